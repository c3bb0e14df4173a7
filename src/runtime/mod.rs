//! MQTT-SN Runtime Module
//!
//! Runs an [`MqttsnClient`](crate::client::MqttsnClient) on an Embassy
//! executor over an `embassy-net` UDP socket.
//!
//! # Overview
//!
//! The client itself never performs async I/O. It is built over a
//! [`DatagramOutbox`], which queues outgoing datagrams, and is shared behind
//! a blocking mutex. [`MqttsnRuntime`] then loops over three steps:
//!
//! - flush the outbox onto the socket
//! - wait for either a datagram or the next tick
//! - hand the datagram or the tick to the client
//!
//! Application tasks on the same executor lock the shared client to issue
//! requests; handlers run inside the runtime's lock.

pub(crate) mod event_loop;
pub(crate) mod outbox;

pub use event_loop::{DEFAULT_TICK_INTERVAL, MqttsnRuntime, RuntimeClient, SharedClient};
pub use outbox::{DatagramOutbox, OutboundDatagram};
