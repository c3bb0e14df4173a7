//! # MQTT-SN Client for Embedded Mesh Networks
//!
//! `myrtio-mqttsn` is a `no_std` compatible MQTT-SN 1.2 client designed for
//! constrained nodes on a low-power mesh (Thread, 6LoWPAN) that reach an
//! MQTT-SN gateway over UDP. It is built upon the
//! [Embassy](https://embassy.dev/) ecosystem.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Pending requests, topic bindings and send
//!   buffers live in fixed-capacity storage sized by const generics.
//!   Running out of space is an ordinary error, never a panic.
//! - **Non-blocking engine:** The client is a state machine driven from
//!   outside. It never awaits and never reads the clock; time is passed in.
//! - **Transport Agnostic:** A small `DatagramTransport` trait lets the client
//!   run over any unreliable datagram service.
//! - **Reliable requests:** CONNECT, REGISTER, SUBSCRIBE, UNSUBSCRIBE, QoS 1
//!   and QoS 2 PUBLISH and the session requests are retransmitted from their
//!   original bytes and complete exactly once.
//! - **Sleeping clients:** Sleep, wake-up polling and keepalive loss detection.
//! - **Gateway discovery:** SEARCHGW broadcasts plus GWINFO and ADVERTISE
//!   handlers.
//!
//! ## Architecture
//!
//! ### 1. Direct Client Usage
//!
//! Drive `MqttsnClient` yourself by feeding it datagrams and periodic ticks:
//!
//! ```ignore
//! let on_connected = |outcome: Outcome<()>| { /* ... */ };
//! let mut client = MqttsnClient::<_, 8, 16, 256>::new(transport);
//! client.set_connected_handler(&on_connected);
//! client.start(10000)?;
//! client.connect(MqttsnConfig::new(gateway, "node-1"), now)?;
//!
//! // in the receive path
//! client.handle_datagram(now, source, &datagram);
//! // every 100 ms
//! client.tick(now);
//! ```
//!
//! ### 2. Embassy Runtime
//!
//! Use `MqttsnRuntime` to run the client over an `embassy-net` UDP socket. See
//! the [`runtime`] module.
//!
//! ## Completion Model
//!
//! Every request takes a borrowed handler that receives an [`Outcome`]:
//! the gateway's acceptance, its rejection code, or an [`Abort`] reason
//! (timeout, lost connection, closed session). Gateway return codes and
//! local failures never share a value space.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod client;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod registry;
pub mod runtime;
pub mod transaction;
pub mod transport;
pub mod util;

// Re-export key types for easier access at the crate root.
pub use client::{
    ClientState, DEFAULT_CLIENT_ID, MAX_CLIENT_ID_LEN, MqttsnClient, MqttsnConfig, WakeMode, Will,
};
pub use dispatch::{
    Abort, Advertisement, DisconnectReason, GatewayInfo, Outcome, ReceivedMessage, Subscription,
};
pub use error::{DecodeError, EncodeError, MqttsnError, ReturnCode};
pub use packet::{QoS, ShortName, Topic, TopicId};
pub use registry::{MAX_TOPIC_NAME_LEN, TopicRegistry};
pub use runtime::{DatagramOutbox, MqttsnRuntime};
pub use transport::DatagramTransport;
