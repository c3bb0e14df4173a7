//! # MQTT-SN Transport Abstraction
//!
//! This module defines the `DatagramTransport` trait, which abstracts the
//! unreliable datagram service the client runs over (UDP on a Thread mesh,
//! UDP over Wi-Fi, a radio link with a custom framing), allowing the protocol
//! engine to stay independent of the network stack.
//!
//! Sends are fire-and-forget: the client never waits on the transport, so the
//! trait is synchronous. An implementation that needs async I/O queues the
//! datagram and flushes it elsewhere, as
//! [`DatagramOutbox`](crate::runtime::DatagramOutbox) does for `embassy-net`.

use embassy_net::IpEndpoint;

/// A trait representing a datagram endpoint.
pub trait DatagramTransport {
    /// The error type returned by the transport.
    type Error: core::fmt::Debug;

    /// Binds the endpoint to a local port.
    fn open(&mut self, port: u16) -> Result<(), Self::Error>;

    /// Unbinds the endpoint and discards anything not yet sent.
    fn close(&mut self);

    /// Hands one datagram to the network. Delivery is not guaranteed.
    fn send_to(&mut self, endpoint: IpEndpoint, buf: &[u8]) -> Result<(), Self::Error>;
}
