//! Queued datagram transport.
//!
//! The client sends synchronously, but `embassy-net` sockets are async. The
//! outbox bridges the two: the client pushes datagrams into a fixed-size
//! queue and the runtime drains it onto the socket after every step.

use embassy_net::IpEndpoint;
use heapless::{Deque, Vec};

use crate::error::MqttsnError;
use crate::transport::DatagramTransport;

/// A datagram waiting to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDatagram<const BUF_SIZE: usize> {
    pub endpoint: IpEndpoint,
    pub data: Vec<u8, BUF_SIZE>,
}

impl<const BUF_SIZE: usize> OutboundDatagram<BUF_SIZE> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A [`DatagramTransport`] that buffers datagrams for the async runtime.
///
/// # Type Parameters
///
/// - `DEPTH`: Maximum number of datagrams that can be queued
/// - `BUF_SIZE`: Maximum datagram size
pub struct DatagramOutbox<const DEPTH: usize, const BUF_SIZE: usize> {
    port: Option<u16>,
    queue: Deque<OutboundDatagram<BUF_SIZE>, DEPTH>,
}

impl<const DEPTH: usize, const BUF_SIZE: usize> DatagramOutbox<DEPTH, BUF_SIZE> {
    /// Create a new closed outbox.
    pub fn new() -> Self {
        Self {
            port: None,
            queue: Deque::new(),
        }
    }

    /// The local port passed to `open`, if the outbox is open.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Take the oldest queued datagram.
    pub fn pop(&mut self) -> Option<OutboundDatagram<BUF_SIZE>> {
        self.queue.pop_front()
    }

    /// Check if the outbox is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get the number of queued datagrams.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<const DEPTH: usize, const BUF_SIZE: usize> Default for DatagramOutbox<DEPTH, BUF_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DEPTH: usize, const BUF_SIZE: usize> DatagramTransport
    for DatagramOutbox<DEPTH, BUF_SIZE>
{
    type Error = MqttsnError;

    fn open(&mut self, port: u16) -> Result<(), Self::Error> {
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
        self.queue.clear();
    }

    fn send_to(&mut self, endpoint: IpEndpoint, buf: &[u8]) -> Result<(), Self::Error> {
        if self.port.is_none() {
            return Err(MqttsnError::NotRunning);
        }
        let mut data: Vec<u8, BUF_SIZE> = Vec::new();
        data.extend_from_slice(buf)
            .map_err(|_| MqttsnError::ResourceExhausted)?;
        self.queue
            .push_back(OutboundDatagram { endpoint, data })
            .map_err(|_| MqttsnError::ResourceExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_net::IpAddress;

    fn endpoint() -> IpEndpoint {
        IpEndpoint::new(IpAddress::v4(10, 0, 0, 1), 10000)
    }

    #[test]
    fn test_closed_outbox_refuses_datagrams() {
        let mut outbox = DatagramOutbox::<2, 8>::new();
        assert_eq!(
            outbox.send_to(endpoint(), &[1, 2]),
            Err(MqttsnError::NotRunning)
        );
    }

    #[test]
    fn test_datagrams_leave_in_order() {
        let mut outbox = DatagramOutbox::<2, 8>::new();
        outbox.open(10000).unwrap();
        outbox.send_to(endpoint(), &[1]).unwrap();
        outbox.send_to(endpoint(), &[2, 3]).unwrap();
        assert_eq!(
            outbox.send_to(endpoint(), &[4]),
            Err(MqttsnError::ResourceExhausted)
        );

        assert_eq!(outbox.pop().unwrap().as_bytes(), &[1]);
        let second = outbox.pop().unwrap();
        assert_eq!(second.endpoint, endpoint());
        assert_eq!(second.as_bytes(), &[2, 3]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_oversized_datagram_is_refused() {
        let mut outbox = DatagramOutbox::<2, 4>::new();
        outbox.open(10000).unwrap();
        assert_eq!(
            outbox.send_to(endpoint(), &[0; 5]),
            Err(MqttsnError::ResourceExhausted)
        );
        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn test_close_discards_queue() {
        let mut outbox = DatagramOutbox::<2, 8>::new();
        outbox.open(10000).unwrap();
        outbox.send_to(endpoint(), &[1]).unwrap();
        outbox.close();
        assert!(outbox.is_empty());
        assert_eq!(outbox.port(), None);
    }
}
