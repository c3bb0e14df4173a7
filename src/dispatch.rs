//! Completion handlers and their delivery.
//!
//! Handlers are borrowed closures: the caller keeps ownership of whatever
//! state they capture, and the client only holds the reference while the
//! request is pending. Every accepted request reaches its handler exactly
//! once, with either the gateway's answer or an [`Abort`] reason.

use embassy_net::IpEndpoint;
use embassy_time::Duration;

use crate::error::ReturnCode;
use crate::packet::{QoS, Topic, TopicId};
use crate::transaction::Pending;

/// Why a request ended without an answer from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Abort {
    /// No acknowledgment within the retransmission budget.
    Timeout,
    /// Keepalive pings went unanswered and the session was declared lost.
    ConnectionLost,
    /// The session was torn down by a disconnect or `stop`.
    SessionClosed,
}

impl Abort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Abort::Timeout => "Timeout",
            Abort::ConnectionLost => "ConnectionLost",
            Abort::SessionClosed => "SessionClosed",
        }
    }
}

/// Terminal result of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome<T> {
    Accepted(T),
    /// The gateway answered with a non-accepted return code.
    Rejected(ReturnCode),
    Aborted(Abort),
}

impl<T> Outcome<T> {
    pub(crate) fn from_code(code: ReturnCode, value: T) -> Self {
        if code.is_accepted() {
            Outcome::Accepted(value)
        } else {
            Outcome::Rejected(code)
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }
}

/// Subscription parameters handed to the subscribe handler.
///
/// Carries the SUBACK values whether the gateway accepted or rejected the
/// request. A request that saw no SUBACK reports id zero and the requested
/// QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscription {
    /// Zero for wildcard and short-name subscriptions.
    pub topic_id: TopicId,
    pub qos: QoS,
}

/// Why the client left the connected states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// The gateway sent an unsolicited DISCONNECT.
    Server,
    /// The client asked to disconnect.
    Client,
    /// The gateway acknowledged a sleep request.
    Asleep,
    /// Keepalive or an acknowledgment timed out.
    Timeout,
}

/// A GWINFO answer to a gateway search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayInfo<'m> {
    pub gateway_id: u8,
    /// Where the answer came from.
    pub source: IpEndpoint,
    /// The gateway's address when another client answered on its behalf.
    pub address: Option<&'m [u8]>,
}

/// A periodic ADVERTISE broadcast by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub gateway_id: u8,
    pub source: IpEndpoint,
    /// Time until the next advertisement.
    pub duration: Duration,
}

/// A PUBLISH received from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedMessage<'m> {
    pub topic: Topic,
    /// The name bound to `topic`, when the registry knows it.
    pub topic_name: Option<&'m str>,
    pub payload: &'m [u8],
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

pub type ConnectedHandler<'a> = &'a dyn Fn(Outcome<()>);
pub type SubscribedHandler<'a> = &'a dyn Fn(Outcome<()>, Subscription);
pub type RegisteredHandler<'a> = &'a dyn Fn(Outcome<TopicId>);
pub type UnsubscribedHandler<'a> = &'a dyn Fn(Outcome<()>);
pub type PublishedHandler<'a> = &'a dyn Fn(Outcome<()>);
pub type DisconnectedHandler<'a> = &'a dyn Fn(DisconnectReason);
/// Returns the code to acknowledge the message with.
pub type PublishReceivedHandler<'a> = &'a dyn Fn(&ReceivedMessage<'_>) -> ReturnCode;
pub type RegisterReceivedHandler<'a> = &'a dyn Fn(TopicId, &str);
pub type SearchGwHandler<'a> = &'a dyn Fn(&GatewayInfo<'_>);
pub type AdvertiseHandler<'a> = &'a dyn Fn(Advertisement);

/// Long-lived handlers set on the client rather than per request.
#[derive(Default, Clone, Copy)]
pub(crate) struct Handlers<'a> {
    pub connected: Option<ConnectedHandler<'a>>,
    pub disconnected: Option<DisconnectedHandler<'a>>,
    pub publish_received: Option<PublishReceivedHandler<'a>>,
    pub register_received: Option<RegisterReceivedHandler<'a>>,
    pub searchgw: Option<SearchGwHandler<'a>>,
    pub advertise: Option<AdvertiseHandler<'a>>,
}

impl<'a> Handlers<'a> {
    pub fn connected(&self, outcome: Outcome<()>) {
        if let Some(handler) = self.connected {
            handler(outcome);
        }
    }

    pub fn disconnected(&self, reason: DisconnectReason) {
        if let Some(handler) = self.disconnected {
            handler(reason);
        }
    }

    /// Hands a message to the application and returns the PUBACK code.
    pub fn publish_received(&self, message: &ReceivedMessage<'_>) -> ReturnCode {
        match self.publish_received {
            Some(handler) => handler(message),
            None => ReturnCode::Accepted,
        }
    }

    pub fn register_received(&self, topic_id: TopicId, name: &str) {
        if let Some(handler) = self.register_received {
            handler(topic_id, name);
        }
    }

    pub fn gateway_info(&self, info: &GatewayInfo<'_>) {
        if let Some(handler) = self.searchgw {
            handler(info);
        }
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        if let Some(handler) = self.advertise {
            handler(advertisement);
        }
    }

    /// Resolves a pending request that will never see its acknowledgment.
    ///
    /// Session-level requests (disconnect, sleep, awake) have no handler of
    /// their own; the caller reports those through `disconnected`.
    pub fn abort(&self, pending: Pending<'a>, reason: Abort) {
        match pending {
            Pending::Connect => self.connected(Outcome::Aborted(reason)),
            Pending::Register { handler, .. } => handler(Outcome::Aborted(reason)),
            Pending::Subscribe { handler, qos, .. } => {
                handler(Outcome::Aborted(reason), Subscription { topic_id: 0, qos })
            }
            Pending::Unsubscribe { handler } => handler(Outcome::Aborted(reason)),
            Pending::Publish { handler }
            | Pending::PublishQos2 { handler }
            | Pending::PubRel { handler } => {
                if let Some(handler) = handler {
                    handler(Outcome::Aborted(reason));
                }
            }
            Pending::Disconnect | Pending::Sleep { .. } | Pending::Awake { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::vec::Vec;

    #[test]
    fn test_outcome_from_code() {
        assert_eq!(
            Outcome::from_code(ReturnCode::Accepted, 5u16),
            Outcome::Accepted(5)
        );
        assert_eq!(
            Outcome::from_code(ReturnCode::RejectedTopicId, 5u16),
            Outcome::Rejected(ReturnCode::RejectedTopicId)
        );
    }

    #[test]
    fn test_abort_reaches_request_handler_once() {
        let seen = RefCell::new(Vec::new());
        let handler = |outcome: Outcome<TopicId>| seen.borrow_mut().push(outcome);
        let handlers = Handlers::default();

        handlers.abort(
            Pending::Register {
                handler: &handler,
                name: heapless::String::new(),
            },
            Abort::ConnectionLost,
        );
        assert_eq!(
            *seen.borrow(),
            [Outcome::Aborted(Abort::ConnectionLost)]
        );
    }

    #[test]
    fn test_aborted_subscribe_reports_requested_qos() {
        let seen = RefCell::new(Vec::new());
        let handler = |outcome: Outcome<()>, granted: Subscription| {
            seen.borrow_mut().push((outcome, granted))
        };
        let handlers = Handlers::default();

        handlers.abort(
            Pending::Subscribe {
                handler: &handler,
                qos: QoS::AtLeastOnce,
                name: None,
            },
            Abort::Timeout,
        );
        assert_eq!(
            *seen.borrow(),
            [(
                Outcome::Aborted(Abort::Timeout),
                Subscription {
                    topic_id: 0,
                    qos: QoS::AtLeastOnce,
                }
            )]
        );
    }

    #[test]
    fn test_aborted_connect_goes_to_connected_handler() {
        let seen = RefCell::new(Vec::new());
        let handler = |outcome: Outcome<()>| seen.borrow_mut().push(outcome);
        let handlers = Handlers {
            connected: Some(&handler),
            ..Handlers::default()
        };

        handlers.abort(Pending::Connect, Abort::Timeout);
        handlers.abort(Pending::Disconnect, Abort::Timeout);
        assert_eq!(*seen.borrow(), [Outcome::Aborted(Abort::Timeout)]);
    }

    #[test]
    fn test_publish_received_defaults_to_accepted() {
        let handlers = Handlers::default();
        let message = ReceivedMessage {
            topic: Topic::Normal(1),
            topic_name: None,
            payload: b"x",
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
        };
        assert_eq!(handlers.publish_received(&message), ReturnCode::Accepted);
    }
}
