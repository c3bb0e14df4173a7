//! # Error Types
//!
//! This module defines the error types used throughout the MQTT-SN client:
//! synchronous call-time failures, wire codec failures and the gateway return
//! codes carried by acknowledgments.
//!
//! Gateway return codes and locally detected failures (timeouts, lost
//! connections) are kept apart on purpose. A `ReturnCode` is only ever a value
//! the gateway put on the wire; local failures are reported as
//! [`Abort`](crate::dispatch::Abort).

use core::fmt;
use core::str::FromStr;

/// The primary error enum returned synchronously by client operations.
///
/// An operation that returns one of these errors has not allocated a message
/// id and has not left a pending transaction behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttsnError {
    /// Malformed caller input: client id, topic name, QoS or config values.
    InvalidArgs,
    /// The operation is not legal in the current client state.
    InvalidState,
    /// No free transaction slot, registry slot or send buffer.
    ResourceExhausted,
    /// `start` was called on a running client.
    AlreadyRunning,
    /// The transport endpoint has not been started.
    NotRunning,
    /// The underlying transport refused the datagram.
    Transport,
    /// The request could not be serialized.
    Encode(EncodeError),
}

impl From<EncodeError> for MqttsnError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::BufferTooSmall => MqttsnError::ResourceExhausted,
            other => MqttsnError::Encode(other),
        }
    }
}

impl fmt::Display for MqttsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttsnError::InvalidArgs => write!(f, "invalid arguments"),
            MqttsnError::InvalidState => write!(f, "invalid client state"),
            MqttsnError::ResourceExhausted => write!(f, "resources exhausted"),
            MqttsnError::AlreadyRunning => write!(f, "client already running"),
            MqttsnError::NotRunning => write!(f, "client not running"),
            MqttsnError::Transport => write!(f, "transport send failed"),
            MqttsnError::Encode(e) => write!(f, "encode failed: {}", e),
        }
    }
}

/// Errors raised while decoding an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The buffer ended before the fixed part of a message.
    Truncated,
    /// The declared length does not match the datagram size.
    LengthMismatch,
    /// A field holds a value the protocol does not allow.
    Malformed,
    /// A topic name or client id was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated message"),
            DecodeError::LengthMismatch => write!(f, "declared length does not match datagram"),
            DecodeError::Malformed => write!(f, "malformed message"),
            DecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
        }
    }
}

/// Errors raised while encoding an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// The output buffer cannot hold the message.
    BufferTooSmall,
    /// The message exceeds the largest length MQTT-SN can express.
    PayloadTooLarge,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::BufferTooSmall => write!(f, "buffer too small"),
            EncodeError::PayloadTooLarge => write!(f, "message too large"),
        }
    }
}

/// Return code carried by CONNACK, REGACK, SUBACK and PUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReturnCode {
    /// The request was accepted.
    Accepted,
    /// Rejected because the gateway is congested.
    RejectedCongestion,
    /// Rejected because of an invalid topic id.
    RejectedTopicId,
    /// Rejected because the request is not supported.
    RejectedNotSupported,
    /// A value outside the codes defined by MQTT-SN 1.2.
    Other(u8),
}

impl From<u8> for ReturnCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Accepted,
            1 => Self::RejectedCongestion,
            2 => Self::RejectedTopicId,
            3 => Self::RejectedNotSupported,
            _ => Self::Other(val),
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(code: ReturnCode) -> Self {
        match code {
            ReturnCode::Accepted => 0,
            ReturnCode::RejectedCongestion => 1,
            ReturnCode::RejectedTopicId => 2,
            ReturnCode::RejectedNotSupported => 3,
            ReturnCode::Other(val) => val,
        }
    }
}

impl ReturnCode {
    pub fn is_accepted(&self) -> bool {
        *self == ReturnCode::Accepted
    }

    /// Human readable name of the code.
    ///
    /// Codes outside the MQTT-SN 1.2 set have no name and yield `InvalidArgs`.
    pub fn as_str(&self) -> Result<&'static str, MqttsnError> {
        match self {
            ReturnCode::Accepted => Ok("Accepted"),
            ReturnCode::RejectedCongestion => Ok("RejectedCongestion"),
            ReturnCode::RejectedTopicId => Ok("RejectedTopicId"),
            ReturnCode::RejectedNotSupported => Ok("RejectedNotSupported"),
            ReturnCode::Other(_) => Err(MqttsnError::InvalidArgs),
        }
    }
}

impl FromStr for ReturnCode {
    type Err = MqttsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Accepted" => Ok(ReturnCode::Accepted),
            "RejectedCongestion" => Ok(ReturnCode::RejectedCongestion),
            "RejectedTopicId" => Ok(ReturnCode::RejectedTopicId),
            "RejectedNotSupported" => Ok(ReturnCode::RejectedNotSupported),
            _ => Err(MqttsnError::InvalidArgs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_from_wire() {
        assert_eq!(ReturnCode::from(0), ReturnCode::Accepted);
        assert_eq!(ReturnCode::from(2), ReturnCode::RejectedTopicId);
        assert_eq!(ReturnCode::from(9), ReturnCode::Other(9));
        assert_eq!(u8::from(ReturnCode::RejectedNotSupported), 3);
        assert_eq!(u8::from(ReturnCode::Other(0x42)), 0x42);
    }

    #[test]
    fn test_return_code_names() {
        assert_eq!(ReturnCode::Accepted.as_str(), Ok("Accepted"));
        assert_eq!(
            ReturnCode::RejectedCongestion.as_str(),
            Ok("RejectedCongestion")
        );
        assert_eq!(ReturnCode::Other(7).as_str(), Err(MqttsnError::InvalidArgs));
        assert_eq!(
            "RejectedTopicId".parse::<ReturnCode>(),
            Ok(ReturnCode::RejectedTopicId)
        );
        assert_eq!("Timeout".parse::<ReturnCode>(), Err(MqttsnError::InvalidArgs));
    }

    #[test]
    fn test_buffer_exhaustion_maps_to_resource_error() {
        assert_eq!(
            MqttsnError::from(EncodeError::BufferTooSmall),
            MqttsnError::ResourceExhausted
        );
        assert_eq!(
            MqttsnError::from(EncodeError::PayloadTooLarge),
            MqttsnError::Encode(EncodeError::PayloadTooLarge)
        );
    }
}
