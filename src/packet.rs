//! # MQTT-SN Message Structures and Serialization
//!
//! This module defines the MQTT-SN 1.2 messages used by the client and the
//! traits for encoding them to and decoding them from datagrams.
//!
//! Every message starts with a length field (1 byte, or `0x01` followed by a
//! 2-byte length when the message is 256 bytes or longer) and a 1-byte message
//! type. All multi-byte integers are big-endian. Message types the client does
//! not understand decode to [`MqttsnPacket::Unsupported`] so the receive path
//! can skip them.

use core::str::FromStr;

use crate::error::{DecodeError, EncodeError, MqttsnError, ReturnCode};
use crate::util::{
    ensure_consumed, header_len, read_header, read_rest, read_str_to_end, read_u8, read_u16,
    write_bytes, write_header, write_u8, write_u16,
};

/// Numeric handle substituting for a topic name on the wire.
pub type TopicId = u16;

/// Message type identifiers.
pub mod msg_type {
    pub const ADVERTISE: u8 = 0x00;
    pub const SEARCHGW: u8 = 0x01;
    pub const GWINFO: u8 = 0x02;
    pub const CONNECT: u8 = 0x04;
    pub const CONNACK: u8 = 0x05;
    pub const WILLTOPICREQ: u8 = 0x06;
    pub const WILLTOPIC: u8 = 0x07;
    pub const WILLMSGREQ: u8 = 0x08;
    pub const WILLMSG: u8 = 0x09;
    pub const REGISTER: u8 = 0x0A;
    pub const REGACK: u8 = 0x0B;
    pub const PUBLISH: u8 = 0x0C;
    pub const PUBACK: u8 = 0x0D;
    pub const PUBCOMP: u8 = 0x0E;
    pub const PUBREC: u8 = 0x0F;
    pub const PUBREL: u8 = 0x10;
    pub const SUBSCRIBE: u8 = 0x12;
    pub const SUBACK: u8 = 0x13;
    pub const UNSUBSCRIBE: u8 = 0x14;
    pub const UNSUBACK: u8 = 0x15;
    pub const PINGREQ: u8 = 0x16;
    pub const PINGRESP: u8 = 0x17;
    pub const DISCONNECT: u8 = 0x18;
}

/// Protocol id carried by CONNECT.
pub const PROTOCOL_ID: u8 = 0x01;

/// Quality of Service levels. `MinusOne` is the MQTT-SN publish level that
/// needs neither a connection nor a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    MinusOne,
}

impl QoS {
    fn bits(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0b00,
            QoS::AtLeastOnce => 0b01,
            QoS::ExactlyOnce => 0b10,
            QoS::MinusOne => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => QoS::AtMostOnce,
            0b01 => QoS::AtLeastOnce,
            0b10 => QoS::ExactlyOnce,
            _ => QoS::MinusOne,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QoS::AtMostOnce => "0",
            QoS::AtLeastOnce => "1",
            QoS::ExactlyOnce => "2",
            QoS::MinusOne => "-1",
        }
    }
}

impl FromStr for QoS {
    type Err = MqttsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(QoS::AtMostOnce),
            "1" => Ok(QoS::AtLeastOnce),
            "2" => Ok(QoS::ExactlyOnce),
            "-1" => Ok(QoS::MinusOne),
            _ => Err(MqttsnError::InvalidArgs),
        }
    }
}

/// How the topic field of PUBLISH, SUBSCRIBE and friends is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TopicIdType {
    Normal,
    Predefined,
    Short,
}

impl TopicIdType {
    fn bits(self) -> u8 {
        match self {
            TopicIdType::Normal => 0b00,
            TopicIdType::Predefined => 0b01,
            TopicIdType::Short => 0b10,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, DecodeError> {
        match bits & 0b11 {
            0b00 => Ok(TopicIdType::Normal),
            0b01 => Ok(TopicIdType::Predefined),
            0b10 => Ok(TopicIdType::Short),
            _ => Err(DecodeError::Malformed),
        }
    }
}

/// The shared flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flags {
    dup: bool,
    qos: QoS,
    retain: bool,
    will: bool,
    clean_session: bool,
    topic_id_type: TopicIdType,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            will: false,
            clean_session: false,
            topic_id_type: TopicIdType::Normal,
        }
    }
}

impl Flags {
    fn to_byte(self) -> u8 {
        let mut byte = (self.qos.bits() << 5) | self.topic_id_type.bits();
        if self.dup {
            byte |= 0x80;
        }
        if self.retain {
            byte |= 0x10;
        }
        if self.will {
            byte |= 0x08;
        }
        if self.clean_session {
            byte |= 0x04;
        }
        byte
    }

    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        Ok(Self {
            dup: byte & 0x80 != 0,
            qos: QoS::from_bits(byte >> 5),
            retain: byte & 0x10 != 0,
            will: byte & 0x08 != 0,
            clean_session: byte & 0x04 != 0,
            topic_id_type: TopicIdType::from_bits(byte)?,
        })
    }
}

/// A one or two character topic name carried in the topic id field.
///
/// A single character name is padded with a trailing zero byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ShortName([u8; 2]);

impl ShortName {
    /// Validates a short topic name: exactly one or two ASCII characters.
    pub fn new(name: &str) -> Result<Self, MqttsnError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > 2 || !name.is_ascii() || bytes.contains(&0) {
            return Err(MqttsnError::InvalidArgs);
        }
        let mut raw = [0u8; 2];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn from_topic_id(id: TopicId) -> Self {
        Self(id.to_be_bytes())
    }

    pub fn topic_id(&self) -> TopicId {
        u16::from_be_bytes(self.0)
    }

    pub fn as_str(&self) -> &str {
        let len = if self.0[1] == 0 { 1 } else { 2 };
        core::str::from_utf8(&self.0[..len]).unwrap_or("")
    }
}

/// The topic a PUBLISH refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Topic {
    /// An id obtained through REGISTER/REGACK or SUBACK.
    Normal(TopicId),
    /// An id known out-of-band to both client and gateway.
    Predefined(TopicId),
    Short(ShortName),
}

impl Topic {
    fn split(&self) -> (TopicIdType, TopicId) {
        match self {
            Topic::Normal(id) => (TopicIdType::Normal, *id),
            Topic::Predefined(id) => (TopicIdType::Predefined, *id),
            Topic::Short(name) => (TopicIdType::Short, name.topic_id()),
        }
    }

    fn join(kind: TopicIdType, id: TopicId) -> Self {
        match kind {
            TopicIdType::Normal => Topic::Normal(id),
            TopicIdType::Predefined => Topic::Predefined(id),
            TopicIdType::Short => Topic::Short(ShortName::from_topic_id(id)),
        }
    }

    pub fn id(&self) -> TopicId {
        self.split().1
    }
}

/// The topic field of SUBSCRIBE and UNSUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicFilter<'a> {
    Name(&'a str),
    Predefined(TopicId),
    Short(ShortName),
}

impl<'a> TopicFilter<'a> {
    fn kind(&self) -> TopicIdType {
        match self {
            TopicFilter::Name(_) => TopicIdType::Normal,
            TopicFilter::Predefined(_) => TopicIdType::Predefined,
            TopicFilter::Short(_) => TopicIdType::Short,
        }
    }

    fn len(&self) -> usize {
        match self {
            TopicFilter::Name(name) => name.len(),
            _ => 2,
        }
    }

    fn encode(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        match self {
            TopicFilter::Name(name) => write_bytes(cursor, buf, name.as_bytes()),
            TopicFilter::Predefined(id) => write_u16(cursor, buf, *id),
            TopicFilter::Short(name) => write_u16(cursor, buf, name.topic_id()),
        }
    }

    fn decode(kind: TopicIdType, cursor: &mut usize, body: &'a [u8]) -> Result<Self, DecodeError> {
        match kind {
            TopicIdType::Normal => Ok(TopicFilter::Name(read_str_to_end(cursor, body)?)),
            TopicIdType::Predefined => Ok(TopicFilter::Predefined(read_u16(cursor, body)?)),
            TopicIdType::Short => Ok(TopicFilter::Short(ShortName::from_topic_id(read_u16(
                cursor, body,
            )?))),
        }
    }
}

/// A trait for messages that can be encoded into a datagram.
pub trait EncodePacket {
    fn msg_type(&self) -> u8;

    /// Length of everything after the message type byte.
    fn body_len(&self) -> usize;

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError>;

    /// Encodes the whole message and returns its length.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let body_len = self.body_len();
        let mut cursor = 0;
        write_header(&mut cursor, buf, self.msg_type(), body_len)?;
        self.encode_body(&mut cursor, buf)?;
        debug_assert_eq!(cursor, header_len(body_len) + body_len);
        Ok(cursor)
    }
}

/// A trait for messages that can be decoded from a message body.
pub trait DecodePacket<'a>: Sized {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError>;
}

/// An enumeration of all MQTT-SN messages the client sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttsnPacket<'a> {
    Advertise(Advertise),
    SearchGw(SearchGw),
    GwInfo(GwInfo<'a>),
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    WillTopicReq,
    WillTopic(WillTopic<'a>),
    WillMsgReq,
    WillMsg(WillMsg<'a>),
    Register(Register<'a>),
    RegAck(RegAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(u16),
    PingReq(PingReq<'a>),
    PingResp,
    Disconnect(Disconnect),
    /// A well-framed message of a type the client does not handle.
    Unsupported(u8),
}

/// Decodes a datagram into an `MqttsnPacket`.
pub fn decode(buf: &[u8]) -> Result<MqttsnPacket<'_>, DecodeError> {
    let (msg_type, body) = read_header(buf)?;
    let packet = match msg_type {
        msg_type::ADVERTISE => MqttsnPacket::Advertise(Advertise::decode_body(body)?),
        msg_type::SEARCHGW => MqttsnPacket::SearchGw(SearchGw::decode_body(body)?),
        msg_type::GWINFO => MqttsnPacket::GwInfo(GwInfo::decode_body(body)?),
        msg_type::CONNECT => MqttsnPacket::Connect(Connect::decode_body(body)?),
        msg_type::CONNACK => MqttsnPacket::ConnAck(ConnAck::decode_body(body)?),
        msg_type::WILLTOPICREQ => {
            ensure_consumed(0, body)?;
            MqttsnPacket::WillTopicReq
        }
        msg_type::WILLTOPIC => MqttsnPacket::WillTopic(WillTopic::decode_body(body)?),
        msg_type::WILLMSGREQ => {
            ensure_consumed(0, body)?;
            MqttsnPacket::WillMsgReq
        }
        msg_type::WILLMSG => MqttsnPacket::WillMsg(WillMsg::decode_body(body)?),
        msg_type::REGISTER => MqttsnPacket::Register(Register::decode_body(body)?),
        msg_type::REGACK => MqttsnPacket::RegAck(RegAck::decode_body(body)?),
        msg_type::PUBLISH => MqttsnPacket::Publish(Publish::decode_body(body)?),
        msg_type::PUBACK => MqttsnPacket::PubAck(PubAck::decode_body(body)?),
        msg_type::PUBREC => MqttsnPacket::PubRec(decode_msg_id(body)?),
        msg_type::PUBREL => MqttsnPacket::PubRel(decode_msg_id(body)?),
        msg_type::PUBCOMP => MqttsnPacket::PubComp(decode_msg_id(body)?),
        msg_type::SUBSCRIBE => MqttsnPacket::Subscribe(Subscribe::decode_body(body)?),
        msg_type::SUBACK => MqttsnPacket::SubAck(SubAck::decode_body(body)?),
        msg_type::UNSUBSCRIBE => MqttsnPacket::Unsubscribe(Unsubscribe::decode_body(body)?),
        msg_type::UNSUBACK => MqttsnPacket::UnsubAck(decode_msg_id(body)?),
        msg_type::PINGREQ => MqttsnPacket::PingReq(PingReq::decode_body(body)?),
        msg_type::PINGRESP => {
            ensure_consumed(0, body)?;
            MqttsnPacket::PingResp
        }
        msg_type::DISCONNECT => MqttsnPacket::Disconnect(Disconnect::decode_body(body)?),
        other => MqttsnPacket::Unsupported(other),
    };
    Ok(packet)
}

fn decode_msg_id(body: &[u8]) -> Result<u16, DecodeError> {
    let mut cursor = 0;
    let msg_id = read_u16(&mut cursor, body)?;
    ensure_consumed(cursor, body)?;
    Ok(msg_id)
}

impl<'a> EncodePacket for MqttsnPacket<'a> {
    fn msg_type(&self) -> u8 {
        match self {
            MqttsnPacket::Advertise(p) => p.msg_type(),
            MqttsnPacket::SearchGw(p) => p.msg_type(),
            MqttsnPacket::GwInfo(p) => p.msg_type(),
            MqttsnPacket::Connect(p) => p.msg_type(),
            MqttsnPacket::ConnAck(p) => p.msg_type(),
            MqttsnPacket::WillTopicReq => msg_type::WILLTOPICREQ,
            MqttsnPacket::WillTopic(p) => p.msg_type(),
            MqttsnPacket::WillMsgReq => msg_type::WILLMSGREQ,
            MqttsnPacket::WillMsg(p) => p.msg_type(),
            MqttsnPacket::Register(p) => p.msg_type(),
            MqttsnPacket::RegAck(p) => p.msg_type(),
            MqttsnPacket::Publish(p) => p.msg_type(),
            MqttsnPacket::PubAck(p) => p.msg_type(),
            MqttsnPacket::PubRec(_) => msg_type::PUBREC,
            MqttsnPacket::PubRel(_) => msg_type::PUBREL,
            MqttsnPacket::PubComp(_) => msg_type::PUBCOMP,
            MqttsnPacket::Subscribe(p) => p.msg_type(),
            MqttsnPacket::SubAck(p) => p.msg_type(),
            MqttsnPacket::Unsubscribe(p) => p.msg_type(),
            MqttsnPacket::UnsubAck(_) => msg_type::UNSUBACK,
            MqttsnPacket::PingReq(p) => p.msg_type(),
            MqttsnPacket::PingResp => msg_type::PINGRESP,
            MqttsnPacket::Disconnect(p) => p.msg_type(),
            MqttsnPacket::Unsupported(t) => *t,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            MqttsnPacket::Advertise(p) => p.body_len(),
            MqttsnPacket::SearchGw(p) => p.body_len(),
            MqttsnPacket::GwInfo(p) => p.body_len(),
            MqttsnPacket::Connect(p) => p.body_len(),
            MqttsnPacket::ConnAck(p) => p.body_len(),
            MqttsnPacket::WillTopic(p) => p.body_len(),
            MqttsnPacket::WillMsg(p) => p.body_len(),
            MqttsnPacket::Register(p) => p.body_len(),
            MqttsnPacket::RegAck(p) => p.body_len(),
            MqttsnPacket::Publish(p) => p.body_len(),
            MqttsnPacket::PubAck(p) => p.body_len(),
            MqttsnPacket::Subscribe(p) => p.body_len(),
            MqttsnPacket::SubAck(p) => p.body_len(),
            MqttsnPacket::Unsubscribe(p) => p.body_len(),
            MqttsnPacket::PingReq(p) => p.body_len(),
            MqttsnPacket::Disconnect(p) => p.body_len(),
            MqttsnPacket::PubRec(_)
            | MqttsnPacket::PubRel(_)
            | MqttsnPacket::PubComp(_)
            | MqttsnPacket::UnsubAck(_) => 2,
            MqttsnPacket::WillTopicReq
            | MqttsnPacket::WillMsgReq
            | MqttsnPacket::PingResp
            | MqttsnPacket::Unsupported(_) => 0,
        }
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        match self {
            MqttsnPacket::Advertise(p) => p.encode_body(cursor, buf),
            MqttsnPacket::SearchGw(p) => p.encode_body(cursor, buf),
            MqttsnPacket::GwInfo(p) => p.encode_body(cursor, buf),
            MqttsnPacket::Connect(p) => p.encode_body(cursor, buf),
            MqttsnPacket::ConnAck(p) => p.encode_body(cursor, buf),
            MqttsnPacket::WillTopic(p) => p.encode_body(cursor, buf),
            MqttsnPacket::WillMsg(p) => p.encode_body(cursor, buf),
            MqttsnPacket::Register(p) => p.encode_body(cursor, buf),
            MqttsnPacket::RegAck(p) => p.encode_body(cursor, buf),
            MqttsnPacket::Publish(p) => p.encode_body(cursor, buf),
            MqttsnPacket::PubAck(p) => p.encode_body(cursor, buf),
            MqttsnPacket::Subscribe(p) => p.encode_body(cursor, buf),
            MqttsnPacket::SubAck(p) => p.encode_body(cursor, buf),
            MqttsnPacket::Unsubscribe(p) => p.encode_body(cursor, buf),
            MqttsnPacket::PingReq(p) => p.encode_body(cursor, buf),
            MqttsnPacket::Disconnect(p) => p.encode_body(cursor, buf),
            MqttsnPacket::PubRec(id)
            | MqttsnPacket::PubRel(id)
            | MqttsnPacket::PubComp(id)
            | MqttsnPacket::UnsubAck(id) => write_u16(cursor, buf, *id),
            MqttsnPacket::WillTopicReq
            | MqttsnPacket::WillMsgReq
            | MqttsnPacket::PingResp
            | MqttsnPacket::Unsupported(_) => Ok(()),
        }
    }
}

// --- ADVERTISE ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertise {
    pub gateway_id: u8,
    /// Seconds until the next ADVERTISE.
    pub duration: u16,
}

impl EncodePacket for Advertise {
    fn msg_type(&self) -> u8 {
        msg_type::ADVERTISE
    }

    fn body_len(&self) -> usize {
        3
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u8(cursor, buf, self.gateway_id)?;
        write_u16(cursor, buf, self.duration)
    }
}

impl<'a> DecodePacket<'a> for Advertise {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let advertise = Self {
            gateway_id: read_u8(&mut cursor, body)?,
            duration: read_u16(&mut cursor, body)?,
        };
        ensure_consumed(cursor, body)?;
        Ok(advertise)
    }
}

// --- SEARCHGW ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchGw {
    /// Broadcast radius in hops.
    pub radius: u8,
}

impl EncodePacket for SearchGw {
    fn msg_type(&self) -> u8 {
        msg_type::SEARCHGW
    }

    fn body_len(&self) -> usize {
        1
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u8(cursor, buf, self.radius)
    }
}

impl<'a> DecodePacket<'a> for SearchGw {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let radius = read_u8(&mut cursor, body)?;
        ensure_consumed(cursor, body)?;
        Ok(Self { radius })
    }
}

// --- GWINFO ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GwInfo<'a> {
    pub gateway_id: u8,
    /// Gateway address; empty when the gateway answers itself.
    pub address: &'a [u8],
}

impl<'a> EncodePacket for GwInfo<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::GWINFO
    }

    fn body_len(&self) -> usize {
        1 + self.address.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u8(cursor, buf, self.gateway_id)?;
        write_bytes(cursor, buf, self.address)
    }
}

impl<'a> DecodePacket<'a> for GwInfo<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let gateway_id = read_u8(&mut cursor, body)?;
        let address = read_rest(&mut cursor, body)?;
        Ok(Self {
            gateway_id,
            address,
        })
    }
}

// --- CONNECT ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect<'a> {
    pub will: bool,
    pub clean_session: bool,
    /// Keepalive duration in seconds.
    pub duration: u16,
    pub client_id: &'a str,
}

impl<'a> EncodePacket for Connect<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::CONNECT
    }

    fn body_len(&self) -> usize {
        4 + self.client_id.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        let flags = Flags {
            will: self.will,
            clean_session: self.clean_session,
            ..Flags::default()
        };
        write_u8(cursor, buf, flags.to_byte())?;
        write_u8(cursor, buf, PROTOCOL_ID)?;
        write_u16(cursor, buf, self.duration)?;
        write_bytes(cursor, buf, self.client_id.as_bytes())
    }
}

impl<'a> DecodePacket<'a> for Connect<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let flags = Flags::from_byte(read_u8(&mut cursor, body)?)?;
        if read_u8(&mut cursor, body)? != PROTOCOL_ID {
            return Err(DecodeError::Malformed);
        }
        let duration = read_u16(&mut cursor, body)?;
        let client_id = read_str_to_end(&mut cursor, body)?;
        Ok(Self {
            will: flags.will,
            clean_session: flags.clean_session,
            duration,
            client_id,
        })
    }
}

// --- CONNACK ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub return_code: ReturnCode,
}

impl EncodePacket for ConnAck {
    fn msg_type(&self) -> u8 {
        msg_type::CONNACK
    }

    fn body_len(&self) -> usize {
        1
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u8(cursor, buf, self.return_code.into())
    }
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let return_code = ReturnCode::from(read_u8(&mut cursor, body)?);
        ensure_consumed(cursor, body)?;
        Ok(Self { return_code })
    }
}

// --- WILLTOPIC ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WillTopic<'a> {
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
}

impl<'a> EncodePacket for WillTopic<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::WILLTOPIC
    }

    fn body_len(&self) -> usize {
        1 + self.topic.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        let flags = Flags {
            qos: self.qos,
            retain: self.retain,
            ..Flags::default()
        };
        write_u8(cursor, buf, flags.to_byte())?;
        write_bytes(cursor, buf, self.topic.as_bytes())
    }
}

impl<'a> DecodePacket<'a> for WillTopic<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let flags = Flags::from_byte(read_u8(&mut cursor, body)?)?;
        let topic = read_str_to_end(&mut cursor, body)?;
        Ok(Self {
            qos: flags.qos,
            retain: flags.retain,
            topic,
        })
    }
}

// --- WILLMSG ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WillMsg<'a> {
    pub message: &'a [u8],
}

impl<'a> EncodePacket for WillMsg<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::WILLMSG
    }

    fn body_len(&self) -> usize {
        self.message.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_bytes(cursor, buf, self.message)
    }
}

impl<'a> DecodePacket<'a> for WillMsg<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        Ok(Self {
            message: read_rest(&mut cursor, body)?,
        })
    }
}

// --- REGISTER ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register<'a> {
    /// Zero when sent by a client.
    pub topic_id: TopicId,
    pub msg_id: u16,
    pub topic_name: &'a str,
}

impl<'a> EncodePacket for Register<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::REGISTER
    }

    fn body_len(&self) -> usize {
        4 + self.topic_name.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u16(cursor, buf, self.topic_id)?;
        write_u16(cursor, buf, self.msg_id)?;
        write_bytes(cursor, buf, self.topic_name.as_bytes())
    }
}

impl<'a> DecodePacket<'a> for Register<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        Ok(Self {
            topic_id: read_u16(&mut cursor, body)?,
            msg_id: read_u16(&mut cursor, body)?,
            topic_name: read_str_to_end(&mut cursor, body)?,
        })
    }
}

// --- REGACK ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAck {
    pub topic_id: TopicId,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

impl EncodePacket for RegAck {
    fn msg_type(&self) -> u8 {
        msg_type::REGACK
    }

    fn body_len(&self) -> usize {
        5
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u16(cursor, buf, self.topic_id)?;
        write_u16(cursor, buf, self.msg_id)?;
        write_u8(cursor, buf, self.return_code.into())
    }
}

impl<'a> DecodePacket<'a> for RegAck {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let ack = Self {
            topic_id: read_u16(&mut cursor, body)?,
            msg_id: read_u16(&mut cursor, body)?,
            return_code: ReturnCode::from(read_u8(&mut cursor, body)?),
        };
        ensure_consumed(cursor, body)?;
        Ok(ack)
    }
}

// --- PUBLISH ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publish<'a> {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Topic,
    /// Zero for QoS 0 and -1.
    pub msg_id: u16,
    pub data: &'a [u8],
}

impl<'a> EncodePacket for Publish<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::PUBLISH
    }

    fn body_len(&self) -> usize {
        5 + self.data.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        let (topic_id_type, topic_id) = self.topic.split();
        let flags = Flags {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
            topic_id_type,
            ..Flags::default()
        };
        write_u8(cursor, buf, flags.to_byte())?;
        write_u16(cursor, buf, topic_id)?;
        write_u16(cursor, buf, self.msg_id)?;
        write_bytes(cursor, buf, self.data)
    }
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let flags = Flags::from_byte(read_u8(&mut cursor, body)?)?;
        let topic_id = read_u16(&mut cursor, body)?;
        let msg_id = read_u16(&mut cursor, body)?;
        let data = read_rest(&mut cursor, body)?;
        Ok(Self {
            dup: flags.dup,
            qos: flags.qos,
            retain: flags.retain,
            topic: Topic::join(flags.topic_id_type, topic_id),
            msg_id,
            data,
        })
    }
}

// --- PUBACK ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub topic_id: TopicId,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

impl EncodePacket for PubAck {
    fn msg_type(&self) -> u8 {
        msg_type::PUBACK
    }

    fn body_len(&self) -> usize {
        5
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_u16(cursor, buf, self.topic_id)?;
        write_u16(cursor, buf, self.msg_id)?;
        write_u8(cursor, buf, self.return_code.into())
    }
}

impl<'a> DecodePacket<'a> for PubAck {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let ack = Self {
            topic_id: read_u16(&mut cursor, body)?,
            msg_id: read_u16(&mut cursor, body)?,
            return_code: ReturnCode::from(read_u8(&mut cursor, body)?),
        };
        ensure_consumed(cursor, body)?;
        Ok(ack)
    }
}

// --- SUBSCRIBE ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribe<'a> {
    pub dup: bool,
    pub qos: QoS,
    pub msg_id: u16,
    pub topic: TopicFilter<'a>,
}

impl<'a> EncodePacket for Subscribe<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::SUBSCRIBE
    }

    fn body_len(&self) -> usize {
        3 + self.topic.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        let flags = Flags {
            dup: self.dup,
            qos: self.qos,
            topic_id_type: self.topic.kind(),
            ..Flags::default()
        };
        write_u8(cursor, buf, flags.to_byte())?;
        write_u16(cursor, buf, self.msg_id)?;
        self.topic.encode(cursor, buf)
    }
}

impl<'a> DecodePacket<'a> for Subscribe<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let flags = Flags::from_byte(read_u8(&mut cursor, body)?)?;
        let msg_id = read_u16(&mut cursor, body)?;
        let topic = TopicFilter::decode(flags.topic_id_type, &mut cursor, body)?;
        ensure_consumed(cursor, body)?;
        Ok(Self {
            dup: flags.dup,
            qos: flags.qos,
            msg_id,
            topic,
        })
    }
}

// --- SUBACK ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    /// Granted QoS.
    pub qos: QoS,
    pub topic_id: TopicId,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

impl EncodePacket for SubAck {
    fn msg_type(&self) -> u8 {
        msg_type::SUBACK
    }

    fn body_len(&self) -> usize {
        6
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        let flags = Flags {
            qos: self.qos,
            ..Flags::default()
        };
        write_u8(cursor, buf, flags.to_byte())?;
        write_u16(cursor, buf, self.topic_id)?;
        write_u16(cursor, buf, self.msg_id)?;
        write_u8(cursor, buf, self.return_code.into())
    }
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let flags = Flags::from_byte(read_u8(&mut cursor, body)?)?;
        let ack = Self {
            qos: flags.qos,
            topic_id: read_u16(&mut cursor, body)?,
            msg_id: read_u16(&mut cursor, body)?,
            return_code: ReturnCode::from(read_u8(&mut cursor, body)?),
        };
        ensure_consumed(cursor, body)?;
        Ok(ack)
    }
}

// --- UNSUBSCRIBE ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribe<'a> {
    pub msg_id: u16,
    pub topic: TopicFilter<'a>,
}

impl<'a> EncodePacket for Unsubscribe<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::UNSUBSCRIBE
    }

    fn body_len(&self) -> usize {
        3 + self.topic.len()
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        let flags = Flags {
            topic_id_type: self.topic.kind(),
            ..Flags::default()
        };
        write_u8(cursor, buf, flags.to_byte())?;
        write_u16(cursor, buf, self.msg_id)?;
        self.topic.encode(cursor, buf)
    }
}

impl<'a> DecodePacket<'a> for Unsubscribe<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let flags = Flags::from_byte(read_u8(&mut cursor, body)?)?;
        let msg_id = read_u16(&mut cursor, body)?;
        let topic = TopicFilter::decode(flags.topic_id_type, &mut cursor, body)?;
        ensure_consumed(cursor, body)?;
        Ok(Self { msg_id, topic })
    }
}

// --- PINGREQ ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReq<'a> {
    /// Present only when a sleeping client polls for buffered messages.
    pub client_id: Option<&'a str>,
}

impl<'a> EncodePacket for PingReq<'a> {
    fn msg_type(&self) -> u8 {
        msg_type::PINGREQ
    }

    fn body_len(&self) -> usize {
        self.client_id.map_or(0, str::len)
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        match self.client_id {
            Some(id) => write_bytes(cursor, buf, id.as_bytes()),
            None => Ok(()),
        }
    }
}

impl<'a> DecodePacket<'a> for PingReq<'a> {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let client_id = read_str_to_end(&mut cursor, body)?;
        Ok(Self {
            client_id: (!client_id.is_empty()).then_some(client_id),
        })
    }
}

// --- DISCONNECT ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    /// Sleep duration in seconds; absent for a plain disconnect.
    pub duration: Option<u16>,
}

impl EncodePacket for Disconnect {
    fn msg_type(&self) -> u8 {
        msg_type::DISCONNECT
    }

    fn body_len(&self) -> usize {
        if self.duration.is_some() { 2 } else { 0 }
    }

    fn encode_body(&self, cursor: &mut usize, buf: &mut [u8]) -> Result<(), EncodeError> {
        match self.duration {
            Some(duration) => write_u16(cursor, buf, duration),
            None => Ok(()),
        }
    }
}

impl<'a> DecodePacket<'a> for Disconnect {
    fn decode_body(body: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0;
        let duration = if body.is_empty() {
            None
        } else {
            Some(read_u16(&mut cursor, body)?)
        };
        ensure_consumed(cursor, body)?;
        Ok(Self { duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: MqttsnPacket<'_>) {
        let mut buf = [0u8; 512];
        let len = packet.encode(&mut buf).unwrap();
        assert_eq!(decode(&buf[..len]).unwrap(), packet);
    }

    #[test]
    fn test_connect_layout() {
        let connect = Connect {
            will: false,
            clean_session: true,
            duration: 60,
            client_id: "dev1",
        };
        let mut buf = [0u8; 32];
        let len = connect.encode(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x0A, 0x04, 0x04, 0x01, 0x00, 0x3C, b'd', b'e', b'v', b'1']);
    }

    #[test]
    fn test_subscribe_short_layout() {
        let subscribe = Subscribe {
            dup: false,
            qos: QoS::AtLeastOnce,
            msg_id: 0x0102,
            topic: TopicFilter::Short(ShortName::new("ab").unwrap()),
        };
        let mut buf = [0u8; 16];
        let len = subscribe.encode(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x07, 0x12, 0x22, 0x01, 0x02, b'a', b'b']);
    }

    #[test]
    fn test_suback_decode() {
        let buf = [0x08, 0x13, 0x20, 0x00, 0x05, 0x00, 0x01, 0x00];
        let packet = decode(&buf).unwrap();
        assert_eq!(
            packet,
            MqttsnPacket::SubAck(SubAck {
                qos: QoS::AtLeastOnce,
                topic_id: 5,
                msg_id: 1,
                return_code: ReturnCode::Accepted,
            })
        );
    }

    #[test]
    fn test_every_message_round_trips() {
        let short = ShortName::new("t").unwrap();
        let packets = [
            MqttsnPacket::Advertise(Advertise {
                gateway_id: 3,
                duration: 900,
            }),
            MqttsnPacket::SearchGw(SearchGw { radius: 2 }),
            MqttsnPacket::GwInfo(GwInfo {
                gateway_id: 3,
                address: &[],
            }),
            MqttsnPacket::GwInfo(GwInfo {
                gateway_id: 3,
                address: &[0xFD, 0x00, 0x0D, 0xB8],
            }),
            MqttsnPacket::Connect(Connect {
                will: true,
                clean_session: false,
                duration: 300,
                client_id: "node-7",
            }),
            MqttsnPacket::ConnAck(ConnAck {
                return_code: ReturnCode::RejectedCongestion,
            }),
            MqttsnPacket::WillTopicReq,
            MqttsnPacket::WillTopic(WillTopic {
                qos: QoS::AtLeastOnce,
                retain: true,
                topic: "node/7/status",
            }),
            MqttsnPacket::WillMsgReq,
            MqttsnPacket::WillMsg(WillMsg { message: b"gone" }),
            MqttsnPacket::Register(Register {
                topic_id: 0,
                msg_id: 9,
                topic_name: "sensor/temp",
            }),
            MqttsnPacket::RegAck(RegAck {
                topic_id: 5,
                msg_id: 9,
                return_code: ReturnCode::Accepted,
            }),
            MqttsnPacket::Publish(Publish {
                dup: true,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: Topic::Short(short),
                msg_id: 3,
                data: b"21.5",
            }),
            MqttsnPacket::Publish(Publish {
                dup: false,
                qos: QoS::MinusOne,
                retain: true,
                topic: Topic::Predefined(77),
                msg_id: 0,
                data: &[],
            }),
            MqttsnPacket::PubAck(PubAck {
                topic_id: 5,
                msg_id: 3,
                return_code: ReturnCode::RejectedTopicId,
            }),
            MqttsnPacket::PubRec(4),
            MqttsnPacket::PubRel(4),
            MqttsnPacket::PubComp(4),
            MqttsnPacket::Subscribe(Subscribe {
                dup: false,
                qos: QoS::ExactlyOnce,
                msg_id: 11,
                topic: TopicFilter::Name("sensor/+"),
            }),
            MqttsnPacket::Subscribe(Subscribe {
                dup: false,
                qos: QoS::AtMostOnce,
                msg_id: 12,
                topic: TopicFilter::Predefined(0x1234),
            }),
            MqttsnPacket::SubAck(SubAck {
                qos: QoS::AtLeastOnce,
                topic_id: 5,
                msg_id: 11,
                return_code: ReturnCode::Accepted,
            }),
            MqttsnPacket::Unsubscribe(Unsubscribe {
                msg_id: 13,
                topic: TopicFilter::Short(short),
            }),
            MqttsnPacket::UnsubAck(13),
            MqttsnPacket::PingReq(PingReq { client_id: None }),
            MqttsnPacket::PingReq(PingReq {
                client_id: Some("node-7"),
            }),
            MqttsnPacket::PingResp,
            MqttsnPacket::Disconnect(Disconnect { duration: None }),
            MqttsnPacket::Disconnect(Disconnect {
                duration: Some(600),
            }),
        ];
        for packet in packets {
            round_trip(packet);
        }
    }

    #[test]
    fn test_discovery_layouts() {
        let mut buf = [0u8; 8];
        let len = SearchGw { radius: 1 }.encode(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x03, 0x01, 0x01]);

        assert_eq!(
            decode(&[0x05, 0x00, 0x07, 0x03, 0x84]),
            Ok(MqttsnPacket::Advertise(Advertise {
                gateway_id: 7,
                duration: 900,
            }))
        );
        assert_eq!(
            decode(&[0x03, 0x02, 0x07]),
            Ok(MqttsnPacket::GwInfo(GwInfo {
                gateway_id: 7,
                address: &[],
            }))
        );
        assert_eq!(decode(&[0x04, 0x00, 0x07, 0x03]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_large_publish_uses_extended_length() {
        let data = [0xAB; 300];
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Topic::Normal(1),
            msg_id: 0,
            data: &data,
        };
        let mut buf = [0u8; 400];
        let len = publish.encode(&mut buf).unwrap();
        assert_eq!(len, 309);
        assert_eq!(buf[0], 0x01);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 309);
        assert_eq!(decode(&buf[..len]).unwrap(), MqttsnPacket::Publish(publish));
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        assert_eq!(decode(&[0x02, 0x03]), Ok(MqttsnPacket::Unsupported(0x03)));
        assert_eq!(decode(&[0x03, 0x1E, 0xFF]), Ok(MqttsnPacket::Unsupported(0x1E)));
    }

    #[test]
    fn test_fixed_messages_reject_extra_bytes() {
        assert_eq!(decode(&[0x04, 0x05, 0x00, 0x00]), Err(DecodeError::Malformed));
        assert_eq!(decode(&[0x03, 0x17, 0x00]), Err(DecodeError::Malformed));
        assert_eq!(decode(&[0x04, 0x0B, 0x00, 0x01]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_reserved_topic_id_type_is_malformed() {
        let buf = [0x07, 0x0C, 0x03, 0x00, 0x01, 0x00, 0x00];
        assert_eq!(decode(&buf), Err(DecodeError::Malformed));
    }

    #[test]
    fn test_short_name_validation() {
        assert!(ShortName::new("").is_err());
        assert!(ShortName::new("abc").is_err());
        assert!(ShortName::new("é").is_err());
        assert_eq!(ShortName::new("a").unwrap().as_str(), "a");
        assert_eq!(ShortName::new("ab").unwrap().topic_id(), 0x6162);
    }

    #[test]
    fn test_qos_strings() {
        assert_eq!("-1".parse::<QoS>(), Ok(QoS::MinusOne));
        assert_eq!("1".parse::<QoS>(), Ok(QoS::AtLeastOnce));
        assert_eq!("3".parse::<QoS>(), Err(MqttsnError::InvalidArgs));
        assert_eq!(QoS::ExactlyOnce.as_str(), "2");
    }
}
