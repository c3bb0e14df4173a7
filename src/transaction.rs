//! Requests waiting for a gateway acknowledgment.
//!
//! The table has a fixed number of slots. Each pending request keeps the exact
//! bytes it was sent with, so retransmission never re-encodes anything.

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::client::WakeMode;
use crate::dispatch::{PublishedHandler, RegisteredHandler, SubscribedHandler, UnsubscribedHandler};
use crate::error::{EncodeError, MqttsnError};
use crate::packet::QoS;
use crate::registry::MAX_TOPIC_NAME_LEN;

/// What a pending request is waiting for, with the handler to complete it.
pub enum Pending<'a> {
    /// Waits for CONNACK. Completion goes to the connected handler.
    Connect,
    /// Waits for REGACK; `name` is bound on acceptance.
    Register {
        handler: RegisteredHandler<'a>,
        name: String<MAX_TOPIC_NAME_LEN>,
    },
    /// Waits for SUBACK; a long `name` is bound on acceptance.
    Subscribe {
        handler: SubscribedHandler<'a>,
        qos: QoS,
        name: Option<String<MAX_TOPIC_NAME_LEN>>,
    },
    /// Waits for UNSUBACK.
    Unsubscribe { handler: UnsubscribedHandler<'a> },
    /// Waits for PUBACK on a QoS 1 publish.
    Publish { handler: Option<PublishedHandler<'a>> },
    /// Waits for PUBREC on a QoS 2 publish.
    PublishQos2 { handler: Option<PublishedHandler<'a>> },
    /// Waits for PUBCOMP after PUBREL, under the publish's message id.
    PubRel { handler: Option<PublishedHandler<'a>> },
    /// Waits for the gateway's DISCONNECT.
    Disconnect,
    /// Waits for the gateway's DISCONNECT to a sleep request.
    Sleep { duration: u16 },
    /// Waits for the PINGRESP closing buffered delivery.
    Awake { mode: WakeMode },
}

/// Discriminant of [`Pending`], used to match acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionKind {
    Connect,
    Register,
    Subscribe,
    Unsubscribe,
    Publish,
    PublishQos2,
    PubRel,
    Disconnect,
    Sleep,
    Awake,
}

impl<'a> Pending<'a> {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Pending::Connect => TransactionKind::Connect,
            Pending::Register { .. } => TransactionKind::Register,
            Pending::Subscribe { .. } => TransactionKind::Subscribe,
            Pending::Unsubscribe { .. } => TransactionKind::Unsubscribe,
            Pending::Publish { .. } => TransactionKind::Publish,
            Pending::PublishQos2 { .. } => TransactionKind::PublishQos2,
            Pending::PubRel { .. } => TransactionKind::PubRel,
            Pending::Disconnect => TransactionKind::Disconnect,
            Pending::Sleep { .. } => TransactionKind::Sleep,
            Pending::Awake { .. } => TransactionKind::Awake,
        }
    }
}

/// One pending request.
pub struct Transaction<'a, const BUF_SIZE: usize> {
    pub msg_id: u16,
    pub pending: Pending<'a>,
    pub retries_left: u8,
    pub deadline: Instant,
    payload: Vec<u8, BUF_SIZE>,
}

impl<'a, const BUF_SIZE: usize> Transaction<'a, BUF_SIZE> {
    /// The datagram as last transmitted.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A request whose retransmission budget ran out.
pub struct Expired<'a> {
    pub msg_id: u16,
    pub pending: Pending<'a>,
}

/// Retransmission parameters taken from the session config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmission {
    pub timeout: Duration,
    pub count: u8,
}

/// Fixed-capacity table of pending requests keyed by message id.
pub struct TransactionTable<'a, const MAX_PENDING: usize, const BUF_SIZE: usize> {
    slots: [Option<Transaction<'a, BUF_SIZE>>; MAX_PENDING],
    next_msg_id: u16,
}

impl<'a, const MAX_PENDING: usize, const BUF_SIZE: usize> Default
    for TransactionTable<'a, MAX_PENDING, BUF_SIZE>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const MAX_PENDING: usize, const BUF_SIZE: usize>
    TransactionTable<'a, MAX_PENDING, BUF_SIZE>
{
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PENDING],
            next_msg_id: 0,
        }
    }

    /// Allocates a message id, encodes the request with it and stores it.
    ///
    /// Fails closed with `ResourceExhausted` when every slot is taken or the
    /// next id is still in use; nothing is evicted. A failed insert leaves the
    /// id counter untouched.
    pub fn insert(
        &mut self,
        pending: Pending<'a>,
        now: Instant,
        retransmission: Retransmission,
        encode: impl FnOnce(u16, &mut [u8]) -> Result<usize, EncodeError>,
    ) -> Result<&Transaction<'a, BUF_SIZE>, MqttsnError> {
        let msg_id = self.peek_msg_id();
        let slot = self.reserve(msg_id)?;
        let payload = encode_payload(msg_id, encode)?;
        self.next_msg_id = msg_id;
        Ok(self.fill(slot, msg_id, pending, now, retransmission, payload))
    }

    /// Stores the next step of an exchange under an id it already owns,
    /// such as PUBREL following PUBREC. The id counter is not touched.
    pub fn insert_with_id(
        &mut self,
        msg_id: u16,
        pending: Pending<'a>,
        now: Instant,
        retransmission: Retransmission,
        encode: impl FnOnce(u16, &mut [u8]) -> Result<usize, EncodeError>,
    ) -> Result<&Transaction<'a, BUF_SIZE>, MqttsnError> {
        let slot = self.reserve(msg_id)?;
        let payload = encode_payload(msg_id, encode)?;
        Ok(self.fill(slot, msg_id, pending, now, retransmission, payload))
    }

    /// Finds a free slot for `msg_id`, which must not be in use.
    fn reserve(&self, msg_id: u16) -> Result<usize, MqttsnError> {
        if self.contains(msg_id) {
            return Err(MqttsnError::ResourceExhausted);
        }
        self.slots
            .iter()
            .position(Option::is_none)
            .ok_or(MqttsnError::ResourceExhausted)
    }

    fn fill(
        &mut self,
        slot: usize,
        msg_id: u16,
        pending: Pending<'a>,
        now: Instant,
        retransmission: Retransmission,
        payload: Vec<u8, BUF_SIZE>,
    ) -> &Transaction<'a, BUF_SIZE> {
        self.slots[slot].insert(Transaction {
            msg_id,
            pending,
            retries_left: retransmission.count,
            deadline: now + retransmission.timeout,
            payload,
        })
    }

    /// Next id after the counter, wrapping around and skipping zero.
    fn peek_msg_id(&self) -> u16 {
        match self.next_msg_id.wrapping_add(1) {
            0 => 1,
            id => id,
        }
    }

    pub fn contains(&self, msg_id: u16) -> bool {
        self.iter().any(|tx| tx.msg_id == msg_id)
    }

    /// Removes and returns the request with `msg_id` if it is of `kind`.
    ///
    /// An acknowledgment whose id matches a request of another kind leaves
    /// the table untouched.
    pub fn take(&mut self, msg_id: u16, kind: TransactionKind) -> Option<Transaction<'a, BUF_SIZE>> {
        self.slots
            .iter_mut()
            .find(|slot| {
                slot.as_ref()
                    .is_some_and(|tx| tx.msg_id == msg_id && tx.pending.kind() == kind)
            })
            .and_then(Option::take)
    }

    /// Removes and returns the oldest-slotted request of `kind`.
    pub fn take_kind(&mut self, kind: TransactionKind) -> Option<Transaction<'a, BUF_SIZE>> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|tx| tx.pending.kind() == kind))
            .and_then(Option::take)
    }

    pub fn has_kind(&self, kind: TransactionKind) -> bool {
        self.iter().any(|tx| tx.pending.kind() == kind)
    }

    /// Drops a request without completing it. Used when the first send fails
    /// and the caller gets the error synchronously instead.
    pub fn remove(&mut self, msg_id: u16) -> bool {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|tx| tx.msg_id == msg_id))
            .and_then(Option::take)
            .is_some()
    }

    /// Advances retransmission state.
    ///
    /// Every request whose deadline has passed is either handed to
    /// `retransmit` unchanged (while retries remain) or removed and returned.
    pub fn tick(
        &mut self,
        now: Instant,
        timeout: Duration,
        mut retransmit: impl FnMut(u16, &[u8]),
    ) -> Vec<Expired<'a>, MAX_PENDING> {
        let mut expired: Vec<Expired<'a>, MAX_PENDING> = Vec::new();
        for slot in self.slots.iter_mut() {
            let Some(tx) = slot.as_mut() else {
                continue;
            };
            if tx.deadline > now {
                continue;
            }
            if tx.retries_left > 0 {
                tx.retries_left -= 1;
                tx.deadline = now + timeout;
                retransmit(tx.msg_id, &tx.payload);
            } else if let Some(tx) = slot.take() {
                // Cannot overflow: there are at most MAX_PENDING slots.
                let _ = expired.push(Expired {
                    msg_id: tx.msg_id,
                    pending: tx.pending,
                });
            }
        }
        expired
    }

    /// Empties the table, yielding every pending request.
    pub fn drain(&mut self) -> impl Iterator<Item = Transaction<'a, BUF_SIZE>> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction<'a, BUF_SIZE>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode_payload<const BUF_SIZE: usize>(
    msg_id: u16,
    encode: impl FnOnce(u16, &mut [u8]) -> Result<usize, EncodeError>,
) -> Result<Vec<u8, BUF_SIZE>, MqttsnError> {
    let mut payload: Vec<u8, BUF_SIZE> = Vec::new();
    payload
        .resize(BUF_SIZE, 0)
        .map_err(|_| MqttsnError::ResourceExhausted)?;
    let len = encode(msg_id, &mut payload)?;
    payload.truncate(len);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec as StdVec;

    const RETRANSMISSION: Retransmission = Retransmission {
        timeout: Duration::from_millis(1000),
        count: 3,
    };

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn encode_id(msg_id: u16, buf: &mut [u8]) -> Result<usize, EncodeError> {
        buf[..2].copy_from_slice(&msg_id.to_be_bytes());
        Ok(2)
    }

    fn insert(table: &mut TransactionTable<'_, 4, 16>, now: Instant) -> Result<u16, MqttsnError> {
        table
            .insert(Pending::Disconnect, now, RETRANSMISSION, encode_id)
            .map(|tx| tx.msg_id)
    }

    #[test]
    fn test_ids_are_unique_and_skip_zero() {
        let mut table = TransactionTable::<4, 16>::new();
        table.next_msg_id = u16::MAX - 1;
        assert_eq!(insert(&mut table, at(0)), Ok(u16::MAX));
        assert_eq!(insert(&mut table, at(0)), Ok(1));
        assert_eq!(insert(&mut table, at(0)), Ok(2));
    }

    #[test]
    fn test_full_table_fails_closed() {
        let mut table = TransactionTable::<4, 16>::new();
        for _ in 0..4 {
            insert(&mut table, at(0)).unwrap();
        }
        assert_eq!(insert(&mut table, at(0)), Err(MqttsnError::ResourceExhausted));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_id_collision_is_exhaustion() {
        let mut table = TransactionTable::<4, 16>::new();
        insert(&mut table, at(0)).unwrap();
        table.next_msg_id = 0;
        assert_eq!(insert(&mut table, at(0)), Err(MqttsnError::ResourceExhausted));
        assert_eq!(table.next_msg_id, 0);
    }

    #[test]
    fn test_failed_encode_keeps_counter() {
        let mut table = TransactionTable::<4, 16>::new();
        let result = table.insert(Pending::Disconnect, at(0), RETRANSMISSION, |_, _| {
            Err(EncodeError::BufferTooSmall)
        });
        assert!(matches!(result, Err(MqttsnError::ResourceExhausted)));
        assert!(table.is_empty());
        assert_eq!(insert(&mut table, at(0)), Ok(1));
    }

    #[test]
    fn test_take_matches_kind() {
        let mut table = TransactionTable::<4, 16>::new();
        let id = insert(&mut table, at(0)).unwrap();
        assert!(table.take(id, TransactionKind::Register).is_none());
        assert!(table.take(id + 1, TransactionKind::Disconnect).is_none());
        let tx = table.take(id, TransactionKind::Disconnect).unwrap();
        assert_eq!(tx.payload(), &id.to_be_bytes());
        assert!(table.is_empty());
    }

    #[test]
    fn test_retransmits_then_expires() {
        let mut table = TransactionTable::<4, 16>::new();
        let id = insert(&mut table, at(0)).unwrap();
        let mut sent = StdVec::new();

        let mut now = 0;
        let mut expired_at = None;
        while now <= 10_000 {
            let expired = table.tick(at(now), RETRANSMISSION.timeout, |msg_id, bytes| {
                sent.push((now, msg_id, bytes.to_vec()));
            });
            if !expired.is_empty() {
                assert_eq!(expired.len(), 1);
                assert_eq!(expired[0].msg_id, id);
                assert!(expired_at.is_none());
                expired_at = Some(now);
            }
            now += 100;
        }

        let times: StdVec<u64> = sent.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(times, [1000u64, 2000, 3000]);
        assert!(sent.iter().all(|(_, _, bytes)| bytes == &id.to_be_bytes()));
        assert_eq!(expired_at, Some(4000));
        assert!(table.is_empty());
    }

    #[test]
    fn test_follow_up_keeps_message_id() {
        let mut table = TransactionTable::<4, 16>::new();
        let id = insert(&mut table, at(0)).unwrap();
        assert_eq!(
            table
                .insert_with_id(id, Pending::Disconnect, at(0), RETRANSMISSION, encode_id)
                .map(|tx| tx.msg_id)
                .err(),
            Some(MqttsnError::ResourceExhausted)
        );

        table.take(id, TransactionKind::Disconnect).unwrap();
        let follow_up = table
            .insert_with_id(id, Pending::Disconnect, at(500), RETRANSMISSION, encode_id)
            .unwrap();
        assert_eq!(follow_up.msg_id, id);
        assert_eq!(follow_up.deadline, at(1500));
        assert_eq!(insert(&mut table, at(0)), Ok(id + 1));
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = TransactionTable::<4, 16>::new();
        insert(&mut table, at(0)).unwrap();
        insert(&mut table, at(0)).unwrap();
        assert_eq!(table.drain().count(), 2);
        assert!(table.is_empty());
    }
}
