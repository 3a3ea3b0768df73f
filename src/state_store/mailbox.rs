//! Per-recipient mailbox engine
//!
//! One [`MailboxState`] owns everything for a single recipient: the queue,
//! the in-flight map, the dead letter queue, the partition counters and the
//! idempotency index. The [`super::StateStore`] serializes access per agent,
//! so all methods here take `&mut self` and are written as plain,
//! non-blocking state transitions.
//!
//! Invariants enforced here:
//! - within a partition, delivery follows `partition_seq` order and at most
//!   one message is in flight at a time;
//! - a message transitions to in-flight at most `max_attempts` times, then
//!   moves to the dead letter queue;
//! - expired leases are recovered opportunistically at the start of the next
//!   receive pass; there is no timer.

use crate::domain_types::{
    AgentId, AttemptCount, IdempotencyKey, MaxDeliveryAttempts, MessageId, PartitionKey,
    PartitionSeq, RunId, TopicName,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime};

/// Lifecycle status of an inter-agent message.
///
/// Transitions: `queued ↔ in_flight → {acked, dead_letter}`, plus
/// `dead_letter → queued` on an explicit requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting in the queue for a receive pass
    Queued,
    /// Delivered under a lease, awaiting ack or nack
    InFlight,
    /// Acknowledged; terminal
    Acked,
    /// Delivery budget exhausted; quarantined until requeued
    DeadLetter,
}

/// An inter-agent message as stored in a mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMessage {
    /// Unique id assigned on enqueue
    pub message_id: MessageId,
    /// When the message was enqueued
    pub timestamp: SystemTime,
    /// Sending agent
    pub from: AgentId,
    /// Receiving agent
    pub to: AgentId,
    /// Arbitrary payload
    pub payload: Value,
    /// Optional topic
    pub topic: Option<TopicName>,
    /// Partition the message is ordered within
    pub partition_key: PartitionKey,
    /// Position within the partition
    pub partition_seq: PartitionSeq,
    /// Key that collapses duplicate sends, if any
    pub idempotency_key: Option<IdempotencyKey>,
    /// Delivery attempts consumed so far
    pub attempt: AttemptCount,
    /// Delivery budget
    pub max_attempts: MaxDeliveryAttempts,
    /// Earliest time the message may be delivered
    pub visible_at: SystemTime,
    /// Lease deadline while in flight
    pub lease_until: Option<SystemTime>,
    /// Current lifecycle status
    pub status: MessageStatus,
    /// Error recorded by the most recent nack or expiry
    pub last_error: Option<String>,
    /// Correlates request/response pairs across agents
    pub correlation_id: Option<String>,
    /// Run that sent the message, if any
    pub run_id: Option<RunId>,
}

/// Fields the caller supplies when enqueuing a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Sending agent
    pub from: AgentId,
    /// Receiving agent
    pub to: AgentId,
    /// Arbitrary payload
    pub payload: Value,
    /// Optional topic
    pub topic: Option<TopicName>,
    /// Explicit partition key; falls back to the topic, then the default
    /// partition
    pub partition_key: Option<PartitionKey>,
    /// Key that collapses duplicate sends, if any
    pub idempotency_key: Option<IdempotencyKey>,
    /// Delivery budget
    pub max_attempts: MaxDeliveryAttempts,
    /// Earliest delivery time; defaults to now
    pub visible_at: Option<SystemTime>,
    /// Correlates request/response pairs across agents
    pub correlation_id: Option<String>,
    /// Run that sent the message, if any
    pub run_id: Option<RunId>,
}

/// What one receive pass produced
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// Messages delivered under a fresh lease, in queue order
    pub delivered: Vec<MailboxMessage>,
    /// Messages moved to the dead letter queue during this pass
    pub dead_lettered: Vec<MailboxMessage>,
}

/// Result of a nack
#[derive(Debug)]
pub struct NackOutcome {
    /// The message went back to the queue
    pub requeued: bool,
    /// The message moved to the dead letter queue
    pub dead_lettered: bool,
    /// Copy of the message after the transition
    pub message: MailboxMessage,
}

/// Counts of messages removed by a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Queued messages removed
    pub queued: usize,
    /// In-flight messages removed
    pub in_flight: usize,
    /// Dead letters removed
    pub dead_letters: usize,
}

/// Point-in-time mailbox counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    /// Messages waiting in the queue
    pub queued: usize,
    /// Messages out under a lease
    pub in_flight: usize,
    /// Messages in the dead letter queue
    pub dead_letters: usize,
    /// Partitions that have ever carried a message
    pub partitions: usize,
}

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    message_id: MessageId,
    expires_at: SystemTime,
}

/// All mailbox state for one recipient
#[derive(Debug, Default)]
pub struct MailboxState {
    queue: VecDeque<MailboxMessage>,
    in_flight: HashMap<MessageId, MailboxMessage>,
    dead_letters: VecDeque<MailboxMessage>,
    acked: HashMap<MessageId, MailboxMessage>,
    partition_seqs: HashMap<PartitionKey, PartitionSeq>,
    idempotency: HashMap<IdempotencyKey, IdempotencyEntry>,
}

impl MailboxState {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message: assigns its id and partition sequence, resolves
    /// the partition key (explicit → topic → default) and inserts it at its
    /// partition-ordered slot. Returns a copy of the stored message.
    pub fn enqueue(&mut self, new: NewMessage, now: SystemTime) -> MailboxMessage {
        let partition_key = new.partition_key.unwrap_or_else(|| {
            new.topic.as_ref().map_or_else(PartitionKey::default_partition, |topic| {
                PartitionKey::try_new(topic.as_str()).expect("topic is a valid partition key")
            })
        });

        let slot = self
            .partition_seqs
            .entry(partition_key.clone())
            .or_insert_with(PartitionSeq::zero);
        let partition_seq = *slot;
        *slot = slot.next();

        let message = MailboxMessage {
            message_id: MessageId::generate(),
            timestamp: now,
            from: new.from,
            to: new.to,
            payload: new.payload,
            topic: new.topic,
            partition_key,
            partition_seq,
            idempotency_key: new.idempotency_key,
            attempt: AttemptCount::zero(),
            max_attempts: new.max_attempts,
            visible_at: new.visible_at.unwrap_or(now),
            lease_until: None,
            status: MessageStatus::Queued,
            last_error: None,
            correlation_id: new.correlation_id,
            run_id: new.run_id,
        };
        self.insert_partition_ordered(message.clone());
        message
    }

    /// Delivers up to `limit` messages under `lease` and returns copies.
    ///
    /// Expired leases are recovered first: each expired in-flight message is
    /// requeued, or dead-lettered when its budget is spent. The queue walk
    /// then skips blocked partitions (those with an in-flight message),
    /// blocks partitions whose head is not yet visible, and dead-letters any
    /// message whose next attempt would exceed its budget.
    pub fn receive(&mut self, now: SystemTime, limit: usize, lease: Duration) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome::default();

        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, message)| message.lease_until.is_some_and(|until| until <= now))
            .map(|(id, _)| *id)
            .collect();
        for message_id in expired {
            let Some(mut message) = self.in_flight.remove(&message_id) else {
                continue;
            };
            message.lease_until = None;
            if message.attempt.exhausted(message.max_attempts) {
                message.status = MessageStatus::DeadLetter;
                message.last_error = Some("lease expired after max delivery attempts".to_string());
                outcome.dead_lettered.push(message.clone());
                self.dead_letters.push_back(message);
            } else {
                message.status = MessageStatus::Queued;
                message.visible_at = now;
                self.insert_partition_ordered(message);
            }
        }

        let mut blocked: HashSet<PartitionKey> = self
            .in_flight
            .values()
            .map(|message| message.partition_key.clone())
            .collect();

        let mut index = 0;
        while index < self.queue.len() {
            let partition_key = self.queue[index].partition_key.clone();
            if blocked.contains(&partition_key) {
                index += 1;
                continue;
            }
            if self.queue[index].visible_at > now {
                // Nothing behind this message in its partition may jump ahead.
                blocked.insert(partition_key);
                index += 1;
                continue;
            }
            if outcome.delivered.len() == limit {
                index += 1;
                continue;
            }

            let Some(mut message) = self.queue.remove(index) else {
                break;
            };
            let next_attempt = message.attempt.increment();
            if next_attempt.as_u32() > message.max_attempts.as_u32() {
                message.status = MessageStatus::DeadLetter;
                message.last_error = Some("delivery attempts exhausted".to_string());
                outcome.dead_lettered.push(message.clone());
                self.dead_letters.push_back(message);
                continue;
            }

            message.status = MessageStatus::InFlight;
            message.attempt = next_attempt;
            message.lease_until = Some(now + lease);
            blocked.insert(partition_key);
            outcome.delivered.push(message.clone());
            self.in_flight.insert(message.message_id, message);
        }

        outcome
    }

    /// Acknowledges an in-flight message. Returns the message if it was in
    /// flight, `None` otherwise.
    pub fn ack(&mut self, message_id: MessageId) -> Option<MailboxMessage> {
        let mut message = self.in_flight.remove(&message_id)?;
        message.status = MessageStatus::Acked;
        message.lease_until = None;
        self.acked.insert(message_id, message.clone());
        Some(message)
    }

    /// Negatively acknowledges an in-flight message. With budget remaining
    /// the message is requeued after `requeue_delay`; otherwise it is
    /// dead-lettered. Returns `None` if the message was not in flight.
    pub fn nack(
        &mut self,
        message_id: MessageId,
        error: Option<String>,
        requeue_delay: Duration,
        now: SystemTime,
    ) -> Option<NackOutcome> {
        let mut message = self.in_flight.remove(&message_id)?;
        message.lease_until = None;
        message.last_error = error;
        if message.attempt.exhausted(message.max_attempts) {
            message.status = MessageStatus::DeadLetter;
            self.dead_letters.push_back(message.clone());
            Some(NackOutcome {
                requeued: false,
                dead_lettered: true,
                message,
            })
        } else {
            message.status = MessageStatus::Queued;
            message.visible_at = now + requeue_delay;
            self.insert_partition_ordered(message.clone());
            Some(NackOutcome {
                requeued: true,
                dead_lettered: false,
                message,
            })
        }
    }

    /// Moves a dead letter back to the queue, optionally resetting its
    /// attempt count. Returns `None` if the id is not in the dead letter
    /// queue.
    pub fn requeue_dead_letter(
        &mut self,
        message_id: MessageId,
        delay: Duration,
        reset_attempts: bool,
        now: SystemTime,
    ) -> Option<MailboxMessage> {
        let position = self
            .dead_letters
            .iter()
            .position(|message| message.message_id == message_id)?;
        let mut message = self
            .dead_letters
            .remove(position)
            .expect("position came from a scan of the same deque");
        message.status = MessageStatus::Queued;
        message.last_error = None;
        message.lease_until = None;
        message.visible_at = now + delay;
        if reset_attempts {
            message.attempt = AttemptCount::zero();
        }
        self.insert_partition_ordered(message.clone());
        Some(message)
    }

    /// Returns copies of up to `limit` dead letters, oldest first.
    #[must_use]
    pub fn dead_letter_messages(&self, limit: Option<usize>) -> Vec<MailboxMessage> {
        let take = limit.unwrap_or(usize::MAX);
        self.dead_letters.iter().take(take).cloned().collect()
    }

    /// Empties the queue, the in-flight map and the dead letter queue.
    pub fn drain(&mut self) -> DrainReport {
        let report = DrainReport {
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            dead_letters: self.dead_letters.len(),
        };
        self.queue.clear();
        self.in_flight.clear();
        self.dead_letters.clear();
        report
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            dead_letters: self.dead_letters.len(),
            partitions: self.partition_seqs.len(),
        }
    }

    /// Looks a message up by id in any non-terminal or terminal collection.
    #[must_use]
    pub fn find_message(&self, message_id: MessageId) -> Option<&MailboxMessage> {
        self.in_flight
            .get(&message_id)
            .or_else(|| self.queue.iter().find(|m| m.message_id == message_id))
            .or_else(|| {
                self.dead_letters
                    .iter()
                    .find(|m| m.message_id == message_id)
            })
            .or_else(|| self.acked.get(&message_id))
    }

    /// Records an idempotency entry, sweeping expired entries first.
    pub fn save_idempotency(
        &mut self,
        key: IdempotencyKey,
        message_id: MessageId,
        expires_at: SystemTime,
        now: SystemTime,
    ) {
        self.idempotency.retain(|_, entry| entry.expires_at > now);
        self.idempotency.insert(
            key,
            IdempotencyEntry {
                message_id,
                expires_at,
            },
        );
    }

    /// Returns the message a non-expired idempotency entry points at.
    #[must_use]
    pub fn find_by_idempotency(
        &self,
        key: &IdempotencyKey,
        now: SystemTime,
    ) -> Option<MailboxMessage> {
        let entry = self.idempotency.get(key)?;
        if entry.expires_at <= now {
            return None;
        }
        self.find_message(entry.message_id).cloned()
    }

    /// Partitions with an in-flight message right now.
    #[must_use]
    pub fn in_flight_partitions(&self) -> HashSet<PartitionKey> {
        self.in_flight
            .values()
            .map(|message| message.partition_key.clone())
            .collect()
    }

    // Requeued messages must land before any same-partition message with a
    // larger sequence; fresh messages always carry the largest sequence of
    // their partition and fall through to the back.
    fn insert_partition_ordered(&mut self, message: MailboxMessage) {
        let position = self.queue.iter().position(|queued| {
            queued.partition_key == message.partition_key
                && queued.partition_seq > message.partition_seq
        });
        match position {
            Some(index) => self.queue.insert(index, message),
            None => self.queue.push_back(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::UNIX_EPOCH;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    fn epoch() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn new_message(topic: Option<&str>, visible_at: Option<SystemTime>, max: u32) -> NewMessage {
        NewMessage {
            from: agent("a"),
            to: agent("b"),
            payload: json!({"n": 1}),
            topic: topic.map(|t| TopicName::try_new(t).unwrap()),
            partition_key: None,
            idempotency_key: None,
            max_attempts: MaxDeliveryAttempts::try_new(max).unwrap(),
            visible_at,
            correlation_id: None,
            run_id: None,
        }
    }

    #[test]
    fn enqueue_resolves_partition_key_and_assigns_sequences() {
        let mut mailbox = MailboxState::new();
        let now = epoch();

        let first = mailbox.enqueue(new_message(Some("t1"), None, 3), now);
        let second = mailbox.enqueue(new_message(Some("t1"), None, 3), now);
        let bare = mailbox.enqueue(new_message(None, None, 3), now);

        assert_eq!(first.partition_key.as_str(), "t1");
        assert_eq!(first.partition_seq, PartitionSeq::zero());
        assert_eq!(second.partition_seq, PartitionSeq::zero().next());
        assert_eq!(bare.partition_key.as_str(), "__default__");
        assert_eq!(first.status, MessageStatus::Queued);
        assert_eq!(first.attempt, AttemptCount::zero());
    }

    #[test]
    fn receive_delivers_at_most_one_per_partition() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        mailbox.enqueue(new_message(Some("a"), None, 3), now);
        mailbox.enqueue(new_message(Some("a"), None, 3), now);
        mailbox.enqueue(new_message(Some("b"), None, 3), now);

        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        let partitions: Vec<&str> = outcome
            .delivered
            .iter()
            .map(|m| m.partition_key.as_str())
            .collect();
        assert_eq!(partitions, vec!["a", "b"]);
        assert_eq!(mailbox.stats().in_flight, 2);

        // Nothing further until the in-flight messages are terminal.
        let again = mailbox.receive(now, 10, Duration::from_secs(60));
        assert!(again.delivered.is_empty());
    }

    #[test]
    fn delayed_head_blocks_its_partition_but_not_others() {
        // Scenario: (topic A, visible now+60s), (topic A, now), (topic B, now).
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let delayed = mailbox.enqueue(
            new_message(Some("A"), Some(now + Duration::from_secs(60)), 3),
            now,
        );
        mailbox.enqueue(new_message(Some("A"), None, 3), now);
        let b = mailbox.enqueue(new_message(Some("B"), None, 3), now);

        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].message_id, b.message_id);

        assert!(mailbox.ack(b.message_id).is_some());

        let later = now + Duration::from_millis(60_001);
        let outcome = mailbox.receive(later, 10, Duration::from_secs(60));
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].message_id, delayed.message_id);
    }

    #[test]
    fn receive_respects_the_limit_without_blocking_partitions() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        for topic in ["a", "b", "c"] {
            mailbox.enqueue(new_message(Some(topic), None, 3), now);
        }

        let outcome = mailbox.receive(now, 2, Duration::from_secs(60));
        assert_eq!(outcome.delivered.len(), 2);

        // The third partition was merely kept, not blocked; acking one
        // in-flight message does not matter for it.
        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].partition_key.as_str(), "c");
    }

    #[test]
    fn nack_requeues_until_budget_then_dead_letters() {
        // maxAttempts=2: receive → nack → receive → nack → DLQ.
        let mut mailbox = MailboxState::new();
        let now = epoch();
        mailbox.enqueue(new_message(Some("t"), None, 2), now);

        let first = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(first.delivered[0].attempt.as_u32(), 1);
        let outcome = mailbox
            .nack(
                first.delivered[0].message_id,
                Some("boom".to_string()),
                Duration::ZERO,
                now,
            )
            .unwrap();
        assert!(outcome.requeued);
        assert!(!outcome.dead_lettered);

        let second = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(second.delivered[0].attempt.as_u32(), 2);
        let outcome = mailbox
            .nack(
                second.delivered[0].message_id,
                Some("boom again".to_string()),
                Duration::ZERO,
                now,
            )
            .unwrap();
        assert!(!outcome.requeued);
        assert!(outcome.dead_lettered);
        assert_eq!(outcome.message.status, MessageStatus::DeadLetter);
        assert_eq!(outcome.message.last_error.as_deref(), Some("boom again"));

        let stats = mailbox.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_letters, 1);
    }

    #[test]
    fn requeue_dead_letter_with_reset_is_receivable_again() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let message = mailbox.enqueue(new_message(Some("t"), None, 1), now);

        let delivered = mailbox.receive(now, 10, Duration::from_secs(60));
        mailbox
            .nack(
                delivered.delivered[0].message_id,
                Some("no".to_string()),
                Duration::ZERO,
                now,
            )
            .unwrap();
        assert_eq!(mailbox.stats().dead_letters, 1);

        let requeued = mailbox
            .requeue_dead_letter(message.message_id, Duration::ZERO, true, now)
            .unwrap();
        assert_eq!(requeued.attempt, AttemptCount::zero());
        assert!(requeued.last_error.is_none());

        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].message_id, message.message_id);
        assert_eq!(outcome.delivered[0].attempt.as_u32(), 1);
    }

    #[test]
    fn requeue_dead_letter_without_reset_dead_letters_on_next_receive() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let message = mailbox.enqueue(new_message(Some("t"), None, 1), now);

        let delivered = mailbox.receive(now, 10, Duration::from_secs(60));
        mailbox
            .nack(delivered.delivered[0].message_id, None, Duration::ZERO, now)
            .unwrap();
        mailbox
            .requeue_dead_letter(message.message_id, Duration::ZERO, false, now)
            .unwrap();

        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.dead_lettered.len(), 1);
        assert_eq!(
            outcome.dead_lettered[0].last_error.as_deref(),
            Some("delivery attempts exhausted")
        );
    }

    #[test]
    fn expired_lease_requeues_with_budget_remaining() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let message = mailbox.enqueue(new_message(Some("t"), None, 3), now);

        mailbox.receive(now, 10, Duration::from_secs(30));
        assert_eq!(mailbox.stats().in_flight, 1);

        // Before the lease deadline nothing changes.
        let early = mailbox.receive(now + Duration::from_secs(29), 10, Duration::from_secs(30));
        assert!(early.delivered.is_empty());

        // At the deadline the message is requeued and immediately
        // redeliverable.
        let at_deadline = now + Duration::from_secs(30);
        let outcome = mailbox.receive(at_deadline, 10, Duration::from_secs(30));
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].message_id, message.message_id);
        assert_eq!(outcome.delivered[0].attempt.as_u32(), 2);
    }

    #[test]
    fn expired_lease_without_budget_dead_letters() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        mailbox.enqueue(new_message(Some("t"), None, 1), now);

        mailbox.receive(now, 10, Duration::from_secs(30));
        let outcome = mailbox.receive(now + Duration::from_secs(31), 10, Duration::from_secs(30));
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.dead_lettered.len(), 1);
        assert_eq!(
            outcome.dead_lettered[0].last_error.as_deref(),
            Some("lease expired after max delivery attempts")
        );
        assert_eq!(mailbox.stats().dead_letters, 1);
    }

    #[test]
    fn requeued_message_keeps_its_partition_slot() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let first = mailbox.enqueue(new_message(Some("t"), None, 3), now);
        let second = mailbox.enqueue(new_message(Some("t"), None, 3), now);

        let delivered = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(delivered.delivered[0].message_id, first.message_id);
        mailbox
            .nack(first.message_id, None, Duration::ZERO, now)
            .unwrap();

        // The requeued first message must come back before the second one.
        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].message_id, first.message_id);
        let _ = mailbox.ack(first.message_id);

        let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
        assert_eq!(outcome.delivered[0].message_id, second.message_id);
    }

    #[test]
    fn ack_of_unknown_message_is_a_miss() {
        let mut mailbox = MailboxState::new();
        assert!(mailbox.ack(MessageId::generate()).is_none());
        assert!(
            mailbox
                .nack(MessageId::generate(), None, Duration::ZERO, epoch())
                .is_none()
        );
    }

    #[test]
    fn idempotency_entries_expire_and_sweep() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let message = mailbox.enqueue(new_message(Some("t"), None, 3), now);
        let key = IdempotencyKey::try_new("k1").unwrap();

        mailbox.save_idempotency(
            key.clone(),
            message.message_id,
            now + Duration::from_secs(60),
            now,
        );
        assert!(mailbox.find_by_idempotency(&key, now).is_some());
        assert!(
            mailbox
                .find_by_idempotency(&key, now + Duration::from_secs(60))
                .is_none()
        );

        // Saving another key past the expiry sweeps the stale entry.
        let later = now + Duration::from_secs(120);
        mailbox.save_idempotency(
            IdempotencyKey::try_new("k2").unwrap(),
            message.message_id,
            later + Duration::from_secs(60),
            later,
        );
        assert!(!mailbox.idempotency.contains_key(&key));
    }

    #[test]
    fn find_by_idempotency_sees_acked_messages() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        let message = mailbox.enqueue(new_message(Some("t"), None, 3), now);
        let key = IdempotencyKey::try_new("k").unwrap();
        mailbox.save_idempotency(
            key.clone(),
            message.message_id,
            now + Duration::from_secs(60),
            now,
        );

        mailbox.receive(now, 10, Duration::from_secs(60));
        mailbox.ack(message.message_id).unwrap();

        let found = mailbox.find_by_idempotency(&key, now).unwrap();
        assert_eq!(found.status, MessageStatus::Acked);
    }

    #[test]
    fn drain_reports_and_clears_everything() {
        let mut mailbox = MailboxState::new();
        let now = epoch();
        mailbox.enqueue(new_message(Some("a"), None, 1), now);
        mailbox.enqueue(new_message(Some("b"), None, 1), now);
        let delivered = mailbox.receive(now, 1, Duration::from_secs(60));
        mailbox
            .nack(delivered.delivered[0].message_id, None, Duration::ZERO, now)
            .unwrap();

        let report = mailbox.drain();
        assert_eq!(report.queued, 1);
        assert_eq!(report.in_flight, 0);
        assert_eq!(report.dead_letters, 1);
        let stats = mailbox.stats();
        assert_eq!(stats.queued + stats.in_flight + stats.dead_letters, 0);
    }

    proptest! {
        /// Within any partition, full drain order equals enqueue order, no
        /// matter how partitions interleave.
        #[test]
        fn partition_order_is_preserved(partitions in proptest::collection::vec(0usize..3, 1..40)) {
            let mut mailbox = MailboxState::new();
            let now = epoch();
            let mut expected: HashMap<String, Vec<MessageId>> = HashMap::new();

            for partition in &partitions {
                let topic = format!("p{partition}");
                let message = mailbox.enqueue(new_message(Some(&topic), None, 3), now);
                expected.entry(topic).or_default().push(message.message_id);
            }

            let mut observed: HashMap<String, Vec<MessageId>> = HashMap::new();
            loop {
                let outcome = mailbox.receive(now, 64, Duration::from_secs(60));
                if outcome.delivered.is_empty() {
                    break;
                }
                for message in outcome.delivered {
                    observed
                        .entry(message.partition_key.as_str().to_string())
                        .or_default()
                        .push(message.message_id);
                    prop_assert!(mailbox.ack(message.message_id).is_some());
                }
            }

            prop_assert_eq!(observed, expected);
        }

        /// A message is delivered at most `max_attempts` times and then lands
        /// in the dead letter queue.
        #[test]
        fn attempts_are_bounded(max in 1u32..5) {
            let mut mailbox = MailboxState::new();
            let now = epoch();
            let message = mailbox.enqueue(new_message(Some("t"), None, max), now);

            let mut deliveries = 0;
            loop {
                let outcome = mailbox.receive(now, 10, Duration::from_secs(60));
                if outcome.delivered.is_empty() {
                    break;
                }
                deliveries += 1;
                mailbox.nack(message.message_id, None, Duration::ZERO, now).unwrap();
            }

            prop_assert_eq!(deliveries, max);
            prop_assert_eq!(mailbox.stats().dead_letters, 1);
        }
    }
}
