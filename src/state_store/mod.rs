//! Authoritative in-memory state for the kernel
//!
//! The [`StateStore`] exclusively owns every mutable collection: agent
//! profiles, run records, route bindings, sticky sessions, the session
//! index and the per-agent mailboxes. Other components hold a shared handle
//! and go through these methods; every return value is a copy so callers can
//! never mutate internal state.
//!
//! Mailbox state is serialized per agent behind its own lock, preserving the
//! partition-order invariant without a global lock; cross-agent operations
//! proceed independently.

pub mod mailbox;

use crate::agent::AgentProfile;
use crate::domain_types::{
    AgentId, BindingId, IdempotencyKey, MessageId, RouteBinding, RunId, RunRecord, SessionId,
    StickyKey,
};
use dashmap::DashMap;
use mailbox::{
    DrainReport, MailboxMessage, MailboxState, MailboxStats, NackOutcome, NewMessage,
    ReceiveOutcome,
};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

/// Process-wide state store
#[derive(Default)]
pub struct StateStore {
    profiles: DashMap<AgentId, AgentProfile>,
    registration_order: RwLock<Vec<AgentId>>,
    runs: DashMap<RunId, RunRecord>,
    spawn_counts: DashMap<RunId, usize>,
    bindings: RwLock<Vec<RouteBinding>>,
    sticky: DashMap<StickyKey, AgentId>,
    sessions: DashMap<SessionId, AgentId>,
    agent_sessions: DashMap<AgentId, SessionId>,
    mailboxes: DashMap<AgentId, Arc<Mutex<MailboxState>>>,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- agent profiles ----------------------------------------------------

    /// Inserts or replaces an agent profile. Returns a copy of the stored
    /// profile.
    pub fn upsert_profile(&self, profile: AgentProfile) -> AgentProfile {
        let agent_id = profile.agent_id.clone();
        let is_new = !self.profiles.contains_key(&agent_id);
        self.profiles.insert(agent_id.clone(), profile.clone());
        if is_new {
            self.registration_order
                .write()
                .expect("registration order lock poisoned")
                .push(agent_id);
        }
        profile
    }

    /// Returns a copy of an agent's profile.
    #[must_use]
    pub fn profile(&self, agent_id: &AgentId) -> Option<AgentProfile> {
        self.profiles.get(agent_id).map(|entry| entry.clone())
    }

    /// Whether an agent is registered.
    #[must_use]
    pub fn contains_agent(&self, agent_id: &AgentId) -> bool {
        self.profiles.contains_key(agent_id)
    }

    /// All registered profiles, in registration order.
    ///
    /// Registration order makes routing candidate iteration deterministic.
    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentProfile> {
        self.registration_order
            .read()
            .expect("registration order lock poisoned")
            .iter()
            .filter_map(|id| self.profiles.get(id).map(|entry| entry.clone()))
            .collect()
    }

    /// Number of registered agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.profiles.len()
    }

    // ---- runs --------------------------------------------------------------

    /// Persists a new run record.
    pub fn insert_run(&self, record: RunRecord) {
        self.runs.insert(record.run_id, record);
    }

    /// Returns a copy of a run record.
    #[must_use]
    pub fn run(&self, run_id: RunId) -> Option<RunRecord> {
        self.runs.get(&run_id).map(|entry| entry.clone())
    }

    /// Applies `mutate` to a run record under the store's lock and returns a
    /// copy of the updated record.
    pub fn update_run(
        &self,
        run_id: RunId,
        mutate: impl FnOnce(&mut RunRecord),
    ) -> Option<RunRecord> {
        let mut entry = self.runs.get_mut(&run_id)?;
        mutate(&mut entry);
        Some(entry.clone())
    }

    /// Copies of all run records, oldest first.
    #[must_use]
    pub fn list_runs(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.runs.iter().map(|entry| entry.clone()).collect();
        runs.sort_by_key(|record| record.created_at);
        runs
    }

    /// Copies of the direct child runs of `parent`, oldest first.
    #[must_use]
    pub fn child_runs(&self, parent: RunId) -> Vec<RunRecord> {
        let mut children: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|entry| entry.parent_run_id == Some(parent))
            .map(|entry| entry.clone())
            .collect();
        children.sort_by_key(|record| record.created_at);
        children
    }

    /// Runs currently queued or running, across all agents.
    #[must_use]
    pub fn active_run_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|entry| entry.status.is_active())
            .count()
    }

    /// Runs currently queued or running for one agent.
    #[must_use]
    pub fn active_runs_for(&self, agent_id: &AgentId) -> usize {
        self.runs
            .iter()
            .filter(|entry| entry.agent_id == *agent_id && entry.status.is_active())
            .count()
    }

    /// Whether an agent has a queued or running run right now.
    #[must_use]
    pub fn has_active_run(&self, agent_id: &AgentId) -> bool {
        self.active_runs_for(agent_id) > 0
    }

    /// Total runs ever recorded.
    #[must_use]
    pub fn total_runs(&self) -> usize {
        self.runs.len()
    }

    /// Records one spawned child for `parent` and returns the new count.
    pub fn record_spawn(&self, parent: RunId) -> usize {
        let mut entry = self.spawn_counts.entry(parent).or_insert(0);
        *entry += 1;
        *entry
    }

    /// How many children `parent` has spawned.
    #[must_use]
    pub fn spawned_children(&self, parent: RunId) -> usize {
        self.spawn_counts
            .get(&parent)
            .map_or(0, |entry| *entry.value())
    }

    // ---- route bindings ----------------------------------------------------

    /// Adds a binding.
    pub fn add_binding(&self, binding: RouteBinding) {
        self.bindings
            .write()
            .expect("bindings lock poisoned")
            .push(binding);
    }

    /// Removes a binding by id. Returns whether it existed.
    pub fn remove_binding(&self, binding_id: &BindingId) -> bool {
        let mut bindings = self.bindings.write().expect("bindings lock poisoned");
        let before = bindings.len();
        bindings.retain(|binding| binding.binding_id != *binding_id);
        bindings.len() != before
    }

    /// Copies of all bindings sorted by ascending priority; insertion order
    /// breaks ties.
    #[must_use]
    pub fn list_bindings(&self) -> Vec<RouteBinding> {
        let mut bindings = self
            .bindings
            .read()
            .expect("bindings lock poisoned")
            .clone();
        bindings.sort_by_key(|binding| binding.priority);
        bindings
    }

    // ---- sticky sessions ---------------------------------------------------

    /// The agent pinned to a sticky key, if any.
    #[must_use]
    pub fn sticky_for(&self, key: &StickyKey) -> Option<AgentId> {
        self.sticky.get(key).map(|entry| entry.clone())
    }

    /// Pins a sticky key to an agent.
    pub fn set_sticky(&self, key: StickyKey, agent_id: AgentId) {
        self.sticky.insert(key, agent_id);
    }

    /// Removes a sticky pin. Returns whether it existed.
    pub fn clear_sticky(&self, key: &StickyKey) -> bool {
        self.sticky.remove(key).is_some()
    }

    // ---- session index -----------------------------------------------------

    /// Associates a session with an agent, in both directions.
    pub fn bind_session(&self, session_id: SessionId, agent_id: AgentId) {
        self.sessions.insert(session_id.clone(), agent_id.clone());
        self.agent_sessions.insert(agent_id, session_id);
    }

    /// The agent behind a session id.
    #[must_use]
    pub fn agent_for_session(&self, session_id: &SessionId) -> Option<AgentId> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// The most recent session of an agent.
    #[must_use]
    pub fn session_for_agent(&self, agent_id: &AgentId) -> Option<SessionId> {
        self.agent_sessions
            .get(agent_id)
            .map(|entry| entry.clone())
    }

    // ---- mailboxes ---------------------------------------------------------

    fn with_mailbox<T>(&self, agent_id: &AgentId, f: impl FnOnce(&mut MailboxState) -> T) -> T {
        let mailbox = self
            .mailboxes
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(MailboxState::new())))
            .clone();
        let mut guard = mailbox.lock().expect("mailbox mutex poisoned");
        f(&mut guard)
    }

    /// Enqueues a message into the recipient's mailbox.
    pub fn enqueue_message(&self, new: NewMessage, now: SystemTime) -> MailboxMessage {
        let to = new.to.clone();
        self.with_mailbox(&to, |mailbox| mailbox.enqueue(new, now))
    }

    /// Runs one receive pass over an agent's mailbox.
    pub fn receive_messages(
        &self,
        agent_id: &AgentId,
        now: SystemTime,
        limit: usize,
        lease: Duration,
    ) -> ReceiveOutcome {
        self.with_mailbox(agent_id, |mailbox| mailbox.receive(now, limit, lease))
    }

    /// Acks an in-flight message.
    pub fn ack_message(&self, agent_id: &AgentId, message_id: MessageId) -> Option<MailboxMessage> {
        self.with_mailbox(agent_id, |mailbox| mailbox.ack(message_id))
    }

    /// Nacks an in-flight message.
    pub fn nack_message(
        &self,
        agent_id: &AgentId,
        message_id: MessageId,
        error: Option<String>,
        requeue_delay: Duration,
        now: SystemTime,
    ) -> Option<NackOutcome> {
        self.with_mailbox(agent_id, |mailbox| {
            mailbox.nack(message_id, error, requeue_delay, now)
        })
    }

    /// Moves a dead letter back to the queue.
    pub fn requeue_dead_letter(
        &self,
        agent_id: &AgentId,
        message_id: MessageId,
        delay: Duration,
        reset_attempts: bool,
        now: SystemTime,
    ) -> Option<MailboxMessage> {
        self.with_mailbox(agent_id, |mailbox| {
            mailbox.requeue_dead_letter(message_id, delay, reset_attempts, now)
        })
    }

    /// Copies of an agent's dead letters, oldest first.
    #[must_use]
    pub fn list_dead_letters(
        &self,
        agent_id: &AgentId,
        limit: Option<usize>,
    ) -> Vec<MailboxMessage> {
        self.with_mailbox(agent_id, |mailbox| mailbox.dead_letter_messages(limit))
    }

    /// Empties an agent's mailbox.
    pub fn drain_mailbox(&self, agent_id: &AgentId) -> DrainReport {
        self.with_mailbox(agent_id, MailboxState::drain)
    }

    /// Point-in-time mailbox counters for an agent.
    #[must_use]
    pub fn mailbox_stats(&self, agent_id: &AgentId) -> MailboxStats {
        self.with_mailbox(agent_id, |mailbox| mailbox.stats())
    }

    /// Records an idempotency entry for an agent's mailbox.
    pub fn save_idempotency(
        &self,
        agent_id: &AgentId,
        key: IdempotencyKey,
        message_id: MessageId,
        expires_at: SystemTime,
        now: SystemTime,
    ) {
        self.with_mailbox(agent_id, |mailbox| {
            mailbox.save_idempotency(key, message_id, expires_at, now);
        });
    }

    /// Returns the message a non-expired idempotency entry points at.
    #[must_use]
    pub fn find_message_by_idempotency(
        &self,
        agent_id: &AgentId,
        key: &IdempotencyKey,
        now: SystemTime,
    ) -> Option<MailboxMessage> {
        self.with_mailbox(agent_id, |mailbox| mailbox.find_by_idempotency(key, now))
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("agents", &self.profiles.len())
            .field("runs", &self.runs.len())
            .field("mailboxes", &self.mailboxes.len())
            .finish_non_exhaustive()
    }
}
