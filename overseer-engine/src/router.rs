//! A2A message router
//!
//! The router validates and addresses messages, keeps one priority queue per
//! recipient, and settles every message it cannot deliver into exactly one
//! terminal record: a dead-letter entry or an expired-ledger entry.
//!
//! Queues order by priority (highest first) and then by enqueue sequence, so
//! an EMERGENCY message overtakes anything still queued but never a message
//! that was already handed out.

use crate::clock::Clock;
use crate::events::EventBus;
use crate::store::SharedStore;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use overseer_core::agent::AgentId;
use overseer_core::config::RouterConfig;
use overseer_core::event::OutcomeEvent;
use overseer_core::message::{Address, Message, MessageKind, MessagePriority};
use overseer_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a successful submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    Queued { message_id: Uuid },
    /// A broadcast was cut into per-agent copies
    FannedOut { copies: usize, unreachable: usize },
    /// Same id and hop count was already accepted; nothing happened
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DeadLetterReason {
    Validation(String),
    Loop,
    Unreachable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: DeadLetterReason,
    pub at: DateTime<Utc>,
}

/// Where an expired message was caught
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryStage {
    Submit,
    Delivery,
    /// Removed from a queue by housekeeping
    Sweep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpiredRecord {
    pub message_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub recipient: Address,
    pub stage: ExpiryStage,
    pub at: DateTime<Utc>,
}

/// Router counters and queue depths
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouterStatistics {
    pub submitted: u64,
    pub accepted_by_kind: BTreeMap<String, u64>,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    pub duplicates: u64,
    pub timeouts: u64,
    /// CRITICAL and EMERGENCY messages accepted
    pub urgent: u64,
    pub pending_responses: usize,
    pub queue_depths: BTreeMap<String, usize>,
}

struct QueuedMessage {
    message: Message,
    sequence: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message.priority == other.message.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (earlier message)
        match self.message.priority.cmp(&other.message.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

type Queue = Arc<Mutex<BinaryHeap<QueuedMessage>>>;

#[derive(Debug, Clone)]
struct PendingRequest {
    recipient: Address,
    expires_at: DateTime<Utc>,
}

/// What one housekeeping pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Housekeeping {
    /// Queued messages that ran past their ttl
    pub expired: usize,
    /// Idempotence and timeout keys that aged out
    pub forgotten: usize,
}

/// Routed messages per project inside the traffic window; true marks an escalation
#[derive(Debug, Default)]
struct Traffic {
    entries: VecDeque<(DateTime<Utc>, bool)>,
}

impl Traffic {
    fn prune(&mut self, since: DateTime<Utc>) {
        while self.entries.front().is_some_and(|(at, _)| *at < since) {
            self.entries.pop_front();
        }
    }

    fn rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let escalations = self.entries.iter().filter(|(_, escalation)| *escalation).count();
        escalations as f64 / self.entries.len() as f64
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
    duplicates: AtomicU64,
    timeouts: AtomicU64,
    urgent: AtomicU64,
}

pub struct Router {
    config: RouterConfig,
    store: Arc<SharedStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    queues: DashMap<Address, Queue>,
    sequence: AtomicU64,
    /// Accepted (id, hop) pairs and the deadline of the message
    accepted: DashMap<(Uuid, u32), DateTime<Utc>>,
    pending_requests: DashMap<Uuid, PendingRequest>,
    /// Correlation ids already reported as TIMEOUT, with when
    timed_out: DashMap<Uuid, DateTime<Utc>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    expired: Mutex<VecDeque<ExpiredRecord>>,
    accepted_by_kind: DashMap<MessageKind, u64>,
    traffic: DashMap<String, Traffic>,
    recent_kinds: DashMap<AgentId, VecDeque<MessageKind>>,
    counters: Counters,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        store: Arc<SharedStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            clock,
            queues: DashMap::new(),
            sequence: AtomicU64::new(0),
            accepted: DashMap::new(),
            pending_requests: DashMap::new(),
            timed_out: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
            expired: Mutex::new(VecDeque::new()),
            accepted_by_kind: DashMap::new(),
            traffic: DashMap::new(),
            recent_kinds: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Validate, address and enqueue a message.
    ///
    /// Every rejection leaves one terminal record behind. Resubmitting a
    /// message that was already accepted with the same hop count is a no-op.
    pub fn submit(&self, message: Message) -> Result<Accepted> {
        self.counters.submitted.fetch_add(1, AtomicOrdering::Relaxed);
        let now = self.clock.now();
        let key = (message.id, message.hop_count);

        if self.accepted.contains_key(&key) {
            debug!("Ignoring duplicate submit of message {}", message.id);
            self.counters.duplicates.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(Accepted::Duplicate);
        }

        if let Err(err) = message.validate() {
            self.dead_letter(message, DeadLetterReason::Validation(err.to_string()), now);
            return Err(err);
        }

        if message.is_expired_at(now) {
            let message_id = message.id;
            self.expire(message, ExpiryStage::Submit, now);
            return Err(Error::expired(message_id));
        }

        if message.hop_count > self.config.hop_ceiling {
            let err = Error::routing_loop(message.id, self.config.hop_ceiling);
            self.dead_letter(message, DeadLetterReason::Loop, now);
            return Err(err);
        }

        if message.kind == MessageKind::Response {
            if let Err(err) = self.check_correlation(&message, now) {
                self.dead_letter(message, DeadLetterReason::Validation(err.to_string()), now);
                return Err(err);
            }
        }

        match message.recipient.clone() {
            Address::Broadcast => self.fan_out(message, now),
            Address::Orchestrator => self.accept(message, now),
            Address::Agent(agent_id) => match self.store.is_routable(&agent_id) {
                Some(true) => self.accept(message, now),
                Some(false) => Err(self.reject_unreachable(message, "recipient is blocked", now)),
                None => Err(self.reject_unreachable(message, "recipient is not registered", now)),
            },
        }
    }

    /// Re-route a message to a new recipient, one hop further
    pub fn forward(&self, message: &Message, recipient: Address) -> Result<Accepted> {
        debug!(
            "Forwarding message {} from {} to {}",
            message.id, message.recipient, recipient
        );
        self.submit(message.forwarded_to(recipient))
    }

    /// Pop the most urgent deliverable message for `recipient`.
    ///
    /// Expired messages met on the way are moved to the expired ledger. A
    /// blocked agent receives nothing; its queue is dead-lettered instead.
    pub fn deliver_next(&self, recipient: &Address) -> Option<Message> {
        let queue = self.queues.get(recipient).map(|q| q.value().clone())?;
        let now = self.clock.now();

        if let Address::Agent(agent_id) = recipient {
            if self.store.is_routable(agent_id) != Some(true) {
                let drained: Vec<QueuedMessage> = queue.lock().drain().collect();
                for queued in drained {
                    self.dead_letter(
                        queued.message,
                        DeadLetterReason::Unreachable("recipient is blocked".to_string()),
                        now,
                    );
                }
                return None;
            }
        }

        loop {
            let next = queue.lock().pop()?;
            if next.message.is_expired_at(now) {
                self.expire(next.message, ExpiryStage::Delivery, now);
                continue;
            }
            self.counters.delivered.fetch_add(1, AtomicOrdering::Relaxed);
            return Some(next.message);
        }
    }

    /// Record TIMEOUT for every REQUEST whose ttl ran out unanswered
    pub fn expire_pending_requests(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        let overdue: Vec<Uuid> = self
            .pending_requests
            .iter()
            .filter(|entry| now > entry.expires_at)
            .map(|entry| *entry.key())
            .collect();

        let mut timed_out = Vec::with_capacity(overdue.len());
        for request_id in overdue {
            if let Some((_, pending)) = self.pending_requests.remove(&request_id) {
                self.record_timeout(request_id, pending.recipient.agent_id().cloned(), now);
                timed_out.push(request_id);
            }
        }
        if !timed_out.is_empty() {
            info!("{} pending requests timed out", timed_out.len());
        }
        timed_out
    }

    /// Queued messages for `recipient` in delivery order
    pub fn pending_for(&self, recipient: &Address) -> Vec<Message> {
        let Some(queue) = self.queues.get(recipient).map(|q| q.value().clone()) else {
            return Vec::new();
        };
        let mut entries: Vec<(MessagePriority, u64, Message)> = queue
            .lock()
            .iter()
            .map(|q| (q.message.priority, q.sequence, q.message.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, _, m)| m).collect()
    }

    pub fn queue_depth(&self, recipient: &Address) -> usize {
        self.queues
            .get(recipient)
            .map(|q| q.value().lock().len())
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> RouterStatistics {
        RouterStatistics {
            submitted: self.counters.submitted.load(AtomicOrdering::Relaxed),
            accepted_by_kind: self
                .accepted_by_kind
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
            delivered: self.counters.delivered.load(AtomicOrdering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(AtomicOrdering::Relaxed),
            expired: self.counters.expired.load(AtomicOrdering::Relaxed),
            duplicates: self.counters.duplicates.load(AtomicOrdering::Relaxed),
            timeouts: self.counters.timeouts.load(AtomicOrdering::Relaxed),
            urgent: self.counters.urgent.load(AtomicOrdering::Relaxed),
            pending_responses: self.pending_requests.len(),
            queue_depths: self
                .queues
                .iter()
                .map(|e| (e.key().to_string(), e.value().lock().len()))
                .collect(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn expired(&self) -> Vec<ExpiredRecord> {
        self.expired.lock().iter().cloned().collect()
    }

    /// Share of the project's messages inside the traffic window that were
    /// escalations
    pub fn escalation_rate(&self, project_id: &str) -> f64 {
        let since = self.clock.now() - self.config.traffic_window();
        match self.traffic.get_mut(project_id) {
            Some(mut traffic) => {
                traffic.prune(since);
                traffic.rate()
            }
            None => 0.0,
        }
    }

    /// Expire stale queued messages and forget bookkeeping that can no
    /// longer matter.
    ///
    /// Idempotence keys are kept for one default ttl past the message
    /// deadline, timeout keys for one default ttl after they were recorded.
    pub fn housekeeping(&self) -> Housekeeping {
        let now = self.clock.now();
        let mut report = Housekeeping::default();

        let queues: Vec<Queue> = self.queues.iter().map(|q| q.value().clone()).collect();
        for queue in queues {
            let stale: Vec<Message> = {
                let mut heap = queue.lock();
                let (stale, live): (Vec<QueuedMessage>, Vec<QueuedMessage>) =
                    heap.drain().partition(|q| q.message.is_expired_at(now));
                heap.extend(live);
                stale.into_iter().map(|q| q.message).collect()
            };
            report.expired += stale.len();
            for message in stale {
                self.expire(message, ExpiryStage::Sweep, now);
            }
        }

        let grace = chrono::Duration::seconds(self.config.default_ttl_secs as i64);
        let before = self.accepted.len() + self.timed_out.len();
        self.accepted.retain(|_, deadline| *deadline + grace >= now);
        self.timed_out.retain(|_, recorded| *recorded + grace >= now);
        report.forgotten = before - (self.accepted.len() + self.timed_out.len());

        let since = now - self.config.traffic_window();
        self.traffic.retain(|_, traffic| {
            traffic.prune(since);
            !traffic.entries.is_empty()
        });

        if report.expired > 0 || report.forgotten > 0 {
            debug!(
                expired = report.expired,
                forgotten = report.forgotten,
                "Router housekeeping"
            );
        }
        report
    }

    /// Kinds of messages the agent recently sent or received, oldest first
    pub fn recent_kinds(&self, agent_id: &AgentId) -> Vec<MessageKind> {
        self.recent_kinds
            .get(agent_id)
            .map(|k| k.iter().copied().collect())
            .unwrap_or_default()
    }

    fn check_correlation(&self, message: &Message, now: DateTime<Utc>) -> Result<()> {
        let correlation_id = message
            .correlation_id
            .ok_or_else(|| Error::validation("RESPONSE requires a correlation id"))?;
        match self.pending_requests.get(&correlation_id) {
            Some(pending) if now <= pending.expires_at => Ok(()),
            Some(_) => Err(Error::validation(format!(
                "RESPONSE correlates with expired request {}",
                correlation_id
            ))),
            None => Err(Error::validation(format!(
                "RESPONSE correlates with unknown request {}",
                correlation_id
            ))),
        }
    }

    /// Claim the (id, hop) key; false when it was already taken
    fn claim(&self, message: &Message) -> bool {
        match self.accepted.entry((message.id, message.hop_count)) {
            Entry::Occupied(_) => {
                self.counters.duplicates.fetch_add(1, AtomicOrdering::Relaxed);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(message.expires_at());
                true
            }
        }
    }

    fn accept(&self, message: Message, now: DateTime<Utc>) -> Result<Accepted> {
        if !self.claim(&message) {
            return Ok(Accepted::Duplicate);
        }
        let message_id = message.id;
        if message.is_urgent() {
            self.counters.urgent.fetch_add(1, AtomicOrdering::Relaxed);
            info!(
                "Urgent {} message {} for {}",
                message.kind.as_str(),
                message.id,
                message.recipient
            );
        }

        match message.kind {
            MessageKind::Request => {
                self.pending_requests.insert(
                    message.id,
                    PendingRequest {
                        recipient: message.recipient.clone(),
                        expires_at: message.expires_at(),
                    },
                );
            }
            MessageKind::Response => {
                if let Some(correlation_id) = message.correlation_id {
                    self.pending_requests.remove(&correlation_id);
                }
            }
            _ => {}
        }

        self.note_traffic(&message, now);
        debug!(
            "Queued {} message {} for {} at {:?}",
            message.kind.as_str(),
            message.id,
            message.recipient,
            message.priority
        );
        self.enqueue(message);
        Ok(Accepted::Queued { message_id })
    }

    fn fan_out(&self, message: Message, now: DateTime<Utc>) -> Result<Accepted> {
        if !self.claim(&message) {
            return Ok(Accepted::Duplicate);
        }
        if message.is_urgent() {
            self.counters.urgent.fetch_add(1, AtomicOrdering::Relaxed);
        }
        self.note_traffic(&message, now);

        let sender = message.sender.agent_id().cloned();
        let mut copies = 0;
        let mut unreachable = 0;
        for agent in self.store.agents() {
            if Some(&agent.agent_id) == sender.as_ref() {
                continue;
            }
            let copy = message.fan_out_copy(&agent.agent_id);
            if agent.is_routable() {
                self.accepted
                    .insert((copy.id, copy.hop_count), copy.expires_at());
                self.enqueue(copy);
                copies += 1;
            } else {
                self.dead_letter(
                    copy,
                    DeadLetterReason::Unreachable("recipient is blocked".to_string()),
                    now,
                );
                unreachable += 1;
            }
        }

        info!(
            "Broadcast {} fanned out to {} agents ({} unreachable)",
            message.id, copies, unreachable
        );
        Ok(Accepted::FannedOut {
            copies,
            unreachable,
        })
    }

    fn enqueue(&self, message: Message) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let queue = self
            .queues
            .entry(message.recipient.clone())
            .or_default()
            .value()
            .clone();
        queue.lock().push(QueuedMessage { message, sequence });
    }

    fn reject_unreachable(&self, message: Message, reason: &str, now: DateTime<Utc>) -> Error {
        let err = Error::unreachable(&message.recipient, reason);
        warn!("Message {} rejected: {}", message.id, err);

        let report = message
            .sender
            .agent_id()
            .cloned()
            .map(|sender| self.unreachable_report(&sender, &message, reason, now));
        self.dead_letter(message, DeadLetterReason::Unreachable(reason.to_string()), now);

        match report {
            Some(Ok(report)) => self.enqueue(report),
            Some(Err(e)) => warn!("Failed to build unreachable blocker report: {}", e),
            None => {}
        }
        err
    }

    /// BLOCKER_REPORT against the sender of an undeliverable message
    fn unreachable_report(
        &self,
        sender: &AgentId,
        message: &Message,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::Orchestrator)
            .kind(MessageKind::BlockerReport)
            .priority(MessagePriority::High)
            .subject(format!("{} unreachable", message.recipient))
            .payload_entry("agent_id", sender.as_str())
            .payload_entry(
                "description",
                format!("{} unreachable: {}", message.recipient, reason),
            )
            .payload_entry("message_id", message.id.to_string())
            .created_at(now)
            .ttl(self.config.default_ttl())
            .build()
    }

    fn dead_letter(&self, message: Message, reason: DeadLetterReason, now: DateTime<Utc>) {
        debug!("Dead-lettering message {}: {:?}", message.id, reason);
        self.counters.dead_lettered.fetch_add(1, AtomicOrdering::Relaxed);
        let mut ledger = self.dead_letters.lock();
        ledger.push_back(DeadLetter {
            message,
            reason,
            at: now,
        });
        while ledger.len() > self.config.ledger_capacity {
            ledger.pop_front();
        }
    }

    fn expire(&self, message: Message, stage: ExpiryStage, now: DateTime<Utc>) {
        debug!("Message {} expired at {:?}", message.id, stage);
        self.counters.expired.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut ledger = self.expired.lock();
            ledger.push_back(ExpiredRecord {
                message_id: message.id,
                correlation_id: message.correlation_id,
                recipient: message.recipient.clone(),
                stage,
                at: now,
            });
            while ledger.len() > self.config.ledger_capacity {
                ledger.pop_front();
            }
        }

        let timeout_key = match (message.correlation_id, message.kind) {
            (Some(correlation_id), _) => Some(correlation_id),
            (None, MessageKind::Request) => Some(message.id),
            _ => None,
        };
        if let Some(key) = timeout_key {
            self.pending_requests.remove(&key);
            let agent = message.recipient.agent_id().cloned();
            self.record_timeout(key, agent, now);
        }
    }

    fn record_timeout(&self, correlation_id: Uuid, agent_id: Option<AgentId>, now: DateTime<Utc>) {
        match self.timed_out.entry(correlation_id) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                vacant.insert(now);
            }
        }
        self.counters.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
        self.bus.publish(OutcomeEvent::RequestTimedOut {
            correlation_id,
            agent_id,
            at: now,
        });
    }

    /// Count traffic per project, remember recent kinds and raise friction
    fn note_traffic(&self, message: &Message, now: DateTime<Utc>) {
        *self.accepted_by_kind.entry(message.kind).or_insert(0) += 1;

        let subject = message
            .payload_str("agent_id")
            .map(AgentId::new)
            .or_else(|| message.recipient.agent_id().cloned())
            .or_else(|| message.sender.agent_id().cloned());
        let escalation = message.kind == MessageKind::Escalation
            || message.priority == MessagePriority::Emergency;

        for agent in [message.sender.agent_id(), message.recipient.agent_id()]
            .into_iter()
            .flatten()
        {
            let mut kinds = self.recent_kinds.entry(agent.clone()).or_default();
            kinds.push_back(message.kind);
            while kinds.len() > self.config.recent_kinds_per_agent {
                kinds.pop_front();
            }
        }

        let Some(subject) = subject else {
            return;
        };
        if let Some(project) = self.store.agent_project(&subject) {
            let mut traffic = self.traffic.entry(project).or_default();
            traffic.prune(now - self.config.traffic_window());
            traffic.entries.push_back((now, escalation));
        }
        if escalation && self.store.contains_agent(&subject) {
            self.bus.publish(OutcomeEvent::FrictionRaised {
                agent_id: subject,
                message_id: message.id,
                at: now,
            });
        }
    }
}
