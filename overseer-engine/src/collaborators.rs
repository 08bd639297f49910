//! Seams to the outside world used by the resolver
//!
//! The resolver bounds every call through these traits with its attempt
//! timeout, so implementations may simply wait. Errors count as a failed
//! attempt.

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use overseer_core::agent::AgentId;
use overseer_core::blocker::BlockerType;
use overseer_core::event::EscalationRequest;
use overseer_core::strategy::ResolutionStrategy;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// What the automation hook is told about a blocker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationContext {
    pub blocker_id: Uuid,
    pub description: String,
    pub confidence: f64,
    pub project_id: Option<String>,
}

#[async_trait]
pub trait AutomationHook: Send + Sync {
    /// Try to clear the blocker without a human; true on success
    async fn execute_automation(
        &self,
        blocker_type: BlockerType,
        agent_id: &AgentId,
        context: &AutomationContext,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait EscalationChannel: Send + Sync {
    /// Called before the escalation message is routed, so an answer that
    /// beats [`acknowledge`](Self::acknowledge) is kept
    fn expect_outcome(&self, _escalation_id: Uuid) {}

    /// The escalation could not be routed and will not be awaited
    fn cancel_outcome(&self, _escalation_id: Uuid) {}

    /// Hand the escalation to a human; true once it is acknowledged
    async fn acknowledge(&self, request: &EscalationRequest) -> anyhow::Result<bool>;
}

/// Request for the outcome of a message-driven strategy
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRequest {
    pub strategy: ResolutionStrategy,
    pub blocker_id: Uuid,
    pub agent_id: AgentId,
    /// Message the strategy sent, answered by a correlated RESPONSE
    pub message_id: Uuid,
}

#[async_trait]
pub trait OutcomeCallback: Send + Sync {
    /// Called before the strategy's message is routed
    fn expect_outcome(&self, _message_id: Uuid) {}

    fn cancel_outcome(&self, _message_id: Uuid) {}

    async fn await_outcome(&self, request: &OutcomeRequest) -> anyhow::Result<bool>;
}

/// Automation hook for deployments without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAutomation;

#[async_trait]
impl AutomationHook for NoAutomation {
    async fn execute_automation(
        &self,
        blocker_type: BlockerType,
        agent_id: &AgentId,
        _context: &AutomationContext,
    ) -> anyhow::Result<bool> {
        debug!(
            "No automation configured for {} blocker of {}",
            blocker_type, agent_id
        );
        Ok(false)
    }
}

enum Slot {
    /// Registered, nobody waiting and no answer yet
    Expected,
    Waiting(oneshot::Sender<bool>),
    Ready(bool),
}

/// Rendezvous between a waiter and its answer, by id.
///
/// Only registered ids hold a slot. Answers for ids nobody registered, or
/// that arrive after the waiter gave up, are dropped.
#[derive(Default)]
pub struct PendingOutcomes {
    slots: DashMap<Uuid, Slot>,
}

impl PendingOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id` ahead of [`wait`](Self::wait)
    pub fn expect(&self, id: Uuid) {
        self.slots.entry(id).or_insert(Slot::Expected);
    }

    /// Wait for the answer to `id`. An answer that arrived first is used.
    pub async fn wait(&self, id: Uuid) -> anyhow::Result<bool> {
        let receiver = match self.slots.entry(id) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Ready(value) = *occupied.get() {
                    occupied.remove();
                    return Ok(value);
                }
                if matches!(occupied.get(), Slot::Waiting(_)) {
                    return Err(anyhow!("outcome {} already awaited", id));
                }
                let (sender, receiver) = oneshot::channel();
                occupied.insert(Slot::Waiting(sender));
                receiver
            }
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                vacant.insert(Slot::Waiting(sender));
                receiver
            }
        };

        receiver
            .await
            .map_err(|_| anyhow!("outcome {} abandoned", id))
    }

    /// Deliver the answer for `id`; returns true if a waiter received it
    pub fn complete(&self, id: Uuid, value: bool) -> bool {
        match self.slots.entry(id) {
            Entry::Occupied(mut occupied) => {
                if matches!(occupied.get(), Slot::Waiting(_)) {
                    match occupied.remove() {
                        Slot::Waiting(sender) => sender.send(value).is_ok(),
                        _ => false,
                    }
                } else {
                    occupied.insert(Slot::Ready(value));
                    false
                }
            }
            Entry::Vacant(_) => {
                debug!("Dropping answer for unregistered outcome {}", id);
                false
            }
        }
    }

    pub fn is_waiting(&self, id: &Uuid) -> bool {
        matches!(self.slots.get(id).as_deref(), Some(Slot::Waiting(_)))
    }

    /// Drop the slot for `id`, whatever state it is in
    pub fn forget(&self, id: &Uuid) {
        self.slots.remove(id);
    }
}

/// Escalation channel answered by CALL_OUTCOME events
#[derive(Default)]
pub struct CallOutcomeChannel {
    pending: PendingOutcomes,
}

impl CallOutcomeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call_outcome(&self, escalation_id: Uuid, acknowledged: bool) -> bool {
        self.pending.complete(escalation_id, acknowledged)
    }

    pub fn is_waiting(&self, escalation_id: &Uuid) -> bool {
        self.pending.is_waiting(escalation_id)
    }
}

#[async_trait]
impl EscalationChannel for CallOutcomeChannel {
    fn expect_outcome(&self, escalation_id: Uuid) {
        self.pending.expect(escalation_id);
    }

    fn cancel_outcome(&self, escalation_id: Uuid) {
        self.pending.forget(&escalation_id);
    }

    async fn acknowledge(&self, request: &EscalationRequest) -> anyhow::Result<bool> {
        debug!(
            "Awaiting call outcome for escalation {} ({:?})",
            request.escalation_id, request.urgency
        );
        let guard = ForgetOnDrop {
            pending: &self.pending,
            id: request.escalation_id,
        };
        let result = self.pending.wait(request.escalation_id).await;
        drop(guard);
        result
    }
}

/// Outcome callback answered by RESPONSE messages to the strategy's message
#[derive(Default)]
pub struct ResponseOutcomes {
    pending: PendingOutcomes,
}

impl ResponseOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_response(&self, correlation_id: Uuid, resolved: bool) -> bool {
        self.pending.complete(correlation_id, resolved)
    }

    pub fn is_waiting(&self, message_id: &Uuid) -> bool {
        self.pending.is_waiting(message_id)
    }
}

#[async_trait]
impl OutcomeCallback for ResponseOutcomes {
    fn expect_outcome(&self, message_id: Uuid) {
        self.pending.expect(message_id);
    }

    fn cancel_outcome(&self, message_id: Uuid) {
        self.pending.forget(&message_id);
    }

    async fn await_outcome(&self, request: &OutcomeRequest) -> anyhow::Result<bool> {
        let guard = ForgetOnDrop {
            pending: &self.pending,
            id: request.message_id,
        };
        let result = self.pending.wait(request.message_id).await;
        drop(guard);
        result
    }
}

/// Clears the slot once the wait ends, including when a timeout drops it
struct ForgetOnDrop<'a> {
    pending: &'a PendingOutcomes,
    id: Uuid,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.forget(&self.id);
    }
}
