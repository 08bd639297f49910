//! Blocker intake and resolution
//!
//! [`BlockerResolver::report`] classifies a new blocker. Each call to
//! [`BlockerResolver::resolve`] then picks the best untried strategy allowed
//! for the blocker's type, runs it against the collaborators under the
//! attempt timeout, records the outcome in the weight table and moves the
//! blocker along its lifecycle.

use crate::clock::Clock;
use crate::collaborators::{
    AutomationContext, AutomationHook, EscalationChannel, OutcomeCallback, OutcomeRequest,
};
use crate::events::EventBus;
use crate::router::Router;
use crate::store::SharedStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use overseer_core::agent::AgentId;
use overseer_core::blocker::{
    AttemptOutcome, Blocker, BlockerStatus, BlockerType, CancelledAttempt, ResolutionAttempt,
};
use overseer_core::classifier::{BlockerClassifier, ClassificationContext};
use overseer_core::config::ResolverConfig;
use overseer_core::event::{EscalationRequest, OutcomeEvent, Urgency};
use overseer_core::message::{Address, Message, MessageKind, MessagePriority};
use overseer_core::strategy::{rank_strategies, ResolutionStrategy};
use overseer_core::weights::WeightKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Blockers an agent must have reported to count as a chronic offender
const CHRONIC_OFFENDER_BLOCKERS: usize = 3;

/// External parties the strategies talk to
#[derive(Clone)]
pub struct Collaborators {
    pub automation: Arc<dyn AutomationHook>,
    pub escalation: Arc<dyn EscalationChannel>,
    pub callbacks: Arc<dyn OutcomeCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Completed(AttemptOutcome),
    /// The blocker settled elsewhere while the attempt was running
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub blocker_id: Uuid,
    pub strategy: ResolutionStrategy,
    pub result: AttemptResult,
    pub status: BlockerStatus,
    /// Forced ESCALATION sent when the blocker went chronic
    pub escalation_message_id: Option<Uuid>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.result == AttemptResult::Completed(AttemptOutcome::Success)
    }
}

/// Aggregate view over all blockers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockerMetrics {
    pub total: usize,
    pub open: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub chronic: usize,
    pub by_type: BTreeMap<BlockerType, usize>,
    pub mean_resolution_secs: Option<f64>,
    /// Successful attempts over all completed attempts
    pub success_rate: f64,
    pub cancelled_attempts: usize,
    /// Agents with at least three reported blockers
    pub chronic_offenders: Vec<AgentId>,
}

enum Finish {
    Cancelled(BlockerStatus),
    Settled {
        status: BlockerStatus,
        agent_id: AgentId,
        resolution_secs: f64,
    },
    Failed {
        agent_id: AgentId,
    },
    Chronic {
        blocker: Blocker,
    },
}

pub struct BlockerResolver {
    config: ResolverConfig,
    classifier: BlockerClassifier,
    store: Arc<SharedStore>,
    router: Arc<Router>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    settled: DashMap<Uuid, watch::Sender<bool>>,
    in_flight: DashMap<Uuid, BTreeSet<ResolutionStrategy>>,
}

impl BlockerResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ResolverConfig,
        classifier: BlockerClassifier,
        store: Arc<SharedStore>,
        router: Arc<Router>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            classifier,
            store,
            router,
            bus,
            clock,
            collaborators,
            settled: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    pub fn classifier(&self) -> &BlockerClassifier {
        &self.classifier
    }

    /// Open and classify a new blocker
    pub fn report(
        &self,
        agent_id: AgentId,
        description: String,
        project_id: Option<String>,
    ) -> Result<Blocker> {
        let now = self.clock.now();
        let project_id = project_id.or_else(|| self.store.agent_project(&agent_id));
        let mut blocker = Blocker::new(agent_id.clone(), project_id, description, now)?;

        let context = ClassificationContext {
            recent_kinds: self.router.recent_kinds(&agent_id),
            prior_types: self.store.prior_blocker_types(&agent_id),
        };
        let verdict = self.classifier.classify(&blocker.raw_description, &context);
        if verdict.is_miss() {
            info!(
                "Blocker from {} matched no pattern; only escalation applies",
                agent_id
            );
        }
        blocker.classify(verdict.blocker_type, verdict.confidence);

        info!(
            "Blocker {} reported by {}: {} ({:.2})",
            blocker.blocker_id, agent_id, blocker.classified_type, blocker.confidence
        );
        self.store.insert_blocker(blocker.clone());
        self.settled
            .insert(blocker.blocker_id, watch::channel(false).0);
        self.bus.publish(OutcomeEvent::BlockerReported {
            agent_id,
            blocker_id: blocker.blocker_id,
            blocker_type: blocker.classified_type,
            at: now,
        });
        Ok(blocker)
    }

    /// Run the next best strategy against an open blocker
    pub async fn resolve(&self, blocker_id: Uuid) -> Result<AttemptReport> {
        let (blocker, strategy) = match self.claim_strategy(blocker_id)? {
            Some(claim) => claim,
            None => {
                let blocker = self
                    .store
                    .blocker(&blocker_id)
                    .ok_or_else(|| Error::not_found("Blocker", blocker_id))?;
                self.go_chronic(blocker)?;
                return Err(overseer_core::Error::exhausted(blocker_id).into());
            }
        };

        let started = self.clock.now();
        debug!(
            "Applying {} to blocker {} ({})",
            strategy, blocker_id, blocker.classified_type
        );
        let settled = self.settled_receiver(blocker_id);
        let timeout = self.config.attempt_timeout();

        let outcome = tokio::select! {
            biased;
            _ = wait_settled(settled) => None,
            result = tokio::time::timeout(timeout, self.execute(strategy, &blocker)) => {
                Some(match result {
                    Ok(Ok(true)) => AttemptOutcome::Success,
                    Ok(Ok(false)) => AttemptOutcome::Failure,
                    Ok(Err(e)) => {
                        warn!("Strategy {} failed for blocker {}: {:#}", strategy, blocker_id, e);
                        AttemptOutcome::Failure
                    }
                    Err(_) => {
                        warn!(
                            "Strategy {} timed out after {:?} for blocker {}",
                            strategy, timeout, blocker_id
                        );
                        AttemptOutcome::TimedOut
                    }
                })
            }
        };

        let finish = self.finish_attempt(blocker_id, strategy, started, outcome);
        self.release_strategy(blocker_id, strategy);
        let finish = finish?;

        let now = self.clock.now();
        let key = WeightKey::new(blocker.classified_type, strategy);
        let (result, status, escalation_message_id) = match finish {
            Finish::Cancelled(status) => {
                info!(
                    "Attempt {} on blocker {} cancelled; blocker is {:?}",
                    strategy, blocker_id, status
                );
                (AttemptResult::Cancelled, status, None)
            }
            Finish::Settled {
                status,
                agent_id,
                resolution_secs,
            } => {
                self.store.record_weight(key, true);
                self.signal_settled(blocker_id);
                info!("Blocker {} settled as {:?} via {}", blocker_id, status, strategy);
                self.bus.publish(OutcomeEvent::BlockerResolved {
                    agent_id,
                    blocker_id,
                    strategy: Some(strategy),
                    resolution_secs,
                    at: now,
                });
                (
                    AttemptResult::Completed(AttemptOutcome::Success),
                    status,
                    None,
                )
            }
            Finish::Failed { agent_id } => {
                self.store.record_weight(key, false);
                self.publish_failure(agent_id, blocker_id, strategy, now);
                let outcome = outcome.unwrap_or(AttemptOutcome::Failure);
                (AttemptResult::Completed(outcome), BlockerStatus::Open, None)
            }
            Finish::Chronic { blocker } => {
                self.store.record_weight(key, false);
                self.publish_failure(blocker.agent_id.clone(), blocker_id, strategy, now);
                let escalation_id = self.escalate_chronic(blocker);
                let outcome = outcome.unwrap_or(AttemptOutcome::Failure);
                (
                    AttemptResult::Completed(outcome),
                    BlockerStatus::Chronic,
                    escalation_id,
                )
            }
        };

        Ok(AttemptReport {
            blocker_id,
            strategy,
            result,
            status,
            escalation_message_id,
        })
    }

    /// Keep resolving until the blocker leaves OPEN
    pub async fn resolve_until_settled(&self, blocker_id: Uuid) -> Result<Vec<AttemptReport>> {
        let mut reports = Vec::new();
        for _ in 0..=ResolutionStrategy::ALL.len() {
            let report = self.resolve(blocker_id).await?;
            let done =
                report.status != BlockerStatus::Open || report.result == AttemptResult::Cancelled;
            reports.push(report);
            if done {
                break;
            }
        }
        Ok(reports)
    }

    /// Resolve a blocker by hand, cancelling any attempt in flight
    pub fn mark_resolved(&self, blocker_id: Uuid, notes: Option<String>) -> Result<Blocker> {
        let now = self.clock.now();
        let blocker = self
            .store
            .with_blocker_mut(&blocker_id, |b| -> Result<Blocker> {
                b.mark_resolved(notes, now)?;
                Ok(b.clone())
            })
            .ok_or_else(|| Error::not_found("Blocker", blocker_id))??;

        self.signal_settled(blocker_id);
        info!("Blocker {} resolved manually", blocker_id);
        self.bus.publish(OutcomeEvent::BlockerResolved {
            agent_id: blocker.agent_id.clone(),
            blocker_id,
            strategy: None,
            resolution_secs: seconds(blocker.resolution_time()),
            at: now,
        });
        Ok(blocker)
    }

    pub fn metrics(&self) -> BlockerMetrics {
        let blockers = self.store.blockers();
        let mut metrics = BlockerMetrics {
            total: blockers.len(),
            ..Default::default()
        };

        let mut per_agent: BTreeMap<AgentId, usize> = BTreeMap::new();
        let mut resolution_total = 0.0;
        let mut resolution_count = 0usize;
        let mut attempts = 0usize;
        let mut successes = 0usize;

        for blocker in &blockers {
            match blocker.status {
                BlockerStatus::Open => metrics.open += 1,
                BlockerStatus::Resolved => metrics.resolved += 1,
                BlockerStatus::Escalated => metrics.escalated += 1,
                BlockerStatus::Chronic => metrics.chronic += 1,
            }
            *metrics.by_type.entry(blocker.classified_type).or_insert(0) += 1;
            *per_agent.entry(blocker.agent_id.clone()).or_insert(0) += 1;

            if let Some(elapsed) = blocker.resolution_time() {
                resolution_total += seconds(Some(elapsed));
                resolution_count += 1;
            }
            attempts += blocker.attempts.len();
            successes += blocker
                .attempts
                .iter()
                .filter(|a| a.outcome.is_success())
                .count();
            metrics.cancelled_attempts += blocker.cancelled_attempts.len();
        }

        if resolution_count > 0 {
            metrics.mean_resolution_secs = Some(resolution_total / resolution_count as f64);
        }
        if attempts > 0 {
            metrics.success_rate = successes as f64 / attempts as f64;
        }
        metrics.chronic_offenders = per_agent
            .into_iter()
            .filter(|(_, count)| *count >= CHRONIC_OFFENDER_BLOCKERS)
            .map(|(agent, _)| agent)
            .collect();
        metrics
    }

    /// Pick and reserve a strategy. `None` means nothing is left to try.
    fn claim_strategy(&self, blocker_id: Uuid) -> Result<Option<(Blocker, ResolutionStrategy)>> {
        let mut in_flight = self.in_flight.entry(blocker_id).or_default();
        let blocker = self
            .store
            .blocker(&blocker_id)
            .ok_or_else(|| Error::not_found("Blocker", blocker_id))?;

        match blocker.status {
            BlockerStatus::Open => {}
            BlockerStatus::Chronic => {
                return Err(overseer_core::Error::exhausted(blocker_id).into());
            }
            BlockerStatus::Resolved | BlockerStatus::Escalated => {
                return Err(overseer_core::Error::state_transition(format!(
                    "Blocker {} is already settled",
                    blocker_id
                ))
                .into());
            }
        }

        let blocker_type = blocker.classified_type;
        let ranked = rank_strategies(
            blocker_type,
            |s| self.store.weight(WeightKey::new(blocker_type, s)),
            |s| blocker.has_tried(s) || in_flight.contains(&s),
        );
        match ranked.first() {
            Some(strategy) => {
                in_flight.insert(*strategy);
                Ok(Some((blocker, *strategy)))
            }
            None if !in_flight.is_empty() => Err(overseer_core::Error::state_transition(format!(
                "Every remaining strategy for blocker {} is already in flight",
                blocker_id
            ))
            .into()),
            None => Ok(None),
        }
    }

    fn release_strategy(&self, blocker_id: Uuid, strategy: ResolutionStrategy) {
        if let Some(mut in_flight) = self.in_flight.get_mut(&blocker_id) {
            in_flight.remove(&strategy);
        }
        self.in_flight
            .remove_if(&blocker_id, |_, strategies| strategies.is_empty());
    }

    fn finish_attempt(
        &self,
        blocker_id: Uuid,
        strategy: ResolutionStrategy,
        started: DateTime<Utc>,
        outcome: Option<AttemptOutcome>,
    ) -> Result<Finish> {
        let now = self.clock.now();
        let threshold = self.config.chronic_failure_threshold as usize;

        self.store
            .with_blocker_mut(&blocker_id, |b| -> Result<Finish> {
                let outcome = match outcome {
                    Some(outcome) if b.is_open() => outcome,
                    _ => {
                        b.record_cancelled(CancelledAttempt {
                            strategy,
                            started_at: started,
                            cancelled_at: now,
                        });
                        return Ok(Finish::Cancelled(b.status));
                    }
                };

                b.record_attempt(ResolutionAttempt {
                    strategy,
                    attempted_at: started,
                    outcome,
                })?;

                if outcome.is_success() {
                    b.settle(strategy, now)?;
                    return Ok(Finish::Settled {
                        status: b.status,
                        agent_id: b.agent_id.clone(),
                        resolution_secs: seconds(b.resolution_time()),
                    });
                }
                if b.failed_attempts() >= threshold || b.strategies_exhausted() {
                    b.mark_chronic()?;
                    return Ok(Finish::Chronic { blocker: b.clone() });
                }
                Ok(Finish::Failed {
                    agent_id: b.agent_id.clone(),
                })
            })
            .ok_or_else(|| Error::not_found("Blocker", blocker_id))?
    }

    /// Move an open blocker with nothing left to try to CHRONIC
    fn go_chronic(&self, blocker: Blocker) -> Result<()> {
        let blocker_id = blocker.blocker_id;
        let marked = self
            .store
            .with_blocker_mut(&blocker_id, |b| b.mark_chronic().map(|_| b.clone()))
            .ok_or_else(|| Error::not_found("Blocker", blocker_id))?;
        match marked {
            Ok(blocker) => {
                self.escalate_chronic(blocker);
            }
            Err(e) => debug!("Blocker {} not moved to chronic: {}", blocker_id, e),
        }
        Ok(())
    }

    /// Announce a blocker that just went chronic and send its ESCALATION.
    ///
    /// The blocker stays chronic when the escalation cannot be routed;
    /// [`retry_escalations`](Self::retry_escalations) sends it later.
    fn escalate_chronic(&self, blocker: Blocker) -> Option<Uuid> {
        self.signal_settled(blocker.blocker_id);
        self.bus.publish(OutcomeEvent::BlockerChronic {
            agent_id: blocker.agent_id.clone(),
            blocker_id: blocker.blocker_id,
            at: self.clock.now(),
        });

        match self.send_chronic_escalation(&blocker) {
            Ok(message_id) => {
                warn!(
                    "Blocker {} of {} is chronic; escalation {} sent",
                    blocker.blocker_id, blocker.agent_id, message_id
                );
                Some(message_id)
            }
            Err(e) => {
                warn!(
                    "Blocker {} of {} is chronic but its escalation failed: {}",
                    blocker.blocker_id, blocker.agent_id, e
                );
                None
            }
        }
    }

    fn send_chronic_escalation(&self, blocker: &Blocker) -> Result<Uuid> {
        let reason = format!(
            "Blocker unresolved after {} attempts: {}",
            blocker.attempts.len(),
            blocker.raw_description
        );
        let message = self.escalation_message(blocker, &reason, self.clock.now())?;
        let message_id = message.id;
        self.router.submit(message)?;
        self.store.with_blocker_mut(&blocker.blocker_id, |b| {
            b.escalation_message_id = Some(message_id);
        });
        Ok(message_id)
    }

    /// Resend the ESCALATION for chronic blockers that never got one
    pub fn retry_escalations(&self) -> Vec<Uuid> {
        let mut sent = Vec::new();
        for blocker in self.store.blockers() {
            if !blocker.is_chronic() || blocker.escalation_message_id.is_some() {
                continue;
            }
            match self.send_chronic_escalation(&blocker) {
                Ok(message_id) => {
                    info!(
                        "Escalation {} sent for chronic blocker {}",
                        message_id, blocker.blocker_id
                    );
                    sent.push(message_id);
                }
                Err(e) => debug!(
                    "Escalation for chronic blocker {} still failing: {}",
                    blocker.blocker_id, e
                ),
            }
        }
        sent
    }

    /// Drop settle signals for blockers that are no longer open
    pub fn prune_settled(&self) -> usize {
        let before = self.settled.len();
        self.settled.retain(|blocker_id, sender| {
            let open = self
                .store
                .blocker(blocker_id)
                .is_some_and(|b| b.is_open());
            if !open {
                sender.send_replace(true);
            }
            open
        });
        before - self.settled.len()
    }

    fn publish_failure(
        &self,
        agent_id: AgentId,
        blocker_id: Uuid,
        strategy: ResolutionStrategy,
        at: DateTime<Utc>,
    ) {
        self.bus.publish(OutcomeEvent::AttemptFailed {
            agent_id,
            blocker_id,
            strategy,
            at,
        });
    }

    /// Priority and urgency for escalations, from the project's last health level
    fn escalation_level(&self, project_id: Option<&str>) -> (MessagePriority, Urgency) {
        let level = project_id
            .and_then(|p| self.store.latest_health(p))
            .map(|s| s.level);
        let priority = level
            .map(|l| l.escalation_priority())
            .unwrap_or(MessagePriority::Normal)
            .max(MessagePriority::High);
        let urgency = level
            .map(|l| l.urgency())
            .unwrap_or(Urgency::Routine)
            .max(Urgency::Elevated);
        (priority, urgency)
    }

    fn escalation_message(
        &self,
        blocker: &Blocker,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let (priority, urgency) = self.escalation_level(blocker.project_id.as_deref());
        let mut builder = Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::Orchestrator)
            .kind(MessageKind::Escalation)
            .priority(priority)
            .subject(format!(
                "Escalation: {} blocker for {}",
                blocker.classified_type, blocker.agent_id
            ))
            .payload_entry("agent_id", blocker.agent_id.as_str())
            .payload_entry("blocker_id", blocker.blocker_id.to_string())
            .payload_entry("reason", reason)
            .payload_entry("urgency", serde_json::to_value(urgency)?)
            .created_at(now)
            .ttl(self.router.config().default_ttl());
        if let Some(project) = &blocker.project_id {
            builder = builder.payload_entry("project_id", project.as_str());
        }
        Ok(builder.build()?)
    }

    async fn execute(&self, strategy: ResolutionStrategy, blocker: &Blocker) -> anyhow::Result<bool> {
        match strategy {
            ResolutionStrategy::Automate => {
                let context = AutomationContext {
                    blocker_id: blocker.blocker_id,
                    description: blocker.raw_description.clone(),
                    confidence: blocker.confidence,
                    project_id: blocker.project_id.clone(),
                };
                self.collaborators
                    .automation
                    .execute_automation(blocker.classified_type, &blocker.agent_id, &context)
                    .await
            }
            ResolutionStrategy::Escalate => {
                let now = self.clock.now();
                let reason = format!("Escalating blocker: {}", blocker.raw_description);
                let message = self.escalation_message(blocker, &reason, now)?;
                let (priority, urgency) = self.escalation_level(blocker.project_id.as_deref());
                let request = EscalationRequest {
                    escalation_id: message.id,
                    reason,
                    priority,
                    agent_id: blocker.agent_id.clone(),
                    project_id: blocker.project_id.clone(),
                    urgency,
                    blocker_id: Some(blocker.blocker_id),
                };
                let escalation = &self.collaborators.escalation;
                escalation.expect_outcome(request.escalation_id);
                if let Err(e) = self.router.submit(message) {
                    escalation.cancel_outcome(request.escalation_id);
                    return Err(e.into());
                }
                escalation.acknowledge(&request).await
            }
            ResolutionStrategy::ApplySass => {
                let message = self.nudge(
                    &blocker.agent_id,
                    blocker,
                    MessagePriority::Low,
                    "Friendly reminder: this blocker is still open",
                )?;
                self.await_callback(strategy, blocker, &blocker.agent_id, message)
                    .await
            }
            ResolutionStrategy::Threaten => {
                let message = self.nudge(
                    &blocker.agent_id,
                    blocker,
                    MessagePriority::High,
                    "Strike warning: resolve this blocker",
                )?;
                self.bus.publish(OutcomeEvent::ThreatenIssued {
                    agent_id: blocker.agent_id.clone(),
                    blocker_id: blocker.blocker_id,
                    at: self.clock.now(),
                });
                self.await_callback(strategy, blocker, &blocker.agent_id, message)
                    .await
            }
            ResolutionStrategy::Delegate => {
                let Some(delegate) = self.best_candidate(&blocker.agent_id) else {
                    info!("No agent available to take over blocker {}", blocker.blocker_id);
                    return Ok(false);
                };
                let message = self.nudge(
                    &delegate,
                    blocker,
                    MessagePriority::Normal,
                    &format!("Please help {} with a blocker", blocker.agent_id),
                )?;
                self.await_callback(strategy, blocker, &delegate, message)
                    .await
            }
            ResolutionStrategy::Replace => {
                let now = self.clock.now();
                self.store.with_agent_mut(&blocker.agent_id, |a| {
                    a.marked_for_replacement = true;
                });
                self.bus.publish(OutcomeEvent::MarkedForReplacement {
                    agent_id: blocker.agent_id.clone(),
                    at: now,
                });
                let Some(replacement) = self.best_candidate(&blocker.agent_id) else {
                    info!(
                        "No replacement available for {} on blocker {}",
                        blocker.agent_id, blocker.blocker_id
                    );
                    return Ok(false);
                };
                let message = self.nudge(
                    &replacement,
                    blocker,
                    MessagePriority::High,
                    &format!("Work reassigned from {}", blocker.agent_id),
                )?;
                self.await_callback(strategy, blocker, &replacement, message)
                    .await
            }
        }
    }

    /// Send a strategy REQUEST about `blocker` to `to`
    fn nudge(
        &self,
        to: &AgentId,
        blocker: &Blocker,
        priority: MessagePriority,
        subject: &str,
    ) -> Result<Uuid> {
        let message = Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::Agent(to.clone()))
            .kind(MessageKind::Request)
            .priority(priority)
            .subject(subject)
            .payload_entry("blocker_id", blocker.blocker_id.to_string())
            .payload_entry("agent_id", blocker.agent_id.as_str())
            .payload_entry("description", blocker.raw_description.as_str())
            .created_at(self.clock.now())
            .ttl(self.config.attempt_timeout().max(self.router.config().default_ttl()))
            .build()?;
        let message_id = message.id;
        self.collaborators.callbacks.expect_outcome(message_id);
        if let Err(e) = self.router.submit(message) {
            self.collaborators.callbacks.cancel_outcome(message_id);
            return Err(e.into());
        }
        Ok(message_id)
    }

    async fn await_callback(
        &self,
        strategy: ResolutionStrategy,
        blocker: &Blocker,
        agent_id: &AgentId,
        message_id: Uuid,
    ) -> anyhow::Result<bool> {
        let request = OutcomeRequest {
            strategy,
            blocker_id: blocker.blocker_id,
            agent_id: agent_id.clone(),
            message_id,
        };
        self.collaborators.callbacks.await_outcome(&request).await
    }

    /// Most reliable other agent that can take the work
    fn best_candidate(&self, owner: &AgentId) -> Option<AgentId> {
        let origin = self.store.agent(owner);
        self.store
            .agents()
            .into_iter()
            .filter(|a| &a.agent_id != owner && a.can_take_work())
            .filter(|a| origin.as_ref().map_or(true, |o| a.covers(o)))
            .max_by(|a, b| {
                a.reliability
                    .partial_cmp(&b.reliability)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.agent_id.cmp(&a.agent_id))
            })
            .map(|a| a.agent_id)
    }

    fn settled_receiver(&self, blocker_id: Uuid) -> watch::Receiver<bool> {
        self.settled
            .entry(blocker_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Wake attempts racing on the blocker, then drop its signal
    fn signal_settled(&self, blocker_id: Uuid) {
        if let Some((_, sender)) = self.settled.remove(&blocker_id) {
            sender.send_replace(true);
        }
    }
}

async fn wait_settled(mut settled: watch::Receiver<bool>) {
    loop {
        if *settled.borrow_and_update() {
            return;
        }
        if settled.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

fn seconds(duration: Option<chrono::Duration>) -> f64 {
    duration
        .map(|d| d.num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{NoAutomation, ResponseOutcomes};
    use async_trait::async_trait;
    use overseer_core::agent::AgentRecord;
    use overseer_core::config::RouterConfig;

    struct Acks(bool);

    #[async_trait]
    impl EscalationChannel for Acks {
        async fn acknowledge(&self, _request: &EscalationRequest) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    struct Answers(bool);

    #[async_trait]
    impl OutcomeCallback for Answers {
        async fn await_outcome(&self, _request: &OutcomeRequest) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    struct Fixture {
        resolver: BlockerResolver,
        store: Arc<SharedStore>,
        router: Arc<Router>,
    }

    fn fixture(collaborators: Collaborators, timeout_ms: u64) -> Fixture {
        fixture_with(collaborators, timeout_ms, RouterConfig::default())
    }

    fn fixture_with(
        collaborators: Collaborators,
        timeout_ms: u64,
        router_config: RouterConfig,
    ) -> Fixture {
        let store = Arc::new(SharedStore::new(30));
        let clock = ManualClock::default();
        for (id, reliability) in [("A1", 0.8), ("A2", 0.9), ("A3", 0.6)] {
            let mut record = AgentRecord::builder()
                .agent_id(id)
                .capability("backend")
                .project_id("proj")
                .build(clock.now())
                .unwrap();
            record.reliability = reliability;
            store.insert_agent(record);
        }
        over_store(store, collaborators, timeout_ms, router_config)
    }

    fn over_store(
        store: Arc<SharedStore>,
        collaborators: Collaborators,
        timeout_ms: u64,
        router_config: RouterConfig,
    ) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let router = Arc::new(Router::new(
            router_config,
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let config = ResolverConfig {
            chronic_failure_threshold: 3,
            attempt_timeout_ms: timeout_ms,
        };
        let resolver = BlockerResolver::new(
            config,
            BlockerClassifier::default(),
            store.clone(),
            router.clone(),
            bus,
            clock,
            collaborators,
        );
        Fixture {
            resolver,
            store,
            router,
        }
    }

    fn collaborators(acks: bool, answers: bool) -> Collaborators {
        Collaborators {
            automation: Arc::new(NoAutomation),
            escalation: Arc::new(Acks(acks)),
            callbacks: Arc::new(Answers(answers)),
        }
    }

    #[tokio::test]
    async fn test_report_classifies() {
        let f = fixture(collaborators(false, false), 1_000);
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "out of memory again".into(), None)
            .unwrap();
        assert_eq!(blocker.classified_type, BlockerType::Resource);
        assert_eq!(blocker.project_id.as_deref(), Some("proj"));
        assert!(f.store.blocker(&blocker.blocker_id).is_some());
    }

    #[tokio::test]
    async fn test_delegate_success_resolves() {
        let f = fixture(collaborators(false, true), 1_000);
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "permission_issue".into(), None)
            .unwrap();

        let report = f.resolver.resolve(blocker.blocker_id).await.unwrap();
        assert_eq!(report.strategy, ResolutionStrategy::Delegate);
        assert!(report.succeeded());
        assert_eq!(report.status, BlockerStatus::Resolved);

        // the most reliable other agent got the request
        let delegated = f.router.deliver_next(&Address::agent("A2")).unwrap();
        assert_eq!(delegated.payload_str("agent_id"), Some("A1"));

        let key = WeightKey::new(BlockerType::Process, ResolutionStrategy::Delegate);
        assert_eq!(f.store.stats(key).successes, 1);
    }

    #[tokio::test]
    async fn test_unknown_only_escalates() {
        let f = fixture(collaborators(true, false), 1_000);
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "lunch".into(), None)
            .unwrap();
        assert_eq!(blocker.classified_type, BlockerType::Unknown);

        let report = f.resolver.resolve(blocker.blocker_id).await.unwrap();
        assert_eq!(report.strategy, ResolutionStrategy::Escalate);
        assert_eq!(report.status, BlockerStatus::Escalated);
    }

    #[tokio::test]
    async fn test_automation_timeout_counts_as_failure() {
        struct Slow;

        #[async_trait]
        impl AutomationHook for Slow {
            async fn execute_automation(
                &self,
                _blocker_type: BlockerType,
                _agent_id: &AgentId,
                _context: &AutomationContext,
            ) -> anyhow::Result<bool> {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(true)
            }
        }

        let f = fixture(
            Collaborators {
                automation: Arc::new(Slow),
                escalation: Arc::new(Acks(false)),
                callbacks: Arc::new(Answers(false)),
            },
            30,
        );
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "out of disk".into(), None)
            .unwrap();

        let report = f.resolver.resolve(blocker.blocker_id).await.unwrap();
        assert_eq!(report.strategy, ResolutionStrategy::Automate);
        assert_eq!(
            report.result,
            AttemptResult::Completed(AttemptOutcome::TimedOut)
        );
        assert_eq!(report.status, BlockerStatus::Open);
        let key = WeightKey::new(BlockerType::Resource, ResolutionStrategy::Automate);
        assert_eq!(f.store.stats(key).attempts, 1);
        assert_eq!(f.store.stats(key).successes, 0);
    }

    #[tokio::test]
    async fn test_exhausted_strategies_go_chronic() {
        let f = fixture(collaborators(false, false), 1_000);
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "out of disk".into(), None)
            .unwrap();

        let reports = f
            .resolver
            .resolve_until_settled(blocker.blocker_id)
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        let last = reports.last().unwrap();
        assert_eq!(last.status, BlockerStatus::Chronic);
        let escalation_id = last.escalation_message_id.unwrap();

        let stored = f.store.blocker(&blocker.blocker_id).unwrap();
        assert_eq!(stored.escalation_message_id, Some(escalation_id));

        let err = f.resolver.resolve(blocker.blocker_id).await.unwrap_err();
        assert_eq!(err.category(), "exhausted");
    }

    #[tokio::test]
    async fn test_manual_resolution_cancels_in_flight_attempt() {
        let callbacks = Arc::new(ResponseOutcomes::new());
        let f = Arc::new(fixture(
            Collaborators {
                automation: Arc::new(NoAutomation),
                escalation: Arc::new(Acks(false)),
                callbacks: callbacks.clone(),
            },
            5_000,
        ));
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "permission_issue".into(), None)
            .unwrap();

        let attempt = {
            let f = f.clone();
            let id = blocker.blocker_id;
            tokio::spawn(async move { f.resolver.resolve(id).await })
        };
        while f.router.queue_depth(&Address::agent("A2")) == 0 {
            tokio::task::yield_now().await;
        }

        f.resolver
            .mark_resolved(blocker.blocker_id, Some("fixed by hand".into()))
            .unwrap();
        let report = attempt.await.unwrap().unwrap();
        assert_eq!(report.result, AttemptResult::Cancelled);
        assert_eq!(report.status, BlockerStatus::Resolved);

        let key = WeightKey::new(BlockerType::Process, ResolutionStrategy::Delegate);
        assert_eq!(f.store.stats(key).attempts, 0);
        let stored = f.store.blocker(&blocker.blocker_id).unwrap();
        assert!(stored.attempts.is_empty());
        assert_eq!(stored.cancelled_attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_metrics() {
        let f = fixture(collaborators(true, false), 1_000);
        for text in ["lunch", "lunch again", "still lunch"] {
            let blocker = f
                .resolver
                .report(AgentId::new("A3"), text.into(), None)
                .unwrap();
            f.resolver.resolve(blocker.blocker_id).await.unwrap();
        }

        let metrics = f.resolver.metrics();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.escalated, 3);
        assert_eq!(metrics.by_type.get(&BlockerType::Unknown), Some(&3));
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.chronic_offenders, vec![AgentId::new("A3")]);
    }

    #[tokio::test]
    async fn test_failed_chronic_escalation_is_retried() {
        // A zero default ttl makes every escalation message invalid
        let broken = RouterConfig {
            default_ttl_secs: 0,
            ..RouterConfig::default()
        };
        let f = fixture_with(collaborators(false, false), 1_000, broken.clone());
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "out of disk".into(), None)
            .unwrap();

        let reports = f
            .resolver
            .resolve_until_settled(blocker.blocker_id)
            .await
            .unwrap();
        let last = reports.last().unwrap();
        assert_eq!(last.status, BlockerStatus::Chronic);
        assert_eq!(last.escalation_message_id, None);
        assert!(f.resolver.retry_escalations().is_empty());

        let stored = f.store.blocker(&blocker.blocker_id).unwrap();
        assert!(stored.is_chronic());
        assert_eq!(stored.escalation_message_id, None);

        let healed = over_store(
            f.store.clone(),
            collaborators(false, false),
            1_000,
            RouterConfig::default(),
        );
        let sent = healed.resolver.retry_escalations();
        assert_eq!(sent.len(), 1);
        let stored = f.store.blocker(&blocker.blocker_id).unwrap();
        assert_eq!(stored.escalation_message_id, Some(sent[0]));
        let escalation = healed.router.deliver_next(&Address::Orchestrator).unwrap();
        assert_eq!(escalation.id, sent[0]);
        assert_eq!(escalation.kind, MessageKind::Escalation);
        assert!(healed.resolver.retry_escalations().is_empty());
    }

    #[tokio::test]
    async fn test_settle_signals_are_dropped() {
        let f = fixture(collaborators(false, true), 1_000);
        let blocker = f
            .resolver
            .report(AgentId::new("A1"), "permission_issue".into(), None)
            .unwrap();
        assert_eq!(f.resolver.settled.len(), 1);
        f.resolver.resolve(blocker.blocker_id).await.unwrap();
        assert!(f.resolver.settled.is_empty());

        // Settled behind the resolver's back
        let other = f
            .resolver
            .report(AgentId::new("A1"), "permission_issue".into(), None)
            .unwrap();
        let now = Utc::now();
        f.store
            .with_blocker_mut(&other.blocker_id, |b| b.mark_resolved(None, now))
            .unwrap()
            .unwrap();
        let open = f
            .resolver
            .report(AgentId::new("A2"), "permission_issue".into(), None)
            .unwrap();
        assert_eq!(f.resolver.prune_settled(), 1);
        assert!(f.resolver.settled.contains_key(&open.blocker_id));
    }
}
