//! Engine facade
//!
//! [`Orchestrator`] owns the shared store, the event bus and every service,
//! and translates normalized inbound events into router submissions,
//! blocker reports and scorer outcomes.
//!
//! # Examples
//!
//! ```rust,no_run
//! use overseer_engine::orchestrator::Orchestrator;
//! use overseer_engine::core::event::{InboundEvent, InboundKind};
//!
//! # async fn example() -> overseer_engine::Result<()> {
//! let orchestrator = Orchestrator::builder().build()?;
//!
//! orchestrator.ingest(
//!     InboundEvent::new("slack", "worker-01".into(), InboundKind::Registration)
//!         .with("capabilities", vec!["backend"])
//!         .with("project_id", "checkout"),
//! )?;
//!
//! let blocker = orchestrator.report_blocker("worker-01".into(), "out of disk", None)?;
//! let attempts = orchestrator.resolve_until_settled(blocker.blocker_id).await?;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    AutomationHook, CallOutcomeChannel, EscalationChannel, NoAutomation, OutcomeCallback,
    ResponseOutcomes,
};
use crate::events::EventBus;
use crate::health::HealthAggregator;
use crate::persistence::{StateBlobs, StateStore};
use crate::resolver::{AttemptReport, BlockerMetrics, BlockerResolver, Collaborators};
use crate::router::{Accepted, Housekeeping, Router};
use crate::scorer::{CycleReport, PerformanceScorer};
use crate::settings;
use crate::store::SharedStore;
use crate::{Error, Result};
use overseer_core::agent::{AgentId, AgentRecord};
use overseer_core::blocker::Blocker;
use overseer_core::classifier::{BlockerClassifier, RuleSet};
use overseer_core::config::OrchestratorConfig;
use overseer_core::event::{InboundEvent, InboundKind, OutcomeEvent};
use overseer_core::health::ProjectHealthSnapshot;
use overseer_core::message::{Address, Message, MessageKind, MessagePriority};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What ingesting one inbound event did
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Registered { agent_id: AgentId, new: bool },
    /// Forwarded to the scorer as an outcome event
    Outcome,
    Blocker(Blocker),
    Routed(Accepted),
    /// Answer to an escalation; `delivered` when a resolver attempt was waiting
    CallOutcome { delivered: bool },
    Noted,
}

/// Messages drained from the orchestrator's own queue
#[derive(Debug, Clone, Default)]
pub struct InboxReport {
    /// Blockers opened from BLOCKER_REPORT messages
    pub blockers: Vec<Blocker>,
    pub escalations: Vec<Message>,
    pub other: Vec<Message>,
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Correlation ids of REQUESTs that expired unanswered
    pub timed_out: Vec<Uuid>,
    pub housekeeping: Housekeeping,
    /// ESCALATIONs finally sent for chronic blockers
    pub escalations_retried: Vec<Uuid>,
    pub cycle: CycleReport,
    pub snapshots: Vec<ProjectHealthSnapshot>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    store: Arc<SharedStore>,
    bus: Arc<EventBus>,
    router: Arc<Router>,
    resolver: Arc<BlockerResolver>,
    scorer: Arc<PerformanceScorer>,
    health: HealthAggregator,
    call_outcomes: Arc<CallOutcomeChannel>,
    responses: Arc<ResponseOutcomes>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Build with configuration loaded from `base` and the environment
    pub fn from_settings(base: &Path) -> Result<Self> {
        Self::builder().config(settings::load_from(base)?).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn resolver(&self) -> &Arc<BlockerResolver> {
        &self.resolver
    }

    pub fn scorer(&self) -> &Arc<PerformanceScorer> {
        &self.scorer
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    /// Default escalation channel, answered by CALL_OUTCOME events
    pub fn call_outcomes(&self) -> &Arc<CallOutcomeChannel> {
        &self.call_outcomes
    }

    /// Default outcome callback, answered by RESPONSE events
    pub fn responses(&self) -> &Arc<ResponseOutcomes> {
        &self.responses
    }

    /// Translate one normalized inbound event
    pub fn ingest(&self, event: InboundEvent) -> Result<Ingested> {
        debug!(
            source = %event.source,
            kind = ?event.kind,
            "Ingesting event for {}",
            event.agent_id
        );
        match event.kind {
            InboundKind::Registration => {
                let capabilities: BTreeSet<String> = event
                    .payload
                    .get("capabilities")
                    .and_then(|v| v.as_array())
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let project_id = event.payload_str("project_id").map(str::to_string);
                let new = self.register_at(
                    event.agent_id.clone(),
                    capabilities,
                    project_id,
                    event.timestamp,
                )?;
                Ok(Ingested::Registered {
                    agent_id: event.agent_id,
                    new,
                })
            }
            InboundKind::TaskAssigned => {
                self.require_agent(&event.agent_id)?;
                self.store
                    .with_agent_mut(&event.agent_id, |a| a.touch(event.timestamp));
                Ok(Ingested::Noted)
            }
            InboundKind::TaskCompleted | InboundKind::TaskFailed => {
                self.require_agent(&event.agent_id)?;
                let task_id = required_str(&event, "task_id")?.to_string();
                let outcome = if event.kind == InboundKind::TaskCompleted {
                    OutcomeEvent::TaskCompleted {
                        agent_id: event.agent_id,
                        task_id,
                        at: event.timestamp,
                    }
                } else {
                    OutcomeEvent::TaskFailed {
                        agent_id: event.agent_id,
                        task_id,
                        at: event.timestamp,
                    }
                };
                self.bus.publish(outcome);
                Ok(Ingested::Outcome)
            }
            InboundKind::BlockerReported => {
                self.require_agent(&event.agent_id)?;
                let description = required_str(&event, "description")?.to_string();
                let project_id = event.payload_str("project_id").map(str::to_string);
                let blocker = self.resolver.report(event.agent_id, description, project_id)?;
                Ok(Ingested::Blocker(blocker))
            }
            InboundKind::Request => {
                let recipient = parse_address(required_str(&event, "recipient")?);
                let message = self
                    .inbound_message(&event, MessageKind::Request, recipient)?
                    .build()?;
                Ok(Ingested::Routed(self.router.submit(message)?))
            }
            InboundKind::Response => {
                let correlation_id = parse_uuid(&event, "correlation_id")?;
                let recipient = event
                    .payload_str("recipient")
                    .map(parse_address)
                    .unwrap_or(Address::Orchestrator);
                let message = self
                    .inbound_message(&event, MessageKind::Response, recipient)?
                    .correlation_id(correlation_id)
                    .build()?;
                let accepted = self.router.submit(message)?;

                let resolved = event
                    .payload
                    .get("resolved")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if self.responses.record_response(correlation_id, resolved) {
                    debug!("Response {} answered a waiting strategy", correlation_id);
                }
                Ok(Ingested::Routed(accepted))
            }
            InboundKind::CallOutcome => {
                let escalation_id = parse_uuid(&event, "escalation_id")?;
                let acknowledged = event
                    .payload
                    .get("acknowledged")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let delivered = self
                    .call_outcomes
                    .record_call_outcome(escalation_id, acknowledged);
                info!(
                    "Call outcome for escalation {}: acknowledged={}",
                    escalation_id, acknowledged
                );
                Ok(Ingested::CallOutcome { delivered })
            }
            InboundKind::ChangeEvent => {
                info!(
                    source = %event.source,
                    project = event.payload_str("project_id").unwrap_or("-"),
                    "Change event from {}",
                    event.agent_id
                );
                self.store
                    .with_agent_mut(&event.agent_id, |a| a.touch(event.timestamp));
                Ok(Ingested::Noted)
            }
        }
    }

    fn inbound_message(
        &self,
        event: &InboundEvent,
        kind: MessageKind,
        recipient: Address,
    ) -> Result<overseer_core::message::MessageBuilder> {
        let priority = match event.payload.get("priority") {
            Some(value) => serde_json::from_value::<MessagePriority>(value.clone())?,
            None => MessagePriority::Normal,
        };
        let ttl = event
            .payload
            .get("ttl_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.router.default_ttl());

        Ok(Message::builder()
            .sender(Address::Agent(event.agent_id.clone()))
            .recipient(recipient)
            .kind(kind)
            .priority(priority)
            .subject(event.payload_str("subject").unwrap_or_default())
            .payload(event.payload.clone())
            .created_at(event.timestamp)
            .ttl(ttl))
    }

    fn require_agent(&self, agent_id: &AgentId) -> Result<()> {
        if self.store.contains_agent(agent_id) {
            Ok(())
        } else {
            Err(Error::not_found("Agent", agent_id))
        }
    }

    /// Register an agent, or merge capabilities into an existing record
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        project_id: Option<String>,
    ) -> Result<AgentRecord> {
        self.register_at(agent_id.clone(), capabilities, project_id, self.clock.now())?;
        self.store
            .agent(&agent_id)
            .ok_or_else(|| Error::not_found("Agent", agent_id))
    }

    fn register_at(
        &self,
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        project_id: Option<String>,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let merged = self.store.with_agent_mut(&agent_id, |record| {
            record.merge_capabilities(capabilities.clone());
            if record.project_id.is_none() {
                record.project_id = project_id.clone();
            }
            record.touch(at);
        });
        if merged.is_some() {
            debug!("Agent {} re-registered", agent_id);
            return Ok(false);
        }

        let mut record = AgentRecord::new(agent_id.clone(), capabilities, project_id, at)?;
        self.scorer.initialize(&mut record);
        if !self.store.insert_agent(record) {
            // Lost a race with a concurrent registration
            return Ok(false);
        }
        info!("Registered agent {}", agent_id);
        self.bus
            .publish(OutcomeEvent::AgentRegistered { agent_id, at });
        Ok(true)
    }

    pub fn send(&self, message: Message) -> Result<Accepted> {
        Ok(self.router.submit(message)?)
    }

    pub fn deliver_next(&self, recipient: &Address) -> Option<Message> {
        self.router.deliver_next(recipient)
    }

    pub fn report_blocker<S: Into<String>>(
        &self,
        agent_id: AgentId,
        description: S,
        project_id: Option<String>,
    ) -> Result<Blocker> {
        self.resolver.report(agent_id, description.into(), project_id)
    }

    pub async fn resolve_blocker(&self, blocker_id: Uuid) -> Result<AttemptReport> {
        self.resolver.resolve(blocker_id).await
    }

    pub async fn resolve_until_settled(&self, blocker_id: Uuid) -> Result<Vec<AttemptReport>> {
        self.resolver.resolve_until_settled(blocker_id).await
    }

    pub fn mark_blocker_resolved(&self, blocker_id: Uuid, notes: Option<String>) -> Result<Blocker> {
        self.resolver.mark_resolved(blocker_id, notes)
    }

    pub fn blocker_metrics(&self) -> BlockerMetrics {
        self.resolver.metrics()
    }

    /// Process everything queued for the orchestrator itself
    pub fn drain_inbox(&self) -> InboxReport {
        let mut report = InboxReport::default();
        while let Some(message) = self.router.deliver_next(&Address::Orchestrator) {
            match message.kind {
                MessageKind::BlockerReport => match self.open_reported_blocker(&message) {
                    Ok(blocker) => report.blockers.push(blocker),
                    Err(e) => warn!("Ignoring blocker report {}: {}", message.id, e),
                },
                MessageKind::Escalation => report.escalations.push(message),
                _ => report.other.push(message),
            }
        }
        report
    }

    fn open_reported_blocker(&self, message: &Message) -> Result<Blocker> {
        let agent_id = message
            .payload_str("agent_id")
            .map(AgentId::new)
            .or_else(|| message.sender.agent_id().cloned())
            .ok_or_else(|| overseer_core::Error::validation("Blocker report names no agent"))?;
        let description = message
            .payload_str("description")
            .unwrap_or(message.subject.as_str())
            .to_string();
        let project_id = message.payload_str("project_id").map(str::to_string);
        self.resolver.report(agent_id, description, project_id)
    }

    pub fn snapshot(&self, project_id: &str) -> Result<ProjectHealthSnapshot> {
        self.health.snapshot(project_id)
    }

    /// One maintenance pass.
    ///
    /// Expires unanswered requests and stale router state, resends missing
    /// chronic escalations, runs the scoring cycle and snapshots every
    /// project's health.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let timed_out = self.router.expire_pending_requests();
        let housekeeping = self.router.housekeeping();
        let escalations_retried = self.resolver.retry_escalations();
        let pruned = self.resolver.prune_settled();
        let cycle = self.scorer.run_cycle();
        let snapshots = self.health.snapshot_all();
        debug!(
            timed_out = timed_out.len(),
            swept = housekeeping.expired,
            retried = escalations_retried.len(),
            pruned,
            rescored = cycle.rescored,
            projects = snapshots.len(),
            "Maintenance pass complete"
        );
        MaintenanceReport {
            timed_out,
            housekeeping,
            escalations_retried,
            cycle,
            snapshots,
        }
    }

    /// Run maintenance every `period` until `shutdown` turns true
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        orchestrator.run_maintenance();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Maintenance loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn persist(&self, backend: &dyn StateStore) -> Result<()> {
        let blobs = StateBlobs::export(&self.store)?;
        backend.save(&blobs).await
    }

    /// Replace the in-memory state with the last saved copy; false when
    /// nothing was saved yet
    pub async fn restore(&self, backend: &dyn StateStore) -> Result<bool> {
        match backend.load().await? {
            Some(blobs) => {
                blobs.import(&self.store)?;
                info!("Restored {} agents from saved state", self.store.agent_ids().len());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn required_str<'a>(event: &'a InboundEvent, key: &str) -> Result<&'a str> {
    event.payload_str(key).ok_or_else(|| {
        overseer_core::Error::validation(format!(
            "{:?} event requires a '{}' payload entry",
            event.kind, key
        ))
        .into()
    })
}

fn parse_uuid(event: &InboundEvent, key: &str) -> Result<Uuid> {
    let raw = required_str(event, key)?;
    Uuid::parse_str(raw).map_err(|e| {
        overseer_core::Error::validation(format!("Invalid {} '{}': {}", key, raw, e)).into()
    })
}

fn parse_address(raw: &str) -> Address {
    match raw {
        "orchestrator" => Address::Orchestrator,
        "broadcast" => Address::Broadcast,
        agent => Address::agent(agent),
    }
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    clock: Option<Arc<dyn Clock>>,
    classifier: Option<BlockerClassifier>,
    automation: Option<Arc<dyn AutomationHook>>,
    escalation: Option<Arc<dyn EscalationChannel>>,
    callbacks: Option<Arc<dyn OutcomeCallback>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use this classifier instead of the configured rule set
    pub fn classifier(mut self, classifier: BlockerClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn automation(mut self, hook: Arc<dyn AutomationHook>) -> Self {
        self.automation = Some(hook);
        self
    }

    pub fn escalation_channel(mut self, channel: Arc<dyn EscalationChannel>) -> Self {
        self.escalation = Some(channel);
        self
    }

    pub fn outcome_callback(mut self, callback: Arc<dyn OutcomeCallback>) -> Self {
        self.callbacks = Some(callback);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let classifier = match self.classifier {
            Some(classifier) => classifier,
            None => load_classifier(&config)?,
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let store = Arc::new(SharedStore::new(config.health.history_capacity));
        let bus = Arc::new(EventBus::new());

        let scorer = Arc::new(PerformanceScorer::new(
            config.scoring.clone(),
            store.clone(),
            clock.clone(),
        ));
        bus.register(scorer.clone());

        let router = Arc::new(Router::new(
            config.router.clone(),
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));

        let call_outcomes = Arc::new(CallOutcomeChannel::new());
        let responses = Arc::new(ResponseOutcomes::new());
        let collaborators = Collaborators {
            automation: self
                .automation
                .unwrap_or_else(|| Arc::new(NoAutomation) as Arc<dyn AutomationHook>),
            escalation: self
                .escalation
                .unwrap_or_else(|| call_outcomes.clone() as Arc<dyn EscalationChannel>),
            callbacks: self
                .callbacks
                .unwrap_or_else(|| responses.clone() as Arc<dyn OutcomeCallback>),
        };

        let resolver = Arc::new(BlockerResolver::new(
            config.resolver.clone(),
            classifier,
            store.clone(),
            router.clone(),
            bus.clone(),
            clock.clone(),
            collaborators,
        ));
        let health = HealthAggregator::new(
            config.health.clone(),
            store.clone(),
            router.clone(),
            bus.clone(),
            clock.clone(),
        );

        info!(
            rules = resolver.classifier().rules().len(),
            "Orchestrator ready"
        );
        Ok(Orchestrator {
            config,
            clock,
            store,
            bus,
            router,
            resolver,
            scorer,
            health,
            call_outcomes,
            responses,
        })
    }
}

fn load_classifier(config: &OrchestratorConfig) -> Result<BlockerClassifier> {
    let threshold = config.classifier.threshold;
    match &config.classifier.rules_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            let rules = RuleSet::from_json(&json)?;
            info!(
                "Loaded {} classifier rules from {}",
                rules.len(),
                path.display()
            );
            Ok(BlockerClassifier::new(rules, threshold)?)
        }
        None => Ok(BlockerClassifier::with_defaults(threshold)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryStateStore;
    use assert_matches::assert_matches;

    fn orchestrator() -> (Orchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Orchestrator::builder()
            .clock(clock.clone())
            .build()
            .unwrap();
        (orchestrator, clock)
    }

    fn register(o: &Orchestrator, id: &str) {
        o.ingest(
            InboundEvent::new("test", id.into(), InboundKind::Registration)
                .with("capabilities", vec!["backend"])
                .with("project_id", "proj"),
        )
        .unwrap();
    }

    #[test]
    fn test_registration_is_idempotent() {
        let (o, _) = orchestrator();
        let first = o
            .ingest(
                InboundEvent::new("test", "A1".into(), InboundKind::Registration)
                    .with("capabilities", vec!["backend"]),
            )
            .unwrap();
        assert_matches!(first, Ingested::Registered { new: true, .. });

        let second = o
            .ingest(
                InboundEvent::new("test", "A1".into(), InboundKind::Registration)
                    .with("capabilities", vec!["testing"]),
            )
            .unwrap();
        assert_matches!(second, Ingested::Registered { new: false, .. });

        let record = o.store().agent(&AgentId::new("A1")).unwrap();
        assert!(record.has_capability("backend") && record.has_capability("testing"));
    }

    #[test]
    fn test_task_events_reach_the_scorer() {
        let (o, _) = orchestrator();
        register(&o, "A1");
        o.ingest(
            InboundEvent::new("test", "A1".into(), InboundKind::TaskCompleted).with("task_id", "t1"),
        )
        .unwrap();
        let record = o.store().agent(&AgentId::new("A1")).unwrap();
        assert_eq!(record.metrics.tasks_completed, 1);

        let err = o
            .ingest(InboundEvent::new("test", "A1".into(), InboundKind::TaskFailed))
            .unwrap_err();
        assert_eq!(err.category(), "validation");

        let err = o
            .ingest(
                InboundEvent::new("test", "ghost".into(), InboundKind::TaskCompleted)
                    .with("task_id", "t1"),
            )
            .unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_request_events_are_routed() {
        let (o, _) = orchestrator();
        register(&o, "A1");
        register(&o, "A2");
        let routed = o
            .ingest(
                InboundEvent::new("test", "A1".into(), InboundKind::Request)
                    .with("recipient", "A2")
                    .with("subject", "review please")
                    .with("priority", "HIGH"),
            )
            .unwrap();
        assert_matches!(routed, Ingested::Routed(Accepted::Queued { .. }));

        let delivered = o.deliver_next(&Address::agent("A2")).unwrap();
        assert_eq!(delivered.priority, MessagePriority::High);
        assert_eq!(delivered.sender, Address::agent("A1"));
    }

    #[test]
    fn test_unreachable_report_becomes_blocker() {
        let (o, _) = orchestrator();
        register(&o, "A1");
        let err = o
            .ingest(
                InboundEvent::new("test", "A1".into(), InboundKind::Request)
                    .with("recipient", "ghost")
                    .with("subject", "hello?"),
            )
            .unwrap_err();
        assert_eq!(err.category(), "unreachable");

        let inbox = o.drain_inbox();
        assert_eq!(inbox.blockers.len(), 1);
        assert_eq!(inbox.blockers[0].agent_id, AgentId::new("A1"));
        assert_eq!(inbox.blockers[0].project_id.as_deref(), Some("proj"));
    }

    #[test]
    fn test_unsolicited_call_outcome_is_not_delivered() {
        let (o, _) = orchestrator();
        let id = Uuid::new_v4();
        let ingested = o
            .ingest(
                InboundEvent::new("phone", "A1".into(), InboundKind::CallOutcome)
                    .with("escalation_id", id.to_string())
                    .with("acknowledged", true),
            )
            .unwrap();
        assert_eq!(ingested, Ingested::CallOutcome { delivered: false });
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let (o, _) = orchestrator();
        register(&o, "A1");
        o.report_blocker("A1".into(), "out of disk", None).unwrap();
        let backend = InMemoryStateStore::new();
        o.persist(&backend).await.unwrap();

        let (fresh, _) = orchestrator();
        assert!(fresh.restore(&backend).await.unwrap());
        assert!(fresh.store().contains_agent(&AgentId::new("A1")));
        assert_eq!(fresh.blocker_metrics().total, 1);

        let (empty, _) = orchestrator();
        assert!(!empty.restore(&InMemoryStateStore::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_loop_stops_on_shutdown() {
        let (o, _) = orchestrator();
        register(&o, "A1");
        let o = Arc::new(o);
        let (stop, shutdown) = watch::channel(false);
        let handle = o.spawn_maintenance(Duration::from_millis(5), shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();
        assert!(o.health().history("proj").is_some());
    }
}
