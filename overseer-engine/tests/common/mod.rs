//! Common test utilities for the overseer-engine test suite.
//!
//! Provides an orchestrator wired to a manual clock and scripted
//! collaborators whose answers each test decides up front.

#![allow(dead_code)]

use async_trait::async_trait;
use overseer_engine::clock::{Clock, ManualClock};
use overseer_engine::collaborators::{
    AutomationContext, AutomationHook, EscalationChannel, OutcomeCallback, OutcomeRequest,
};
use overseer_engine::core::agent::{AgentId, AgentRecord};
use overseer_engine::core::blocker::BlockerType;
use overseer_engine::core::config::OrchestratorConfig;
use overseer_engine::core::event::EscalationRequest;
use overseer_engine::core::strategy::ResolutionStrategy;
use overseer_engine::Orchestrator;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome callback answering per strategy; unscripted strategies fail
#[derive(Default)]
pub struct ScriptedCallbacks {
    answers: Mutex<HashMap<ResolutionStrategy, bool>>,
    requests: Mutex<Vec<OutcomeRequest>>,
}

impl ScriptedCallbacks {
    pub fn answer(&self, strategy: ResolutionStrategy, outcome: bool) {
        self.answers.lock().insert(strategy, outcome);
    }

    pub fn requests(&self) -> Vec<OutcomeRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl OutcomeCallback for ScriptedCallbacks {
    async fn await_outcome(&self, request: &OutcomeRequest) -> anyhow::Result<bool> {
        self.requests.lock().push(request.clone());
        Ok(self
            .answers
            .lock()
            .get(&request.strategy)
            .copied()
            .unwrap_or(false))
    }
}

#[derive(Default)]
pub struct ScriptedEscalation {
    acknowledge: Mutex<bool>,
    requests: Mutex<Vec<EscalationRequest>>,
}

impl ScriptedEscalation {
    pub fn set_acknowledge(&self, acknowledge: bool) {
        *self.acknowledge.lock() = acknowledge;
    }

    pub fn requests(&self) -> Vec<EscalationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl EscalationChannel for ScriptedEscalation {
    async fn acknowledge(&self, request: &EscalationRequest) -> anyhow::Result<bool> {
        self.requests.lock().push(request.clone());
        Ok(*self.acknowledge.lock())
    }
}

#[derive(Default)]
pub struct ScriptedAutomation {
    handles: Mutex<bool>,
    calls: AtomicUsize,
}

impl ScriptedAutomation {
    pub fn set_handles(&self, handles: bool) {
        *self.handles.lock() = handles;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AutomationHook for ScriptedAutomation {
    async fn execute_automation(
        &self,
        _blocker_type: BlockerType,
        _agent_id: &AgentId,
        _context: &AutomationContext,
    ) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.handles.lock())
    }
}

/// Orchestrator plus handles on everything a test wants to steer
pub struct TestContext {
    pub orchestrator: Orchestrator,
    pub clock: Arc<ManualClock>,
    pub callbacks: Arc<ScriptedCallbacks>,
    pub escalation: Arc<ScriptedEscalation>,
    pub automation: Arc<ScriptedAutomation>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let callbacks = Arc::new(ScriptedCallbacks::default());
        let escalation = Arc::new(ScriptedEscalation::default());
        let automation = Arc::new(ScriptedAutomation::default());

        let orchestrator = Orchestrator::builder()
            .config(config)
            .clock(clock.clone())
            .outcome_callback(callbacks.clone())
            .escalation_channel(escalation.clone())
            .automation(automation.clone())
            .build()
            .expect("Failed to build orchestrator");

        Self {
            orchestrator,
            clock,
            callbacks,
            escalation,
            automation,
        }
    }

    /// Register `id` with the `backend` capability in project `proj`
    pub fn register(&self, id: &str) -> AgentRecord {
        self.orchestrator
            .register_agent(
                AgentId::new(id),
                BTreeSet::from(["backend".to_string()]),
                Some("proj".to_string()),
            )
            .expect("Failed to register agent")
    }

    /// Force an agent to the strike ceiling
    pub fn block(&self, id: &str) {
        let now = self.clock.now();
        self.orchestrator
            .store()
            .with_agent_mut(&AgentId::new(id), |agent| {
                agent.strike_count = 3;
                agent.blocked_at = Some(now);
            })
            .expect("Agent not registered");
    }

    pub fn agent(&self, id: &str) -> AgentRecord {
        self.orchestrator
            .store()
            .agent(&AgentId::new(id))
            .expect("Agent not registered")
    }
}
