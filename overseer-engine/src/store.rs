//! Shared state for the engine services
//!
//! Agent records, blockers, the pattern weight table and project health
//! histories each live in their own concurrent map. Mutation goes through
//! closures that hold a single entry's lock for as long as they run; none
//! of them may await or publish events.

use dashmap::DashMap;
use overseer_core::agent::{AgentId, AgentRecord};
use overseer_core::blocker::{Blocker, BlockerType};
use overseer_core::health::{HealthHistory, ProjectHealthSnapshot};
use overseer_core::weights::{StrategyStats, WeightKey};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub struct SharedStore {
    agents: DashMap<AgentId, AgentRecord>,
    blockers: DashMap<Uuid, Blocker>,
    weights: DashMap<WeightKey, StrategyStats>,
    health: DashMap<String, HealthHistory>,
    history_capacity: usize,
}

impl SharedStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            agents: DashMap::new(),
            blockers: DashMap::new(),
            weights: DashMap::new(),
            health: DashMap::new(),
            history_capacity,
        }
    }

    // Agents

    /// Insert a record unless one already exists; returns true if inserted
    pub fn insert_agent(&self, record: AgentRecord) -> bool {
        match self.agents.entry(record.agent_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|r| r.clone())
    }

    pub fn contains_agent(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Routable state of a known agent, `None` when unknown
    pub fn is_routable(&self, agent_id: &AgentId) -> Option<bool> {
        self.agents.get(agent_id).map(|r| r.is_routable())
    }

    pub fn with_agent_mut<R>(
        &self,
        agent_id: &AgentId,
        f: impl FnOnce(&mut AgentRecord) -> R,
    ) -> Option<R> {
        self.agents.get_mut(agent_id).map(|mut r| f(&mut r))
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.iter().map(|r| r.clone()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn project_agents(&self, project_id: &str) -> Vec<AgentRecord> {
        self.agents()
            .into_iter()
            .filter(|a| a.project_id.as_deref() == Some(project_id))
            .collect()
    }

    pub fn agent_project(&self, agent_id: &AgentId) -> Option<String> {
        self.agents
            .get(agent_id)
            .and_then(|r| r.project_id.clone())
    }

    // Blockers

    pub fn insert_blocker(&self, blocker: Blocker) {
        self.blockers.insert(blocker.blocker_id, blocker);
    }

    pub fn blocker(&self, blocker_id: &Uuid) -> Option<Blocker> {
        self.blockers.get(blocker_id).map(|b| b.clone())
    }

    pub fn with_blocker_mut<R>(
        &self,
        blocker_id: &Uuid,
        f: impl FnOnce(&mut Blocker) -> R,
    ) -> Option<R> {
        self.blockers.get_mut(blocker_id).map(|mut b| f(&mut b))
    }

    pub fn blockers(&self) -> Vec<Blocker> {
        let mut blockers: Vec<Blocker> = self.blockers.iter().map(|b| b.clone()).collect();
        blockers.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        blockers
    }

    pub fn blockers_for_agent(&self, agent_id: &AgentId) -> Vec<Blocker> {
        self.blockers()
            .into_iter()
            .filter(|b| &b.agent_id == agent_id)
            .collect()
    }

    pub fn project_blockers(&self, project_id: &str) -> Vec<Blocker> {
        self.blockers()
            .into_iter()
            .filter(|b| b.project_id.as_deref() == Some(project_id))
            .collect()
    }

    /// Types of the agent's earlier blockers, oldest first
    pub fn prior_blocker_types(&self, agent_id: &AgentId) -> Vec<BlockerType> {
        self.blockers_for_agent(agent_id)
            .into_iter()
            .map(|b| b.classified_type)
            .filter(|t| *t != BlockerType::Unknown)
            .collect()
    }

    // Pattern weights

    /// Current Laplace-smoothed rate; 0.5 for unseen pairs
    pub fn weight(&self, key: WeightKey) -> f64 {
        self.weights
            .get(&key)
            .map(|s| s.rate())
            .unwrap_or_else(|| StrategyStats::default().rate())
    }

    pub fn stats(&self, key: WeightKey) -> StrategyStats {
        self.weights.get(&key).map(|s| *s).unwrap_or_default()
    }

    pub fn record_weight(&self, key: WeightKey, success: bool) -> StrategyStats {
        let mut entry = self.weights.entry(key).or_default();
        entry.record(success);
        *entry
    }

    pub fn weights(&self) -> BTreeMap<WeightKey, StrategyStats> {
        self.weights.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    // Health

    pub fn push_health(&self, snapshot: ProjectHealthSnapshot) {
        let capacity = self.history_capacity;
        self.health
            .entry(snapshot.project_id.clone())
            .or_insert_with(|| HealthHistory::new(capacity))
            .push(snapshot);
    }

    pub fn health_history(&self, project_id: &str) -> Option<HealthHistory> {
        self.health.get(project_id).map(|h| h.clone())
    }

    pub fn latest_health(&self, project_id: &str) -> Option<ProjectHealthSnapshot> {
        self.health
            .get(project_id)
            .and_then(|h| h.latest().cloned())
    }

    /// Projects referenced by any agent, blocker or health history
    pub fn projects(&self) -> BTreeSet<String> {
        let mut projects: BTreeSet<String> = self
            .agents
            .iter()
            .filter_map(|a| a.project_id.clone())
            .collect();
        projects.extend(self.blockers.iter().filter_map(|b| b.project_id.clone()));
        projects.extend(self.health.iter().map(|h| h.key().clone()));
        projects
    }

    pub(crate) fn health_histories(&self) -> BTreeMap<String, HealthHistory> {
        self.health
            .iter()
            .map(|h| (h.key().clone(), h.value().clone()))
            .collect()
    }

    /// Replace all state, used when restoring from a persisted copy
    pub(crate) fn replace_all(
        &self,
        agents: Vec<AgentRecord>,
        blockers: Vec<Blocker>,
        weights: Vec<(WeightKey, StrategyStats)>,
        health: Vec<(String, HealthHistory)>,
    ) {
        self.agents.clear();
        self.blockers.clear();
        self.weights.clear();
        self.health.clear();
        for agent in agents {
            self.agents.insert(agent.agent_id.clone(), agent);
        }
        for blocker in blockers {
            self.blockers.insert(blocker.blocker_id, blocker);
        }
        for (key, stats) in weights {
            self.weights.insert(key, stats);
        }
        for (project, history) in health {
            self.health.insert(project, history);
        }
    }
}
