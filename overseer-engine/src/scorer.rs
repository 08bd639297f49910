//! Per-agent performance scoring
//!
//! The scorer listens on the event bus and folds every outcome into the
//! agent's rolling metrics: EMAs for completion and reliability, a decaying
//! friction count, windowed velocity and strikes. After each update the
//! composite score and tier are recomputed.

use crate::clock::Clock;
use crate::events::EventSubscriber;
use crate::store::SharedStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use overseer_core::agent::{ema, AgentId, AgentMetrics, AgentRecord, PerformanceTier, StrikeChange};
use overseer_core::config::ScoringConfig;
use overseer_core::event::OutcomeEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedAgent {
    pub agent_id: AgentId,
    pub composite: f64,
    pub tier: PerformanceTier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProblemAgent {
    pub agent_id: AgentId,
    pub tier: PerformanceTier,
    pub strike_count: u8,
    pub reasons: Vec<String>,
}

/// Everything known about one agent's standing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceReport {
    pub agent_id: AgentId,
    pub composite: f64,
    pub tier: PerformanceTier,
    pub recommendation: String,
    pub reliability: f64,
    pub metrics: BTreeMap<String, f64>,
    pub strike_count: u8,
    pub blocked: bool,
    pub marked_for_replacement: bool,
    pub commendations: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub blockers_reported: u64,
    pub blockers_resolved: u64,
}

/// What a maintenance cycle changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub rescored: usize,
    /// Agents whose cool-down elapsed and are routable again
    pub unblocked: Vec<AgentId>,
}

pub struct PerformanceScorer {
    config: ScoringConfig,
    store: Arc<SharedStore>,
    clock: Arc<dyn Clock>,
}

impl PerformanceScorer {
    pub fn new(config: ScoringConfig, store: Arc<SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Reset a freshly registered record to the configured starting values
    pub fn initialize(&self, record: &mut AgentRecord) {
        record.reliability = self.config.initial_reliability;
        record.metrics = AgentMetrics::new(self.config.initial_completion_rate);
        self.rescore(record);
    }

    /// Fold one outcome event into the metrics of the agent it names.
    ///
    /// Returns the updated metrics, or `None` when the event names no
    /// known agent.
    pub fn record_outcome(&self, event: &OutcomeEvent) -> Option<AgentMetrics> {
        let agent_id = event.agent_id()?.clone();
        let updated = self
            .store
            .with_agent_mut(&agent_id, |record| self.apply(record, event));
        if updated.is_none() {
            debug!(
                event = event.name(),
                "Outcome for unknown agent {} ignored", agent_id
            );
        }
        updated
    }

    fn apply(&self, record: &mut AgentRecord, event: &OutcomeEvent) -> AgentMetrics {
        let alpha = self.config.ema_alpha;
        let frozen = record.is_blocked();

        match event {
            OutcomeEvent::TaskCompleted { at, .. } => {
                record.metrics.tasks_completed += 1;
                record.record_completion(*at, self.config.window());
                if !frozen {
                    record.metrics.completion_rate = ema(record.metrics.completion_rate, 1.0, alpha);
                    record.metrics.velocity = self.velocity(record);
                }
                record.touch(*at);
            }
            OutcomeEvent::TaskFailed { task_id, at, .. } => {
                record.metrics.tasks_failed += 1;
                if !frozen {
                    record.metrics.completion_rate = ema(record.metrics.completion_rate, 0.0, alpha);
                }
                self.strike(record, &format!("task:{}", task_id), *at);
                record.touch(*at);
            }
            OutcomeEvent::BlockerReported { at, .. } => {
                record.metrics.blockers_reported += 1;
                record.touch(*at);
            }
            OutcomeEvent::BlockerResolved {
                resolution_secs, ..
            } => {
                record.metrics.record_resolution_time(*resolution_secs);
                if !frozen {
                    record.reliability = ema(record.reliability, 1.0, alpha);
                }
            }
            OutcomeEvent::AttemptFailed { .. } | OutcomeEvent::RequestTimedOut { .. } => {
                if !frozen {
                    record.reliability = ema(record.reliability, 0.0, alpha);
                }
            }
            OutcomeEvent::BlockerChronic { blocker_id, at, .. } => {
                self.strike(record, &format!("blocker:{}", blocker_id), *at);
            }
            OutcomeEvent::ThreatenIssued { blocker_id, at, .. } => {
                self.strike(record, &format!("threaten:{}", blocker_id), *at);
            }
            OutcomeEvent::FrictionRaised { .. } => {
                if !frozen {
                    record.metrics.friction += 1.0;
                }
            }
            OutcomeEvent::AgentRegistered { at, .. } => record.touch(*at),
            OutcomeEvent::MarkedForReplacement { .. } | OutcomeEvent::Intervention(_) => {}
        }

        self.rescore(record);
        record.metrics.clone()
    }

    fn strike(&self, record: &mut AgentRecord, source: &str, at: DateTime<Utc>) {
        match record.record_failure(source, at, self.config.strike_window()) {
            StrikeChange::Blocked => warn!(
                "Agent {} reached {} strikes and is blocked from routing",
                record.agent_id, record.strike_count
            ),
            StrikeChange::Added => info!(
                "Strike {} for agent {} ({})",
                record.strike_count, record.agent_id, source
            ),
            StrikeChange::Duplicate | StrikeChange::Unchanged => {}
        }
    }

    fn velocity(&self, record: &AgentRecord) -> f64 {
        (record.completions.len() as f64 / self.config.velocity_target as f64).min(1.0)
    }

    /// Weighted composite on a 0-100 scale
    pub fn composite(&self, record: &AgentRecord) -> f64 {
        let weights = &self.config.weights;
        let total = weights.total();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = weights.completion * record.metrics.completion_rate
            + weights.reliability * record.reliability
            + weights.collaboration * record.metrics.collaboration()
            + weights.velocity * record.metrics.velocity;
        (100.0 * weighted / total).clamp(0.0, 100.0)
    }

    fn rescore(&self, record: &mut AgentRecord) {
        let composite = self.composite(record);
        let tier = PerformanceTier::from_score(composite);
        if tier != record.tier {
            debug!(
                "Agent {} moved from {} to {} ({:.1})",
                record.agent_id,
                record.tier.as_str(),
                tier.as_str(),
                composite
            );
        }
        record.composite = composite;
        record.tier = tier;
    }

    pub fn score(&self, agent_id: &AgentId) -> Result<(f64, PerformanceTier)> {
        self.store
            .with_agent_mut(agent_id, |record| {
                self.rescore(record);
                (record.composite, record.tier)
            })
            .ok_or_else(|| Error::not_found("Agent", agent_id))
    }

    /// Periodic upkeep: decay friction and strikes, expire old completions
    /// and rescore every agent
    pub fn run_cycle(&self) -> CycleReport {
        let now = self.clock.now();
        let mut report = CycleReport::default();

        for agent_id in self.store.agent_ids() {
            let unblocked = self.store.with_agent_mut(&agent_id, |record| {
                let was_blocked = record.is_blocked();
                record.metrics.friction *= self.config.friction_decay;
                record.decay_strikes(now, self.config.strike_window(), self.config.strike_cooldown());
                record.prune_completions(now, self.config.window());
                record.metrics.velocity = self.velocity(record);
                self.rescore(record);
                was_blocked && !record.is_blocked()
            });
            match unblocked {
                Some(true) => {
                    info!("Agent {} cooled down and is routable again", agent_id);
                    report.unblocked.push(agent_id);
                    report.rescored += 1;
                }
                Some(false) => report.rescored += 1,
                None => {}
            }
        }
        report
    }

    /// Routable agents by composite, best first
    pub fn rankings(&self) -> Vec<RankedAgent> {
        let mut ranked: Vec<RankedAgent> = self
            .store
            .agents()
            .into_iter()
            .filter(|a| a.is_routable())
            .map(|a| RankedAgent {
                agent_id: a.agent_id,
                composite: a.composite,
                tier: a.tier,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.composite
                .partial_cmp(&a.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        ranked
    }

    /// Commend the best agent if it clears the MVP threshold
    pub fn select_mvp(&self) -> Option<AgentId> {
        let best = self.rankings().into_iter().next()?;
        if best.composite < self.config.mvp_threshold {
            debug!(
                "No MVP this cycle; best composite {:.1} is below {:.1}",
                best.composite, self.config.mvp_threshold
            );
            return None;
        }
        self.store
            .with_agent_mut(&best.agent_id, |record| record.commendations += 1)?;
        info!("Agent {} selected as MVP ({:.1})", best.agent_id, best.composite);
        Some(best.agent_id)
    }

    /// Agents that need coaching, replacement or are close to being blocked
    pub fn problem_agents(&self) -> Vec<ProblemAgent> {
        self.store
            .agents()
            .into_iter()
            .filter_map(|a| {
                let mut reasons = Vec::new();
                if a.tier.needs_attention() {
                    reasons.push(format!("tier {}", a.tier.as_str()));
                }
                if a.strike_count >= self.config.problem_strike_threshold {
                    reasons.push(format!("{} strikes", a.strike_count));
                }
                if a.marked_for_replacement {
                    reasons.push("marked for replacement".to_string());
                }
                (!reasons.is_empty()).then(|| ProblemAgent {
                    agent_id: a.agent_id,
                    tier: a.tier,
                    strike_count: a.strike_count,
                    reasons,
                })
            })
            .collect()
    }

    pub fn report(&self, agent_id: &AgentId) -> Result<PerformanceReport> {
        let record = self
            .store
            .agent(agent_id)
            .ok_or_else(|| Error::not_found("Agent", agent_id))?;
        Ok(PerformanceReport {
            agent_id: record.agent_id.clone(),
            composite: record.composite,
            tier: record.tier,
            recommendation: record.tier.recommendation().to_string(),
            reliability: record.reliability,
            metrics: record
                .metrics
                .named()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            strike_count: record.strike_count,
            blocked: record.is_blocked(),
            marked_for_replacement: record.marked_for_replacement,
            commendations: record.commendations,
            tasks_completed: record.metrics.tasks_completed,
            tasks_failed: record.metrics.tasks_failed,
            blockers_reported: record.metrics.blockers_reported,
            blockers_resolved: record.metrics.blockers_resolved,
        })
    }
}

impl EventSubscriber for PerformanceScorer {
    fn name(&self) -> &str {
        "performance_scorer"
    }

    fn on_event(&self, event: &OutcomeEvent) {
        self.record_outcome(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use uuid::Uuid;

    fn setup() -> (PerformanceScorer, Arc<SharedStore>, Arc<ManualClock>) {
        let store = Arc::new(SharedStore::new(30));
        let clock = Arc::new(ManualClock::default());
        let config = ScoringConfig {
            strike_cooldown_secs: 3600,
            ..ScoringConfig::default()
        };
        let scorer = PerformanceScorer::new(config, store.clone(), clock.clone());
        for id in ["A1", "A2"] {
            let mut record = AgentRecord::builder()
                .agent_id(id)
                .capability("backend")
                .build(clock.now())
                .unwrap();
            scorer.initialize(&mut record);
            store.insert_agent(record);
        }
        (scorer, store, clock)
    }

    fn failed(agent: &str, task: &str, at: DateTime<Utc>) -> OutcomeEvent {
        OutcomeEvent::TaskFailed {
            agent_id: AgentId::new(agent),
            task_id: task.to_string(),
            at,
        }
    }

    #[test]
    fn test_initial_composite() {
        let (scorer, store, _) = setup();
        let record = store.agent(&AgentId::new("A1")).unwrap();
        // 0.4 * 0.5 + 0.3 * 0.8 + 0.2 * 1.0 + 0.1 * 0.0
        assert!((record.composite - 64.0).abs() < 1e-9);
        assert_eq!(record.tier, PerformanceTier::Adequate);
        assert_eq!(scorer.score(&AgentId::new("A1")).unwrap().1, PerformanceTier::Adequate);
    }

    #[test]
    fn test_completion_raises_score() {
        let (scorer, store, clock) = setup();
        let before = store.agent(&AgentId::new("A1")).unwrap().composite;
        let metrics = scorer
            .record_outcome(&OutcomeEvent::TaskCompleted {
                agent_id: AgentId::new("A1"),
                task_id: "t1".into(),
                at: clock.now(),
            })
            .unwrap();
        assert!((metrics.completion_rate - 0.65).abs() < 1e-9);
        assert!((metrics.velocity - 0.1).abs() < 1e-9);
        assert!(store.agent(&AgentId::new("A1")).unwrap().composite > before);
    }

    #[test]
    fn test_three_failures_block_and_freeze() {
        let (scorer, store, clock) = setup();
        let now = clock.now();
        for task in ["t1", "t2", "t3"] {
            scorer.record_outcome(&failed("A1", task, now));
        }
        let record = store.agent(&AgentId::new("A1")).unwrap();
        assert!(record.is_blocked());
        let frozen_rate = record.metrics.completion_rate;

        scorer.record_outcome(&failed("A1", "t4", now));
        let record = store.agent(&AgentId::new("A1")).unwrap();
        assert_eq!(record.strike_count, 3);
        assert_eq!(record.metrics.completion_rate, frozen_rate);
        assert_eq!(record.metrics.tasks_failed, 4);
        assert_eq!(record.failure_log.len(), 4);

        assert!(scorer
            .rankings()
            .iter()
            .all(|r| r.agent_id != AgentId::new("A1")));
    }

    #[test]
    fn test_cycle_unblocks_after_cooldown() {
        let (scorer, store, clock) = setup();
        let now = clock.now();
        for task in ["t1", "t2", "t3"] {
            scorer.record_outcome(&failed("A1", task, now));
        }

        clock.advance(Duration::minutes(30));
        assert!(scorer.run_cycle().unblocked.is_empty());

        clock.advance(Duration::hours(1));
        let report = scorer.run_cycle();
        assert_eq!(report.unblocked, vec![AgentId::new("A1")]);
        assert_eq!(report.rescored, 2);
        assert_eq!(store.agent(&AgentId::new("A1")).unwrap().strike_count, 2);
    }

    #[test]
    fn test_friction_decays_each_cycle() {
        let (scorer, store, clock) = setup();
        for _ in 0..2 {
            scorer.record_outcome(&OutcomeEvent::FrictionRaised {
                agent_id: AgentId::new("A2"),
                message_id: Uuid::new_v4(),
                at: clock.now(),
            });
        }
        assert_eq!(store.agent(&AgentId::new("A2")).unwrap().metrics.friction, 2.0);
        scorer.run_cycle();
        assert_eq!(store.agent(&AgentId::new("A2")).unwrap().metrics.friction, 1.0);
    }

    #[test]
    fn test_mvp_requires_threshold() {
        let (scorer, store, clock) = setup();
        assert_eq!(scorer.select_mvp(), None);

        for i in 0..10 {
            scorer.record_outcome(&OutcomeEvent::TaskCompleted {
                agent_id: AgentId::new("A2"),
                task_id: format!("t{}", i),
                at: clock.now(),
            });
        }
        assert_eq!(scorer.rankings()[0].agent_id, AgentId::new("A2"));
        assert_eq!(scorer.select_mvp(), Some(AgentId::new("A2")));
        assert_eq!(store.agent(&AgentId::new("A2")).unwrap().commendations, 1);
    }

    #[test]
    fn test_problem_agents_and_report() {
        let (scorer, _, clock) = setup();
        let now = clock.now();
        scorer.record_outcome(&failed("A1", "t1", now));
        scorer.record_outcome(&failed("A1", "t2", now));

        let problems = scorer.problem_agents();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].agent_id, AgentId::new("A1"));
        assert_eq!(problems[0].strike_count, 2);

        let report = scorer.report(&AgentId::new("A1")).unwrap();
        assert_eq!(report.tasks_failed, 2);
        assert!(!report.blocked);
        assert!(report.metrics.contains_key("completion_rate"));
        assert!(scorer.report(&AgentId::new("ghost")).is_err());
    }

    #[test]
    fn test_unknown_agent_is_ignored() {
        let (scorer, _, clock) = setup();
        assert!(scorer.record_outcome(&failed("ghost", "t1", clock.now())).is_none());
    }
}
