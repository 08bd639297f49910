//! Project health aggregation
//!
//! A snapshot blends four signals into a 0-100 composite: the mean agent
//! composite, blocker density, the project's escalation rate and agent
//! velocity. Snapshots are kept per project so trends can be read off the
//! history, and a snapshot that falls below the intervention floor raises
//! an intervention signal on the event bus.

use crate::clock::Clock;
use crate::events::EventBus;
use crate::router::Router;
use crate::store::SharedStore;
use crate::{Error, Result};
use overseer_core::blocker::BlockerStatus;
use overseer_core::config::HealthConfig;
use overseer_core::event::{InterventionReason, InterventionSignal, OutcomeEvent, Urgency};
use overseer_core::health::{
    HealthFactors, HealthHistory, HealthLevel, HealthTrend, ProjectHealthSnapshot,
};
use overseer_core::message::MessagePriority;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct HealthAggregator {
    config: HealthConfig,
    store: Arc<SharedStore>,
    router: Arc<Router>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl HealthAggregator {
    pub fn new(
        config: HealthConfig,
        store: Arc<SharedStore>,
        router: Arc<Router>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            router,
            bus,
            clock,
        }
    }

    /// Compute, record and return a fresh snapshot for `project_id`
    pub fn snapshot(&self, project_id: &str) -> Result<ProjectHealthSnapshot> {
        if !self.store.projects().contains(project_id) {
            return Err(Error::not_found("Project", project_id));
        }
        let now = self.clock.now();

        let active: Vec<_> = self
            .store
            .project_agents(project_id)
            .into_iter()
            .filter(|a| a.is_routable())
            .collect();
        let (agent_health, velocity) = if active.is_empty() {
            (0.0, 0.0)
        } else {
            let n = active.len() as f64;
            (
                active.iter().map(|a| a.composite).sum::<f64>() / n,
                active.iter().map(|a| a.metrics.velocity).sum::<f64>() / n,
            )
        };

        let blockers = self.store.project_blockers(project_id);
        let open = blockers
            .iter()
            .filter(|b| matches!(b.status, BlockerStatus::Open | BlockerStatus::Chronic))
            .count();

        let factors = HealthFactors::from_signals(
            agent_health,
            open,
            active.len(),
            self.router.escalation_rate(project_id),
            velocity,
        );
        let snapshot =
            ProjectHealthSnapshot::new(project_id.to_string(), now, factors, &self.config.weights);
        debug!(
            project = project_id,
            score = snapshot.composite_score,
            "Health snapshot: {}",
            snapshot.level.as_str()
        );
        self.store.push_health(snapshot.clone());

        if snapshot.composite_score < self.config.intervention_floor {
            warn!(
                "Project {} health {:.1} is below the floor of {:.1}",
                project_id, snapshot.composite_score, self.config.intervention_floor
            );
            self.intervene(
                &snapshot,
                InterventionReason::LowHealth {
                    score: snapshot.composite_score,
                    floor: self.config.intervention_floor,
                },
            );
        }

        let chronic_age = self.config.chronic_age();
        for blocker in blockers.iter().filter(|b| b.is_chronic()) {
            let age = blocker.age(now);
            if age > chronic_age {
                info!(
                    "Chronic blocker {} in project {} is {}h old",
                    blocker.blocker_id,
                    project_id,
                    age.num_hours()
                );
                self.intervene(
                    &snapshot,
                    InterventionReason::ChronicBlocker {
                        blocker_id: blocker.blocker_id,
                        age_secs: age.num_seconds(),
                    },
                );
            }
        }

        Ok(snapshot)
    }

    /// Snapshot every known project; projects that fail are skipped
    pub fn snapshot_all(&self) -> Vec<ProjectHealthSnapshot> {
        self.store
            .projects()
            .into_iter()
            .filter_map(|project| match self.snapshot(&project) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Health snapshot for {} failed: {}", project, e);
                    None
                }
            })
            .collect()
    }

    fn intervene(&self, snapshot: &ProjectHealthSnapshot, reason: InterventionReason) {
        self.bus
            .publish(OutcomeEvent::Intervention(InterventionSignal {
                project_id: snapshot.project_id.clone(),
                level: snapshot.level,
                reason,
                raised_at: snapshot.timestamp,
            }));
    }

    pub fn history(&self, project_id: &str) -> Option<HealthHistory> {
        self.store.health_history(project_id)
    }

    pub fn latest(&self, project_id: &str) -> Option<ProjectHealthSnapshot> {
        self.store.latest_health(project_id)
    }

    pub fn trend(&self, project_id: &str) -> HealthTrend {
        self.store
            .health_history(project_id)
            .map(|h| h.trend())
            .unwrap_or(HealthTrend::InsufficientData)
    }

    pub fn needs_intervention(&self, project_id: &str) -> bool {
        self.store
            .health_history(project_id)
            .map(|h| h.needs_intervention())
            .unwrap_or(false)
    }

    fn latest_level(&self, project_id: &str) -> Option<HealthLevel> {
        self.store.latest_health(project_id).map(|s| s.level)
    }

    /// Priority an escalation from this project should carry right now
    pub fn escalation_priority(&self, project_id: &str) -> MessagePriority {
        self.latest_level(project_id)
            .map(|l| l.escalation_priority())
            .unwrap_or(MessagePriority::Normal)
    }

    pub fn urgency(&self, project_id: &str) -> Urgency {
        self.latest_level(project_id)
            .map(|l| l.urgency())
            .unwrap_or(Urgency::Routine)
    }

    pub fn projects(&self) -> Vec<String> {
        self.store.projects().into_iter().collect()
    }
}
