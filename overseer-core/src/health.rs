//! Project health snapshots and history

use crate::event::Urgency;
use crate::message::MessagePriority;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Points the newer half of the history must move before a trend counts
const TREND_BAND: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    Critical,
    Unhealthy,
    AtRisk,
    Fair,
    Healthy,
    Excellent,
}

impl HealthLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 20.0 {
            HealthLevel::Critical
        } else if score < 40.0 {
            HealthLevel::Unhealthy
        } else if score < 55.0 {
            HealthLevel::AtRisk
        } else if score < 70.0 {
            HealthLevel::Fair
        } else if score < 85.0 {
            HealthLevel::Healthy
        } else {
            HealthLevel::Excellent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Critical => "critical",
            HealthLevel::Unhealthy => "unhealthy",
            HealthLevel::AtRisk => "at_risk",
            HealthLevel::Fair => "fair",
            HealthLevel::Healthy => "healthy",
            HealthLevel::Excellent => "excellent",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            HealthLevel::Critical => {
                "Immediate intervention required. Consider stopping new development."
            }
            HealthLevel::Unhealthy => "Major issues detected. Schedule an emergency team meeting.",
            HealthLevel::AtRisk => "Project showing warning signs. Increase monitoring.",
            HealthLevel::Fair => "Some concerns present. Review and address bottlenecks.",
            HealthLevel::Healthy => "Project on track. Maintain current practices.",
            HealthLevel::Excellent => {
                "Exceeding expectations. Consider documenting best practices."
            }
        }
    }

    /// Priority for escalations raised while the project is at this level
    pub fn escalation_priority(&self) -> MessagePriority {
        match self {
            HealthLevel::Critical => MessagePriority::Emergency,
            HealthLevel::Unhealthy => MessagePriority::Critical,
            HealthLevel::AtRisk => MessagePriority::High,
            HealthLevel::Fair | HealthLevel::Healthy | HealthLevel::Excellent => {
                MessagePriority::Normal
            }
        }
    }

    pub fn urgency(&self) -> Urgency {
        match self {
            HealthLevel::Critical => Urgency::Immediate,
            HealthLevel::Unhealthy => Urgency::Urgent,
            HealthLevel::AtRisk => Urgency::Elevated,
            HealthLevel::Fair | HealthLevel::Healthy | HealthLevel::Excellent => Urgency::Routine,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthTrend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

/// Blend weights of the health composite
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthWeights {
    pub agent_health: f64,
    pub blocker_density: f64,
    pub escalation_rate: f64,
    pub velocity: f64,
}

impl HealthWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [
            self.agent_health,
            self.blocker_density,
            self.escalation_rate,
            self.velocity,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::configuration("Health weights must be non-negative"));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(Error::configuration("Health weights cannot all be zero"));
        }
        Ok(())
    }
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            agent_health: 0.4,
            blocker_density: 0.25,
            escalation_rate: 0.2,
            velocity: 0.15,
        }
    }
}

/// Inputs to the project composite, each on a 0-100 scale
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HealthFactors {
    /// Mean composite of the project's scored agents
    pub agent_health: f64,
    /// `100 / (1 + open / active)`
    pub blocker_density: f64,
    /// `100 * (1 - escalation rate)`
    pub escalation_rate: f64,
    pub velocity: f64,
    pub open_blockers: usize,
    pub active_agents: usize,
}

impl HealthFactors {
    /// Build the factors from raw project signals
    pub fn from_signals(
        agent_health: f64,
        open_blockers: usize,
        active_agents: usize,
        escalation_rate: f64,
        velocity: f64,
    ) -> Self {
        let density = if active_agents == 0 {
            if open_blockers == 0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            open_blockers as f64 / active_agents as f64
        };
        Self {
            agent_health: agent_health.clamp(0.0, 100.0),
            blocker_density: 100.0 / (1.0 + density),
            escalation_rate: 100.0 * (1.0 - escalation_rate.clamp(0.0, 1.0)),
            velocity: (velocity * 100.0).clamp(0.0, 100.0),
            open_blockers,
            active_agents,
        }
    }

    /// Weighted blend clamped to 0-100
    pub fn composite(&self, weights: &HealthWeights) -> f64 {
        let total = weights.agent_health
            + weights.blocker_density
            + weights.escalation_rate
            + weights.velocity;
        if total <= 0.0 {
            return 0.0;
        }
        let blended = self.agent_health * weights.agent_health
            + self.blocker_density * weights.blocker_density
            + self.escalation_rate * weights.escalation_rate
            + self.velocity * weights.velocity;
        (blended / total).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectHealthSnapshot {
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub composite_score: f64,
    pub contributing_factors: HealthFactors,
    pub level: HealthLevel,
}

impl ProjectHealthSnapshot {
    pub fn new(
        project_id: String,
        timestamp: DateTime<Utc>,
        factors: HealthFactors,
        weights: &HealthWeights,
    ) -> Self {
        let composite_score = factors.composite(weights);
        Self {
            project_id,
            timestamp,
            composite_score,
            contributing_factors: factors,
            level: HealthLevel::from_score(composite_score),
        }
    }
}

/// Bounded per-project snapshot history, oldest first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthHistory {
    capacity: usize,
    snapshots: VecDeque<ProjectHealthSnapshot>,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: VecDeque::new(),
        }
    }

    pub fn push(&mut self, snapshot: ProjectHealthSnapshot) {
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&ProjectHealthSnapshot> {
        self.snapshots.back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectHealthSnapshot> {
        self.snapshots.iter()
    }

    /// Compare the mean of the newer half against the older half
    pub fn trend(&self) -> HealthTrend {
        if self.snapshots.len() < 2 {
            return HealthTrend::InsufficientData;
        }
        let split = self.snapshots.len() / 2;
        let older = mean_score(self.snapshots.iter().take(split));
        let newer = mean_score(self.snapshots.iter().skip(split));

        if newer > older + TREND_BAND {
            HealthTrend::Improving
        } else if newer < older - TREND_BAND {
            HealthTrend::Declining
        } else {
            HealthTrend::Stable
        }
    }

    /// Latest level is unhealthy or worse, or health is declining
    pub fn needs_intervention(&self) -> bool {
        let poor = self
            .latest()
            .map(|s| s.level <= HealthLevel::Unhealthy)
            .unwrap_or(false);
        poor || self.trend() == HealthTrend::Declining
    }
}

fn mean_score<'a, I>(snapshots: I) -> f64
where
    I: Iterator<Item = &'a ProjectHealthSnapshot>,
{
    let (sum, n) = snapshots.fold((0.0, 0usize), |(sum, n), s| (sum + s.composite_score, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
