//! Agent domain model and related types
//!
//! An [`AgentRecord`] is created the first time a worker registers and then
//! accumulates the rolling metrics, strikes and tier that the performance
//! scorer maintains for it.
//!
//! # Examples
//!
//! ```rust
//! use overseer_core::agent::*;
//! use chrono::Utc;
//!
//! let agent = AgentRecord::builder()
//!     .agent_id("worker-01")
//!     .capability("backend")
//!     .capability("testing")
//!     .project_id("checkout")
//!     .build(Utc::now())
//!     .unwrap();
//!
//! assert!(agent.is_routable());
//! assert_eq!(agent.tier, PerformanceTier::Adequate);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Strikes at which an agent is blocked from routing
pub const MAX_STRIKES: u8 = 3;

/// Stable identifier of a worker agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Discrete performance tier derived from the composite score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    ReplaceCandidate,
    AtRisk,
    Adequate,
    Solid,
    TopTier,
}

impl PerformanceTier {
    /// Map a 0-100 composite onto the fixed tier breakpoints
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            PerformanceTier::TopTier
        } else if score >= 70.0 {
            PerformanceTier::Solid
        } else if score >= 50.0 {
            PerformanceTier::Adequate
        } else if score >= 30.0 {
            PerformanceTier::AtRisk
        } else {
            PerformanceTier::ReplaceCandidate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceTier::TopTier => "top_tier",
            PerformanceTier::Solid => "solid",
            PerformanceTier::Adequate => "adequate",
            PerformanceTier::AtRisk => "at_risk",
            PerformanceTier::ReplaceCandidate => "replace_candidate",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            PerformanceTier::TopTier => "Keep up the excellent work. Consider for promotion.",
            PerformanceTier::Solid => "Solid performer. Minor improvements could reach the top tier.",
            PerformanceTier::Adequate => "Meeting expectations but room for improvement.",
            PerformanceTier::AtRisk => "Needs immediate coaching and support.",
            PerformanceTier::ReplaceCandidate => {
                "Consider immediate replacement or reassignment."
            }
        }
    }

    pub fn needs_attention(&self) -> bool {
        *self <= PerformanceTier::AtRisk
    }
}

/// Rolling metrics maintained by the performance scorer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetrics {
    /// EMA of task outcomes (1 = completed, 0 = failed)
    pub completion_rate: f64,
    /// Decaying count of escalations raised about the agent
    pub friction: f64,
    /// Completed tasks in the scoring window relative to the target
    pub velocity: f64,
    /// Mean seconds from blocker report to resolution
    pub average_resolution_secs: Option<f64>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub blockers_reported: u64,
    pub blockers_resolved: u64,
}

impl AgentMetrics {
    pub fn new(initial_completion_rate: f64) -> Self {
        Self {
            completion_rate: initial_completion_rate,
            friction: 0.0,
            velocity: 0.0,
            average_resolution_secs: None,
            tasks_completed: 0,
            tasks_failed: 0,
            blockers_reported: 0,
            blockers_resolved: 0,
        }
    }

    /// Friction mapped onto 0..=1 where 1 means no friction
    pub fn collaboration(&self) -> f64 {
        1.0 / (1.0 + self.friction.max(0.0))
    }

    /// Metric name to current value
    pub fn named(&self) -> BTreeMap<&'static str, f64> {
        let mut map = BTreeMap::new();
        map.insert("completion_rate", self.completion_rate);
        map.insert("friction", self.friction);
        map.insert("collaboration", self.collaboration());
        map.insert("velocity", self.velocity);
        if let Some(secs) = self.average_resolution_secs {
            map.insert("average_resolution_secs", secs);
        }
        map
    }

    /// Fold a new resolution time into the running mean
    pub fn record_resolution_time(&mut self, secs: f64) {
        let n = self.blockers_resolved as f64;
        self.average_resolution_secs = Some(match self.average_resolution_secs {
            Some(mean) if n > 0.0 => (mean * n + secs) / (n + 1.0),
            _ => secs,
        });
        self.blockers_resolved += 1;
    }
}

/// Exponential moving average step toward `sample`
pub fn ema(current: f64, sample: f64, alpha: f64) -> f64 {
    (alpha * sample + (1.0 - alpha) * current).clamp(0.0, 1.0)
}

/// A failure event counted toward strikes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    /// Task id, blocker id, or warning id the failure came from
    pub source: String,
    pub at: DateTime<Utc>,
}

/// What a failure event did to the strike count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeChange {
    /// Same source already counted in the window
    Duplicate,
    Added,
    /// The strike that brought the agent to the ceiling
    Blocked,
    /// Agent already blocked; logged only
    Unchanged,
}

/// Tracked worker agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub project_id: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub strike_count: u8,
    pub reliability: f64,
    pub metrics: AgentMetrics,
    pub tier: PerformanceTier,
    pub composite: f64,
    pub commendations: u32,
    pub marked_for_replacement: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub failure_log: VecDeque<FailureRecord>,
    pub completions: VecDeque<DateTime<Utc>>,
}

impl AgentRecord {
    /// Create a new agent record with validation
    pub fn new(
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        project_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Self::validate_id(&agent_id)?;
        Self::validate_capabilities(&capabilities)?;

        Ok(Self {
            agent_id,
            project_id,
            capabilities,
            strike_count: 0,
            reliability: 0.8,
            metrics: AgentMetrics::new(0.5),
            tier: PerformanceTier::Adequate,
            composite: 50.0,
            commendations: 0,
            marked_for_replacement: false,
            registered_at: now,
            last_seen: now,
            blocked_at: None,
            failure_log: VecDeque::new(),
            completions: VecDeque::new(),
        })
    }

    /// Create a builder for constructing an AgentRecord
    pub fn builder() -> AgentRecordBuilder {
        AgentRecordBuilder::new()
    }

    fn validate_id(agent_id: &AgentId) -> Result<()> {
        let id = agent_id.as_str();
        if id.trim().is_empty() {
            return Err(Error::validation("Agent id cannot be empty"));
        }
        if id.len() > 100 {
            return Err(Error::validation("Agent id cannot exceed 100 characters"));
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::validation(
                "Agent id can only contain alphanumeric characters, dots, hyphens, and underscores",
            ));
        }
        Ok(())
    }

    fn validate_capabilities(capabilities: &BTreeSet<String>) -> Result<()> {
        for capability in capabilities {
            if capability.trim().is_empty() {
                return Err(Error::validation("Capability cannot be empty"));
            }
            if capability.len() > 50 {
                return Err(Error::validation(
                    "Capability name cannot exceed 50 characters",
                ));
            }
        }
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.strike_count >= MAX_STRIKES
    }

    /// Whether messages may currently be delivered to this agent
    pub fn is_routable(&self) -> bool {
        !self.is_blocked()
    }

    /// Whether work may be handed to this agent by the resolver
    pub fn can_take_work(&self) -> bool {
        self.is_routable() && !self.marked_for_replacement
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether this agent can take over `other`'s work. Work from an agent
    /// without declared capabilities can go to anyone.
    pub fn covers(&self, other: &AgentRecord) -> bool {
        other.capabilities.is_empty()
            || other.capabilities.iter().any(|c| self.has_capability(c))
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Merge capabilities from a repeated registration
    pub fn merge_capabilities<I: IntoIterator<Item = String>>(&mut self, capabilities: I) {
        self.capabilities
            .extend(capabilities.into_iter().filter(|c| !c.trim().is_empty()));
    }

    /// Count a failure event toward strikes.
    ///
    /// Failures older than `window` fall out of the log while the agent is
    /// not blocked; the strike count is the number of failures left in the
    /// window, capped at [`MAX_STRIKES`].
    pub fn record_failure(
        &mut self,
        source: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StrikeChange {
        if self.failure_log.iter().any(|f| f.source == source) {
            return StrikeChange::Duplicate;
        }
        self.failure_log.push_back(FailureRecord {
            source: source.to_string(),
            at,
        });
        if self.is_blocked() {
            return StrikeChange::Unchanged;
        }

        self.prune_failures(at, window);
        let strikes = self.failure_log.len().min(MAX_STRIKES as usize) as u8;
        self.strike_count = strikes;
        if self.is_blocked() {
            self.blocked_at = Some(at);
            StrikeChange::Blocked
        } else {
            StrikeChange::Added
        }
    }

    fn prune_failures(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(front) = self.failure_log.front() {
            if now.signed_duration_since(front.at) > window {
                self.failure_log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Apply strike decay for one scoring cycle.
    ///
    /// A blocked agent whose cool-down has elapsed loses exactly one strike
    /// and becomes routable again. Otherwise failures that left the rolling
    /// window stop counting. Returns true when the strike count changed.
    pub fn decay_strikes(&mut self, now: DateTime<Utc>, window: Duration, cooldown: Duration) -> bool {
        let before = self.strike_count;
        if self.is_blocked() {
            let elapsed = self
                .blocked_at
                .map(|at| now.signed_duration_since(at) >= cooldown)
                .unwrap_or(true);
            if elapsed {
                self.failure_log.pop_front();
                while self.failure_log.len() > (MAX_STRIKES - 1) as usize {
                    self.failure_log.pop_front();
                }
                self.strike_count = MAX_STRIKES - 1;
                self.blocked_at = None;
            }
        } else {
            self.prune_failures(now, window);
            self.strike_count = self.failure_log.len().min(MAX_STRIKES as usize) as u8;
        }
        before != self.strike_count
    }

    /// Record a completed task for velocity and drop ones outside `window`
    pub fn record_completion(&mut self, at: DateTime<Utc>, window: Duration) {
        self.completions.push_back(at);
        self.prune_completions(at, window);
    }

    pub fn prune_completions(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(front) = self.completions.front() {
            if now.signed_duration_since(*front) > window {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Builder for constructing AgentRecord instances with validation
#[derive(Debug, Clone, Default)]
pub struct AgentRecordBuilder {
    agent_id: Option<AgentId>,
    capabilities: BTreeSet<String>,
    project_id: Option<String>,
}

impl AgentRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_id<S: Into<String>>(mut self, id: S) -> Self {
        self.agent_id = Some(AgentId::new(id));
        self
    }

    /// Add a capability
    pub fn capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Add multiple capabilities
    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(|c| c.into()));
        self
    }

    pub fn project_id<S: Into<String>>(mut self, project: S) -> Self {
        self.project_id = Some(project.into());
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> Result<AgentRecord> {
        let agent_id = self
            .agent_id
            .ok_or_else(|| Error::validation("Agent id is required"))?;
        AgentRecord::new(agent_id, self.capabilities, self.project_id, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn agent(id: &str) -> AgentRecord {
        AgentRecord::builder()
            .agent_id(id)
            .capability("backend")
            .build(Utc::now())
            .unwrap()
    }

    #[rstest]
    #[case(95.0, PerformanceTier::TopTier)]
    #[case(90.0, PerformanceTier::TopTier)]
    #[case(89.9, PerformanceTier::Solid)]
    #[case(70.0, PerformanceTier::Solid)]
    #[case(50.0, PerformanceTier::Adequate)]
    #[case(30.0, PerformanceTier::AtRisk)]
    #[case(29.9, PerformanceTier::ReplaceCandidate)]
    #[case(0.0, PerformanceTier::ReplaceCandidate)]
    fn test_tier_breakpoints(#[case] score: f64, #[case] expected: PerformanceTier) {
        assert_eq!(PerformanceTier::from_score(score), expected);
    }

    #[test]
    fn test_agent_validation() {
        assert!(AgentRecord::builder().build(Utc::now()).is_err());
        assert!(AgentRecord::builder()
            .agent_id("bad id!")
            .build(Utc::now())
            .is_err());
        assert!(AgentRecord::builder()
            .agent_id("A1")
            .capability("  ")
            .build(Utc::now())
            .is_err());
    }

    #[test]
    fn test_three_failures_block_agent() {
        let mut record = agent("A1");
        let now = Utc::now();
        let window = Duration::hours(24);

        assert_eq!(record.record_failure("task-1", now, window), StrikeChange::Added);
        assert_eq!(
            record.record_failure("task-1", now, window),
            StrikeChange::Duplicate
        );
        assert_eq!(record.record_failure("task-2", now, window), StrikeChange::Added);
        assert_eq!(record.strike_count, 2);
        assert!(record.is_routable());

        assert_eq!(record.record_failure("task-3", now, window), StrikeChange::Blocked);
        assert_eq!(record.strike_count, MAX_STRIKES);
        assert!(!record.is_routable());

        assert_eq!(
            record.record_failure("task-4", now, window),
            StrikeChange::Unchanged
        );
        assert_eq!(record.strike_count, MAX_STRIKES);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let mut record = agent("A1");
        let start = Utc::now();
        let window = Duration::hours(1);

        record.record_failure("task-1", start, window);
        record.record_failure("task-2", start + Duration::minutes(30), window);
        let change = record.record_failure("task-3", start + Duration::hours(2), window);

        assert_eq!(change, StrikeChange::Added);
        assert_eq!(record.strike_count, 1);
    }

    #[test]
    fn test_cooldown_decays_one_strike() {
        let mut record = agent("A1");
        let now = Utc::now();
        let window = Duration::hours(24);
        let cooldown = Duration::hours(1);
        for source in ["t1", "t2", "t3"] {
            record.record_failure(source, now, window);
        }
        assert!(record.is_blocked());

        assert!(!record.decay_strikes(now + Duration::minutes(30), window, cooldown));
        assert!(record.is_blocked());

        assert!(record.decay_strikes(now + Duration::hours(2), window, cooldown));
        assert_eq!(record.strike_count, 2);
        assert!(record.is_routable());
        assert!(record.blocked_at.is_none());
    }

    #[test]
    fn test_ema_moves_toward_sample() {
        let value = ema(0.5, 1.0, 0.3);
        assert!((value - 0.65).abs() < 1e-9);
        let value = ema(0.5, 0.0, 0.3);
        assert!((value - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_named_and_resolution_mean() {
        let mut metrics = AgentMetrics::new(0.5);
        metrics.record_resolution_time(10.0);
        metrics.record_resolution_time(20.0);
        assert_eq!(metrics.average_resolution_secs, Some(15.0));
        let named = metrics.named();
        assert_eq!(named["collaboration"], 1.0);
        assert!(named.contains_key("average_resolution_secs"));
    }

    #[test]
    fn test_capability_cover() {
        let a = agent("A1");
        let mut b = agent("A2");
        assert!(b.covers(&a));
        b.capabilities = BTreeSet::from(["frontend".to_string()]);
        assert!(!b.has_capability("backend"));
        assert!(!b.covers(&a));

        let mut generalist = agent("A3");
        generalist.capabilities.clear();
        assert!(b.covers(&generalist));
    }
}
