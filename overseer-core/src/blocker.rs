//! Blocker domain model
//!
//! A blocker is something an agent reported as stopping its work. It carries
//! the classifier's verdict, every resolution attempt made against it, and
//! its status.
//!
//! ```text
//!         success            success via ESCALATE
//!   OPEN ─────────► RESOLVED   OPEN ─────────► ESCALATED
//!    │
//!    │ N failures / strategies exhausted
//!    ▼
//!  CHRONIC ──(manual)──► RESOLVED
//! ```

use crate::agent::AgentId;
use crate::strategy::ResolutionStrategy;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const MAX_DESCRIPTION_LEN: usize = 4000;

/// Category assigned by the classifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerType {
    Dependency,
    Resource,
    Communication,
    Technical,
    Process,
    Human,
    Existential,
    Unknown,
}

impl BlockerType {
    pub const ALL: [BlockerType; 8] = [
        BlockerType::Dependency,
        BlockerType::Resource,
        BlockerType::Communication,
        BlockerType::Technical,
        BlockerType::Process,
        BlockerType::Human,
        BlockerType::Existential,
        BlockerType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockerType::Dependency => "dependency",
            BlockerType::Resource => "resource",
            BlockerType::Communication => "communication",
            BlockerType::Technical => "technical",
            BlockerType::Process => "process",
            BlockerType::Human => "human",
            BlockerType::Existential => "existential",
            BlockerType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BlockerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerStatus {
    Open,
    Resolved,
    Escalated,
    Chronic,
}

impl BlockerStatus {
    pub fn can_transition_to(&self, next: BlockerStatus) -> bool {
        use BlockerStatus::*;
        matches!(
            (self, next),
            (Open, Resolved) | (Open, Escalated) | (Open, Chronic) | (Chronic, Resolved)
                | (Escalated, Resolved)
        )
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// The collaborator did not answer within the attempt timeout
    TimedOut,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// One strategy applied to a blocker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionAttempt {
    pub strategy: ResolutionStrategy,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Attempt abandoned because the blocker was resolved elsewhere
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelledAttempt {
    pub strategy: ResolutionStrategy,
    pub started_at: DateTime<Utc>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blocker {
    pub blocker_id: Uuid,
    pub agent_id: AgentId,
    pub project_id: Option<String>,
    pub raw_description: String,
    pub classified_type: BlockerType,
    pub confidence: f64,
    pub opened_at: DateTime<Utc>,
    pub attempts: Vec<ResolutionAttempt>,
    pub status: BlockerStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub cancelled_attempts: Vec<CancelledAttempt>,
    /// ESCALATION message sent when the blocker went chronic
    pub escalation_message_id: Option<Uuid>,
}

impl Blocker {
    /// Open a new, unclassified blocker
    pub fn new(
        agent_id: AgentId,
        project_id: Option<String>,
        raw_description: String,
        opened_at: DateTime<Utc>,
    ) -> Result<Self> {
        if raw_description.trim().is_empty() {
            return Err(Error::validation("Blocker description cannot be empty"));
        }
        if raw_description.len() > MAX_DESCRIPTION_LEN {
            return Err(Error::validation(format!(
                "Blocker description cannot exceed {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }

        Ok(Self {
            blocker_id: Uuid::new_v4(),
            agent_id,
            project_id,
            raw_description,
            classified_type: BlockerType::Unknown,
            confidence: 0.0,
            opened_at,
            attempts: Vec::new(),
            status: BlockerStatus::Open,
            resolved_at: None,
            resolution_notes: None,
            cancelled_attempts: Vec::new(),
            escalation_message_id: None,
        })
    }

    pub fn classify(&mut self, blocker_type: BlockerType, confidence: f64) {
        self.classified_type = blocker_type;
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    pub fn is_open(&self) -> bool {
        self.status == BlockerStatus::Open
    }

    pub fn is_chronic(&self) -> bool {
        self.status == BlockerStatus::Chronic
    }

    pub fn has_tried(&self, strategy: ResolutionStrategy) -> bool {
        self.attempts.iter().any(|a| a.strategy == strategy)
    }

    /// Attempts that failed or timed out
    pub fn failed_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| !a.outcome.is_success())
            .count()
    }

    /// Every allowed strategy has been tried
    pub fn strategies_exhausted(&self) -> bool {
        ResolutionStrategy::allowed_for(self.classified_type)
            .iter()
            .all(|s| self.has_tried(*s))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.opened_at)
    }

    /// Time from open to resolution, if resolved
    pub fn resolution_time(&self) -> Option<Duration> {
        self.resolved_at
            .map(|at| at.signed_duration_since(self.opened_at))
    }

    /// Append a finished attempt. Only open blockers take attempts.
    pub fn record_attempt(&mut self, attempt: ResolutionAttempt) -> Result<()> {
        if !self.is_open() {
            return Err(Error::state_transition(format!(
                "Cannot record attempt on blocker {} in status {:?}",
                self.blocker_id, self.status
            )));
        }
        self.attempts.push(attempt);
        Ok(())
    }

    pub fn record_cancelled(&mut self, cancelled: CancelledAttempt) {
        self.cancelled_attempts.push(cancelled);
    }

    fn transition(&mut self, next: BlockerStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Invalid blocker transition from {:?} to {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Resolve after a successful strategy
    pub fn settle(&mut self, via: ResolutionStrategy, at: DateTime<Utc>) -> Result<()> {
        let next = if via == ResolutionStrategy::Escalate {
            BlockerStatus::Escalated
        } else {
            BlockerStatus::Resolved
        };
        self.transition(next)?;
        self.resolved_at = Some(at);
        Ok(())
    }

    pub fn mark_chronic(&mut self) -> Result<()> {
        self.transition(BlockerStatus::Chronic)
    }

    /// Manual resolution with optional notes
    pub fn mark_resolved(&mut self, notes: Option<String>, at: DateTime<Utc>) -> Result<()> {
        self.transition(BlockerStatus::Resolved)?;
        self.resolved_at = Some(at);
        self.resolution_notes = notes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocker() -> Blocker {
        Blocker::new(
            AgentId::new("A1"),
            Some("proj".to_string()),
            "waiting for review".to_string(),
            Utc::now(),
        )
        .unwrap()
    }

    fn attempt(strategy: ResolutionStrategy, outcome: AttemptOutcome) -> ResolutionAttempt {
        ResolutionAttempt {
            strategy,
            attempted_at: Utc::now(),
            outcome,
        }
    }

    #[test]
    fn test_new_blocker_is_open_and_unknown() {
        let blocker = blocker();
        assert!(blocker.is_open());
        assert_eq!(blocker.classified_type, BlockerType::Unknown);
        assert!(Blocker::new(AgentId::new("A1"), None, "  ".into(), Utc::now()).is_err());
    }

    #[test]
    fn test_attempt_tracking() {
        let mut blocker = blocker();
        blocker.classify(BlockerType::Resource, 0.9);
        blocker
            .record_attempt(attempt(ResolutionStrategy::Automate, AttemptOutcome::TimedOut))
            .unwrap();
        assert_eq!(blocker.failed_attempts(), 1);
        assert!(!blocker.strategies_exhausted());

        blocker
            .record_attempt(attempt(ResolutionStrategy::Escalate, AttemptOutcome::Failure))
            .unwrap();
        assert!(blocker.strategies_exhausted());
    }

    #[test]
    fn test_escalate_success_settles_as_escalated() {
        let mut blocker = blocker();
        blocker.settle(ResolutionStrategy::Escalate, Utc::now()).unwrap();
        assert_eq!(blocker.status, BlockerStatus::Escalated);
        assert!(blocker.resolved_at.is_some());

        let mut other = self::blocker();
        other.settle(ResolutionStrategy::Delegate, Utc::now()).unwrap();
        assert_eq!(other.status, BlockerStatus::Resolved);
    }

    #[test]
    fn test_chronic_only_from_open() {
        let mut blocker = blocker();
        blocker.mark_chronic().unwrap();
        assert!(blocker.mark_chronic().is_err());
        assert!(blocker
            .record_attempt(attempt(ResolutionStrategy::Delegate, AttemptOutcome::Success))
            .is_err());

        blocker
            .mark_resolved(Some("fixed by hand".into()), Utc::now())
            .unwrap();
        assert_eq!(blocker.status, BlockerStatus::Resolved);
        assert!(blocker.mark_chronic().is_err());
    }
}
