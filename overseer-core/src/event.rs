//! Events crossing the engine boundary and flowing between its services
//!
//! [`InboundEvent`] is what adapters push in. [`OutcomeEvent`] is what the
//! router and resolver publish for the scorer and health aggregator.
//! [`EscalationRequest`] goes out to the escalation channel.

use crate::agent::AgentId;
use crate::blocker::BlockerType;
use crate::health::HealthLevel;
use crate::message::{MessagePriority, Payload};
use crate::strategy::ResolutionStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of normalized inbound events.
///
/// Payload keys read per kind:
///
/// | kind | keys |
/// |---|---|
/// | `REGISTRATION` | `capabilities` (array of strings), `project_id` |
/// | `TASK_ASSIGNED` / `TASK_COMPLETED` / `TASK_FAILED` | `task_id` |
/// | `BLOCKER_REPORTED` | `description`, `project_id` |
/// | `REQUEST` | `recipient`, `subject`, `priority`, `ttl_secs` |
/// | `RESPONSE` | `correlation_id`, `recipient` |
/// | `CALL_OUTCOME` | `escalation_id`, `acknowledged` |
/// | `CHANGE_EVENT` | `project_id`, free-form |
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundKind {
    Registration,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    BlockerReported,
    Request,
    Response,
    CallOutcome,
    ChangeEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    pub source: String,
    pub agent_id: AgentId,
    pub kind: InboundKind,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new<S: Into<String>>(source: S, agent_id: AgentId, kind: InboundKind) -> Self {
        Self {
            source: source.into(),
            agent_id,
            kind,
            payload: Payload::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// How quickly a human should look at an escalation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Routine,
    Elevated,
    Urgent,
    Immediate,
}

/// Outbound request handed to the escalation channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationRequest {
    pub escalation_id: Uuid,
    pub reason: String,
    pub priority: MessagePriority,
    pub agent_id: AgentId,
    pub project_id: Option<String>,
    pub urgency: Urgency,
    pub blocker_id: Option<Uuid>,
}

/// Why a project needs attention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InterventionReason {
    LowHealth { score: f64, floor: f64 },
    ChronicBlocker { blocker_id: Uuid, age_secs: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterventionSignal {
    pub project_id: String,
    pub level: HealthLevel,
    pub reason: InterventionReason,
    pub raised_at: DateTime<Utc>,
}

/// Facts published on the engine's event bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutcomeEvent {
    AgentRegistered {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        agent_id: AgentId,
        task_id: String,
        at: DateTime<Utc>,
    },
    TaskFailed {
        agent_id: AgentId,
        task_id: String,
        at: DateTime<Utc>,
    },
    BlockerReported {
        agent_id: AgentId,
        blocker_id: Uuid,
        blocker_type: BlockerType,
        at: DateTime<Utc>,
    },
    BlockerResolved {
        agent_id: AgentId,
        blocker_id: Uuid,
        strategy: Option<ResolutionStrategy>,
        resolution_secs: f64,
        at: DateTime<Utc>,
    },
    AttemptFailed {
        agent_id: AgentId,
        blocker_id: Uuid,
        strategy: ResolutionStrategy,
        at: DateTime<Utc>,
    },
    BlockerChronic {
        agent_id: AgentId,
        blocker_id: Uuid,
        at: DateTime<Utc>,
    },
    ThreatenIssued {
        agent_id: AgentId,
        blocker_id: Uuid,
        at: DateTime<Utc>,
    },
    /// An EMERGENCY or ESCALATION message named the agent
    FrictionRaised {
        agent_id: AgentId,
        message_id: Uuid,
        at: DateTime<Utc>,
    },
    /// A REQUEST expired without a RESPONSE
    RequestTimedOut {
        correlation_id: Uuid,
        agent_id: Option<AgentId>,
        at: DateTime<Utc>,
    },
    MarkedForReplacement {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    Intervention(InterventionSignal),
}

impl OutcomeEvent {
    /// Agent the event is about, if any
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            OutcomeEvent::AgentRegistered { agent_id, .. }
            | OutcomeEvent::TaskCompleted { agent_id, .. }
            | OutcomeEvent::TaskFailed { agent_id, .. }
            | OutcomeEvent::BlockerReported { agent_id, .. }
            | OutcomeEvent::BlockerResolved { agent_id, .. }
            | OutcomeEvent::AttemptFailed { agent_id, .. }
            | OutcomeEvent::BlockerChronic { agent_id, .. }
            | OutcomeEvent::ThreatenIssued { agent_id, .. }
            | OutcomeEvent::FrictionRaised { agent_id, .. }
            | OutcomeEvent::MarkedForReplacement { agent_id, .. } => Some(agent_id),
            OutcomeEvent::RequestTimedOut { agent_id, .. } => agent_id.as_ref(),
            OutcomeEvent::Intervention(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutcomeEvent::AgentRegistered { .. } => "agent_registered",
            OutcomeEvent::TaskCompleted { .. } => "task_completed",
            OutcomeEvent::TaskFailed { .. } => "task_failed",
            OutcomeEvent::BlockerReported { .. } => "blocker_reported",
            OutcomeEvent::BlockerResolved { .. } => "blocker_resolved",
            OutcomeEvent::AttemptFailed { .. } => "attempt_failed",
            OutcomeEvent::BlockerChronic { .. } => "blocker_chronic",
            OutcomeEvent::ThreatenIssued { .. } => "threaten_issued",
            OutcomeEvent::FrictionRaised { .. } => "friction_raised",
            OutcomeEvent::RequestTimedOut { .. } => "request_timed_out",
            OutcomeEvent::MarkedForReplacement { .. } => "marked_for_replacement",
            OutcomeEvent::Intervention(_) => "intervention",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_event_builder() {
        let event = InboundEvent::new("tracker", AgentId::new("A1"), InboundKind::TaskCompleted)
            .with("task_id", "T-1");
        assert_eq!(event.payload_str("task_id"), Some("T-1"));
        assert_eq!(event.payload_str("missing"), None);
    }

    #[test]
    fn test_inbound_event_from_json() {
        let json = r#"{
            "source": "github",
            "agent_id": "A1",
            "kind": "BLOCKER_REPORTED",
            "payload": {"description": "blocked by infra"},
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, InboundKind::BlockerReported);
        assert_eq!(event.agent_id.as_str(), "A1");
    }

    #[test]
    fn test_outcome_event_agent() {
        let event = OutcomeEvent::ThreatenIssued {
            agent_id: AgentId::new("A2"),
            blocker_id: Uuid::new_v4(),
            at: Utc::now(),
        };
        assert_eq!(event.agent_id().map(|a| a.as_str()), Some("A2"));
        assert_eq!(event.name(), "threaten_issued");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "threaten_issued");
    }

    #[test]
    fn test_urgency_order() {
        assert!(Urgency::Immediate > Urgency::Urgent);
        assert!(Urgency::Elevated > Urgency::Routine);
    }
}
