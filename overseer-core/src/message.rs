//! Message domain model and related types
//!
//! Messages are the unit of agent-to-agent (A2A) communication. Each message
//! carries its addressing, a priority, an optional correlation to an earlier
//! request, a time-to-live, and the number of times it has been re-routed.
//!
//! # Examples
//!
//! Creating a request to a worker:
//!
//! ```rust
//! use overseer_core::message::*;
//! use std::time::Duration;
//!
//! let message = Message::builder()
//!     .sender(Address::Orchestrator)
//!     .recipient(Address::agent("worker-01"))
//!     .kind(MessageKind::Request)
//!     .subject("Status check")
//!     .priority(MessagePriority::High)
//!     .ttl(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//!
//! assert!(!message.is_broadcast());
//! ```
//!
//! Creating a broadcast:
//!
//! ```rust
//! use overseer_core::message::*;
//!
//! let message = Message::broadcast_builder()
//!     .sender(Address::Orchestrator)
//!     .subject("Standup in five minutes")
//!     .priority(MessagePriority::Emergency)
//!     .build()
//!     .unwrap();
//!
//! assert!(message.is_broadcast());
//! ```

use crate::agent::AgentId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default time-to-live for messages that do not set one
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

const MAX_SUBJECT_LEN: usize = 200;

/// Opaque key/value payload carried by a message
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Where a message comes from or goes to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    Agent(AgentId),
    Broadcast,
    Orchestrator,
}

impl Address {
    pub fn agent<S: Into<String>>(id: S) -> Self {
        Address::Agent(AgentId::new(id))
    }

    /// The agent behind this address, if any
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Address::Agent(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Agent(id) => write!(f, "{}", id),
            Address::Broadcast => write!(f, "broadcast"),
            Address::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

/// Kind of message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Request,
    Response,
    Broadcast,
    Escalation,
    BlockerReport,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Escalation => "escalation",
            MessageKind::BlockerReport => "blocker_report",
        }
    }
}

/// Priority of a message, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Emergency,
}

impl MessagePriority {
    /// CRITICAL and EMERGENCY skip the normal queuing delay
    pub fn bypasses_queue(&self) -> bool {
        *self >= MessagePriority::Critical
    }
}

/// A routed A2A message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub sender: Address,
    pub recipient: Address,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub subject: String,
    pub correlation_id: Option<Uuid>,
    pub thread_id: Uuid,
    /// Set on fan-out copies: the BROADCAST they were cut from
    pub broadcast_origin: Option<Uuid>,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub hop_count: u32,
}

impl Message {
    /// Create a builder for constructing a Message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Create a builder for constructing a broadcast Message
    pub fn broadcast_builder() -> MessageBuilder {
        MessageBuilder::new()
            .recipient(Address::Broadcast)
            .kind(MessageKind::Broadcast)
    }

    /// Check structural invariants that do not depend on router state
    pub fn validate(&self) -> Result<()> {
        if self.sender == Address::Broadcast {
            return Err(Error::validation("Broadcast sentinel cannot send messages"));
        }
        if let Address::Agent(id) = &self.sender {
            if id.as_str().trim().is_empty() {
                return Err(Error::validation("Sender agent id cannot be empty"));
            }
        }
        if let Address::Agent(id) = &self.recipient {
            if id.as_str().trim().is_empty() {
                return Err(Error::validation("Recipient agent id cannot be empty"));
            }
        }
        // Fan-out copies keep the BROADCAST kind but name a single agent
        let broadcast_kind = self.kind == MessageKind::Broadcast;
        let broadcast_recipient =
            self.recipient == Address::Broadcast || self.broadcast_origin.is_some();
        if broadcast_kind != broadcast_recipient {
            return Err(Error::validation(
                "BROADCAST messages must be addressed to the broadcast sentinel and vice versa",
            ));
        }
        if self.kind == MessageKind::Response && self.correlation_id.is_none() {
            return Err(Error::validation("RESPONSE requires a correlation id"));
        }
        if self.ttl.is_zero() {
            return Err(Error::validation("Message ttl must be positive"));
        }
        if self.subject.len() > MAX_SUBJECT_LEN {
            return Err(Error::validation(format!(
                "Message subject cannot exceed {} characters",
                MAX_SUBJECT_LEN
            )));
        }
        Ok(())
    }

    /// Deadline after which the message is no longer deliverable
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check whether the message has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Check if the message is a broadcast
    pub fn is_broadcast(&self) -> bool {
        self.recipient == Address::Broadcast
    }

    pub fn is_urgent(&self) -> bool {
        self.priority.bypasses_queue()
    }

    /// Independent deliverable copy of a broadcast for one agent
    pub fn fan_out_copy(&self, agent: &AgentId) -> Message {
        Message {
            id: Uuid::new_v4(),
            recipient: Address::Agent(agent.clone()),
            broadcast_origin: Some(self.id),
            ..self.clone()
        }
    }

    /// The same message re-routed to a new recipient, one hop further along
    pub fn forwarded_to(&self, recipient: Address) -> Message {
        Message {
            recipient,
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Start a RESPONSE correlated with this message
    pub fn reply(&self) -> MessageBuilder {
        MessageBuilder::new()
            .sender(self.recipient.clone())
            .recipient(self.sender.clone())
            .kind(MessageKind::Response)
            .subject(format!("Re: {}", self.subject))
            .priority(self.priority)
            .correlation_id(self.id)
            .thread_id(self.thread_id)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Builder for constructing Message instances with validation
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    sender: Option<Address>,
    recipient: Option<Address>,
    kind: Option<MessageKind>,
    priority: MessagePriority,
    subject: String,
    correlation_id: Option<Uuid>,
    thread_id: Option<Uuid>,
    payload: Payload,
    created_at: Option<DateTime<Utc>>,
    ttl: Duration,
    hop_count: u32,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new() -> Self {
        Self {
            sender: None,
            recipient: None,
            kind: None,
            priority: MessagePriority::Normal,
            subject: String::new(),
            correlation_id: None,
            thread_id: None,
            payload: Payload::new(),
            created_at: None,
            ttl: DEFAULT_TTL,
            hop_count: 0,
        }
    }

    pub fn sender(mut self, sender: Address) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn recipient(mut self, recipient: Address) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the message priority
    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set correlation ID
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn thread_id(mut self, id: Uuid) -> Self {
        self.thread_id = Some(id);
        self
    }

    /// Add a payload entry
    pub fn payload_entry<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload.extend(payload);
        self
    }

    /// Override the creation timestamp (ingested events keep their own time)
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn hop_count(mut self, hops: u32) -> Self {
        self.hop_count = hops;
        self
    }

    /// Build the Message instance
    pub fn build(self) -> Result<Message> {
        let sender = self
            .sender
            .ok_or_else(|| Error::validation("Sender is required"))?;
        let recipient = self
            .recipient
            .ok_or_else(|| Error::validation("Recipient is required"))?;
        let kind = self.kind.unwrap_or(MessageKind::Request);

        let message = Message {
            id: Uuid::new_v4(),
            sender,
            recipient,
            kind,
            priority: self.priority,
            subject: self.subject,
            correlation_id: self.correlation_id,
            thread_id: self.thread_id.unwrap_or_else(Uuid::new_v4),
            broadcast_origin: None,
            payload: self.payload,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            ttl: self.ttl,
            hop_count: self.hop_count,
        };
        message.validate()?;
        Ok(message)
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::agent("worker-1"))
            .kind(MessageKind::Request)
            .subject("Ping")
            .build()
            .unwrap()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Low < MessagePriority::Normal);
        assert!(MessagePriority::Normal < MessagePriority::High);
        assert!(MessagePriority::High < MessagePriority::Critical);
        assert!(MessagePriority::Critical < MessagePriority::Emergency);
        assert!(MessagePriority::Critical.bypasses_queue());
        assert!(!MessagePriority::High.bypasses_queue());
    }

    #[test]
    fn test_request_creation() {
        let message = request();
        assert_eq!(message.kind, MessageKind::Request);
        assert_eq!(message.hop_count, 0);
        assert_eq!(message.ttl, DEFAULT_TTL);
        assert!(!message.is_broadcast());
        assert_eq!(message.recipient.agent_id().unwrap().as_str(), "worker-1");
    }

    #[test]
    fn test_builder_validation() {
        // Missing sender
        let result = Message::builder()
            .recipient(Address::agent("worker-1"))
            .build();
        assert!(result.is_err());

        // Broadcast kind to a single agent
        let result = Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::agent("worker-1"))
            .kind(MessageKind::Broadcast)
            .build();
        assert!(result.unwrap_err().is_validation());

        // Response without correlation
        let result = Message::builder()
            .sender(Address::agent("worker-1"))
            .recipient(Address::Orchestrator)
            .kind(MessageKind::Response)
            .build();
        assert!(result.is_err());

        // Zero ttl
        let result = Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::agent("worker-1"))
            .ttl(Duration::ZERO)
            .build();
        assert!(result.is_err());

        // Broadcast sentinel as sender
        let result = Message::builder()
            .sender(Address::Broadcast)
            .recipient(Address::agent("worker-1"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_expiry() {
        let created = Utc::now();
        let message = Message::builder()
            .sender(Address::Orchestrator)
            .recipient(Address::agent("worker-1"))
            .created_at(created)
            .ttl(Duration::from_secs(1))
            .build()
            .unwrap();

        assert!(!message.is_expired_at(created));
        assert!(!message.is_expired_at(created + chrono::Duration::seconds(1)));
        assert!(message.is_expired_at(created + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_reply_is_correlated() {
        let original = request();
        let reply = original
            .reply()
            .payload_entry("status", "ok")
            .build()
            .unwrap();

        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.correlation_id, Some(original.id));
        assert_eq!(reply.thread_id, original.thread_id);
        assert_eq!(reply.recipient, Address::Orchestrator);
        assert_eq!(reply.payload_str("status"), Some("ok"));
        assert!(reply.subject.starts_with("Re: "));
    }

    #[test]
    fn test_fan_out_and_forward() {
        let broadcast = Message::broadcast_builder()
            .sender(Address::Orchestrator)
            .subject("All hands")
            .build()
            .unwrap();

        let copy = broadcast.fan_out_copy(&AgentId::new("worker-2"));
        assert_ne!(copy.id, broadcast.id);
        assert_eq!(copy.broadcast_origin, Some(broadcast.id));
        assert_eq!(copy.recipient, Address::agent("worker-2"));

        let forwarded = copy.forwarded_to(Address::agent("worker-3"));
        assert_eq!(forwarded.id, copy.id);
        assert_eq!(forwarded.hop_count, copy.hop_count + 1);
    }

    #[test]
    fn test_serde_roundtrip_keeps_kind_names() {
        let message = request();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "REQUEST");
        assert_eq!(json["priority"], "NORMAL");
    }
}
