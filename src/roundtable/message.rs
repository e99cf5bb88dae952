//! Transcript primitives shared by the orchestrator, adapters, and hooks.
//!
//! A conversation is an append-only sequence of [`Message`] values.  Each
//! message records who produced it, when, and (for agent turns) the
//! performance metrics observed while producing it.  Messages are immutable
//! once appended; the orchestrator owns the canonical sequence and hands
//! adapters read-only snapshots of it.
//!
//! # Example
//!
//! ```rust
//! use roundtable::message::{Message, Role};
//!
//! let seed = Message::host("Say hi");
//! assert_eq!(seed.agent_id, "host");
//! assert!(matches!(seed.role, Role::System));
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Reserved agent id for orchestrator-originated messages (seed prompt and
/// terminal status markers).
pub const HOST_ID: &str = "host";

/// Conversation role attached to every transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Orchestrator- or tool-originated framing (seed prompt, announcements,
    /// terminal status).
    System,
    /// A human-originated message, typically spliced in via injection.
    User,
    /// An agent-authored turn.
    Agent,
}

/// Performance metrics observed for a single agent turn.
///
/// Token counts come from the adapter's usage report when the backend
/// provides one; `estimated_cost` is advisory (computed from the provider
/// registry's per-1M-token prices) and never authoritative billing data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetrics {
    /// Wall-clock duration of the invocation in milliseconds.
    pub duration_ms: u64,
    /// Prompt tokens billed by the backend, when reported.
    pub input_tokens: usize,
    /// Completion tokens billed by the backend, when reported.
    pub output_tokens: usize,
    /// Convenience total (`input_tokens + output_tokens`).
    pub total_tokens: usize,
    /// Model identifier that served the turn, when known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    /// Estimated cost in currency units.  Zero for unknown models.
    pub estimated_cost: f64,
}

/// How many tokens were spent on prompt vs. completion?
///
/// Adapters persist the most recent value in their usage slot so the
/// orchestrator can attach it to the finalized message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the backend.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the backend.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// A single transcript entry.
///
/// Invariants maintained by the orchestrator: a message is appended exactly
/// once and its position is final; timestamps are non-decreasing along the
/// transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier of the producer (`"host"` for orchestrator-originated
    /// entries, an agent id otherwise, or an external identity for injected
    /// messages).
    pub agent_id: String,
    /// Display name of the producer.
    pub agent_name: String,
    /// Adapter type key of the producer, or `"system"` for host entries.
    pub agent_type: String,
    /// Message body.
    pub content: String,
    /// Seconds since the Unix epoch at creation time.
    pub timestamp: i64,
    /// Conversation role.
    pub role: Role,
    /// Metrics captured for agent turns; absent on system/user entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TurnMetrics>,
}

impl Message {
    /// Create an orchestrator-originated system message (seed prompt,
    /// terminal status marker).
    pub fn host(content: impl Into<String>) -> Self {
        Self {
            agent_id: HOST_ID.to_string(),
            agent_name: HOST_ID.to_string(),
            agent_type: "system".to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
            role: Role::System,
            metrics: None,
        }
    }

    /// Create the announcement system message emitted for one agent during
    /// seeding.
    pub fn announcement(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
            role: Role::System,
            metrics: None,
        }
    }

    /// Create an agent-authored turn message.
    pub fn from_agent(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
            role: Role::Agent,
            metrics: None,
        }
    }

    /// Create a user-role message carrying an external identity, suitable for
    /// splicing into the transcript via the injection queue.
    pub fn external(
        source_id: impl Into<String>,
        source_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: source_id.into(),
            agent_name: source_name.into(),
            agent_type: "external".to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
            role: Role::User,
            metrics: None,
        }
    }

    /// Attach turn metrics (builder pattern).
    pub fn with_metrics(mut self, metrics: TurnMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether this entry was authored by the orchestrator itself.
    pub fn is_host(&self) -> bool {
        self.agent_id == HOST_ID
    }
}
