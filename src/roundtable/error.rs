//! Error taxonomy for adapters and the orchestrator.
//!
//! Adapters never panic out of an invocation: every failure is returned as an
//! [`AgentError`] whose variant is the *kind* the orchestrator's turn loop
//! dispatches on.  Transient kinds (timeout, rate-limited, exhausted retries)
//! are recoverable per turn; repeated recoverable failures escalate to a
//! fatal conversation outcome inside the orchestrator, not here.

use std::error::Error;
use std::fmt;

/// Process exit codes surfaced to CLI collaborators.
pub mod exit_code {
    /// Normal completion.
    pub const OK: i32 = 0;
    /// Startup or validation failure (config, roster, health checks).
    pub const STARTUP: i32 = 1;
    /// Unrecoverable in-conversation failure.
    pub const CONVERSATION: i32 = 2;
    /// Interrupted by signal.
    pub const INTERRUPTED: i32 = 130;
}

/// Classified failure returned by adapter operations.
///
/// # Example
///
/// ```rust
/// use roundtable::error::AgentError;
///
/// let err = AgentError::Timeout("exceeded 30s".to_string());
/// assert_eq!(err.kind(), "turn-timeout");
/// assert!(err.is_recoverable());
/// assert_eq!(err.to_string(), "turn timed out: exceeded 30s");
/// ```
#[derive(Debug, Clone)]
pub enum AgentError {
    /// The agent configuration is structurally invalid (missing model,
    /// missing endpoint, bad extras).  Surfaced at startup.
    ConfigInvalid(String),
    /// The backend is locally unavailable: binary not on PATH, API key
    /// missing.  Surfaced at startup or on-add.
    Unavailable(String),
    /// The health-check round trip failed.
    Unhealthy(String),
    /// The invocation exceeded its deadline.
    Timeout(String),
    /// A rate-limit token could not be acquired within the deadline.
    RateLimited(String),
    /// Transient backend failure (network error, 5xx, 429) surfaced after
    /// retries were exhausted.
    Transient(String),
    /// Permanent backend failure for this request (non-429 4xx, auth,
    /// model-not-found, malformed response).
    Permanent(String),
    /// The cancellation token was tripped while the operation was in flight.
    Cancelled,
}

impl AgentError {
    /// Whether the turn loop may keep scheduling this agent after the error.
    ///
    /// Everything except cancellation is recoverable for *this* turn; the
    /// orchestrator's consecutive-failure counter decides escalation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AgentError::Cancelled)
    }

    /// Whether the error indicates a startup-time misconfiguration rather
    /// than a runtime fault.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            AgentError::ConfigInvalid(_) | AgentError::Unavailable(_) | AgentError::Unhealthy(_)
        )
    }

    /// Short stable label used in logs and turn accounting.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ConfigInvalid(_) => "config-invalid",
            AgentError::Unavailable(_) => "agent-unavailable",
            AgentError::Unhealthy(_) => "agent-unhealthy",
            AgentError::Timeout(_) => "turn-timeout",
            AgentError::RateLimited(_) => "rate-limited",
            AgentError::Transient(_) => "adapter-transient",
            AgentError::Permanent(_) => "adapter-permanent",
            AgentError::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            AgentError::Unavailable(msg) => write!(f, "agent unavailable: {}", msg),
            AgentError::Unhealthy(msg) => write!(f, "health check failed: {}", msg),
            AgentError::Timeout(msg) => write!(f, "turn timed out: {}", msg),
            AgentError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            AgentError::Transient(msg) => write!(f, "transient backend failure: {}", msg),
            AgentError::Permanent(msg) => write!(f, "permanent backend failure: {}", msg),
            AgentError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Error for AgentError {}

/// Errors surfaced by orchestrator construction and execution.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// `run()` was called with an empty roster.
    NoAgents,
    /// Roster construction failed before the conversation started (config
    /// validation, adapter build, availability).
    Startup(String),
    /// Two roster entries share an agent id.
    DuplicateAgent(String),
    /// A fatal adapter failure terminated the conversation: `(agent id,
    /// reason)`.
    AgentFailed(String, String),
    /// The summary agent could not be constructed or invoked.  Non-fatal for
    /// the conversation; carried for reporting.
    SummaryFailed(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::NoAgents => write!(f, "no agents in the roster"),
            OrchestratorError::Startup(msg) => write!(f, "startup failed: {}", msg),
            OrchestratorError::DuplicateAgent(id) => {
                write!(f, "duplicate agent id '{}'", id)
            }
            OrchestratorError::AgentFailed(id, reason) => {
                write!(f, "agent '{}' failed fatally: {}", id, reason)
            }
            OrchestratorError::SummaryFailed(reason) => {
                write!(f, "summary generation failed: {}", reason)
            }
        }
    }
}

impl Error for OrchestratorError {}
