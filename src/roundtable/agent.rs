//! The speaker capability set every adapter implements.
//!
//! Applications interact with speakers exclusively through the [`Agent`]
//! trait.  The trait abstracts over the two adapter families (subprocess
//! and HTTP API) while [`AgentIdentity`] carries the config-derived fields
//! both families share, so concrete adapters embed it and delegate their
//! accessors instead of re-storing every field.
//!
//! Invocation is blocking-with-cancellation: both [`Agent::send_message`] and
//! [`Agent::stream_message`] take a [`CancellationToken`] and must return
//! promptly once it trips.  The streaming variant pushes decoded fragments
//! into a caller-supplied sink callback rather than returning a stream, so
//! the contract is identical for child-process stdout and SSE deltas.
//!
//! # Example
//!
//! ```rust,no_run
//! use roundtable::adapters;
//! use roundtable::agent::Agent;
//! use roundtable::config::AgentConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = AgentConfig::new("echo-bot", "process");
//! let agent = adapters::build(&cfg).await?;
//!
//! let cancel = CancellationToken::new();
//! let reply = agent.send_message(&cancel, &[]).await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::roundtable::config::AgentConfig;
use crate::roundtable::error::AgentError;
use crate::roundtable::message::{Message, TokenUsage};

/// Push-style sink receiving decoded response fragments during streaming.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Trait-driven abstraction over one concrete speaker backend.
///
/// Implementations **must** be thread-safe (`Send + Sync`): the orchestrator
/// shares agents across tasks in free-form mode.  Adapters may carry private
/// mutable state (for example a remembered backend session id) behind their
/// own synchronization; that state never leaks into the transcript.
#[async_trait]
pub trait Agent: Send + Sync {
    /// One-time initialization: resolve the backing binary on PATH or
    /// validate endpoint/key/model.  Called exactly once by the adapter
    /// factory before the agent is handed to the orchestrator.
    async fn initialize(&mut self) -> Result<(), AgentError>;

    /// Cheap local availability probe (binary on PATH, API key present).
    /// Never performs I/O beyond the local filesystem.
    fn is_available(&self) -> bool;

    /// Minimal round trip through the backend: a `--version` run for
    /// subprocesses, a one-token request for APIs.
    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), AgentError>;

    /// Backend version string, when the backend can report one.
    async fn cli_version(&self, cancel: &CancellationToken) -> Result<String, AgentError>;

    /// Produce one response to the conversation so far.
    ///
    /// `transcript` is a read-only snapshot; the adapter assembles its own
    /// prompt view from it (excluding this agent's prior turns) and must not
    /// assume it can observe later appends.
    async fn send_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
    ) -> Result<String, AgentError>;

    /// Streaming variant of [`send_message`](Agent::send_message): decoded
    /// fragments are pushed into `sink` as they arrive, and the complete
    /// response text is returned once the backend finishes.
    async fn stream_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        sink: ChunkSink<'_>,
    ) -> Result<String, AgentError>;

    /// Shared identity and configuration fields.
    fn identity(&self) -> &AgentIdentity;

    /// Stable identifier, unique within a conversation.
    fn id(&self) -> &str {
        &self.identity().id
    }

    /// Display name, also used for prompt self-reference.
    fn name(&self) -> &str {
        &self.identity().name
    }

    /// Adapter type key this agent was built from.
    fn agent_type(&self) -> &str {
        &self.identity().agent_type
    }

    /// Configured model identifier, when the adapter uses one.
    fn model(&self) -> Option<&str> {
        self.identity().model.as_deref()
    }

    /// Configured system prompt.
    fn system_prompt(&self) -> &str {
        &self.identity().system_prompt
    }

    /// Requests per second granted by the rate limiter; `0.0` disables gating.
    fn rate_limit(&self) -> f64 {
        self.identity().rate_limit
    }

    /// Burst capacity of this agent's rate-limit bucket.
    fn rate_limit_burst(&self) -> u32 {
        self.identity().rate_limit_burst
    }

    /// Greeting emitted as this agent's seed announcement.
    fn announce(&self) -> String {
        self.identity().announce()
    }

    /// Token accounting from the most recent invocation, when the backend
    /// reported any.
    async fn last_usage(&self) -> Option<TokenUsage> {
        match self.usage_slot() {
            Some(slot) => slot.lock().await.clone(),
            None => None,
        }
    }

    /// Shared mutable slot where the implementation persists token usage.
    /// Adapters whose backends report usage override this; the default
    /// reports none.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

/// Config-derived fields shared by every adapter.
///
/// Concrete adapters embed one `AgentIdentity` and return it from
/// [`Agent::identity`]; the trait's accessor defaults delegate here so the
/// field storage lives in exactly one place.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Stable identifier, unique within a conversation.
    pub id: String,
    /// Display name used in prompts and logs.
    pub name: String,
    /// Adapter type key (`"process"`, `"openai"`, …).
    pub agent_type: String,
    /// System prompt injected verbatim into the identity block.
    pub system_prompt: String,
    /// Optional configured greeting overriding the default template.
    pub announcement: Option<String>,
    /// Optional model identifier.
    pub model: Option<String>,
    /// Sampling temperature forwarded when positive.
    pub temperature: f64,
    /// Completion token cap forwarded when positive.
    pub max_tokens: u32,
    /// Requests per second; `0.0` means unlimited.
    pub rate_limit: f64,
    /// Token-bucket burst capacity.
    pub rate_limit_burst: u32,
}

impl AgentIdentity {
    /// Extract the shared fields from an [`AgentConfig`].
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            name: cfg.name.clone(),
            agent_type: cfg.agent_type.clone(),
            system_prompt: cfg.prompt.clone(),
            announcement: cfg.announcement.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            rate_limit: cfg.rate_limit,
            rate_limit_burst: cfg.rate_limit_burst,
        }
    }

    /// The configured announcement, or the default greeting template.
    pub fn announce(&self) -> String {
        match &self.announcement {
            Some(text) => text.clone(),
            None => format!("{} has joined the conversation.", self.name),
        }
    }
}
