//! Declarative configuration for a conversation.
//!
//! A conversation is described by a human-authored YAML file with `version`,
//! `agents`, `orchestrator`, and `logging` sections.  [`Config::from_path`]
//! parses it; [`Config::validate`] applies the structural rules (unique agent
//! ids, per-adapter model policy, API endpoint requirements) before any agent
//! is constructed.
//!
//! # Example
//!
//! ```rust
//! use roundtable::config::Config;
//!
//! let cfg = Config::from_yaml_str(r#"
//! version: "1"
//! agents:
//!   - id: scout
//!     type: process
//!     command: echo
//!   - id: critic
//!     type: openai
//!     model: gpt-4o-mini
//!     api_endpoint: https://openrouter.ai/api/v1
//! orchestrator:
//!   mode: round-robin
//!   max_turns: 4
//!   initial_prompt: "Debate the motion."
//! "#).unwrap();
//!
//! cfg.validate().unwrap();
//! assert_eq!(cfg.agents.len(), 2);
//! assert_eq!(cfg.orchestrator.max_turns, 4);
//! ```

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors produced while loading or validating a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(std::io::Error),
    /// The YAML did not parse into the expected shape.
    Parse(String),
    /// The parsed configuration violates a structural rule.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config read error: {}", e),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl Error for ConfigError {}

/// How a subprocess adapter's stdout is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Trim and return the whole output.
    Text,
    /// Newline-delimited JSON events carrying assistant text fragments and a
    /// completion sentinel.
    JsonEvents,
    /// Like `json-events`, with a backend session id on the first line that
    /// is captured for reuse.
    StreamJson,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Text
    }
}

/// Declarative specification of one speaker, consumed at initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier, unique within the conversation.
    pub id: String,
    /// Adapter type key used for factory dispatch.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// System prompt injected verbatim into the agent's identity block.
    #[serde(default)]
    pub prompt: String,
    /// Optional greeting overriding the default announcement template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<String>,
    /// Model identifier; required, optional, or forbidden per adapter type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature forwarded when positive.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Completion token cap forwarded when positive.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Requests per second; `0` disables rate limiting for this agent.
    #[serde(default)]
    pub rate_limit: f64,
    /// Token-bucket burst capacity.
    #[serde(default = "default_burst")]
    pub rate_limit_burst: u32,
    /// Chat-completions base URL (API adapters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    /// Bearer key (API adapters); optional for local servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Binary name or path (subprocess adapters); defaults to the agent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Extra argv passed on every invocation (subprocess adapters).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Flag carrying the assembled prompt (e.g. `-p`); absent means the
    /// prompt is fed via stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_flag: Option<String>,
    /// Flag carrying the configured model (e.g. `--model`), when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_flag: Option<String>,
    /// Flag used to resume a captured backend session (e.g. `--resume`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_flag: Option<String>,
    /// How stdout is parsed (subprocess adapters).
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_burst() -> u32 {
    1
}

impl AgentConfig {
    /// Create a minimal config with defaults for everything beyond the id and
    /// adapter type.  The display name defaults to the id.
    ///
    /// # Example
    ///
    /// ```rust
    /// use roundtable::config::AgentConfig;
    ///
    /// let mut cfg = AgentConfig::new("critic", "openai");
    /// cfg.model = Some("gpt-4o-mini".to_string());
    /// cfg.api_endpoint = Some("https://openrouter.ai/api/v1".to_string());
    ///
    /// assert_eq!(cfg.name, "critic");
    /// assert_eq!(cfg.max_tokens, 2000);
    /// assert_eq!(cfg.rate_limit_burst, 1);
    /// ```
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type: agent_type.into(),
            prompt: String::new(),
            announcement: None,
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            rate_limit: 0.0,
            rate_limit_burst: default_burst(),
            api_endpoint: None,
            api_key: None,
            command: None,
            args: Vec::new(),
            prompt_flag: None,
            model_flag: None,
            session_flag: None,
            output_format: OutputFormat::Text,
        }
    }

    /// Fill derived defaults after deserialization: an empty name falls back
    /// to the id.
    fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
    }
}

/// Turn-scheduling strategy across the roster.
///
/// Spelled `round-robin`, `reactive`, and `free-form` in configuration
/// files.
///
/// # Example
///
/// ```rust
/// use roundtable::config::Mode;
///
/// let mode: Mode = serde_yaml::from_str("free-form").unwrap();
/// assert_eq!(mode, Mode::FreeForm);
/// assert_eq!(Mode::default(), Mode::RoundRobin);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Roster order, cycling indefinitely from the first entry.
    RoundRobin,
    /// Uniformly random among agents other than the last speaker.
    Reactive,
    /// All agents speak concurrently each turn; responses append in roster
    /// order.
    FreeForm,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::RoundRobin
    }
}

/// Summary generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Whether summaries are produced on normal termination.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Config for the transient summary agent; when absent the first roster
    /// agent's config is reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent: None,
        }
    }
}

/// Orchestration policy for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Turn-scheduling mode.
    #[serde(default)]
    pub mode: Mode,
    /// Upper bound on scheduled turns; `0` means unlimited.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Per-turn deadline in (possibly fractional) seconds.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: f64,
    /// Pause between turns in (possibly fractional) seconds.
    #[serde(default = "default_response_delay_secs")]
    pub response_delay_secs: f64,
    /// Seed prompt emitted as the first host message when non-empty.
    #[serde(default)]
    pub initial_prompt: String,
    /// Summary generation settings.
    #[serde(default)]
    pub summary: SummaryConfig,
}

fn default_max_turns() -> u32 {
    10
}

fn default_turn_timeout_secs() -> f64 {
    30.0
}

fn default_response_delay_secs() -> f64 {
    1.0
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            max_turns: default_max_turns(),
            turn_timeout_secs: default_turn_timeout_secs(),
            response_delay_secs: default_response_delay_secs(),
            initial_prompt: String::new(),
            summary: SummaryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Per-turn deadline as a [`Duration`].
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.turn_timeout_secs.max(0.0))
    }

    /// Inter-turn pause as a [`Duration`].
    pub fn response_delay(&self) -> Duration {
        Duration::from_secs_f64(self.response_delay_secs.max(0.0))
    }
}

/// Transcript log rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One human-readable line per message.
    Text,
    /// One JSON object per line.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

/// Transcript logging settings consumed by the logger hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// File the transcript is appended to.
    pub path: PathBuf,
    /// Line rendering.
    #[serde(default)]
    pub format: LogFormat,
    /// Whether metric suffixes (duration, tokens, cost) are included.
    #[serde(default)]
    pub show_metrics: bool,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Schema version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// The roster, in speaking order.
    pub agents: Vec<AgentConfig>,
    /// Orchestration policy.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Optional transcript logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Config {
    /// Parse a configuration from YAML text and apply derived defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        for agent in &mut cfg.agents {
            agent.normalize();
        }
        if let Some(summary_agent) = &mut cfg.orchestrator.summary.agent {
            summary_agent.normalize();
        }
        Ok(cfg)
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_yaml_str(&text)
    }

    /// Apply structural validation: unique agent ids and per-adapter model /
    /// endpoint requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("no agents configured".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(ConfigError::Invalid("agent with empty id".to_string()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            validate_agent(agent)?;
        }
        if let Some(summary_agent) = &self.orchestrator.summary.agent {
            validate_agent(summary_agent)?;
        }
        Ok(())
    }
}

/// Check one agent entry against its adapter's model policy and the API
/// endpoint requirement.
fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    use crate::roundtable::adapters::{model_policy, ModelPolicy};

    let policy = model_policy(&agent.agent_type).ok_or_else(|| {
        ConfigError::Invalid(format!(
            "agent '{}': unknown adapter type '{}'",
            agent.id, agent.agent_type
        ))
    })?;
    match policy {
        ModelPolicy::Required if agent.model.is_none() => {
            return Err(ConfigError::Invalid(format!(
                "agent '{}': adapter '{}' requires a model",
                agent.id, agent.agent_type
            )));
        }
        ModelPolicy::Forbidden if agent.model.is_some() => {
            return Err(ConfigError::Invalid(format!(
                "agent '{}': adapter '{}' does not take a model",
                agent.id, agent.agent_type
            )));
        }
        _ => {}
    }
    if agent.agent_type == "openai" && agent.api_endpoint.is_none() {
        return Err(ConfigError::Invalid(format!(
            "agent '{}': adapter 'openai' requires api_endpoint",
            agent.id
        )));
    }
    Ok(())
}
