//! Adapter factory: the process-wide mapping from adapter type keys to
//! agent builders.
//!
//! The two built-in families, [`process`] (subprocess) and [`api`]
//! (OpenAI-compatible HTTP), register themselves at startup; external
//! adapter crates add their own builders via [`register`].  Each entry also
//! declares its [`ModelPolicy`], which drives config validation and the
//! `type[:model[:name]]` shorthand parser used by CLI collaborators.

pub mod api;
pub mod process;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::roundtable::agent::Agent;
use crate::roundtable::config::AgentConfig;
use crate::roundtable::error::AgentError;

pub use api::ApiAgent;
pub use process::ProcessAgent;

/// Whether an adapter type takes a model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPolicy {
    /// A model must be configured.
    Required,
    /// A model may be configured.
    Optional,
    /// A model must not be configured.
    Forbidden,
}

/// Constructor for one adapter family.
pub type AgentBuilder = Arc<dyn Fn(&AgentConfig) -> Box<dyn Agent> + Send + Sync>;

struct AdapterEntry {
    policy: ModelPolicy,
    builder: AgentBuilder,
}

lazy_static! {
    static ref FACTORY: RwLock<HashMap<String, AdapterEntry>> = {
        let mut map: HashMap<String, AdapterEntry> = HashMap::new();
        map.insert(
            "process".to_string(),
            AdapterEntry {
                policy: ModelPolicy::Optional,
                builder: Arc::new(|cfg| Box::new(ProcessAgent::new(cfg))),
            },
        );
        map.insert(
            "openai".to_string(),
            AdapterEntry {
                policy: ModelPolicy::Required,
                builder: Arc::new(|cfg| Box::new(ApiAgent::new(cfg))),
            },
        );
        RwLock::new(map)
    };
}

/// Register an adapter type.  Intended for startup; replaces any existing
/// entry under the same key.
pub fn register(type_name: impl Into<String>, policy: ModelPolicy, builder: AgentBuilder) {
    let mut factory = FACTORY.write().expect("adapter factory poisoned");
    factory.insert(type_name.into(), AdapterEntry { policy, builder });
}

/// The model policy of an adapter type, or `None` for unknown types.
pub fn model_policy(type_name: &str) -> Option<ModelPolicy> {
    let factory = FACTORY.read().expect("adapter factory poisoned");
    factory.get(type_name).map(|entry| entry.policy)
}

/// Registered adapter type keys, sorted.
pub fn registered_types() -> Vec<String> {
    let factory = FACTORY.read().expect("adapter factory poisoned");
    let mut types: Vec<String> = factory.keys().cloned().collect();
    types.sort();
    types
}

/// Construct and initialize an agent from its config.
///
/// Dispatches on `cfg.agent_type`, then runs the adapter's one-time
/// initialization (binary resolution, endpoint validation) before handing
/// the agent back.
///
/// # Example
///
/// ```rust,no_run
/// use roundtable::adapters;
/// use roundtable::agent::Agent;
/// use roundtable::config::AgentConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cfg = AgentConfig::new("reviewer", "process");
/// cfg.command = Some("claude".to_string());
/// cfg.prompt_flag = Some("-p".to_string());
///
/// let agent = adapters::build(&cfg).await?;
/// assert!(agent.is_available());
/// # Ok(())
/// # }
/// ```
pub async fn build(cfg: &AgentConfig) -> Result<Box<dyn Agent>, AgentError> {
    let builder = {
        let factory = FACTORY.read().expect("adapter factory poisoned");
        let entry = factory.get(&cfg.agent_type).ok_or_else(|| {
            AgentError::ConfigInvalid(format!("unknown adapter type '{}'", cfg.agent_type))
        })?;
        Arc::clone(&entry.builder)
    };
    let mut agent = builder(cfg);
    agent.initialize().await?;
    Ok(agent)
}

/// Errors from the `type[:model[:name]]` shorthand parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShorthandError {
    /// The spec string was empty.
    Empty,
    /// The type segment names no registered adapter.
    UnknownType(String),
    /// The adapter requires a model but the form supplied none.
    ModelRequired(String),
    /// The adapter forbids a model but the three-segment form supplied one.
    ModelForbidden(String),
    /// More than three segments.
    Malformed(String),
}

impl fmt::Display for ShorthandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShorthandError::Empty => write!(f, "empty agent spec"),
            ShorthandError::UnknownType(t) => write!(f, "unknown adapter type '{}'", t),
            ShorthandError::ModelRequired(t) => {
                write!(f, "adapter '{}' requires a model: use {}:<model>:<name>", t, t)
            }
            ShorthandError::ModelForbidden(t) => {
                write!(f, "adapter '{}' does not take a model", t)
            }
            ShorthandError::Malformed(spec) => write!(f, "malformed agent spec '{}'", spec),
        }
    }
}

impl Error for ShorthandError {}

/// Parse the `type[:model[:name]]` agent shorthand into an [`AgentConfig`].
///
/// - `type` alone: the name (and id) default to the type.
/// - `type:name`: rejected when the adapter requires a model.
/// - `type:model:name`: rejected when the adapter forbids a model.
///
/// # Example
///
/// ```rust
/// use roundtable::adapters::parse_shorthand;
///
/// let cfg = parse_shorthand("openai:gpt-4o-mini:Critic").unwrap();
/// assert_eq!(cfg.agent_type, "openai");
/// assert_eq!(cfg.model.as_deref(), Some("gpt-4o-mini"));
/// assert_eq!(cfg.name, "Critic");
///
/// // `openai` requires a model, so the two-segment form is rejected.
/// assert!(parse_shorthand("openai:Critic").is_err());
/// ```
pub fn parse_shorthand(spec: &str) -> Result<AgentConfig, ShorthandError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ShorthandError::Empty);
    }
    let segments: Vec<&str> = spec.split(':').collect();
    if segments.len() > 3 {
        return Err(ShorthandError::Malformed(spec.to_string()));
    }

    let type_name = segments[0];
    let policy = model_policy(type_name)
        .ok_or_else(|| ShorthandError::UnknownType(type_name.to_string()))?;

    let (model, name) = match segments.len() {
        1 => (None, type_name),
        2 => {
            if policy == ModelPolicy::Required {
                return Err(ShorthandError::ModelRequired(type_name.to_string()));
            }
            (None, segments[1])
        }
        _ => {
            if policy == ModelPolicy::Forbidden {
                return Err(ShorthandError::ModelForbidden(type_name.to_string()));
            }
            (Some(segments[1]), segments[2])
        }
    };
    if policy == ModelPolicy::Required && model.is_none() {
        return Err(ShorthandError::ModelRequired(type_name.to_string()));
    }

    let mut cfg = AgentConfig::new(name, type_name);
    cfg.model = model.map(|m| m.to_string());
    Ok(cfg)
}
