//! Read-only provider/model registry and advisory cost estimation.
//!
//! The registry maps a model identifier to provider metadata and per-1M-token
//! unit prices.  It is loaded once at startup from a manifest embedded in the
//! binary; a user-supplied manifest at a well-known location (the
//! `ROUNDTABLE_PROVIDERS` environment variable, falling back to
//! `~/.config/roundtable/providers.json`) replaces the embedded one wholesale.
//!
//! Lookups are case-insensitive and evaluate three match classes in order:
//! exact, prefix, substring.  Substring hits are logged as warnings since
//! they are imprecise; an unknown model costs `0` and logs one informational
//! line.
//!
//! # Example
//!
//! ```rust
//! use roundtable::registry;
//!
//! let registry = registry::global();
//! let (provider, model) = registry.lookup("gpt-4o-mini").unwrap();
//! assert_eq!(provider.id, "openai");
//!
//! // (10k input + 2k output) tokens of GPT-4o mini.
//! let cost = registry.estimate_cost("gpt-4o-mini", 10_000, 2_000);
//! assert!(cost > 0.0);
//! # let _ = model;
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Pricing and capability metadata for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier as accepted by the provider API.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Price per one million input tokens, in currency units.
    pub cost_per_1m_input: f64,
    /// Price per one million output tokens, in currency units.
    pub cost_per_1m_output: f64,
    /// Maximum context window in tokens.
    pub context_window: u64,
    /// Capability tags (`"chat"`, `"vision"`, `"tools"`, …).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// One provider and its model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Stable provider identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Catalog of known models.
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    providers: Vec<Provider>,
}

/// The loaded registry.  Obtain the process-wide instance via [`global`].
pub struct Registry {
    providers: Vec<Provider>,
}

const EMBEDDED_MANIFEST: &str = include_str!("providers.json");

impl Registry {
    /// Parse a registry from manifest JSON.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let manifest: Manifest = serde_json::from_str(text)?;
        Ok(Self {
            providers: manifest.providers,
        })
    }

    /// Build the registry from the embedded manifest.
    fn embedded() -> Self {
        Self::from_json(EMBEDDED_MANIFEST).expect("embedded provider manifest is valid")
    }

    /// All known providers.
    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    /// Resolve a model identifier to its provider and metadata.
    ///
    /// Match classes run in order: exact, prefix (either the query extends a
    /// catalog id, as dated releases of a base model do, or vice versa),
    /// substring.  Returns `None` when no class matches.
    pub fn lookup(&self, model_id: &str) -> Option<(&Provider, &ModelInfo)> {
        let query = model_id.to_lowercase();

        for provider in &self.providers {
            for model in &provider.models {
                if model.id.to_lowercase() == query {
                    log::debug!("model '{}' matched exactly in '{}'", model_id, provider.id);
                    return Some((provider, model));
                }
            }
        }

        for provider in &self.providers {
            for model in &provider.models {
                let id = model.id.to_lowercase();
                if query.starts_with(&id) || id.starts_with(&query) {
                    log::info!(
                        "model '{}' matched '{}' by prefix in '{}'",
                        model_id,
                        model.id,
                        provider.id
                    );
                    return Some((provider, model));
                }
            }
        }

        for provider in &self.providers {
            for model in &provider.models {
                let id = model.id.to_lowercase();
                if query.contains(&id) || id.contains(&query) {
                    log::warn!(
                        "model '{}' matched '{}' only by substring in '{}'; pricing may be wrong",
                        model_id,
                        model.id,
                        provider.id
                    );
                    return Some((provider, model));
                }
            }
        }

        None
    }

    /// Advisory cost of a turn in currency units.
    ///
    /// `input_tokens × rate_in / 1e6 + output_tokens × rate_out / 1e6` for a
    /// known model; `0.0` with one informational log line otherwise.
    pub fn estimate_cost(&self, model_id: &str, input_tokens: usize, output_tokens: usize) -> f64 {
        match self.lookup(model_id) {
            Some((_, model)) => {
                input_tokens as f64 * model.cost_per_1m_input / 1_000_000.0
                    + output_tokens as f64 * model.cost_per_1m_output / 1_000_000.0
            }
            None => {
                log::info!("model '{}' not in the registry; cost estimate is 0", model_id);
                0.0
            }
        }
    }
}

/// Path of the optional user-supplied manifest.
fn user_manifest_path() -> Option<std::path::PathBuf> {
    if let Ok(path) = std::env::var("ROUNDTABLE_PROVIDERS") {
        return Some(std::path::PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| {
        std::path::PathBuf::from(home)
            .join(".config")
            .join("roundtable")
            .join("providers.json")
    })
}

/// Load the user manifest when present and valid, otherwise the embedded
/// one.  A malformed user manifest logs a warning and the embedded data
/// stays in effect.
fn load_registry() -> Registry {
    if let Some(path) = user_manifest_path() {
        if let Ok(text) = std::fs::read_to_string(&path) {
            match Registry::from_json(&text) {
                Ok(registry) => {
                    log::info!("provider registry loaded from {}", path.display());
                    return registry;
                }
                Err(e) => {
                    log::warn!(
                        "ignoring malformed provider manifest {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
    }
    Registry::embedded()
}

lazy_static! {
    /// Process-wide registry, initialized on first use.
    static ref GLOBAL_REGISTRY: Registry = load_registry();
}

/// Borrow the process-wide registry.
pub fn global() -> &'static Registry {
    &GLOBAL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        let registry = Registry::embedded();
        let (provider, model) = registry.lookup("gpt-4o").unwrap();
        assert_eq!(provider.id, "openai");
        assert_eq!(model.id, "gpt-4o");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = Registry::embedded();
        let (_, model) = registry.lookup("GPT-4O-MINI").unwrap();
        assert_eq!(model.id, "gpt-4o-mini");
    }

    #[test]
    fn dated_release_matches_by_prefix() {
        let registry = Registry::embedded();
        let (provider, model) = registry.lookup("claude-sonnet-4-0-latest").unwrap();
        assert_eq!(provider.id, "anthropic");
        assert_eq!(model.id, "claude-sonnet-4-0");
    }

    #[test]
    fn substring_is_the_last_resort() {
        let registry = Registry::embedded();
        let (_, model) = registry.lookup("openrouter/meta/llama-3.3-70b:free").unwrap();
        assert_eq!(model.id, "llama-3.3-70b");
    }

    #[test]
    fn unknown_model_costs_zero() {
        let registry = Registry::embedded();
        assert_eq!(registry.estimate_cost("made-up-model-9000", 1000, 1000), 0.0);
    }

    #[test]
    fn cost_math_is_exact() {
        let registry = Registry::embedded();
        // gpt-4o: 2.5 in / 10.0 out per 1M.
        let cost = registry.estimate_cost("gpt-4o", 1_000_000, 500_000);
        assert!((cost - (2.5 + 5.0)).abs() < 1e-9);
    }
}
