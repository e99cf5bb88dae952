// src/lib.rs

// Import the top-level `roundtable` module.
pub mod roundtable;

// Re-export the public modules at the crate root so external code does not
// have to navigate the whole hierarchy.
pub use roundtable::{
    adapters, agent, config, error, hooks, message, orchestrator, prompt, ratelimit, registry,
    retry, snapshot, summary,
};

// Re-exporting key items for easier external access.
pub use roundtable::agent::{Agent, AgentIdentity};
pub use roundtable::message::{Message, Role};
pub use roundtable::orchestrator::{ConversationReport, Orchestrator, OrchestratorHandle};
