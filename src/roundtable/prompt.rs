//! Uniform prompt assembly for every adapter family.
//!
//! Each speaker sees the conversation through the same three-part discipline:
//! an identity block naming the agent and carrying its configured prompt
//! verbatim, a task block surfacing the seed prompt, and a context block with
//! everything else, excluding the speaker's own prior turns.  Subprocess
//! adapters render the parts into one flat prompt ([`assemble_flat`]); API
//! adapters render them into chat-completion wire messages
//! ([`assemble_wire`]).  Both renderers share the same selection logic, so
//! the self-exclusion invariant holds identically for both families.
//!
//! # Example
//!
//! ```rust
//! use roundtable::agent::AgentIdentity;
//! use roundtable::config::AgentConfig;
//! use roundtable::message::Message;
//! use roundtable::prompt;
//!
//! let mut cfg = AgentConfig::new("critic", "openai");
//! cfg.name = "Critic".to_string();
//! cfg.prompt = "You find flaws.".to_string();
//! let critic = AgentIdentity::from_config(&cfg);
//!
//! let transcript = vec![
//!     Message::host("Review this design."),
//!     Message::from_agent("critic", "Critic", "openai", "The cache is racy."),
//!     Message::from_agent("scout", "Scout", "process", "Benchmarks look fine."),
//! ];
//!
//! let flat = prompt::assemble_flat(&critic, &transcript);
//! assert!(flat.contains("Review this design."));
//! assert!(flat.contains("Scout: Benchmarks look fine."));
//! // The speaker never sees its own prior turn.
//! assert!(!flat.contains("The cache is racy."));
//! ```

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::roundtable::agent::AgentIdentity;
use crate::roundtable::message::{Message, Role, HOST_ID};

/// One OpenAI-style chat message ready for serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    /// Wire role: `"system"` or `"user"`.
    pub role: String,
    /// Rendered content.
    pub content: String,
}

/// Split a transcript snapshot into the task message and the context entries
/// visible to `identity`.
///
/// The task is the first `role=system` entry authored by the host; the
/// context is every other entry except the speaker's own turns (matched by
/// id *and* by name, since some backends thread their own history
/// server-side and must never be shown what they already said).
fn select<'a>(
    identity: &AgentIdentity,
    transcript: &'a [Message],
) -> (Option<&'a Message>, Vec<&'a Message>) {
    let task_index = transcript
        .iter()
        .position(|m| m.role == Role::System && (m.agent_id == HOST_ID || m.agent_id == "system"));

    let context = transcript
        .iter()
        .enumerate()
        .filter(|(i, m)| {
            Some(*i) != task_index
                && m.agent_id != identity.id
                && m.agent_name != identity.name
        })
        .map(|(_, m)| m)
        .collect();
    (task_index.map(|i| &transcript[i]), context)
}

/// Render an epoch timestamp as local `HH:MM:SS`.
fn clock(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0).single() {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => "00:00:00".to_string(),
    }
}

/// Render one context entry for the flat prompt.
fn context_line(msg: &Message) -> String {
    match msg.role {
        Role::System => format!("[{}] SYSTEM: {}", clock(msg.timestamp), msg.content),
        _ => format!("[{}] {}: {}", clock(msg.timestamp), msg.agent_name, msg.content),
    }
}

/// Build the single-string prompt a subprocess adapter feeds its child.
pub fn assemble_flat(identity: &AgentIdentity, transcript: &[Message]) -> String {
    let (task, context) = select(identity, transcript);

    let mut prompt = format!(
        "You are {}, one participant in a multi-agent conversation.\n",
        identity.name
    );
    if !identity.system_prompt.is_empty() {
        prompt.push_str(&identity.system_prompt);
        prompt.push('\n');
    }

    if let Some(task) = task {
        prompt.push_str("\nThe task for this conversation:\n");
        prompt.push_str(&task.content);
        prompt.push('\n');
    }

    if !context.is_empty() {
        prompt.push_str("\nThe conversation so far:\n");
        for msg in &context {
            prompt.push_str(&context_line(msg));
            prompt.push('\n');
        }
    }

    prompt.push_str(&format!(
        "\n{}, respond to the task, taking the conversation so far into account.",
        identity.name
    ));
    prompt
}

/// Build the chat-completion message array an API adapter sends.
///
/// The configured prompt leads as the single `system` entry; transcript
/// entries map by role: `system` becomes a `user` message tagged
/// `[System]`, `user` passes through, and other agents' turns become `user`
/// messages tagged with the speaker's name.  The speaker's own entries are
/// filtered out.
pub fn assemble_wire(identity: &AgentIdentity, transcript: &[Message]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(transcript.len() + 2);
    wire.push(WireMessage {
        role: "system".to_string(),
        content: format!(
            "You are {}, one participant in a multi-agent conversation.\n{}",
            identity.name, identity.system_prompt
        ),
    });

    for msg in transcript {
        if msg.agent_id == identity.id || msg.agent_name == identity.name {
            continue;
        }
        let content = match msg.role {
            Role::System => format!("[System] {}", msg.content),
            Role::User => msg.content.clone(),
            Role::Agent => format!("{}: {}", msg.agent_name, msg.content),
        };
        wire.push(WireMessage {
            role: "user".to_string(),
            content,
        });
    }

    wire.push(WireMessage {
        role: "user".to_string(),
        content: format!(
            "{}, respond to the task, taking the conversation so far into account.",
            identity.name
        ),
    });
    wire
}
