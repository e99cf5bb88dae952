//! The conversation engine: turn scheduling, message routing, lifecycle.
//!
//! An [`Orchestrator`] owns the canonical transcript and drives turns until a
//! termination predicate fires.  Each loop iteration drains at most one
//! externally injected message, selects the next speaker according to the
//! configured [`Mode`], snapshots the transcript, invokes the speaker under
//! the rate-limit and turn-timeout gates, appends the produced message,
//! dispatches hooks, and sleeps for the inter-turn delay.
//!
//! # Modes
//!
//! - **round-robin**: roster order, cycling from the first entry.
//! - **reactive**: uniformly random among agents other than the last
//!   speaker.
//! - **free-form**: every agent speaks once per turn, concurrently, against
//!   the same pre-turn snapshot; responses append in roster order after the
//!   fan-out joins, so the transcript stays deterministic.
//!
//! # Example
//!
//! ```rust,no_run
//! use roundtable::config::Config;
//! use roundtable::orchestrator::Orchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_path("conversation.yaml")?;
//! let mut orchestrator = Orchestrator::from_config(&config).await?;
//!
//! let report = orchestrator.run(CancellationToken::new()).await?;
//! println!("{} messages, outcome {:?}", report.messages.len(), report.outcome);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::roundtable::adapters;
use crate::roundtable::agent::Agent;
use crate::roundtable::config::{Config, Mode, OrchestratorConfig};
use crate::roundtable::error::{exit_code, AgentError, OrchestratorError};
use crate::roundtable::hooks::MessageHook;
use crate::roundtable::message::{Message, TokenUsage, TurnMetrics};
use crate::roundtable::ratelimit::RateLimiter;
use crate::roundtable::registry;
use crate::roundtable::summary;

/// Default capacity of the injection queue.
const INJECTION_CAPACITY: usize = 64;

/// Consecutive recoverable failures tolerated per agent before the
/// conversation ends with an error.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Returned by [`OrchestratorHandle::inject`] when the bounded queue
/// overflowed.  The new message was still queued; the oldest pending entry
/// was dropped to make room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFull;

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "injection queue full; dropped the oldest pending message")
    }
}

impl std::error::Error for QueueFull {}

/// Thread-safe bounded FIFO of injected messages awaiting splice.
struct InjectionQueue {
    pending: Mutex<VecDeque<Message>>,
    capacity: usize,
}

impl InjectionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn push(&self, message: Message) -> Result<(), QueueFull> {
        let mut pending = self.pending.lock().expect("injection queue poisoned");
        if pending.len() >= self.capacity {
            pending.pop_front();
            pending.push_back(message);
            log::warn!("injection queue overflowed; dropped the oldest pending message");
            return Err(QueueFull);
        }
        pending.push_back(message);
        Ok(())
    }

    fn pop(&self) -> Option<Message> {
        self.pending.lock().expect("injection queue poisoned").pop_front()
    }
}

/// Cloneable intake handle for external collaborators (chat-room bridges,
/// human-in-the-loop frontends).
#[derive(Clone)]
pub struct OrchestratorHandle {
    queue: Arc<InjectionQueue>,
}

impl OrchestratorHandle {
    /// Queue a message for splicing into the transcript before the next
    /// speaker selection.  Thread-safe; see [`QueueFull`] for the overflow
    /// policy.
    ///
    /// The injected author is treated as the previous speaker, so the
    /// selector picks someone else next — a chat-room human interjecting
    /// pushes the conversation onward rather than repeating the same agent.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use roundtable::message::Message;
    /// # fn example(handle: roundtable::orchestrator::OrchestratorHandle) {
    /// let msg = Message::external("matrix:@sam", "Sam", "What about latency?");
    /// if handle.inject(msg).is_err() {
    ///     eprintln!("injection queue overflowed");
    /// }
    /// # }
    /// ```
    pub fn inject(&self, message: Message) -> Result<(), QueueFull> {
        self.queue.push(message)
    }
}

/// How a conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The turn budget was reached.
    Completed,
    /// The host tripped the cancellation token.
    Interrupted,
    /// An agent failed fatally: `(agent name, reason)`.
    Failed(String, String),
}

impl Outcome {
    /// The exit code CLI collaborators surface for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed => exit_code::OK,
            Outcome::Interrupted => exit_code::INTERRUPTED,
            Outcome::Failed(_, _) => exit_code::CONVERSATION,
        }
    }

    fn terminal_message(&self) -> String {
        match self {
            Outcome::Completed => "Completed.".to_string(),
            Outcome::Interrupted => "Interrupted.".to_string(),
            Outcome::Failed(agent, reason) => {
                format!("Ended with error: {}: {}", agent, reason)
            }
        }
    }
}

/// Everything a caller needs after [`Orchestrator::run`] returns.
#[derive(Debug, Clone)]
pub struct ConversationReport {
    /// Random identifier assigned at construction; appears in logs and
    /// snapshots.
    pub conversation_id: String,
    /// How the conversation ended.
    pub outcome: Outcome,
    /// The final transcript.
    pub messages: Vec<Message>,
    /// Scheduled turns, including failed ones.
    pub total_turns: u32,
    /// Transcript length.
    pub total_messages: usize,
    /// Wall-clock duration of the whole run.
    pub total_duration_ms: u64,
    /// RFC 3339 stamp taken when `run` began.
    pub started_at: String,
    /// 1-2 sentence summary, when summary generation ran and succeeded.
    pub short_summary: Option<String>,
    /// Comprehensive summary, when summary generation ran and succeeded.
    pub long_summary: Option<String>,
}

/// Result of one speaker invocation inside the turn loop.
struct TurnResult {
    content: String,
    usage: Option<TokenUsage>,
    duration_ms: u64,
    completed_at: i64,
}

/// The conversation engine.  See the module docs for the lifecycle.
pub struct Orchestrator {
    conversation_id: String,
    agents: Vec<Arc<dyn Agent>>,
    config: OrchestratorConfig,
    limiter: Arc<RateLimiter>,
    hooks: Vec<Arc<dyn MessageHook>>,
    queue: Arc<InjectionQueue>,
    /// Config reused for the transient summary agent when none is configured.
    summary_fallback: Option<crate::roundtable::config::AgentConfig>,
    messages: Vec<Message>,
    turn_index: u32,
    last_speaker_id: Option<String>,
    rr_cursor: usize,
    failures: HashMap<String, u32>,
    last_timestamp: i64,
}

impl Orchestrator {
    /// Create an orchestrator over an already-built roster.
    ///
    /// Fails on duplicate agent ids; an empty roster is tolerated until
    /// [`run`](Orchestrator::run).  Use this constructor when the agents are
    /// built by hand (or mocked); [`from_config`](Orchestrator::from_config)
    /// covers the declarative path.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use roundtable::adapters;
    /// use roundtable::config::{AgentConfig, OrchestratorConfig};
    /// use roundtable::orchestrator::Orchestrator;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut cfg = AgentConfig::new("scout", "process");
    /// cfg.command = Some("claude".to_string());
    /// let scout = adapters::build(&cfg).await?;
    ///
    /// let orchestrator = Orchestrator::new(
    ///     vec![Arc::from(scout)],
    ///     OrchestratorConfig::default(),
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        agents: Vec<Arc<dyn Agent>>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let mut seen = std::collections::HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.id().to_string()) {
                return Err(OrchestratorError::DuplicateAgent(agent.id().to_string()));
            }
        }
        Ok(Self {
            conversation_id: Uuid::new_v4().to_string(),
            agents,
            config,
            limiter: Arc::new(RateLimiter::new()),
            hooks: Vec::new(),
            queue: Arc::new(InjectionQueue::new(INJECTION_CAPACITY)),
            summary_fallback: None,
            messages: Vec::new(),
            turn_index: 0,
            last_speaker_id: None,
            rr_cursor: 0,
            failures: HashMap::new(),
            last_timestamp: 0,
        })
    }

    /// Build the roster from a validated [`Config`] and wire up the
    /// transcript logger when one is configured.
    pub async fn from_config(config: &Config) -> Result<Self, OrchestratorError> {
        config
            .validate()
            .map_err(|e| OrchestratorError::Startup(e.to_string()))?;

        let mut agents: Vec<Arc<dyn Agent>> = Vec::with_capacity(config.agents.len());
        for agent_cfg in &config.agents {
            let agent = adapters::build(agent_cfg)
                .await
                .map_err(|e| OrchestratorError::Startup(format!("agent '{}': {}", agent_cfg.id, e)))?;
            agents.push(Arc::from(agent));
        }

        let mut orchestrator = Self::new(agents, config.orchestrator.clone())?;
        orchestrator.summary_fallback = config.agents.first().cloned();
        if let Some(logging) = &config.logging {
            let logger = crate::roundtable::hooks::TranscriptLogger::new(logging)
                .map_err(|e| OrchestratorError::Startup(format!("transcript log: {}", e)))?;
            orchestrator.add_hook(Arc::new(logger));
        }
        Ok(orchestrator)
    }

    /// Register an observer invoked once per finalized message.  Must be
    /// called before [`run`](Orchestrator::run).
    pub fn add_hook(&mut self, hook: Arc<dyn MessageHook>) {
        self.hooks.push(hook);
    }

    /// Cloneable injection intake for external collaborators.
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// The generated conversation identifier.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Read-only view of the transcript so far.
    pub fn transcript(&self) -> &[Message] {
        &self.messages
    }

    /// Append a message, enforcing timestamp monotonicity, and dispatch
    /// hooks.  Hook errors are logged and swallowed.
    async fn append(&mut self, mut message: Message) {
        if message.timestamp < self.last_timestamp {
            message.timestamp = self.last_timestamp;
        }
        self.last_timestamp = message.timestamp;
        self.messages.push(message);
        let message = self.messages.last().expect("just pushed");
        for hook in &self.hooks {
            if let Err(e) = hook.on_message(message).await {
                log::warn!("hook failed for message from '{}': {}", message.agent_id, e);
            }
        }
    }

    /// Drive the conversation to termination.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<ConversationReport, OrchestratorError> {
        if self.agents.is_empty() {
            return Err(OrchestratorError::NoAgents);
        }
        let started_at = Utc::now();
        let start = Instant::now();
        log::info!(
            "conversation {} starting: {} agents, mode {:?}, max_turns {}",
            self.conversation_id,
            self.agents.len(),
            self.config.mode,
            self.config.max_turns
        );

        // Seed: initial prompt, then one announcement per agent in roster
        // order.
        if !self.config.initial_prompt.is_empty() {
            let seed = Message::host(self.config.initial_prompt.clone());
            self.append(seed).await;
        }
        for agent in self.agents.clone() {
            let announcement = Message::announcement(
                agent.id(),
                agent.name(),
                agent.agent_type(),
                agent.announce(),
            );
            self.append(announcement).await;
        }

        let outcome = self.turn_loop(&cancel).await;

        self.append(Message::host(outcome.terminal_message())).await;

        let (short_summary, long_summary) = if outcome == Outcome::Completed
            && self.config.summary.enabled
        {
            let summary_cfg = self
                .config
                .summary
                .agent
                .clone()
                .or_else(|| self.summary_fallback.clone());
            match summary_cfg {
                Some(cfg) => match summary::generate(&cancel, &cfg, &self.messages).await {
                    Ok((short, long)) => (Some(short), Some(long)),
                    Err(e) => {
                        log::warn!("summary generation failed: {}", e);
                        (None, None)
                    }
                },
                None => (None, None),
            }
        } else {
            (None, None)
        };

        log::info!(
            "conversation {} ended: {:?} after {} turns",
            self.conversation_id,
            outcome,
            self.turn_index
        );

        Ok(ConversationReport {
            conversation_id: self.conversation_id.clone(),
            outcome,
            messages: self.messages.clone(),
            total_turns: self.turn_index,
            total_messages: self.messages.len(),
            total_duration_ms: start.elapsed().as_millis() as u64,
            started_at: started_at.to_rfc3339(),
            short_summary,
            long_summary,
        })
    }

    /// The scheduling loop; returns how the conversation ended.
    async fn turn_loop(&mut self, cancel: &CancellationToken) -> Outcome {
        loop {
            if cancel.is_cancelled() {
                return Outcome::Interrupted;
            }
            if self.config.max_turns > 0 && self.turn_index >= self.config.max_turns {
                return Outcome::Completed;
            }

            // Splice at most one injected message, treating its author as the
            // previous speaker so selection moves to someone else.
            if let Some(injected) = self.queue.pop() {
                self.last_speaker_id = Some(injected.agent_id.clone());
                if let Some(pos) = self.agents.iter().position(|a| a.id() == injected.agent_id) {
                    self.rr_cursor = (pos + 1) % self.agents.len();
                }
                log::debug!("spliced injected message from '{}'", injected.agent_id);
                self.append(injected).await;
            }

            let fatal = match self.config.mode {
                Mode::FreeForm => self.free_form_turn(cancel).await,
                Mode::RoundRobin | Mode::Reactive => {
                    let speaker = self.select_speaker();
                    self.single_turn(cancel, speaker).await
                }
            };
            if cancel.is_cancelled() {
                return Outcome::Interrupted;
            }
            if let Some((agent_name, reason)) = fatal {
                return Outcome::Failed(agent_name, reason);
            }

            self.turn_index += 1;

            let delay = self.config.response_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Outcome::Interrupted,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Pick the next speaker for round-robin/reactive modes.
    fn select_speaker(&mut self) -> Arc<dyn Agent> {
        match self.config.mode {
            Mode::RoundRobin => {
                let index = self.rr_cursor % self.agents.len();
                self.rr_cursor = (index + 1) % self.agents.len();
                Arc::clone(&self.agents[index])
            }
            _ => {
                let candidates: Vec<usize> = self
                    .agents
                    .iter()
                    .enumerate()
                    .filter(|(_, agent)| match &self.last_speaker_id {
                        Some(last) => agent.id() != last,
                        None => true,
                    })
                    .map(|(i, _)| i)
                    .collect();
                let pool = if candidates.is_empty() {
                    (0..self.agents.len()).collect()
                } else {
                    candidates
                };
                let pick = pool[rand::thread_rng().gen_range(0..pool.len())];
                Arc::clone(&self.agents[pick])
            }
        }
    }

    /// Run one speaker under the rate-limit and turn-timeout gates, append
    /// its message, and account failures.  Returns the fatal `(name, reason)`
    /// pair when the agent crossed the consecutive-failure limit.
    async fn single_turn(
        &mut self,
        cancel: &CancellationToken,
        agent: Arc<dyn Agent>,
    ) -> Option<(String, String)> {
        let snapshot = Arc::new(self.messages.clone());
        let result = invoke_agent(
            Arc::clone(&agent),
            snapshot,
            Arc::clone(&self.limiter),
            self.config.turn_timeout(),
            cancel,
        )
        .await;
        self.settle_turn(agent, result).await
    }

    /// Free-form: every agent speaks once against the same pre-turn
    /// snapshot; results append in roster order regardless of finish order.
    async fn free_form_turn(&mut self, cancel: &CancellationToken) -> Option<(String, String)> {
        let snapshot = Arc::new(self.messages.clone());
        let timeout = self.config.turn_timeout();

        let mut tasks = Vec::with_capacity(self.agents.len());
        for agent in self.agents.clone() {
            let snapshot = Arc::clone(&snapshot);
            let limiter = Arc::clone(&self.limiter);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                invoke_agent(agent, snapshot, limiter, timeout, &cancel).await
            }));
        }

        let mut fatal = None;
        for (index, task) in tasks.into_iter().enumerate() {
            let agent = Arc::clone(&self.agents[index]);
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(AgentError::Transient(format!("task join error: {}", e))),
            };
            if let Some(failure) = self.settle_turn(agent, result).await {
                fatal.get_or_insert(failure);
            }
        }
        fatal
    }

    /// Append a successful turn or account a failure.
    async fn settle_turn(
        &mut self,
        agent: Arc<dyn Agent>,
        result: Result<TurnResult, AgentError>,
    ) -> Option<(String, String)> {
        match result {
            Ok(turn) => {
                let model = agent.model().unwrap_or("").to_string();
                let (input, output, total) = match &turn.usage {
                    Some(usage) => (usage.input_tokens, usage.output_tokens, usage.total_tokens),
                    None => (0, 0, 0),
                };
                let estimated_cost = if model.is_empty() || total == 0 {
                    0.0
                } else {
                    registry::global().estimate_cost(&model, input, output)
                };
                let mut message =
                    Message::from_agent(agent.id(), agent.name(), agent.agent_type(), turn.content)
                        .with_metrics(TurnMetrics {
                            duration_ms: turn.duration_ms,
                            input_tokens: input,
                            output_tokens: output,
                            total_tokens: total,
                            model,
                            estimated_cost,
                        });
                message.timestamp = turn.completed_at;
                self.append(message).await;
                self.failures.insert(agent.id().to_string(), 0);
                self.last_speaker_id = Some(agent.id().to_string());
                None
            }
            Err(AgentError::Cancelled) => None,
            Err(e) => {
                let count = self.failures.entry(agent.id().to_string()).or_insert(0);
                *count += 1;
                log::warn!(
                    "turn failed for '{}' ({} consecutive): {} [{}]",
                    agent.id(),
                    count,
                    e,
                    e.kind()
                );
                if *count >= MAX_CONSECUTIVE_FAILURES {
                    Some((agent.name().to_string(), e.to_string()))
                } else {
                    None
                }
            }
        }
    }
}

/// Gate one invocation behind the rate limiter and the turn timeout.
///
/// The speaker runs under a child token derived from the conversation token;
/// on timeout the child is cancelled so subprocess adapters kill their
/// children and HTTP requests abort.
async fn invoke_agent(
    agent: Arc<dyn Agent>,
    snapshot: Arc<Vec<Message>>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TurnResult, AgentError> {
    let deadline = Instant::now() + timeout;
    limiter
        .acquire(
            agent.id(),
            agent.rate_limit(),
            agent.rate_limit_burst(),
            deadline,
            cancel,
        )
        .await?;

    let child = cancel.child_token();
    let start = Instant::now();
    let result = tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {
            child.cancel();
            Err(AgentError::Timeout(format!(
                "agent '{}' exceeded the {:?} turn timeout",
                agent.id(),
                timeout
            )))
        }
        result = agent.send_message(&child, snapshot.as_slice()) => result,
    };

    let content = result?;
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    Ok(TurnResult {
        content,
        usage: agent.last_usage().await,
        duration_ms: start.elapsed().as_millis() as u64,
        completed_at: Utc::now().timestamp(),
    })
}
