//! The completion orchestrator.
//!
//! Drives the multi-round "model speaks → may request tools → tools execute
//! → model resumes" loop, emitting one logical event stream to the caller.
//! Per request the state machine is
//! `Init → Streaming → (ToolRound)* → Finalizing → {Completed | Cancelled |
//! Failed}`; the caller observes it as [`TurnEvent`]s ending in exactly one
//! [`TurnEvent::Completed`].
//!
//! The orchestrator holds only the [`ProviderAdapter`] and [`ToolBridge`]
//! contracts — it never branches on provider identity.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gateway_ledger::{TurnSettlement, TurnStatus as LedgerTurnStatus};
use gateway_mcp::{BridgeCall, ToolBridge, ToolsetSnapshot};
use gateway_provider::{
    CompletionRequest, Conversation, GenerationParams, Message, ProviderAdapter, ProviderError,
    StreamEvent, ToolDescriptor, ToolInvocation, Usage,
};

/// Buffered events between the driver task and the caller.
const TURN_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-turn orchestration limits and generation parameters.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on tool rounds before the turn fails with a loop error.
    pub max_tool_rounds: u32,

    /// Model identifier override (empty selects the adapter's default).
    pub model: String,

    /// Pass-through generation parameters.
    pub params: GenerationParams,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            model: String::new(),
            params: GenerationParams::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Turn events and outcome
// ---------------------------------------------------------------------------

/// A tool call surfaced for UI progress indication (never as text).
#[derive(Debug, Clone)]
pub struct ToolCallInfo {
    /// Correlation id assigned by the model.
    pub call_id: String,
    /// The exposed tool name.
    pub name: String,
}

/// One event in the orchestrator's caller-facing stream.
#[derive(Debug)]
pub enum TurnEvent {
    /// An incremental chunk of generated text, forwarded without buffering.
    Delta(String),

    /// The model requested tools; a tool round is starting.
    ToolCalls(Vec<ToolCallInfo>),

    /// A tool round finished; its results were appended to the transcript.
    ToolResults {
        /// 1-based index of the round that finished.
        round: u32,
        /// How many results were appended (one per requested call).
        count: usize,
    },

    /// Provider-reported usage for one stream within the turn.
    Usage(Usage),

    /// Terminal event: how the turn concluded plus the full transcript.
    Completed(TurnOutcome),
}

/// Why a turn failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The provider failed terminally (after any permitted retry).
    Provider(String),

    /// The toolset could not be discovered.
    Toolset(String),

    /// The model kept requesting tools past the configured ceiling.
    ToolLoopExceeded {
        /// Rounds that had executed when the ceiling was hit.
        rounds: u32,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(reason) => write!(f, "provider failure: {reason}"),
            Self::Toolset(reason) => write!(f, "toolset failure: {reason}"),
            Self::ToolLoopExceeded { rounds } => {
                write!(f, "tool-calling loop exceeded after {rounds} rounds")
            }
        }
    }
}

/// Terminal state of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// The model produced a final assistant message.
    Completed,
    /// The caller cancelled; partial output stands.
    Cancelled,
    /// A hard error ended the turn; partial output stands.
    Failed(FailureReason),
}

impl TurnStatus {
    /// The status recorded on this turn's usage record.
    pub fn ledger_status(&self) -> LedgerTurnStatus {
        match self {
            Self::Completed => LedgerTurnStatus::Completed,
            Self::Cancelled => LedgerTurnStatus::Cancelled,
            Self::Failed(_) => LedgerTurnStatus::Failed,
        }
    }
}

/// Everything the caller needs after a turn concludes.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Unique id of this turn.
    pub turn_id: Uuid,

    /// How the turn ended.
    pub status: TurnStatus,

    /// All text forwarded to the caller, including partial output of failed
    /// or cancelled turns — no silent truncation.
    pub text: String,

    /// The full transcript: input history plus every assistant/tool message
    /// appended during the turn.
    pub messages: Vec<Message>,

    /// Provider-reported usage summed across rounds.  Zero when the
    /// provider reported nothing before the turn ended.
    pub usage: Usage,

    /// Tool rounds that executed.
    pub rounds: u32,
}

impl TurnOutcome {
    /// Build the ledger input for this turn.
    ///
    /// `source` and `association_no` are the caller's explicit identity for
    /// the deduction; the gateway never infers them.
    pub fn settlement(
        &self,
        user_id: impl Into<String>,
        source: impl Into<String>,
        association_no: impl Into<String>,
    ) -> TurnSettlement {
        TurnSettlement {
            user_id: user_id.into(),
            source: source.into(),
            association_no: association_no.into(),
            prompt_tokens: self.usage.prompt_tokens,
            completion_tokens: self.usage.completion_tokens,
            status: self.status.ledger_status(),
        }
    }
}

// ---------------------------------------------------------------------------
// Turn stream
// ---------------------------------------------------------------------------

/// Idempotent cancel capability for a running turn.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    token: CancellationToken,
}

impl TurnHandle {
    /// Cancel the turn.  The active provider stream stops, in-flight tool
    /// calls finish, and no new round starts.  Safe to call repeatedly.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The caller-facing event sequence for one turn.
pub struct TurnStream {
    events: mpsc::Receiver<TurnEvent>,
    handle: TurnHandle,
}

impl TurnStream {
    /// Receive the next event, or `None` after the terminal event.
    pub async fn next(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Clone the cancel capability.
    pub fn handle(&self) -> TurnHandle {
        self.handle.clone()
    }

    /// Cancel the turn in place.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs completion turns against a provider and the bridged toolset.
pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator with the given configuration.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Start one turn.  Returns immediately; the loop runs as its own task
    /// and reports through the returned stream.
    pub fn run(
        &self,
        conversation: Conversation,
        adapter: Arc<dyn ProviderAdapter>,
        bridge: Arc<ToolBridge>,
    ) -> TurnStream {
        let token = CancellationToken::new();
        let (tx, events) = mpsc::channel(TURN_CHANNEL_CAPACITY);

        let driver = Driver {
            config: self.config.clone(),
            adapter,
            bridge,
            tx,
            token: token.clone(),
            turn_id: Uuid::now_v7(),
            conversation,
            text: String::new(),
            usage: Usage::default(),
            rounds: 0,
        };
        tokio::spawn(driver.run());

        TurnStream {
            events,
            handle: TurnHandle { token },
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Result of one streaming attempt.
enum StreamRun {
    /// The provider finished the stream normally.
    Completed {
        round_text: String,
        calls: Vec<ToolInvocation>,
    },
    /// Cancellation ended the stream.
    Cancelled,
    /// The stream failed; `forwarded` records whether any delta of this
    /// attempt already reached the caller.
    Failed {
        error: ProviderError,
        forwarded: bool,
    },
}

/// Result of one round (streaming attempt plus its single permitted retry).
enum RoundResult {
    Finished {
        round_text: String,
        calls: Vec<ToolInvocation>,
    },
    Cancelled,
    Failed(FailureReason),
}

/// Owns the state of one running turn.
struct Driver {
    config: OrchestratorConfig,
    adapter: Arc<dyn ProviderAdapter>,
    bridge: Arc<ToolBridge>,
    tx: mpsc::Sender<TurnEvent>,
    token: CancellationToken,
    turn_id: Uuid,
    conversation: Conversation,
    text: String,
    usage: Usage,
    rounds: u32,
}

impl Driver {
    /// Run the turn to its terminal state and emit the outcome.
    async fn run(mut self) {
        let status = self.drive().await;

        info!(
            turn_id = %self.turn_id,
            status = ?status,
            rounds = self.rounds,
            prompt_tokens = self.usage.prompt_tokens,
            completion_tokens = self.usage.completion_tokens,
            "turn concluded"
        );

        let outcome = TurnOutcome {
            turn_id: self.turn_id,
            status,
            text: self.text,
            messages: self.conversation.messages,
            usage: self.usage,
            rounds: self.rounds,
        };
        // The caller may already be gone; the outcome is still final.
        let _ = self.tx.send(TurnEvent::Completed(outcome)).await;
    }

    /// The state machine proper.
    async fn drive(&mut self) -> TurnStatus {
        if let Err(e) = self.conversation.validate() {
            return TurnStatus::Failed(FailureReason::Provider(e.to_string()));
        }

        // One toolset snapshot per turn: the namespace must not shift
        // between rounds.
        let snapshot = if self.bridge.registries().is_empty() {
            ToolsetSnapshot::default()
        } else {
            match self.bridge.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => return TurnStatus::Failed(FailureReason::Toolset(e.to_string())),
            }
        };
        let tools: Vec<ToolDescriptor> = snapshot
            .tools()
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        info!(
            turn_id = %self.turn_id,
            tools = tools.len(),
            max_rounds = self.config.max_tool_rounds,
            "turn started"
        );

        loop {
            let (round_text, calls) = match self.stream_round(&tools).await {
                RoundResult::Finished { round_text, calls } => (round_text, calls),
                RoundResult::Cancelled => return TurnStatus::Cancelled,
                RoundResult::Failed(reason) => return TurnStatus::Failed(reason),
            };

            // Terminal, successful path: a final assistant message.
            if calls.is_empty() {
                self.conversation.push(Message::assistant(round_text));
                return TurnStatus::Completed;
            }

            if self.rounds >= self.config.max_tool_rounds {
                warn!(turn_id = %self.turn_id, rounds = self.rounds, "tool loop ceiling hit");
                return TurnStatus::Failed(FailureReason::ToolLoopExceeded {
                    rounds: self.rounds,
                });
            }

            // A cancellation that raced the stream's end must not start a
            // new round.
            if self.token.is_cancelled() {
                return TurnStatus::Cancelled;
            }

            self.conversation
                .push(Message::assistant_tool_calls(round_text, calls.clone()));

            let infos: Vec<ToolCallInfo> = calls
                .iter()
                .map(|c| ToolCallInfo {
                    call_id: c.call_id.clone(),
                    name: c.name.clone(),
                })
                .collect();
            if !self.emit(TurnEvent::ToolCalls(infos)).await {
                return TurnStatus::Cancelled;
            }

            // Every invocation produces exactly one result, in request
            // order; in-flight calls run to completion even under
            // cancellation so no side effect is left ambiguous.
            let bridge_calls: Vec<BridgeCall> = calls
                .into_iter()
                .map(|c| BridgeCall {
                    call_id: c.call_id,
                    name: c.name,
                    arguments: c.arguments,
                })
                .collect();
            let dispatches = self.bridge.invoke_all(&snapshot, bridge_calls).await;

            let count = dispatches.len();
            for dispatch in dispatches {
                self.conversation
                    .push(Message::tool_result(dispatch.call_id, dispatch.content));
            }
            self.rounds += 1;
            debug!(turn_id = %self.turn_id, round = self.rounds, count, "tool round finished");

            if !self
                .emit(TurnEvent::ToolResults {
                    round: self.rounds,
                    count,
                })
                .await
            {
                return TurnStatus::Cancelled;
            }
            if self.token.is_cancelled() {
                return TurnStatus::Cancelled;
            }
        }
    }

    /// Stream one round, retrying once on a transient failure — but only
    /// when nothing of this round reached the caller yet, so the retry is
    /// invisible except as latency.
    async fn stream_round(&mut self, tools: &[ToolDescriptor]) -> RoundResult {
        let mut retried = false;

        loop {
            match self.attempt_stream(tools).await {
                StreamRun::Completed { round_text, calls } => {
                    return RoundResult::Finished { round_text, calls };
                }
                StreamRun::Cancelled => return RoundResult::Cancelled,
                StreamRun::Failed { error, forwarded } => {
                    if !retried && !forwarded && error.is_transient() {
                        retried = true;
                        warn!(
                            turn_id = %self.turn_id,
                            error = %error,
                            "transient stream failure, retrying round"
                        );
                        continue;
                    }
                    return RoundResult::Failed(FailureReason::Provider(error.to_string()));
                }
            }
        }
    }

    /// One pass through the provider stream.
    async fn attempt_stream(&mut self, tools: &[ToolDescriptor]) -> StreamRun {
        let request = CompletionRequest {
            model: self.config.model.clone(),
            conversation: self.conversation.clone(),
            tools: tools.to_vec(),
            params: self.config.params,
        };

        let mut stream = match self.adapter.stream(&request).await {
            Ok(stream) => stream,
            Err(error) => {
                return StreamRun::Failed {
                    error,
                    forwarded: false,
                };
            }
        };
        let cancel = stream.cancel_handle();

        let mut round_text = String::new();
        let mut calls: Vec<ToolInvocation> = Vec::new();
        let mut forwarded = false;

        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => {
                    cancel.cancel();
                    return StreamRun::Cancelled;
                }
                event = stream.next() => event,
            };

            match event {
                None => {
                    // The producer closed without a terminal event.
                    return if self.token.is_cancelled() {
                        StreamRun::Cancelled
                    } else {
                        StreamRun::Failed {
                            error: ProviderError::Stream {
                                reason: "stream ended without terminal event".into(),
                            },
                            forwarded,
                        }
                    };
                }
                Some(StreamEvent::Delta(delta)) => {
                    self.text.push_str(&delta);
                    round_text.push_str(&delta);
                    forwarded = true;
                    if !self.emit(TurnEvent::Delta(delta)).await {
                        cancel.cancel();
                        return StreamRun::Cancelled;
                    }
                }
                Some(StreamEvent::ToolCall(call)) => {
                    // Buffered for the round; surfaced to the caller only as
                    // a progress event once the round starts.
                    calls.push(call);
                }
                Some(StreamEvent::Usage(usage)) => {
                    self.usage.prompt_tokens += usage.prompt_tokens;
                    self.usage.completion_tokens += usage.completion_tokens;
                    if !self.emit(TurnEvent::Usage(usage)).await {
                        cancel.cancel();
                        return StreamRun::Cancelled;
                    }
                }
                Some(StreamEvent::Done { .. }) => {
                    return StreamRun::Completed { round_text, calls };
                }
                Some(StreamEvent::Error(error)) => {
                    return StreamRun::Failed { error, forwarded };
                }
            }
        }
    }

    /// Send an event to the caller.  Returns `false` when the caller has
    /// gone away, which the driver treats as cancellation.
    async fn emit(&self, event: TurnEvent) -> bool {
        let sent = tokio::select! {
            _ = self.token.cancelled() => return false,
            sent = self.tx.send(event) => sent,
        };
        if sent.is_err() {
            self.token.cancel();
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
