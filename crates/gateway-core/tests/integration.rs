//! End-to-end orchestrator tests with a scripted provider and mock tool
//! servers.
//!
//! The provider adapter replays scripted rounds; the MCP transport is an
//! in-process mock, so every scenario exercises the real orchestrator,
//! bridge, registry, and (where relevant) ledger code paths.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use gateway_core::{
    FailureReason, Orchestrator, OrchestratorConfig, TurnEvent, TurnOutcome, TurnStatus,
};
use gateway_ledger::{Database, UsageLedger};
use gateway_mcp::{McpError, McpTransport, ToolBridge, ToolRegistry};
use gateway_provider::{
    CompletionRequest, CompletionResult, CompletionStream, Conversation, Message, ProviderAdapter,
    ProviderError, StreamEvent, ToolInvocation, Usage,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Scripted provider adapter
// ---------------------------------------------------------------------------

/// One scripted event within a stream.
#[derive(Debug, Clone)]
enum Ev {
    Delta(&'static str),
    ToolCall {
        id: &'static str,
        name: &'static str,
        args: Value,
    },
    Usage {
        prompt: u32,
        completion: u32,
    },
    Done,
    /// Emit a transient stream error and stop.
    StreamError,
    /// Produce nothing further until cancelled.
    Hang,
}

/// One scripted `stream()` call.
#[derive(Debug, Clone)]
enum Round {
    Events(Vec<Ev>),
    /// Fail before any event is produced.
    PreflightTransportError,
    PreflightConfigError,
}

/// Replays scripted rounds; each `stream()` call consumes the next one.
struct ScriptedAdapter {
    rounds: Mutex<VecDeque<Round>>,
}

impl ScriptedAdapter {
    fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _request: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
        Err(ProviderError::Config {
            reason: "generate is not scripted".into(),
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, ProviderError> {
        request.conversation.validate()?;

        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted");

        let events = match round {
            Round::PreflightTransportError => {
                return Err(ProviderError::Transport {
                    reason: "connection reset".into(),
                });
            }
            Round::PreflightConfigError => {
                return Err(ProviderError::Config {
                    reason: "missing api key".into(),
                });
            }
            Round::Events(events) => events,
        };

        let token = CancellationToken::new();
        let (tx, stream) = CompletionStream::channel(token.clone());

        tokio::spawn(async move {
            for ev in events {
                let event = match ev {
                    Ev::Delta(text) => StreamEvent::Delta(text.to_owned()),
                    Ev::ToolCall { id, name, args } => StreamEvent::ToolCall(ToolInvocation {
                        call_id: id.to_owned(),
                        name: name.to_owned(),
                        arguments: args,
                    }),
                    Ev::Usage { prompt, completion } => StreamEvent::Usage(Usage {
                        prompt_tokens: prompt,
                        completion_tokens: completion,
                    }),
                    Ev::Done => StreamEvent::Done { stop_reason: None },
                    Ev::StreamError => StreamEvent::Error(ProviderError::Stream {
                        reason: "connection dropped mid-stream".into(),
                    }),
                    Ev::Hang => {
                        token.cancelled().await;
                        return;
                    }
                };

                let sent = tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(event) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
        });

        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Mock tool server
// ---------------------------------------------------------------------------

/// An in-process MCP server with a `calc` tool and a deliberately slow one.
struct CalcServer;

#[async_trait]
impl McpTransport for CalcServer {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "calc-server", "version": "1.0"}
            })),
            "tools/list" => Ok(json!({
                "tools": [
                    {
                        "name": "calc",
                        "description": "Adds two integers",
                        "inputSchema": {
                            "type": "object",
                            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                            "required": ["a", "b"]
                        }
                    },
                    {
                        "name": "slow",
                        "description": "Never answers in time",
                        "inputSchema": {"type": "object"}
                    }
                ]
            })),
            "tools/call" => {
                let params = params.unwrap();
                match params["name"].as_str().unwrap() {
                    "calc" => {
                        let a = params["arguments"]["a"].as_i64().unwrap_or(0);
                        let b = params["arguments"]["b"].as_i64().unwrap_or(0);
                        Ok(json!({
                            "content": [{"type": "text", "text": (a + b).to_string()}],
                            "isError": false
                        }))
                    }
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!({"content": [], "isError": false}))
                    }
                    other => Err(McpError::ToolNotFound {
                        tool_name: other.to_owned(),
                    }),
                }
            }
            other => panic!("unexpected method {other}"),
        }
    }

    async fn close(&self) {}
}

async fn calc_bridge() -> Arc<ToolBridge> {
    let registry = Arc::new(
        ToolRegistry::with_transport("calc-server", Arc::new(CalcServer))
            .with_call_timeout(Duration::from_millis(100)),
    );
    registry.connect().await.unwrap();
    Arc::new(ToolBridge::new(vec![registry]))
}

fn empty_bridge() -> Arc<ToolBridge> {
    Arc::new(ToolBridge::new(Vec::new()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn user_turn(text: &str) -> Conversation {
    Conversation::from_messages(vec![Message::user(text)])
}

/// Drain a turn stream, returning the non-terminal events and the outcome.
async fn drain(
    mut stream: gateway_core::TurnStream,
) -> (Vec<TurnEvent>, TurnOutcome) {
    let mut events = Vec::new();
    let mut outcome = None;
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::Completed(o) => outcome = Some(o),
            other => events.push(other),
        }
    }
    (events, outcome.expect("missing terminal event"))
}

fn deltas(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Delta(d) => Some(d.as_str()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario A: plain completion, no tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_no_tools_streams_deltas_and_completes() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![Round::Events(vec![
        Ev::Delta("2+2 is "),
        Ev::Delta("4"),
        Ev::Usage {
            prompt: 9,
            completion: 5,
        },
        Ev::Done,
    ])]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("2+2?"), adapter, empty_bridge());
    let (events, outcome) = drain(stream).await;

    assert_eq!(deltas(&events), "2+2 is 4");
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, TurnEvent::ToolCalls(_) | TurnEvent::ToolResults { .. }))
    );
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 0);
    assert_eq!(outcome.text, "2+2 is 4");
    assert_eq!(outcome.usage.prompt_tokens, 9);
    assert_eq!(outcome.usage.completion_tokens, 5);

    // The final assistant message landed on the transcript.
    let last = outcome.messages.last().unwrap();
    assert_eq!(last.content, "2+2 is 4");
}

// ---------------------------------------------------------------------------
// Scenario B: one tool round
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_b_single_tool_round() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![
        Round::Events(vec![
            Ev::ToolCall {
                id: "tc_1",
                name: "calc",
                args: json!({"a": 2, "b": 2}),
            },
            Ev::Usage {
                prompt: 12,
                completion: 6,
            },
            Ev::Done,
        ]),
        Round::Events(vec![
            Ev::Delta("4"),
            Ev::Usage {
                prompt: 20,
                completion: 1,
            },
            Ev::Done,
        ]),
    ]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("2+2?"), adapter, calc_bridge().await);
    let (events, outcome) = drain(stream).await;

    // Tool calls surfaced as progress events, never as text.
    let tool_calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolCalls(calls) => Some(calls),
            _ => None,
        })
        .collect();
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0][0].name, "calc");

    assert_eq!(deltas(&events), "4");
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 1);

    // Usage accumulated across both rounds.
    assert_eq!(outcome.usage.prompt_tokens, 32);
    assert_eq!(outcome.usage.completion_tokens, 7);

    // Transcript: user, assistant(tool_calls), tool(result "4"), assistant.
    let messages = &outcome.messages;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].tool_calls.len(), 1);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("tc_1"));
    assert_eq!(messages[2].content, "4");
    assert_eq!(messages[3].content, "4");
}

// ---------------------------------------------------------------------------
// Scenario C: tool timeout is protocol data, not a turn failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_c_tool_timeout_is_not_fatal() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![
        Round::Events(vec![
            Ev::ToolCall {
                id: "tc_1",
                name: "slow",
                args: json!({}),
            },
            Ev::Done,
        ]),
        Round::Events(vec![Ev::Delta("the tool was unavailable"), Ev::Done]),
    ]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("try the slow tool"), adapter, calc_bridge().await);
    let (_, outcome) = drain(stream).await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 1);

    // The model saw a tool message carrying the timeout as its payload.
    let tool_message = outcome
        .messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("tc_1"))
        .unwrap();
    assert!(tool_message.content.contains("timed out"));
}

// ---------------------------------------------------------------------------
// Scenario D: cancellation mid-stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_d_cancel_mid_stream_settles_reported_usage() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![Round::Events(vec![
        Ev::Delta("one "),
        Ev::Delta("two "),
        Ev::Delta("three "),
        Ev::Usage {
            prompt: 10,
            completion: 3,
        },
        Ev::Hang,
    ])]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let mut stream = orchestrator.run(user_turn("count slowly"), adapter, empty_bridge());
    let handle = stream.handle();

    let mut seen = 0;
    let mut outcome = None;
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::Delta(_) => seen += 1,
            // The usage event proves the driver has recorded it; cancelling
            // here keeps the scenario deterministic.
            TurnEvent::Usage(_) => {
                handle.cancel();
                handle.cancel(); // idempotent
            }
            TurnEvent::Completed(o) => outcome = Some(o),
            _ => {}
        }
    }
    let outcome = outcome.expect("sequence must terminate after cancel");

    assert_eq!(seen, 3);
    assert_eq!(outcome.status, TurnStatus::Cancelled);
    assert_eq!(outcome.text, "one two three ");

    // The usage reported before cancellation still bills.
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    db.execute(|conn| UsageLedger::credit(conn, "u1", 100))
        .await
        .unwrap();

    let settlement = outcome.settlement("u1", "chat", "req-d");
    let ledger = UsageLedger::default();
    let record = db
        .execute_mut(move |conn| {
            let tx = conn.transaction()?;
            let record = ledger.settle(&tx, &settlement)?;
            tx.commit()?;
            Ok(record)
        })
        .await
        .unwrap();

    // 10 prompt * 1/1k rounds up to 1; 3 completion * 2/1k rounds up to 1.
    assert_eq!(record.amount, 2);
    assert_eq!(record.status, gateway_ledger::TurnStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// Scenario E: pathological tool loop hits the ceiling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_e_tool_loop_ceiling() {
    init_tracing();
    let tool_round = || {
        Round::Events(vec![
            Ev::ToolCall {
                id: "tc",
                name: "calc",
                args: json!({"a": 1, "b": 1}),
            },
            Ev::Done,
        ])
    };
    // Six consecutive tool-requesting rounds against a ceiling of three.
    let adapter = ScriptedAdapter::new((0..6).map(|_| tool_round()).collect());

    let orchestrator = Orchestrator::new(OrchestratorConfig {
        max_tool_rounds: 3,
        ..OrchestratorConfig::default()
    });
    let stream = orchestrator.run(user_turn("loop forever"), adapter, calc_bridge().await);
    let (events, outcome) = drain(stream).await;

    assert_eq!(
        outcome.status,
        TurnStatus::Failed(FailureReason::ToolLoopExceeded { rounds: 3 })
    );
    assert_eq!(outcome.rounds, 3);

    // The partial transcript survives: three executed rounds are visible.
    let result_rounds = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::ToolResults { .. }))
        .count();
    assert_eq!(result_rounds, 3);
    let tool_messages = outcome
        .messages
        .iter()
        .filter(|m| m.tool_call_id.is_some())
        .count();
    assert_eq!(tool_messages, 3);
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_preflight_error_retries_once_invisibly() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![
        Round::PreflightTransportError,
        Round::Events(vec![Ev::Delta("recovered"), Ev::Done]),
    ]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("hi"), adapter, empty_bridge());
    let (events, outcome) = drain(stream).await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(deltas(&events), "recovered");
}

#[tokio::test]
async fn second_transient_failure_in_a_round_is_fatal() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![
        Round::PreflightTransportError,
        Round::PreflightTransportError,
    ]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("hi"), adapter, empty_bridge());
    let (_, outcome) = drain(stream).await;

    assert!(matches!(
        outcome.status,
        TurnStatus::Failed(FailureReason::Provider(_))
    ));
}

#[tokio::test]
async fn config_error_is_fatal_and_never_retried() {
    init_tracing();
    // A second scripted round would panic the script if it were consumed.
    let adapter = ScriptedAdapter::new(vec![Round::PreflightConfigError]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("hi"), adapter, empty_bridge());
    let (_, outcome) = drain(stream).await;

    assert!(matches!(
        outcome.status,
        TurnStatus::Failed(FailureReason::Provider(reason)) if reason.contains("missing api key")
    ));
}

#[tokio::test]
async fn mid_stream_failure_after_forwarded_text_preserves_partial_output() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![Round::Events(vec![
        Ev::Delta("partial "),
        Ev::Delta("answer"),
        Ev::StreamError,
    ])]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("hi"), adapter, empty_bridge());
    let (events, outcome) = drain(stream).await;

    // No silent truncation: the caller saw the text and a terminal error.
    assert_eq!(deltas(&events), "partial answer");
    assert_eq!(outcome.text, "partial answer");
    assert!(matches!(
        outcome.status,
        TurnStatus::Failed(FailureReason::Provider(_))
    ));
}

// ---------------------------------------------------------------------------
// Count preservation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_tool_invocation_yields_exactly_one_result() {
    init_tracing();
    let adapter = ScriptedAdapter::new(vec![
        Round::Events(vec![
            Ev::ToolCall {
                id: "tc_1",
                name: "calc",
                args: json!({"a": 1, "b": 2}),
            },
            Ev::ToolCall {
                id: "tc_2",
                name: "no_such_tool",
                args: json!({}),
            },
            Ev::ToolCall {
                id: "tc_3",
                name: "calc",
                args: json!({"a": 3, "b": 4}),
            },
            Ev::Done,
        ]),
        Round::Events(vec![Ev::Delta("done"), Ev::Done]),
    ]);

    let orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let stream = orchestrator.run(user_turn("fan out"), adapter, calc_bridge().await);
    let (events, outcome) = drain(stream).await;

    assert_eq!(outcome.status, TurnStatus::Completed);

    // One ToolResults event reporting all three, in request order.
    let counts: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolResults { count, .. } => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![3]);

    let tool_messages: Vec<&Message> = outcome
        .messages
        .iter()
        .filter(|m| m.tool_call_id.is_some())
        .collect();
    assert_eq!(tool_messages.len(), 3);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("tc_1"));
    assert_eq!(tool_messages[0].content, "3");
    // The unknown tool produced an error payload, not a dropped call.
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("tc_2"));
    assert!(tool_messages[1].content.contains("tool not found"));
    assert_eq!(tool_messages[2].tool_call_id.as_deref(), Some("tc_3"));
    assert_eq!(tool_messages[2].content, "7");
}
