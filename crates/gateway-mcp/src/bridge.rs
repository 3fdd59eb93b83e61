//! Tool bridge: N registries, one namespace.
//!
//! The bridge concatenates every registry's tool listing into a single
//! toolset for the model, disambiguating name collisions deterministically
//! instead of dropping either tool (the model may already reference a tool
//! by a name the caller showed the user).  Invocations resolve back through
//! the same mapping, and expected failures come back as outcome data the
//! model must see, never as errors that kill the turn.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::registry::ToolRegistry;

/// Default bound on concurrently in-flight tool calls per round.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One tool in the merged namespace.
#[derive(Debug, Clone)]
pub struct BridgedTool {
    /// The name exposed to the model (possibly registry-prefixed).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
    /// Which registry owns the tool.
    pub registry_id: String,
    /// The tool's original name on its registry.
    pub source_name: String,
}

/// A merged toolset frozen for the duration of one turn.
///
/// Re-querying registries mid-loop would let the namespace shift underneath
/// the model; the orchestrator takes one snapshot per turn instead.
#[derive(Debug, Clone, Default)]
pub struct ToolsetSnapshot {
    tools: Vec<BridgedTool>,
}

impl ToolsetSnapshot {
    /// All tools in the merged namespace.
    pub fn tools(&self) -> &[BridgedTool] {
        &self.tools
    }

    /// Resolve an exposed name back to its owning tool.
    pub fn resolve(&self, name: &str) -> Option<&BridgedTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Number of tools in the snapshot.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A tool call to dispatch through the bridge.
#[derive(Debug, Clone)]
pub struct BridgeCall {
    /// Correlation id assigned by the model.
    pub call_id: String,
    /// The exposed tool name.
    pub name: String,
    /// Arguments to pass.
    pub arguments: Value,
}

/// The dispatched result for one call, paired to its `call_id`.
#[derive(Debug, Clone)]
pub struct ToolDispatch {
    /// The [`BridgeCall::call_id`] this result answers.
    pub call_id: String,
    /// Flattened textual content (or error description).
    pub content: String,
    /// Whether the call failed.
    pub is_error: bool,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Aggregates tool registries into one name-disambiguated toolset.
pub struct ToolBridge {
    registries: Vec<Arc<ToolRegistry>>,
    max_concurrency: usize,
}

impl ToolBridge {
    /// Create a bridge over the given registries.
    ///
    /// Registry order is significant: it decides which tool keeps a bare
    /// name on collision, so snapshots are deterministic.
    pub fn new(registries: Vec<Arc<ToolRegistry>>) -> Self {
        Self {
            registries,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Override the per-round concurrency bound (minimum 1).
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// The registries behind this bridge.
    pub fn registries(&self) -> &[Arc<ToolRegistry>] {
        &self.registries
    }

    /// Build the merged toolset from every registry's current listing.
    ///
    /// The first registry to claim a name keeps it bare; later claimants get
    /// a `<registry-id>__<name>` prefix.  Nothing is ever dropped.
    pub async fn snapshot(&self) -> Result<ToolsetSnapshot> {
        let mut tools: Vec<BridgedTool> = Vec::new();
        let mut used: HashSet<String> = HashSet::new();

        for registry in &self.registries {
            for tool in registry.list_tools().await? {
                let mut exposed = tool.name.clone();
                if used.contains(&exposed) {
                    exposed = format!("{}__{}", registry.id(), tool.name);
                }
                let mut suffix = 2;
                while used.contains(&exposed) {
                    exposed = format!("{}__{}_{suffix}", registry.id(), tool.name);
                    suffix += 1;
                }

                used.insert(exposed.clone());
                tools.push(BridgedTool {
                    name: exposed,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    registry_id: registry.id().to_owned(),
                    source_name: tool.name,
                });
            }
        }

        debug!(
            registries = self.registries.len(),
            tools = tools.len(),
            "built toolset snapshot"
        );
        Ok(ToolsetSnapshot { tools })
    }

    /// Dispatch one call, always producing a result for its `call_id`.
    ///
    /// Unknown names, schema-invalid arguments, timeouts, and transport
    /// failures all come back as error outcomes — valid protocol data for
    /// the model, not a fatal condition for the turn.
    pub async fn invoke(&self, snapshot: &ToolsetSnapshot, call: BridgeCall) -> ToolDispatch {
        let Some(tool) = snapshot.resolve(&call.name) else {
            warn!(tool = %call.name, "tool not in snapshot");
            return ToolDispatch {
                call_id: call.call_id,
                content: McpError::ToolNotFound {
                    tool_name: call.name,
                }
                .to_string(),
                is_error: true,
            };
        };

        if let Err(reason) = validate_arguments(&tool.input_schema, &call.arguments) {
            return ToolDispatch {
                call_id: call.call_id,
                content: McpError::InvalidArguments {
                    tool_name: call.name,
                    reason,
                }
                .to_string(),
                is_error: true,
            };
        }

        let Some(registry) = self
            .registries
            .iter()
            .find(|r| r.id() == tool.registry_id)
        else {
            // A snapshot can only name registries the bridge holds; reaching
            // here means the snapshot came from a different bridge.
            return ToolDispatch {
                call_id: call.call_id,
                content: format!("registry `{}` not available", tool.registry_id),
                is_error: true,
            };
        };

        match registry.call_tool(&tool.source_name, call.arguments).await {
            Ok(outcome) => ToolDispatch {
                call_id: call.call_id,
                content: outcome.content,
                is_error: outcome.is_error,
            },
            Err(e) => {
                warn!(tool = %tool.source_name, registry = %tool.registry_id, error = %e, "tool invocation failed");
                ToolDispatch {
                    call_id: call.call_id,
                    content: e.to_string(),
                    is_error: true,
                }
            }
        }
    }

    /// Dispatch a round of calls concurrently, bounded by the configured
    /// limit, returning exactly one result per call **in request order**.
    pub async fn invoke_all(
        &self,
        snapshot: &ToolsetSnapshot,
        calls: Vec<BridgeCall>,
    ) -> Vec<ToolDispatch> {
        // `buffered` preserves input order regardless of completion order,
        // so the model sees a deterministic transcript.
        stream::iter(calls)
            .map(|call| self.invoke(snapshot, call))
            .buffered(self.max_concurrency)
            .collect()
            .await
    }
}

/// Validate arguments against a tool's input schema.
///
/// A schema that fails to compile disables validation for that call rather
/// than failing it — the server remains the authority on its own schema.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    if !schema.is_object() {
        return Ok(());
    }

    let compiled = match JSONSchema::compile(schema) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "tool schema failed to compile, skipping validation");
            return Ok(());
        }
    };

    if let Err(errors) = compiled.validate(arguments) {
        let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(reasons.join("; "));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::McpTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// A transport serving a fixed tool list; `tools/call` echoes which
    /// server answered, optionally after a delay.
    struct MockServer {
        server: &'static str,
        tools: Vec<Value>,
        call_delay: Duration,
    }

    #[async_trait]
    impl McpTransport for MockServer {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
            match method {
                "initialize" => Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": self.server, "version": "1.0"}
                })),
                "tools/list" => Ok(json!({"tools": self.tools})),
                "tools/call" => {
                    if !self.call_delay.is_zero() {
                        tokio::time::sleep(self.call_delay).await;
                    }
                    let name = params.as_ref().unwrap()["name"].as_str().unwrap();
                    if name == "flaky" {
                        return Err(McpError::Timeout { seconds: 30 });
                    }
                    Ok(json!({
                        "content": [{
                            "type": "text",
                            "text": format!("{}:{}", self.server, name)
                        }],
                        "isError": false
                    }))
                }
                other => panic!("unexpected method {other}"),
            }
        }

        async fn close(&self) {}
    }

    fn tool_json(name: &str) -> Value {
        json!({
            "name": name,
            "description": format!("tool {name}"),
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "integer"}},
                "required": ["a"]
            }
        })
    }

    async fn bridge_with_overlap() -> ToolBridge {
        let alpha = Arc::new(ToolRegistry::with_transport(
            "alpha",
            Arc::new(MockServer {
                server: "alpha",
                tools: vec![tool_json("calc"), tool_json("search")],
                call_delay: Duration::ZERO,
            }),
        ));
        let beta = Arc::new(ToolRegistry::with_transport(
            "beta",
            Arc::new(MockServer {
                server: "beta",
                tools: vec![tool_json("calc"), tool_json("flaky")],
                call_delay: Duration::ZERO,
            }),
        ));
        alpha.connect().await.unwrap();
        beta.connect().await.unwrap();
        ToolBridge::new(vec![alpha, beta])
    }

    fn call(id: &str, name: &str) -> BridgeCall {
        BridgeCall {
            call_id: id.into(),
            name: name.into(),
            arguments: json!({"a": 1}),
        }
    }

    #[tokio::test]
    async fn colliding_names_both_survive_and_resolve() {
        let bridge = bridge_with_overlap().await;
        let snapshot = bridge.snapshot().await.unwrap();

        let names: Vec<&str> = snapshot.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calc", "search", "beta__calc", "flaky"]);

        // The bare name routes to the first registry, the prefixed one to
        // the second.
        let first = bridge.invoke(&snapshot, call("c1", "calc")).await;
        assert_eq!(first.content, "alpha:calc");
        let second = bridge.invoke(&snapshot, call("c2", "beta__calc")).await;
        assert_eq!(second.content, "beta:calc");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome_not_a_failure() {
        let bridge = bridge_with_overlap().await;
        let snapshot = bridge.snapshot().await.unwrap();

        let dispatch = bridge.invoke(&snapshot, call("c1", "nope")).await;
        assert_eq!(dispatch.call_id, "c1");
        assert!(dispatch.is_error);
        assert!(dispatch.content.contains("tool not found"));
    }

    #[tokio::test]
    async fn schema_invalid_arguments_rejected_before_dispatch() {
        let bridge = bridge_with_overlap().await;
        let snapshot = bridge.snapshot().await.unwrap();

        let dispatch = bridge
            .invoke(
                &snapshot,
                BridgeCall {
                    call_id: "c1".into(),
                    name: "calc".into(),
                    arguments: json!({"a": "not a number"}),
                },
            )
            .await;
        assert!(dispatch.is_error);
        assert!(dispatch.content.contains("invalid arguments"));
    }

    #[tokio::test]
    async fn transport_failures_fold_into_outcomes() {
        let bridge = bridge_with_overlap().await;
        let snapshot = bridge.snapshot().await.unwrap();

        let dispatch = bridge.invoke(&snapshot, call("c9", "flaky")).await;
        assert_eq!(dispatch.call_id, "c9");
        assert!(dispatch.is_error);
        assert!(dispatch.content.contains("timed out"));
    }

    #[tokio::test]
    async fn round_results_keep_request_order() {
        // The slow registry answers first in the request list; if results
        // arrived in completion order the fast call would overtake it.
        let slow = Arc::new(ToolRegistry::with_transport(
            "slow",
            Arc::new(MockServer {
                server: "slow",
                tools: vec![tool_json("a")],
                call_delay: Duration::from_millis(80),
            }),
        ));
        let fast = Arc::new(ToolRegistry::with_transport(
            "fast",
            Arc::new(MockServer {
                server: "fast",
                tools: vec![tool_json("b")],
                call_delay: Duration::ZERO,
            }),
        ));
        slow.connect().await.unwrap();
        fast.connect().await.unwrap();

        let bridge = ToolBridge::new(vec![slow, fast]).with_max_concurrency(4);
        let snapshot = bridge.snapshot().await.unwrap();

        let results = bridge
            .invoke_all(&snapshot, vec![call("c1", "a"), call("c2", "b")])
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].call_id, "c1");
        assert_eq!(results[0].content, "slow:a");
        assert_eq!(results[1].call_id, "c2");
        assert_eq!(results[1].content, "fast:b");
    }

    #[tokio::test]
    async fn every_call_gets_exactly_one_result() {
        let bridge = bridge_with_overlap().await;
        let snapshot = bridge.snapshot().await.unwrap();

        let calls = vec![
            call("c1", "calc"),
            call("c2", "nope"),
            call("c3", "flaky"),
            call("c4", "search"),
        ];
        let results = bridge.invoke_all(&snapshot, calls).await;

        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn concurrency_limit_floors_at_one() {
        let bridge = bridge_with_overlap().await.with_max_concurrency(0);
        let snapshot = bridge.snapshot().await.unwrap();
        let results = bridge.invoke_all(&snapshot, vec![call("c1", "calc")]).await;
        assert_eq!(results.len(), 1);
    }
}
