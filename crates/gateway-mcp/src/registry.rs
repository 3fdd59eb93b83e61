//! Tool registry: one connection to one MCP tool server.
//!
//! The registry owns the session state machine
//! (`Disconnected → Connecting → Connected → Disconnected`), runs the
//! `initialize` handshake, discovers tools, and dispatches invocations with
//! a per-call timeout.  It deliberately does not cache tool listings — the
//! bridge snapshots them per turn, so repeated `list_tools` calls always
//! reflect the server's current state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{McpError, Result};
use crate::rpc::{
    CallToolResult, INVALID_PARAMS, InitializeResult, ListToolsResult, McpTool, ServerInfo,
    initialize_params,
};
use crate::transport::{HttpTransport, McpTransport, StdioTransport};

/// Default per-call timeout, sized for interactive use.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How to reach one tool server.
#[derive(Debug, Clone)]
pub enum ToolServerConfig {
    /// Spawn a child process and speak newline-delimited JSON-RPC on stdio.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments for the executable.
        args: Vec<String>,
        /// Extra environment variables for the process.
        env: HashMap<String, String>,
    },
    /// POST JSON-RPC to an HTTP endpoint.
    Http {
        /// Endpoint URL.
        url: String,
    },
}

/// Connection lifecycle of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; operations fail with `NotConnected`.
    Disconnected,
    /// A session is being established.
    Connecting,
    /// The session is live and initialized.
    Connected,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The outcome of one tool invocation, as protocol data.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    /// Flattened textual content of the result.
    pub content: String,
    /// Whether the server marked the result as a tool-level error.
    pub is_error: bool,
}

enum TransportSource {
    /// Build a fresh transport from config on every connect.
    Config(ToolServerConfig),
    /// Reuse an externally supplied transport (tests, pooling).
    Injected(Arc<dyn McpTransport>),
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn McpTransport>>,
    server: Option<ServerInfo>,
}

/// A client for one MCP tool server.
///
/// Concurrent `call_tool` invocations are safe: the transport correlates
/// in-flight requests per id, and the registry never holds its state lock
/// across a call.
pub struct ToolRegistry {
    id: String,
    call_timeout: Duration,
    source: TransportSource,
    inner: Mutex<Inner>,
}

impl ToolRegistry {
    /// Create a registry for the given server config.  No connection is made
    /// until [`connect`](Self::connect).
    pub fn new(id: impl Into<String>, config: ToolServerConfig) -> Self {
        Self {
            id: id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            source: TransportSource::Config(config),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
                server: None,
            }),
        }
    }

    /// Create a registry over an existing transport.
    pub fn with_transport(id: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            id: id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            source: TransportSource::Injected(transport),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
                server: None,
            }),
        }
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The registry's stable identifier (used for namespace prefixes).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Identity of the connected server, if any.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner.lock().await.server.clone()
    }

    /// Establish the session and run the `initialize` handshake.
    ///
    /// Idempotent while connected.  Concurrent callers serialize on the
    /// state lock; the losers observe `Connected` and return immediately.
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }
        inner.state = ConnectionState::Connecting;

        let transport: Arc<dyn McpTransport> = match &self.source {
            TransportSource::Injected(t) => Arc::clone(t),
            TransportSource::Config(ToolServerConfig::Stdio { command, args, env }) => {
                match StdioTransport::spawn(&self.id, command, args, env).await {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        inner.state = ConnectionState::Disconnected;
                        return Err(e);
                    }
                }
            }
            TransportSource::Config(ToolServerConfig::Http { url }) => {
                match HttpTransport::new(url.clone()) {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        inner.state = ConnectionState::Disconnected;
                        return Err(e);
                    }
                }
            }
        };

        let init = self
            .timed(transport.request("initialize", Some(initialize_params())))
            .await
            .and_then(|v| {
                serde_json::from_value::<InitializeResult>(v).map_err(|e| McpError::Protocol {
                    reason: format!("invalid initialize result: {e}"),
                })
            });

        match init {
            Ok(result) => {
                info!(
                    registry = %self.id,
                    server = %result.server_info.name,
                    version = %result.server_info.version,
                    protocol = %result.protocol_version,
                    "tool server connected"
                );
                inner.server = Some(result.server_info);
                inner.transport = Some(transport);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                inner.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Tear the session down.  Safe from any state, any number of times.
    pub async fn disconnect(&self) {
        let transport = {
            let mut inner = self.inner.lock().await;
            inner.state = ConnectionState::Disconnected;
            inner.server = None;
            inner.transport.take()
        };

        if let Some(transport) = transport {
            transport.close().await;
            debug!(registry = %self.id, "tool server disconnected");
        }
    }

    /// Query the server's current tool listing, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let transport = self.connected_transport().await?;

        let mut all_tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let result = self
                .timed(transport.request("tools/list", Some(params)))
                .await?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::Protocol {
                    reason: format!("invalid tools/list result: {e}"),
                })?;

            all_tools.extend(page.tools);
            if page.next_cursor.is_none() {
                break;
            }
            cursor = page.next_cursor;
        }

        debug!(registry = %self.id, count = all_tools.len(), "listed tools");
        Ok(all_tools)
    }

    /// Invoke one tool as a single request/response exchange.
    ///
    /// Tool-level failures reported by the server come back as an outcome
    /// with `is_error` set; transport failures, timeouts, and argument
    /// rejections surface as typed errors for the bridge to fold.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome> {
        let transport = self.connected_transport().await?;

        debug!(registry = %self.id, tool = %name, "calling tool");

        let params = json!({"name": name, "arguments": arguments});
        let result = self
            .timed(transport.request("tools/call", Some(params)))
            .await
            .map_err(|e| match e {
                McpError::Server { code, message } if code == INVALID_PARAMS => {
                    McpError::InvalidArguments {
                        tool_name: name.to_owned(),
                        reason: message,
                    }
                }
                other => other,
            })?;

        let call_result: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol {
                reason: format!("invalid tools/call result: {e}"),
            })?;

        Ok(ToolCallOutcome {
            content: call_result.flatten_text(),
            is_error: call_result.is_error.unwrap_or(false),
        })
    }

    /// Clone the live transport, or fail when not connected.
    async fn connected_transport(&self) -> Result<Arc<dyn McpTransport>> {
        let inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return Err(McpError::NotConnected {
                server: self.id.clone(),
            });
        }
        inner
            .transport
            .clone()
            .ok_or_else(|| McpError::NotConnected {
                server: self.id.clone(),
            })
    }

    /// Apply the per-call timeout to a transport future.
    async fn timed<F>(&self, fut: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| McpError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
