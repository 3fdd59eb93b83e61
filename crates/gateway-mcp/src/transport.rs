//! Session transports for MCP tool servers.
//!
//! A transport carries one JSON-RPC request to one response over a
//! long-lived session.  Concurrent in-flight requests are supported by both
//! implementations: each request owns a oneshot channel keyed by its id, so
//! no mutable buffers are shared across calls.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A session-oriented JSON-RPC transport to one tool server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send one request and await its response's `result` value.
    ///
    /// Timeouts are the caller's responsibility; this future resolves when
    /// the server answers or the session dies.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Tear the session down.  Never fails; safe to call repeatedly.
    async fn close(&self);
}

/// Unwrap a JSON-RPC response into its result value.
fn unwrap_response(resp: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = resp.error {
        return Err(McpError::Server {
            code: error.code,
            message: error.message,
        });
    }
    resp.result.ok_or_else(|| McpError::Protocol {
        reason: "missing result in response".into(),
    })
}

// ---------------------------------------------------------------------------
// Stdio transport
// ---------------------------------------------------------------------------

/// Transport over a spawned child process speaking newline-delimited
/// JSON-RPC on stdio (the most common MCP server shape).
pub struct StdioTransport {
    server_name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    request_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
}

impl StdioTransport {
    /// Spawn the server process and start the response reader.
    pub async fn spawn(
        server_name: impl Into<String>,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let server_name = server_name.into();

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, val) in env {
            cmd.env(key, val);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Transport {
            reason: format!("failed to spawn `{command}`: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            reason: "failed to capture stdout".into(),
        })?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Reader task: correlate responses back to their pending requests.
        let reader_pending = Arc::clone(&pending);
        let reader_name = server_name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(response) => {
                        let Some(id) = response.id.as_u64() else {
                            // Server-initiated notification; the gateway has
                            // no subscriptions, so ignore it.
                            continue;
                        };
                        if let Some(tx) = reader_pending.lock().await.remove(&id) {
                            let _ = tx.send(response);
                        } else {
                            warn!(server = %reader_name, id, "response for unknown request");
                        }
                    }
                    Err(e) => {
                        warn!(server = %reader_name, error = %e, "unparseable line from server");
                    }
                }
            }

            // Session over: fail anything still waiting.
            reader_pending.lock().await.clear();
            debug!(server = %reader_name, "stdout reader exited");
        });

        Ok(Self {
            server_name,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            request_id: AtomicU64::new(1),
            pending,
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let write_result = {
            let mut stdin_guard = self.stdin.lock().await;
            match stdin_guard.as_mut() {
                Some(stdin) => {
                    let written = stdin.write_all(line.as_bytes()).await;
                    match written {
                        Ok(()) => stdin.flush().await,
                        Err(e) => Err(e),
                    }
                }
                None => Err(std::io::Error::other("stdin closed")),
            }
        };

        if let Err(e) = write_result {
            self.pending.lock().await.remove(&id);
            return Err(McpError::Transport {
                reason: format!("failed to write request: {e}"),
            });
        }

        let response = rx.await.map_err(|_| McpError::Transport {
            reason: "session closed before response".into(),
        })?;

        unwrap_response(response)
    }

    async fn close(&self) {
        debug!(server = %self.server_name, "closing stdio transport");

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.pending.lock().await.clear();
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Transport over HTTP POST: each JSON-RPC request is one round trip to a
/// streamable-HTTP MCP endpoint.
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    request_id: AtomicU64,
}

impl HttpTransport {
    /// Create a transport for the given endpoint URL.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(McpError::Transport {
                reason: "empty MCP endpoint url".into(),
            });
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| McpError::Transport {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            url,
            http,
            request_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| McpError::Transport {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(McpError::Transport {
                reason: format!("endpoint returned {status}"),
            });
        }

        let response: JsonRpcResponse = resp.json().await.map_err(|e| McpError::Protocol {
            reason: format!("invalid JSON-RPC response: {e}"),
        })?;

        unwrap_response(response)
    }

    async fn close(&self) {
        // Stateless per request; nothing to tear down.
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::JsonRpcError;
    use serde_json::json;

    #[test]
    fn unwrap_prefers_error_over_result() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: json!(1),
            result: Some(json!({"ok": true})),
            error: Some(JsonRpcError {
                code: -32000,
                message: "boom".into(),
                data: None,
            }),
        };
        assert!(matches!(
            unwrap_response(resp),
            Err(McpError::Server { code: -32000, .. })
        ));
    }

    #[test]
    fn unwrap_requires_result() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: json!(1),
            result: None,
            error: None,
        };
        assert!(matches!(unwrap_response(resp), Err(McpError::Protocol { .. })));
    }

    #[test]
    fn http_transport_rejects_empty_url() {
        assert!(matches!(
            HttpTransport::new(""),
            Err(McpError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn http_close_is_infallible_and_repeatable() {
        let transport = HttpTransport::new("http://localhost:9/mcp").unwrap();
        transport.close().await;
        transport.close().await;
    }
}
