//! JSON-RPC 2.0 and MCP wire types.
//!
//! The MCP protocol runs JSON-RPC 2.0 over a session transport.  The types
//! here cover the client side of the methods the gateway uses:
//! `initialize`, `tools/list`, and `tools/call`.
//!
//! The MCP specification version targeted is `2024-11-05`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The MCP protocol version this client speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// The client name reported during initialization.
pub const CLIENT_NAME: &str = "completion-gateway";

/// The client version reported during initialization.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// JSON-RPC error code for invalid method parameters.
pub const INVALID_PARAMS: i32 = -32602;

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be `"2.0"`.
    pub jsonrpc: String,
    /// Request identifier for response correlation.
    pub id: Value,
    /// The method to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Construct a request with a numeric id.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: json!(id),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Echoed from the request.
    #[serde(default)]
    pub id: Value,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (negative numbers are reserved by JSON-RPC).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// MCP method payloads
// ---------------------------------------------------------------------------

/// Identity of the remote tool server, from the `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    #[serde(default)]
    pub version: String,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// Protocol version the server settled on.
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    /// Server identity.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Build the `initialize` request parameters.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
    })
}

/// A tool definition returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    /// The machine-readable tool name, unique within its server.
    pub name: String,
    /// Human-readable description of the tool.
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Result of a `tools/list` call (one page).
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    /// Tools on this page.
    #[serde(default)]
    pub tools: Vec<McpTool>,
    /// Cursor for the next page, absent on the last one.
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// Result of a `tools/call` invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    /// Content blocks returned by the tool.
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Whether the call resulted in a tool-level error.  A `true` here is
    /// still a successful protocol exchange.
    #[serde(rename = "isError", default)]
    pub is_error: Option<bool>,
}

/// A single content block within a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Plain text content.
    Text {
        /// The textual content.
        text: String,
    },
    /// Binary image content.
    Image {
        /// Base64-encoded image data.
        #[serde(default)]
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType", default)]
        mime_type: String,
    },
    /// An embedded resource reference.
    Resource {
        /// The resource payload.
        resource: ResourceContents,
    },
}

/// Embedded resource contents within a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContents {
    /// Resource URI.
    #[serde(default)]
    pub uri: String,
    /// Inline text, when the resource is textual.
    #[serde(default)]
    pub text: Option<String>,
}

impl CallToolResult {
    /// Flatten the content blocks into one text payload for the model.
    pub fn flatten_text(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.content.len());
        for block in &self.content {
            match block {
                ToolContent::Text { text } => parts.push(text.clone()),
                ToolContent::Image { mime_type, .. } => {
                    parts.push(format!("[image content: {mime_type}]"));
                }
                ToolContent::Resource { resource } => match &resource.text {
                    Some(text) => parts.push(text.clone()),
                    None => parts.push(format!("[resource: {}]", resource.uri)),
                },
            }
        }
        parts.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
