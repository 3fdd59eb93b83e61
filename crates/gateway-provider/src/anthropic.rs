//! Provider adapter for the Anthropic Messages API.
//!
//! Translates the gateway's provider-agnostic conversation types into the
//! Messages wire format (system text as a top-level field, tool results as
//! `tool_result` user content blocks) and consumes the SSE stream through
//! [`AnthropicStreamParser`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::adapter::{CompletionStream, ProviderAdapter};
use crate::error::{ProviderError, Result};
use crate::sse;
use crate::streaming::AnthropicStreamParser;
use crate::types::{
    CompletionRequest, CompletionResult, Message, Role, ToolDescriptor, ToolInvocation, Usage,
};

/// Default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default maximum tokens per response.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Total request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for one Anthropic endpoint.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API key (`x-api-key` header).
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Default model identifier.
    pub default_model: String,
    /// Default maximum tokens per response.
    pub max_tokens: u32,
}

impl AnthropicConfig {
    /// Create a configuration with the public endpoint and default limits.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// [`ProviderAdapter`] implementation for the Anthropic Messages API.
pub struct AnthropicAdapter {
    id: String,
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicAdapter {
    /// Create a new adapter, validating the configuration before any
    /// network call is possible.
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ProviderError::Config {
                reason: "anthropic api key is empty".into(),
            });
        }
        if config.base_url.is_empty() {
            return Err(ProviderError::Config {
                reason: "anthropic base url is empty".into(),
            });
        }
        if config.default_model.is_empty() {
            return Err(ProviderError::Config {
                reason: "anthropic default model is empty".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            id: format!("anthropic/{}", config.default_model),
            config,
            http,
        })
    }

    /// Build the JSON body for the Messages API.
    fn build_request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let (system_text, messages) = messages_to_wire(&request.conversation.messages);

        let mut body = json!({
            "model": if request.model.is_empty() {
                &self.config.default_model
            } else {
                &request.model
            },
            "max_tokens": request.params.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });

        if let Some(system) = system_text {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.params.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            body["tools"] = tools_to_wire(&request.tools);
        }
        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    /// Send the HTTP request to the Messages endpoint.
    async fn send_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.base_url);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|e| ProviderError::Config {
                reason: format!("invalid API key header: {e}"),
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], "sending anthropic request");

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Transport {
                reason: format!("API returned {status}: {text}"),
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        request.conversation.validate()?;

        let body = self.build_request_body(request, false);
        let resp = self.send_request(&body).await?;

        let text = resp.text().await.map_err(|e| ProviderError::Transport {
            reason: format!("failed to read response body: {e}"),
        })?;
        let v: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Parse {
            reason: format!("invalid JSON response: {e}"),
        })?;

        parse_response(&v)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        request.conversation.validate()?;

        let body = self.build_request_body(request, true);
        let resp = self.send_request(&body).await?;

        let token = CancellationToken::new();
        let (tx, stream) = CompletionStream::channel(token.clone());
        sse::spawn_producer(resp, token, tx, AnthropicStreamParser::new());

        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

/// Split the system text out (the Messages API expects it as a top-level
/// field, not in the `messages` array) and convert the rest to wire format.
fn messages_to_wire(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User => {
                wire.push(json!({"role": "user", "content": msg.content}));
            }
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(json!({"role": "assistant", "content": msg.content}));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    if !msg.content.is_empty() {
                        content.push(json!({"type": "text", "text": msg.content}));
                    }
                    for call in &msg.tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": call.call_id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    wire.push(json!({"role": "assistant", "content": content}));
                }
            }
            Role::Tool => {
                wire.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id,
                        "content": msg.content,
                    }],
                }));
            }
        }
    }

    (system, wire)
}

/// Convert tool descriptors into the Messages API tool format.
fn tools_to_wire(tools: &[ToolDescriptor]) -> Value {
    let values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect();
    json!(values)
}

/// Parse a non-streaming Messages API response.
fn parse_response(v: &Value) -> Result<CompletionResult> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Parse {
            reason: "missing `content` array in response".into(),
        })?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolInvocation> = Vec::new();

    for block in content {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    text_parts.push(t.to_owned());
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolInvocation {
                    call_id: block["id"].as_str().unwrap_or_default().to_owned(),
                    name: block["name"].as_str().unwrap_or_default().to_owned(),
                    arguments: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    Ok(CompletionResult {
        text: text_parts.join(""),
        tool_calls,
        usage: Usage {
            prompt_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        },
        stop_reason: v["stop_reason"].as_str().map(String::from),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
