//! Provider adapter for the OpenAI Chat Completions API.
//!
//! Also covers OpenAI-compatible endpoints (Ollama, Together, vLLM) by
//! pointing `base_url` elsewhere.  System messages stay in the `messages`
//! array, tool calls ride on `assistant.tool_calls`, and tool results use
//! `role: "tool"` with a `tool_call_id`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::adapter::{CompletionStream, ProviderAdapter};
use crate::error::{ProviderError, Result};
use crate::sse;
use crate::streaming_openai::OpenAiStreamParser;
use crate::types::{
    CompletionRequest, CompletionResult, Message, Role, ToolDescriptor, ToolInvocation, Usage,
};

/// Default OpenAI API base URL.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default maximum tokens per response.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Total request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key (`Authorization: Bearer` header).
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Default model identifier.
    pub default_model: String,
    /// Default maximum tokens per response.
    pub max_tokens: u32,
}

impl OpenAiConfig {
    /// Create a configuration for the public OpenAI endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Create a configuration for any OpenAI-compatible endpoint.
    pub fn compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            default_model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// [`ProviderAdapter`] implementation for OpenAI-compatible chat APIs.
pub struct OpenAiAdapter {
    id: String,
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiAdapter {
    /// Create a new adapter, validating the configuration before any
    /// network call is possible.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ProviderError::Config {
                reason: "openai api key is empty".into(),
            });
        }
        if config.base_url.is_empty() {
            return Err(ProviderError::Config {
                reason: "openai base url is empty".into(),
            });
        }
        if config.default_model.is_empty() {
            return Err(ProviderError::Config {
                reason: "openai default model is empty".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            id: format!("openai/{}", config.default_model),
            config,
            http,
        })
    }

    /// Build the JSON body for the Chat Completions API.
    fn build_request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages = messages_to_wire(&request.conversation.messages);

        let mut body = json!({
            "model": if request.model.is_empty() {
                &self.config.default_model
            } else {
                &request.model
            },
            "max_tokens": request.params.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });

        if let Some(temp) = request.params.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            body["tools"] = tools_to_wire(&request.tools);
        }
        if stream {
            body["stream"] = json!(true);
            // Ask compatible providers to report usage in the final chunk.
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }

    /// Send the HTTP request to the Chat Completions endpoint.
    async fn send_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|e| ProviderError::Config {
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], "sending openai request");

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
impl ProviderAdapter for OpenAiAdapter {
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
        sse::spawn_producer(resp, token, tx, OpenAiStreamParser::new());

        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

/// Convert gateway messages to the Chat Completions wire format.
fn messages_to_wire(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => {
                wire.push(json!({"role": "system", "content": msg.content}));
            }
            Role::User => {
                wire.push(json!({"role": "user", "content": msg.content}));
            }
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(json!({"role": "assistant", "content": msg.content}));
                } else {
                    let tool_calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.call_id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect();

                    let mut m = json!({"role": "assistant", "tool_calls": tool_calls});
                    if !msg.content.is_empty() {
                        m["content"] = json!(msg.content);
                    }
                    wire.push(m);
                }
            }
            Role::Tool => {
                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id,
                    "content": msg.content,
                }));
            }
        }
    }

    wire
}

/// Convert tool descriptors into the Chat Completions tool format.
///
/// OpenAI wraps each tool in `{"type": "function", "function": {...}}`.
fn tools_to_wire(tools: &[ToolDescriptor]) -> Value {
    let values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect();
    json!(values)
}

/// Parse a non-streaming Chat Completions response.
fn parse_response(v: &Value) -> Result<CompletionResult> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::Parse {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let mut tool_calls: Vec<ToolInvocation> = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for tc in calls {
            let func = &tc["function"];
            let name = func["name"].as_str().unwrap_or_default().to_owned();
            let args_str = func["arguments"].as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).map_err(|e| ProviderError::Parse {
                    reason: format!("invalid JSON in tool call `{name}` arguments: {e}"),
                })?;

            tool_calls.push(ToolInvocation {
                call_id: tc["id"].as_str().unwrap_or_default().to_owned(),
                name,
                arguments,
            });
        }
    }

    Ok(CompletionResult {
        text: message["content"].as_str().unwrap_or_default().to_owned(),
        tool_calls,
        usage: Usage {
            prompt_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: v["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        },
        stop_reason: v["choices"][0]["finish_reason"].as_str().map(String::from),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
