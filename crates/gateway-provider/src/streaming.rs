//! SSE stream parser for the Anthropic Messages API.
//!
//! The Anthropic streaming format sends `event:` and `data:` lines in
//! standard SSE format.  This parser folds those lines into the
//! caller-facing [`StreamEvent`] sequence: text deltas pass through as they
//! arrive, tool-use blocks are assembled across their `input_json_delta`
//! fragments and flushed as one [`StreamEvent::ToolCall`] when the block
//! closes, and usage is announced once from the `message_delta` event.

use serde_json::Value;

use crate::error::{ProviderError, Result};
use crate::types::{StreamEvent, ToolInvocation, Usage};

/// Parses raw SSE lines from an Anthropic Messages stream.
///
/// Accumulates partial state across calls because SSE events span multiple
/// lines (`event:` followed by `data:`) and tool-use input spans multiple
/// delta events.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    /// The most recently seen `event:` type.
    current_event_type: Option<String>,

    /// Open tool-use blocks, keyed by content block index.
    open_tool_blocks: Vec<(u32, ToolUseBuilder)>,

    /// Prompt tokens reported by `message_start`.
    prompt_tokens: u32,

    /// Stop reason reported by `message_delta`.
    stop_reason: Option<String>,
}

/// In-progress tool-use block being assembled from streaming deltas.
#[derive(Debug, Default)]
struct ToolUseBuilder {
    call_id: String,
    name: String,
    input_json: String,
}

impl AnthropicStreamParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns the stream events the line completes — usually none or one.
    pub fn feed_line(&mut self, line: &str) -> Result<Vec<StreamEvent>> {
        let line = line.trim_end();

        // SSE comment lines start with `:`.
        if line.starts_with(':') || line.is_empty() {
            return Ok(Vec::new());
        }

        // `event: <type>` — stash the type for the next `data:` line.
        if let Some(event_type) = line.strip_prefix("event: ") {
            self.current_event_type = Some(event_type.to_owned());
            return Ok(Vec::new());
        }

        // `data: <json>` — combine with the stashed event type.
        if let Some(data) = line.strip_prefix("data: ") {
            let event_type = self
                .current_event_type
                .take()
                .unwrap_or_else(|| "unknown".into());
            return self.apply_event(&event_type, data);
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        Ok(Vec::new())
    }

    /// Apply a (event_type, data_json) pair, emitting completed events.
    fn apply_event(&mut self, event_type: &str, data: &str) -> Result<Vec<StreamEvent>> {
        match event_type {
            "message_start" => {
                let v = parse_json(data)?;
                self.prompt_tokens =
                    v["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
                Ok(Vec::new())
            }

            "content_block_start" => {
                let v = parse_json(data)?;
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.open_tool_blocks.push((
                        index,
                        ToolUseBuilder {
                            call_id: json_string(block, "id"),
                            name: json_string(block, "name"),
                            input_json: String::new(),
                        },
                    ));
                }
                Ok(Vec::new())
            }

            "content_block_delta" => {
                let v = parse_json(data)?;
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta = &v["delta"];

                match delta["type"].as_str() {
                    Some("text_delta") => {
                        Ok(vec![StreamEvent::Delta(json_string(delta, "text"))])
                    }
                    Some("input_json_delta") => {
                        if let Some((_, builder)) =
                            self.open_tool_blocks.iter_mut().find(|(i, _)| *i == index)
                        {
                            builder.input_json.push_str(&json_string(delta, "partial_json"));
                        }
                        Ok(Vec::new())
                    }
                    other => {
                        tracing::warn!(delta_type = ?other, "unknown delta type");
                        Ok(Vec::new())
                    }
                }
            }

            "content_block_stop" => {
                let v = parse_json(data)?;
                let index = v["index"].as_u64().unwrap_or(0) as u32;

                // Closing a tool-use block completes its invocation.
                if let Some(pos) = self.open_tool_blocks.iter().position(|(i, _)| *i == index) {
                    let (_, builder) = self.open_tool_blocks.remove(pos);
                    return Ok(vec![StreamEvent::ToolCall(builder.into_invocation()?)]);
                }
                Ok(Vec::new())
            }

            "message_delta" => {
                let v = parse_json(data)?;
                self.stop_reason = v["delta"]["stop_reason"].as_str().map(String::from);

                let usage = Usage {
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
                };
                Ok(vec![StreamEvent::Usage(usage)])
            }

            "message_stop" => Ok(vec![StreamEvent::Done {
                stop_reason: self.stop_reason.take(),
            }]),

            "ping" => Ok(Vec::new()),

            _ => {
                if data.trim() == "[DONE]" {
                    Ok(vec![StreamEvent::Done {
                        stop_reason: self.stop_reason.take(),
                    }])
                } else {
                    tracing::trace!(event_type, "ignoring unknown SSE event type");
                    Ok(Vec::new())
                }
            }
        }
    }
}

impl ToolUseBuilder {
    /// Parse the accumulated input JSON into a complete invocation.
    fn into_invocation(self) -> Result<ToolInvocation> {
        let arguments: Value = if self.input_json.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.input_json).map_err(|e| ProviderError::Parse {
                reason: format!("invalid JSON in tool call `{}` input: {e}", self.name),
            })?
        };

        Ok(ToolInvocation {
            call_id: self.call_id,
            name: self.name,
            arguments,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a JSON string, mapping errors to [`ProviderError::Parse`].
fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| ProviderError::Parse {
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}

/// Extract a string field from a JSON value, empty if missing.
fn json_string(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
