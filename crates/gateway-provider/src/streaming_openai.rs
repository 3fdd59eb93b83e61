//! SSE stream parser for the OpenAI Chat Completions API.
//!
//! The OpenAI streaming format sends `data:` lines with JSON payloads
//! containing `choices[].delta` objects and terminates with a `data: [DONE]`
//! sentinel.  Text deltas pass through immediately; tool-call fragments are
//! accumulated by index (the name typically arrives in the first chunk, with
//! argument fragments following) and flushed when the stream finishes.

use serde_json::Value;

use crate::error::{ProviderError, Result};
use crate::types::{StreamEvent, ToolInvocation, Usage};

/// Parses raw SSE lines from an OpenAI-compatible chat completions stream.
#[derive(Debug, Default)]
pub struct OpenAiStreamParser {
    /// In-progress tool calls indexed by their position in the `tool_calls`
    /// array.  OpenAI sends `index` to correlate chunks.
    tool_call_builders: Vec<ToolCallBuilder>,

    /// Finish reason from the last chunk that carried one.
    finish_reason: Option<String>,

    /// Usage from the final pre-`[DONE]` chunk, when the provider sends it.
    usage: Option<Usage>,
}

/// In-progress tool call being assembled from streaming deltas.
#[derive(Debug, Default)]
struct ToolCallBuilder {
    call_id: String,
    name: String,
    arguments: String,
}

impl OpenAiStreamParser {
    /// Create a new empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single SSE line from the stream.
    ///
    /// Returns the stream events the line completes.  The `[DONE]` sentinel
    /// flushes any accumulated tool calls, then usage, then the terminal
    /// [`StreamEvent::Done`].
    pub fn feed_line(&mut self, line: &str) -> Result<Vec<StreamEvent>> {
        let line = line.trim_end();

        // Skip blank lines, comments, and non-data SSE fields.
        if line.is_empty() || line.starts_with(':') {
            return Ok(Vec::new());
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return Ok(Vec::new());
        };
        let data = data.trim();

        if data == "[DONE]" {
            return self.finish();
        }

        let v: Value = serde_json::from_str(data).map_err(|e| ProviderError::Parse {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        let mut events = Vec::new();
        let choice = &v["choices"][0];

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_owned());
        }

        let delta = &choice["delta"];
        if let Some(content) = delta["content"].as_str()
            && !content.is_empty()
        {
            events.push(StreamEvent::Delta(content.to_owned()));
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                while self.tool_call_builders.len() <= index {
                    self.tool_call_builders.push(ToolCallBuilder::default());
                }
                let builder = &mut self.tool_call_builders[index];

                if let Some(id) = tc["id"].as_str() {
                    builder.call_id = id.to_owned();
                }
                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = func["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        // Some providers include usage in the final content chunk (requested
        // via `stream_options.include_usage`).
        if let Some(usage_obj) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                prompt_tokens: usage_obj["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage_obj["completion_tokens"].as_u64().unwrap_or(0) as u32,
            });
        }

        Ok(events)
    }

    /// Flush accumulated state on `[DONE]`.
    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();

        for builder in self.tool_call_builders.drain(..) {
            let arguments: Value = if builder.arguments.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&builder.arguments).map_err(|e| ProviderError::Parse {
                    reason: format!(
                        "invalid JSON in tool call `{}` arguments: {e}",
                        builder.name
                    ),
                })?
            };
            events.push(StreamEvent::ToolCall(ToolInvocation {
                call_id: builder.call_id,
                name: builder.name,
                arguments,
            }));
        }

        if let Some(usage) = self.usage.take() {
            events.push(StreamEvent::Usage(usage));
        }

        events.push(StreamEvent::Done {
            stop_reason: self.finish_reason.take(),
        });

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
