//! Core types for provider interaction.
//!
//! These types model the data flowing between the orchestrator and LLM
//! providers.  They are provider-agnostic at this layer; the adapter modules
//! translate them into provider-specific wire formats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProviderError, Result};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
///
/// Vendors that distinguish a `developer` role accept `system` content in its
/// place; the adapters own that mapping at the wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content of the message.
    ///
    /// For [`Role::Tool`] messages this carries the serialized tool outcome.
    /// For [`Role::Assistant`] messages that contain only tool calls, this
    /// may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool invocations requested by the assistant (only present when
    /// `role == Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// Identifies which tool call this message responds to (only present
    /// when `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// An ordered sequence of messages owned by the orchestrator for the
/// lifetime of one request.
///
/// The gateway never persists conversations; history load/store belongs to
/// an external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    /// The messages, oldest first.
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a conversation from existing history.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Check the invariants a provider would reject:
    ///
    /// - no two consecutive `user` messages without an intervening
    ///   `assistant` or `tool` message;
    /// - every `tool` message references a tool-call id announced by a prior
    ///   `assistant` message.
    ///
    /// Adapters call this before any network I/O.
    pub fn validate(&self) -> Result<()> {
        let mut known_call_ids: Vec<&str> = Vec::new();
        let mut prev_role: Option<Role> = None;

        for (index, msg) in self.messages.iter().enumerate() {
            if msg.role == Role::User && prev_role == Some(Role::User) {
                return Err(ProviderError::InvalidConversation {
                    reason: format!("consecutive user messages at index {index}"),
                });
            }

            match msg.role {
                Role::Assistant => {
                    known_call_ids.extend(msg.tool_calls.iter().map(|c| c.call_id.as_str()));
                }
                Role::Tool => {
                    let call_id =
                        msg.tool_call_id
                            .as_deref()
                            .ok_or_else(|| ProviderError::InvalidConversation {
                                reason: format!("tool message at index {index} has no call id"),
                            })?;
                    if !known_call_ids.contains(&call_id) {
                        return Err(ProviderError::InvalidConversation {
                            reason: format!(
                                "tool message at index {index} references unknown call `{call_id}`"
                            ),
                        });
                    }
                }
                _ => {}
            }

            prev_role = Some(msg.role);
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool exposed to the model so it knows what it may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name within the merged toolset.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

/// A tool invocation requested by the model mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Identifier assigned by the model for correlating the result.
    pub call_id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON value; the structure is the tool's own schema.
    pub arguments: Value,
}

/// The outcome of executing one tool invocation, ready to feed back to the
/// model.
///
/// Expected failures (unknown tool, bad arguments, transport errors) are
/// carried here as data with `is_error` set — they are protocol-visible
/// results, not exceptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// The [`ToolInvocation::call_id`] this outcome corresponds to.
    pub call_id: String,

    /// Serialized result content (or error description).
    pub content: String,

    /// Whether the invocation failed.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutcome {
    /// Create a successful outcome.
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Create a failed outcome.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Provider-reported token usage, announced once near stream end.
///
/// The gateway never estimates these counts itself; a turn with no reported
/// usage settles at zero tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,
    /// Number of tokens generated by the model.
    pub completion_tokens: u32,
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Opaque generation parameters passed through to the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens the model may generate in this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A full completion request handed to a provider adapter.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// The model identifier (empty selects the adapter's default).
    pub model: String,

    /// The conversation so far.
    pub conversation: Conversation,

    /// Merged tool descriptors the model may invoke (may be empty).
    pub tools: Vec<ToolDescriptor>,

    /// Pass-through generation parameters.
    pub params: GenerationParams,
}

impl CompletionRequest {
    /// Create a request with default parameters and no tools.
    pub fn new(conversation: Conversation) -> Self {
        Self {
            model: String::new(),
            conversation,
            tools: Vec::new(),
            params: GenerationParams::default(),
        }
    }
}

/// The whole-response result of a non-streaming completion.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    /// The generated text (may be empty when only tool calls were produced).
    pub text: String,

    /// Tool invocations the model requested, in announcement order.
    pub tool_calls: Vec<ToolInvocation>,

    /// Provider-reported usage.
    pub usage: Usage,

    /// The provider's stop reason, if reported.
    pub stop_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// One event in a provider's completion stream.
///
/// A stream is a lazy, finite, single-consumer sequence: zero or more
/// `Delta`/`ToolCall`/`Usage` events followed by exactly one terminal
/// `Done` or `Error`.  After cancellation no further events are delivered.
#[derive(Debug)]
pub enum StreamEvent {
    /// An incremental chunk of generated text.
    Delta(String),

    /// A fully assembled tool invocation the model requested.
    ToolCall(ToolInvocation),

    /// Provider-reported token usage (at most once per stream).
    Usage(Usage),

    /// The stream completed normally.
    Done {
        /// The provider's stop reason (`"end_turn"`, `"tool_calls"`, ...).
        stop_reason: Option<String>,
    },

    /// The stream failed; terminal.
    Error(ProviderError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
