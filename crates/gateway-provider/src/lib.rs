//! Provider adapters for the completion gateway.
//!
//! This crate normalizes heterogeneous LLM vendor APIs behind one capability
//! contract: a blocking whole-response `generate` and a cancellable
//! streaming `stream`, both driven by provider-agnostic conversation types.
//!
//! ## Modules
//!
//! - [`types`] -- Conversation, tool, usage, and stream event types.
//! - [`adapter`] -- The [`ProviderAdapter`] trait and cancellable stream.
//! - [`anthropic`] -- Adapter for the Anthropic Messages API.
//! - [`openai`] -- Adapter for OpenAI-compatible Chat Completions APIs.
//! - [`streaming`] / [`streaming_openai`] -- SSE parsers per wire format.
//! - [`cache`] -- Explicit adapter cache with host-visible invalidation.
//! - [`error`] -- Provider error types.

pub mod adapter;
pub mod anthropic;
pub mod cache;
pub mod error;
pub mod openai;
mod sse;
pub mod streaming;
pub mod streaming_openai;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use adapter::{CancelHandle, CompletionStream, ProviderAdapter};
pub use anthropic::{AnthropicAdapter, AnthropicConfig};
pub use cache::{AdapterCache, config_fingerprint};
pub use error::{ProviderError, Result};
pub use openai::{OpenAiAdapter, OpenAiConfig};
pub use types::{
    CompletionRequest, CompletionResult, Conversation, GenerationParams, Message, Role,
    StreamEvent, ToolDescriptor, ToolInvocation, ToolOutcome, Usage,
};
