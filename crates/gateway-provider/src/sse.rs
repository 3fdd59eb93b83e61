//! Shared SSE consumption loop for streaming adapters.
//!
//! Both wire formats deliver newline-delimited SSE over the response body;
//! only the line-level parsing differs.  The producer task spawned here owns
//! the network read and honors cancellation: once the token fires, the next
//! poll stops consuming upstream and the channel closes with no further
//! events.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, Result};
use crate::streaming::AnthropicStreamParser;
use crate::streaming_openai::OpenAiStreamParser;
use crate::types::StreamEvent;

/// Line-level parser for one provider's SSE dialect.
pub(crate) trait SseLineParser: Send + 'static {
    /// Feed one line; return the stream events it completes.
    fn feed_line(&mut self, line: &str) -> Result<Vec<StreamEvent>>;
}

impl SseLineParser for AnthropicStreamParser {
    fn feed_line(&mut self, line: &str) -> Result<Vec<StreamEvent>> {
        AnthropicStreamParser::feed_line(self, line)
    }
}

impl SseLineParser for OpenAiStreamParser {
    fn feed_line(&mut self, line: &str) -> Result<Vec<StreamEvent>> {
        OpenAiStreamParser::feed_line(self, line)
    }
}

/// Spawn the producer task that drives `resp`'s body through `parser` into
/// the event channel.
///
/// The task terminates on: the terminal `Done` event, a read/parse error
/// (forwarded as `StreamEvent::Error`), consumer drop, or cancellation.
pub(crate) fn spawn_producer<P: SseLineParser>(
    resp: reqwest::Response,
    token: CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
    mut parser: P,
) {
    tokio::spawn(async move {
        let mut bytes = resp.bytes_stream();
        let mut buffer = String::new();

        'read: loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => break 'read,
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else { break 'read };

            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error(ProviderError::Stream {
                            reason: format!("stream read error: {e}"),
                        }))
                        .await;
                    break 'read;
                }
            };

            let text = match std::str::from_utf8(&chunk) {
                Ok(t) => t,
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error(ProviderError::Stream {
                            reason: format!("invalid UTF-8 in stream: {e}"),
                        }))
                        .await;
                    break 'read;
                }
            };
            buffer.push_str(text);

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();

                let events = match parser.feed_line(line.trim_end()) {
                    Ok(events) => events,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(e)).await;
                        break 'read;
                    }
                };

                for event in events {
                    let terminal = matches!(event, StreamEvent::Done { .. });
                    // Select against cancellation so a consumer that stopped
                    // reading after cancel cannot strand this task on a full
                    // channel.
                    let sent = tokio::select! {
                        _ = token.cancelled() => break 'read,
                        sent = tx.send(event) => sent,
                    };
                    if sent.is_err() || terminal {
                        break 'read;
                    }
                }
            }
        }
        // Dropping `tx` terminates the sequence for the consumer.
    });
}
