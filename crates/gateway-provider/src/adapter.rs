//! The provider adapter contract.
//!
//! Every vendor implementation exposes the same two operations: a blocking
//! whole-response [`ProviderAdapter::generate`] and a cancellable
//! [`ProviderAdapter::stream`].  The orchestrator holds only the trait
//! object and never branches on provider identity.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{CompletionRequest, CompletionResult, StreamEvent};

/// Buffered events between the producer task and the consumer.
///
/// Small on purpose: deltas should reach the caller promptly, and a slow
/// consumer applies backpressure to the network read.
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Uniform capability interface over one vendor's completion API.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// A stable identifier for this adapter instance (used in logs and the
    /// adapter cache, never for dispatch).
    fn id(&self) -> &str;

    /// Run a completion and return the whole response.
    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResult>;

    /// Run a completion as a lazy, finite, single-consumer event stream.
    ///
    /// The returned stream owns a cancel capability; after `cancel()` the
    /// producer stops consuming the upstream connection on its next poll and
    /// the sequence terminates with no further events.
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;
}

// ---------------------------------------------------------------------------
// Cancellable stream handle
// ---------------------------------------------------------------------------

/// Idempotent cancel capability for an in-flight stream.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation.  Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A provider's completion event sequence plus its cancel capability.
///
/// Non-restartable: once the terminal `Done`/`Error` event (or `None` after
/// cancellation) has been observed, the stream is exhausted.
pub struct CompletionStream {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancelHandle,
}

impl CompletionStream {
    /// Create the producer/consumer pair for a stream.
    ///
    /// The producer task sends events on the returned sender and must watch
    /// the token: once cancelled, stop reading upstream and drop the sender
    /// so the receiver sees end-of-stream.
    pub fn channel(token: CancellationToken) -> (mpsc::Sender<StreamEvent>, CompletionStream) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let stream = CompletionStream {
            events: rx,
            cancel: CancelHandle { token },
        };
        (tx, stream)
    }

    /// Receive the next event, or `None` once the sequence has terminated.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Clone the cancel capability for use outside the consumer loop.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the stream in place.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_in_order_and_terminate() {
        let token = CancellationToken::new();
        let (tx, mut stream) = CompletionStream::channel(token);

        tokio::spawn(async move {
            tx.send(StreamEvent::Delta("Hel".into())).await.unwrap();
            tx.send(StreamEvent::Delta("lo".into())).await.unwrap();
            tx.send(StreamEvent::Done { stop_reason: None }).await.unwrap();
        });

        assert!(matches!(stream.next().await, Some(StreamEvent::Delta(d)) if d == "Hel"));
        assert!(matches!(stream.next().await, Some(StreamEvent::Delta(d)) if d == "lo"));
        assert!(matches!(stream.next().await, Some(StreamEvent::Done { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_producer() {
        let token = CancellationToken::new();
        let producer_token = token.clone();
        let (tx, mut stream) = CompletionStream::channel(token);

        let producer = tokio::spawn(async move {
            let mut sent = 0u32;
            loop {
                tokio::select! {
                    _ = producer_token.cancelled() => break,
                    ok = tx.send(StreamEvent::Delta("x".into())) => {
                        if ok.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                }
            }
            sent
        });

        // Read a few events, then cancel twice.
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        let handle = stream.cancel_handle();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        let sent = producer.await.unwrap();
        assert!(sent >= 2);

        // Drain: the sequence terminates without a task leak.
        while stream.next().await.is_some() {}
    }
}
