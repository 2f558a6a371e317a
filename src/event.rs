//! Streaming dispatch: the orchestrator emits [`StreamEvent`]s onto a
//! bounded channel as a turn progresses; a transport (SSE, a test harness,
//! whatever [`EventHandler`] a caller registers) drains them independently.
//!
//! # Architecture
//!
//! This mirrors the teacher's `EventHandler`/dual-dispatch idiom — a single
//! trait with a default no-op method so callers only override what they
//! care about, wrapped in `Arc<dyn EventHandler>` and shared across a turn —
//! collapsed from the teacher's two concrete payload enums (`AgentEvent`,
//! `OrchestrationEvent`, tied to a generic multi-mode engine this crate
//! doesn't have) down to the one `StreamEvent` envelope the fixed 7-stage
//! pipeline actually produces (§4.8).
//!
//! # Example
//!
//! ```rust
//! use conclave::event::{EventHandler, StreamEvent};
//! use async_trait::async_trait;
//!
//! struct LoggingHandler;
//!
//! #[async_trait]
//! impl EventHandler for LoggingHandler {
//!     async fn on_stream_event(&self, event: &StreamEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Default capacity of the channel a [`StreamDispatcher`] is built with.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// How long a turn waits for its streaming worker to drain before giving up
/// and discarding the rest (§5).
pub const STREAM_WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Which of the three kinds of progress line a [`StreamEvent::ChatCallback`]
/// carries (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackType {
    /// An in-progress stage update (memory scan, planning, routing, ...).
    Thinking,
    /// A reply-type action's payload, emitted as soon as the Planner
    /// produces it rather than held back for the final [`StreamEvent::Response`].
    Reply,
    /// A recoverable error surfaced mid-turn that did not abort it.
    Error,
}

/// The SSE envelope a turn emits, in order, as it runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A human-readable progress line tied to one of the 7 pipeline stages
    /// (e.g. the Planner/Supervisor/Router/Executor label strings).
    ChatCallback {
        cid: String,
        callback_type: CallbackType,
        stage: String,
        message: String,
    },
    /// An incremental delta from a streaming agent call.
    AgentStream {
        cid: String,
        agent: String,
        delta: String,
    },
    /// The turn's final reply.
    Response { cid: String, content: String },
    /// A terminal failure for the turn.
    Error { cid: String, message: String },
}

/// Receives [`StreamEvent`]s as a turn runs. Default method is a no-op so
/// callers only implement what they need.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_stream_event(&self, _event: &StreamEvent) {}
}

/// A handler that does nothing; the default when a caller doesn't care
/// about streaming at all.
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {}

/// The sending half of a turn's event channel. Cloned freely — every stage
/// of the pipeline holds one.
#[derive(Clone)]
pub struct StreamDispatcher {
    sender: mpsc::Sender<StreamEvent>,
}

impl StreamDispatcher {
    /// Build a dispatcher and its receiver with the given channel capacity.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Emit an event. A full or disconnected channel (the receiving side
    /// gave up, e.g. the client dropped the SSE connection) is logged and
    /// discarded rather than propagated as an error — per §4.8, streaming
    /// failures never abort the underlying turn.
    pub async fn emit(&self, event: StreamEvent) {
        if let Err(e) = self.sender.send(event).await {
            log::warn!("stream event dropped, receiver gone: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_to_receiver() {
        let (dispatcher, mut rx) = StreamDispatcher::new(STREAM_CHANNEL_CAPACITY);
        dispatcher
            .emit(StreamEvent::Response {
                cid: "c1".into(),
                content: "done".into(),
            })
            .await;
        match rx.recv().await.unwrap() {
            StreamEvent::Response { cid, content } => {
                assert_eq!(cid, "c1");
                assert_eq!(content, "done");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_does_not_panic() {
        let (dispatcher, rx) = StreamDispatcher::new(1);
        drop(rx);
        dispatcher
            .emit(StreamEvent::Error {
                cid: "c1".into(),
                message: "boom".into(),
            })
            .await;
    }
}
