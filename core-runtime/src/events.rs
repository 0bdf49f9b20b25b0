//! # Event Bus System
//!
//! Publishes decode-session lifecycle events over `tokio::sync::broadcast`, so
//! hosts can observe a decode without polling it.
//!
//! ## Overview
//!
//! - **DecodeEvent**: one enum covering a session from configuration to teardown
//! - **EventBus**: broadcast channel shared by the supervisor and the engine callbacks
//! - **EventStream**: receiver wrapper with optional filtering
//!
//! ```text
//! ┌────────────┐     emit      ┌───────────┐
//! │ Supervisor ├──────────────>│           │     subscribe    ┌────────────┐
//! └────────────┘               │ EventBus  ├─────────────────>│ Subscriber │
//! ┌────────────┐     emit      │ (broadcast│                  └────────────┘
//! │ Callbacks  ├──────────────>│  channel) │
//! └────────────┘               └───────────┘
//! ```
//!
//! Emission never blocks, which is what makes it safe to call from the
//! engine's callback thread. A bus with no subscribers simply drops events.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{DecodeEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(32);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(DecodeEvent::Prefetching {
//!     session_id: "a1".to_string(),
//! })
//! .ok();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.session_id(), "a1");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; it can keep going.
//!   Progress events are the usual cause on long files.
//! - **`RecvError::Closed`**: every sender is gone.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 64;

/// Lifecycle events of one decode session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DecodeEvent {
    /// Engine player created and callbacks registered.
    Configured {
        session_id: String,
        /// Source display name (basename only).
        source: String,
        requested_sample_rate: u32,
    },
    /// Buffers enqueued, engine paused, waiting for prefetch.
    Prefetching { session_id: String },
    /// Prefetch reached sufficient data.
    PrefetchReady {
        session_id: String,
        /// Stream duration if the engine knows it.
        duration_ms: Option<u64>,
    },
    /// The engine reported its output format.
    FormatDiscovered {
        session_id: String,
        sample_rate: Option<u32>,
        channels: Option<u32>,
    },
    /// Periodic position update.
    Progress { session_id: String, position_ms: u64 },
    /// End-of-stream flag raised.
    EndOfStream {
        session_id: String,
        /// Natural, write failure, prefetch error, engine fault or cancellation.
        cause: String,
    },
    /// Session torn down.
    Stopped {
        session_id: String,
        bytes_written: u64,
        buffers_drained: u64,
    },
    /// Session finished with an error.
    Failed {
        session_id: String,
        message: String,
        recoverable: bool,
    },
}

impl DecodeEvent {
    pub fn session_id(&self) -> &str {
        match self {
            DecodeEvent::Configured { session_id, .. }
            | DecodeEvent::Prefetching { session_id }
            | DecodeEvent::PrefetchReady { session_id, .. }
            | DecodeEvent::FormatDiscovered { session_id, .. }
            | DecodeEvent::Progress { session_id, .. }
            | DecodeEvent::EndOfStream { session_id, .. }
            | DecodeEvent::Stopped { session_id, .. }
            | DecodeEvent::Failed { session_id, .. } => session_id,
        }
    }

    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            DecodeEvent::Configured { .. } => "Decoder configured",
            DecodeEvent::Prefetching { .. } => "Prefetching source",
            DecodeEvent::PrefetchReady { .. } => "Prefetch complete",
            DecodeEvent::FormatDiscovered { .. } => "Output format discovered",
            DecodeEvent::Progress { .. } => "Decode progress",
            DecodeEvent::EndOfStream { .. } => "End of stream",
            DecodeEvent::Stopped { .. } => "Decoder stopped",
            DecodeEvent::Failed { .. } => "Decode failed",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            DecodeEvent::Failed {
                recoverable: false, ..
            } => EventSeverity::Error,
            DecodeEvent::Failed { .. } => EventSeverity::Warning,
            DecodeEvent::Stopped { .. } | DecodeEvent::FormatDiscovered { .. } => {
                EventSeverity::Info
            }
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Central event bus for publishing and subscribing to decode events.
///
/// Cloning the bus clones the sender; every clone publishes into the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DecodeEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if nobody is listening.
    pub fn emit(&self, event: DecodeEvent) -> Result<usize, SendError<DecodeEvent>> {
        self.sender.send(event)
    }

    /// Each receiver sees every event emitted after it subscribed.
    pub fn subscribe(&self) -> Receiver<DecodeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

type EventFilter = Box<dyn Fn(&DecodeEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{DecodeEvent, EventBus, EventStream};
///
/// let bus = EventBus::default();
/// let session = "5f1c".to_string();
/// let stream = EventStream::new(bus.subscribe())
///     .filter(move |event| event.session_id() == session);
/// ```
pub struct EventStream {
    receiver: Receiver<DecodeEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<DecodeEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv` and `try_recv`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DecodeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &DecodeEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<DecodeEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<DecodeEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    /// Drains every event currently buffered, skipping lag markers.
    pub fn drain(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        while let Some(result) = self.try_recv() {
            match result {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        events
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
