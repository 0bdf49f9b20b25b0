//! # Decode Session
//!
//! State shared between the supervisor and the callbacks it registers with
//! the engine, plus the callback logic itself.
//!
//! ## Overview
//!
//! One [`SessionContext`] exists per decode call. The supervisor and every
//! callback hold it through an `Arc`, so it outlives the engine's last
//! callback. Callbacks only touch atomics and post [`SessionSignal`]s over an
//! unbounded channel; they never wait on the supervisor.
//!
//! End of stream has three writers (natural end, sink write failure, prefetch
//! error) plus engine faults and cancellation. Each is an idempotent flag
//! store, and the cause is recorded once so the supervisor can tell a clean
//! completion from a reported failure.

pub mod callbacks;
pub mod metadata;
pub mod prefetch;

use crate::error::DecodeError;
use core_runtime::events::{DecodeEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

pub use callbacks::{is_prefetch_error, BufferReadyHandler, PlayEventHandler, PrefetchEventHandler};
pub use metadata::{bootstrap, MetadataKeyIndices};
pub use prefetch::{PrefetchHandshake, PrefetchState};

/// Why the end-of-stream flag was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndCause {
    /// The engine reached the end of the source.
    Natural,
    /// The sink refused a write.
    WriteFailed,
    /// The engine reported an open or fetch failure.
    PrefetchError,
    /// An engine call failed inside a callback.
    EngineFault,
    Cancelled,
}

impl EndCause {
    fn as_u8(self) -> u8 {
        match self {
            EndCause::Natural => 1,
            EndCause::WriteFailed => 2,
            EndCause::PrefetchError => 3,
            EndCause::EngineFault => 4,
            EndCause::Cancelled => 5,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EndCause::Natural),
            2 => Some(EndCause::WriteFailed),
            3 => Some(EndCause::PrefetchError),
            4 => Some(EndCause::EngineFault),
            5 => Some(EndCause::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for EndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndCause::Natural => "natural",
            EndCause::WriteFailed => "write_failed",
            EndCause::PrefetchError => "prefetch_error",
            EndCause::EngineFault => "engine_fault",
            EndCause::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Messages posted by callbacks for the supervisor's wait loop.
#[derive(Debug)]
pub enum SessionSignal {
    BufferFilled { slot: usize, bytes: usize },
    EndOfStream(EndCause),
    PrefetchError,
    EngineFault(DecodeError),
}

/// A metadata key position, `-1` while unresolved.
#[derive(Debug)]
pub struct KeyIndexCell(AtomicI32);

impl KeyIndexCell {
    const UNRESOLVED: i32 = -1;

    pub fn new() -> Self {
        Self(AtomicI32::new(Self::UNRESOLVED))
    }

    pub fn get(&self) -> Option<u32> {
        u32::try_from(self.0.load(Ordering::Acquire)).ok()
    }

    pub fn set(&self, index: Option<u32>) {
        let raw = index
            .and_then(|i| i32::try_from(i).ok())
            .unwrap_or(Self::UNRESOLVED);
        self.0.store(raw, Ordering::Release);
    }
}

impl Default for KeyIndexCell {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the supervisor and every callback of one decode.
pub struct SessionContext {
    id: String,
    eos: AtomicBool,
    end_cause: AtomicU8,
    prefetch_error: AtomicBool,
    write_failed: AtomicBool,
    engine_fault: AtomicBool,
    pub(crate) sample_rate_key: KeyIndexCell,
    pub(crate) channel_count_key: KeyIndexCell,
    reported_sample_rate: AtomicU32,
    reported_channels: AtomicU32,
    buffers_drained: AtomicU64,
    bytes_written: AtomicU64,
    signals: mpsc::UnboundedSender<SessionSignal>,
    events: Option<EventBus>,
}

impl SessionContext {
    /// New context plus the receiving end of its signal channel.
    pub fn new(events: Option<EventBus>) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let context = Self {
            id: Uuid::new_v4().to_string(),
            eos: AtomicBool::new(false),
            end_cause: AtomicU8::new(0),
            prefetch_error: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            engine_fault: AtomicBool::new(false),
            sample_rate_key: KeyIndexCell::new(),
            channel_count_key: KeyIndexCell::new(),
            reported_sample_rate: AtomicU32::new(0),
            reported_channels: AtomicU32::new(0),
            buffers_drained: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            signals,
            events,
        };
        (context, receiver)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ------------------------------------------------------------------
    // Terminal flags
    // ------------------------------------------------------------------

    /// Raise the end-of-stream flag. The first cause wins; later calls only
    /// re-store `true`.
    pub fn signal_end_of_stream(&self, cause: EndCause) {
        let first = self
            .end_cause
            .compare_exchange(0, cause.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.eos.store(true, Ordering::Release);

        if first {
            debug!(session = %self.id, %cause, "end of stream");
            self.post(SessionSignal::EndOfStream(cause));
            self.emit(DecodeEvent::EndOfStream {
                session_id: self.id.clone(),
                cause: cause.to_string(),
            });
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    pub fn end_cause(&self) -> Option<EndCause> {
        EndCause::from_u8(self.end_cause.load(Ordering::Acquire))
    }

    pub fn mark_prefetch_error(&self) {
        if !self.prefetch_error.swap(true, Ordering::AcqRel) {
            self.post(SessionSignal::PrefetchError);
        }
        self.signal_end_of_stream(EndCause::PrefetchError);
    }

    pub fn has_prefetch_error(&self) -> bool {
        self.prefetch_error.load(Ordering::Acquire)
    }

    pub fn mark_write_failed(&self) {
        self.write_failed.store(true, Ordering::Release);
        self.signal_end_of_stream(EndCause::WriteFailed);
    }

    pub fn has_write_failed(&self) -> bool {
        self.write_failed.load(Ordering::Acquire)
    }

    /// Record an engine-call failure seen inside a callback and stop the session.
    pub fn report_engine_fault(&self, error: DecodeError) {
        self.engine_fault.store(true, Ordering::Release);
        self.post(SessionSignal::EngineFault(error));
        self.signal_end_of_stream(EndCause::EngineFault);
    }

    pub fn has_engine_fault(&self) -> bool {
        self.engine_fault.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Discovered format
    // ------------------------------------------------------------------

    pub fn set_reported_format(&self, sample_rate: Option<u32>, channels: Option<u32>) {
        if let Some(rate) = sample_rate {
            self.reported_sample_rate.store(rate, Ordering::Release);
        }
        if let Some(channels) = channels {
            self.reported_channels.store(channels, Ordering::Release);
        }
    }

    pub fn reported_sample_rate(&self) -> Option<u32> {
        non_zero(self.reported_sample_rate.load(Ordering::Acquire))
    }

    pub fn reported_channels(&self) -> Option<u32> {
        non_zero(self.reported_channels.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Count a drained buffer; returns the new total.
    pub fn record_drained(&self, slot: usize, bytes: usize) -> u64 {
        self.bytes_written.fetch_add(bytes as u64, Ordering::AcqRel);
        let drained = self.buffers_drained.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(slot, bytes, drained, "buffer drained");
        self.post(SessionSignal::BufferFilled { slot, bytes });
        drained
    }

    pub fn buffers_drained(&self) -> u64 {
        self.buffers_drained.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn post(&self, signal: SessionSignal) {
        // The receiver is gone once the supervisor returned; nothing to tell.
        let _ = self.signals.send(signal);
    }

    /// Publish on the event bus, if one is attached. Never blocks.
    pub fn emit(&self, event: DecodeEvent) {
        if let Some(bus) = &self.events {
            let _ = bus.emit(event);
        }
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("eos", &self.is_end_of_stream())
            .field("end_cause", &self.end_cause())
            .field("prefetch_error", &self.has_prefetch_error())
            .field("write_failed", &self.has_write_failed())
            .field("buffers_drained", &self.buffers_drained())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

fn non_zero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}
