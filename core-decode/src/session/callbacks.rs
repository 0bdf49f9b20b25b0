//! Engine callbacks: buffer drain, prefetch status and play events.
//!
//! All three run on the engine thread. They report through the
//! [`SessionContext`] only, so none of them can block on the supervisor.

use super::metadata::{read_u32, MetadataKeyIndices};
use super::{EndCause, SessionContext};
use crate::error::DecodeError;
use crate::pool::{FrameBuffer, FrameBufferPool};
use crate::traits::{
    BufferCallback, EngineHandle, Permille, PlayCallback, PlayEventMask, PrefetchCallback,
    PrefetchEventMask, PrefetchStatus,
};
use core_runtime::events::DecodeEvent;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Buffer Ready
// ============================================================================

/// Drains filled buffers to the sink and returns them to the engine.
///
/// Owns the sink and the pool cursor. When the engine is destroyed the
/// handler is dropped with it, which flushes the sink.
pub struct BufferReadyHandler {
    ctx: Arc<SessionContext>,
    sink: Box<dyn Write + Send>,
    pool: FrameBufferPool,
    format_queried: bool,
    progress_log_interval: u64,
}

impl BufferReadyHandler {
    pub fn new(
        ctx: Arc<SessionContext>,
        sink: Box<dyn Write + Send>,
        pool: FrameBufferPool,
        progress_log_interval: u64,
    ) -> Self {
        Self {
            ctx,
            sink,
            pool,
            format_queried: false,
            progress_log_interval,
        }
    }

    pub fn into_callback(mut self) -> BufferCallback {
        Box::new(move |engine: &dyn EngineHandle, buffer: FrameBuffer| {
            self.on_buffer(engine, buffer)
        })
    }

    pub fn on_buffer(&mut self, engine: &dyn EngineHandle, mut buffer: FrameBuffer) {
        if self.ctx.has_write_failed() || self.ctx.has_engine_fault() {
            trace!(slot = buffer.slot(), "session stopping, buffer dropped");
            return;
        }

        let expected = self.pool.expected();
        if buffer.slot() != expected {
            self.ctx
                .report_engine_fault(DecodeError::BufferOrderViolation {
                    expected,
                    actual: buffer.slot(),
                });
            return;
        }

        // Flushed per buffer so a failure is charged to the buffer that caused it.
        let written = self
            .sink
            .write_all(buffer.as_slice())
            .and_then(|()| self.sink.flush());
        if let Err(e) = written {
            warn!(
                error = %e,
                bytes_written = self.ctx.bytes_written(),
                "sink write failed, stopping decode"
            );
            // Not re-enqueueing starves the engine.
            self.ctx.mark_write_failed();
            return;
        }

        let drained = self.ctx.record_drained(buffer.slot(), buffer.filled());
        self.pool.next();

        buffer.reset();
        if let Err(e) = engine.enqueue(buffer) {
            self.ctx.report_engine_fault(e);
            return;
        }

        if !self.format_queried {
            self.query_format(engine);
            self.format_queried = true;
        }

        if self.progress_log_interval > 0 && drained % self.progress_log_interval == 0 {
            match engine.position() {
                Ok(position) => debug!(
                    drained,
                    position_ms = position.as_millis() as u64,
                    "decode position"
                ),
                Err(e) => debug!(drained, error = %e, "position unavailable"),
            }
        }
    }

    fn query_format(&self, engine: &dyn EngineHandle) {
        let indices = MetadataKeyIndices::load(&self.ctx);
        let metadata = engine.metadata();

        let sample_rate = indices
            .sample_rate
            .map(|index| read_u32(metadata, index))
            .transpose();
        let channels = indices
            .channel_count
            .map(|index| read_u32(metadata, index))
            .transpose();

        match (sample_rate, channels) {
            (Ok(sample_rate), Ok(channels)) => {
                let sample_rate = sample_rate.flatten();
                let channels = channels.flatten();
                info!(?sample_rate, ?channels, "decoder output format");
                self.ctx.set_reported_format(sample_rate, channels);
                self.ctx.emit(DecodeEvent::FormatDiscovered {
                    session_id: self.ctx.id().to_string(),
                    sample_rate,
                    channels,
                });
            }
            (Err(e), _) | (_, Err(e)) => self.ctx.report_engine_fault(e),
        }
    }
}

impl Drop for BufferReadyHandler {
    fn drop(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!(error = %e, "sink flush failed");
            self.ctx.mark_write_failed();
        }
    }
}

// ============================================================================
// Prefetch
// ============================================================================

/// True when a prefetch event means the source could not be opened or read:
/// both status and fill level changed, to underflow and empty.
pub fn is_prefetch_error(mask: PrefetchEventMask, status: PrefetchStatus, level: Permille) -> bool {
    mask.contains(PrefetchEventMask::STATUS_CHANGE | PrefetchEventMask::FILL_LEVEL_CHANGE)
        && status == PrefetchStatus::Underflow
        && level == 0
}

pub struct PrefetchEventHandler {
    ctx: Arc<SessionContext>,
}

impl PrefetchEventHandler {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    pub fn into_callback(self) -> PrefetchCallback {
        Box::new(move |engine: &dyn EngineHandle, mask: PrefetchEventMask| {
            self.on_event(engine, mask)
        })
    }

    pub fn on_event(&self, engine: &dyn EngineHandle, mask: PrefetchEventMask) {
        let query = engine.prefetch();
        let level = match query.fill_level() {
            Ok(level) => level,
            Err(e) => return self.ctx.report_engine_fault(e),
        };
        let status = match query.prefetch_status() {
            Ok(status) => status,
            Err(e) => return self.ctx.report_engine_fault(e),
        };
        trace!(?mask, ?status, level, "prefetch event");

        if is_prefetch_error(mask, status, level) {
            warn!("prefetch error: source could not be opened or read");
            self.ctx.mark_prefetch_error();
        }
    }
}

// ============================================================================
// Play
// ============================================================================

pub struct PlayEventHandler {
    ctx: Arc<SessionContext>,
}

impl PlayEventHandler {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    pub fn into_callback(self) -> PlayCallback {
        Box::new(move |engine: &dyn EngineHandle, mask: PlayEventMask| {
            self.on_event(engine, mask)
        })
    }

    pub fn on_event(&self, engine: &dyn EngineHandle, mask: PlayEventMask) {
        if mask.contains(PlayEventMask::HEAD_AT_MARKER) {
            debug!("marker reached");
        }

        if mask.contains(PlayEventMask::HEAD_AT_NEW_POS) {
            match engine.position() {
                Ok(position) => self.ctx.emit(DecodeEvent::Progress {
                    session_id: self.ctx.id().to_string(),
                    position_ms: position.as_millis() as u64,
                }),
                Err(e) => debug!(error = %e, "position unavailable"),
            }
        }

        if mask.contains(PlayEventMask::HEAD_AT_END) {
            self.ctx.signal_end_of_stream(EndCause::Natural);
        }
    }
}
