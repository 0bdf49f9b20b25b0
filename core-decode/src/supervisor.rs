//! # Session Supervisor
//!
//! Drives one decode from source resolution to teardown on the calling
//! thread.
//!
//! ```text
//! resolve source → open destination → create player → realize
//!     → register callbacks → enqueue N buffers → Paused
//!     → prefetch handshake → metadata bootstrap → Playing
//!     → poll end-of-stream → Stopped → destroy → report
//! ```
//!
//! The supervisor only ever sleeps in the two bounded polls. Everything the
//! engine thread wants to say arrives through the [`SessionContext`] flags
//! and its signal channel.

use crate::config::{DecodeConfig, SessionState};
use crate::decoder::SymphoniaEngine;
use crate::error::{DecodeError, Result};
use crate::pool::FrameBufferPool;
use crate::session::{
    bootstrap, BufferReadyHandler, EndCause, PlayEventHandler, PrefetchEventHandler,
    PrefetchHandshake, SessionContext, SessionSignal,
};
use crate::source::{resolve, AssetResolver, ResolvedSource, SourceDescriptor};
use crate::traits::{
    DecodeEngine, DecodePlayer, PcmFormat, PlayEventMask, PlayState, PrefetchEventMask,
    SampleRate,
};
use core_runtime::events::{DecodeEvent, EventBus};
use core_runtime::logging::strip_path;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, trace, warn};

/// Summary of a completed decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeReport {
    pub session_id: String,
    /// The rate the engine was configured with (after mapping to a supported one).
    pub requested_sample_rate: SampleRate,
    /// Rate the decoder reported for its output, if it did.
    pub reported_sample_rate: Option<u32>,
    pub reported_channels: Option<u32>,
    pub bytes_written: u64,
    pub buffers_drained: u64,
    /// Stream duration as probed by the engine.
    pub duration: Option<Duration>,
    /// Wall-clock time spent in the session.
    pub elapsed: Duration,
    pub end: EndCause,
}

/// Decode entry point: an engine plus configuration.
///
/// # Example
///
/// ```rust,no_run
/// use core_decode::{Flac2Raw, SourceDescriptor};
///
/// # fn main() -> core_decode::Result<()> {
/// let report = Flac2Raw::new().decode(
///     SourceDescriptor::path("/sdcard/Music/track.flac"),
///     "/sdcard/Music/track.raw",
///     44100,
/// )?;
/// println!("{} bytes at {:?} Hz", report.bytes_written, report.reported_sample_rate);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Flac2Raw {
    engine: Arc<dyn DecodeEngine>,
    config: DecodeConfig,
    assets: Option<Arc<dyn AssetResolver>>,
    events: Option<EventBus>,
    cancel: CancellationToken,
}

impl Default for Flac2Raw {
    fn default() -> Self {
        Self::new()
    }
}

impl Flac2Raw {
    /// Symphonia engine, default configuration, no asset resolver.
    pub fn new() -> Self {
        Self {
            engine: Arc::new(SymphoniaEngine),
            config: DecodeConfig::default(),
            assets: None,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn DecodeEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_config(mut self, config: DecodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolver used for [`SourceDescriptor::Asset`].
    pub fn with_assets(mut self, assets: Arc<dyn AssetResolver>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Token observed by the prefetch handshake and the end-of-stream poll.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Decode `source` into a raw PCM file at `destination`.
    ///
    /// The source is resolved before the destination is touched; the
    /// destination is opened (truncating) before the engine is configured.
    #[instrument(
        skip(self, source, destination),
        fields(source = %strip_path(&source.label()), rate = target_sample_rate_hz)
    )]
    pub fn decode(
        &self,
        source: SourceDescriptor,
        destination: impl AsRef<Path>,
        target_sample_rate_hz: u32,
    ) -> Result<DecodeReport> {
        self.config.validate()?;
        let source = resolve(source, self.assets.as_deref())?;

        let destination = destination.as_ref();
        let file = File::create(destination).map_err(|e| {
            DecodeError::DestinationUnwritable(format!(
                "{}: {}",
                strip_path(&destination.to_string_lossy()),
                e
            ))
        })?;

        self.run_session(source, Box::new(file), target_sample_rate_hz)
    }

    /// Decode `source` into an arbitrary sink.
    #[instrument(
        skip(self, source, sink),
        fields(source = %strip_path(&source.label()), rate = target_sample_rate_hz)
    )]
    pub fn decode_to_writer(
        &self,
        source: SourceDescriptor,
        sink: Box<dyn Write + Send>,
        target_sample_rate_hz: u32,
    ) -> Result<DecodeReport> {
        self.config.validate()?;
        let source = resolve(source, self.assets.as_deref())?;
        self.run_session(source, sink, target_sample_rate_hz)
    }

    /// [`decode`](Self::decode) on tokio's blocking pool.
    pub async fn decode_async(
        &self,
        source: SourceDescriptor,
        destination: PathBuf,
        target_sample_rate_hz: u32,
    ) -> Result<DecodeReport> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.decode(source, destination, target_sample_rate_hz))
            .await
            .map_err(|e| DecodeError::Internal(format!("decode task failed: {}", e)))?
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    fn run_session(
        &self,
        source: ResolvedSource,
        sink: Box<dyn Write + Send>,
        target_sample_rate_hz: u32,
    ) -> Result<DecodeReport> {
        let requested = SampleRate::from_hz(target_sample_rate_hz);
        if !SampleRate::is_supported(target_sample_rate_hz) {
            info!(
                target_hz = target_sample_rate_hz,
                using = %requested,
                "Unsupported target rate"
            );
        }

        let (ctx, mut signals) = SessionContext::new(self.events.clone());
        let ctx = Arc::new(ctx);
        let span = info_span!("session", id = %ctx.id());
        let _enter = span.enter();
        let started = Instant::now();

        ctx.emit(DecodeEvent::Configured {
            session_id: ctx.id().to_string(),
            source: strip_path(source.name()).to_string(),
            requested_sample_rate: requested.as_hz(),
        });

        let mut state = SessionState::Configured;
        let driven = self.drive(&ctx, &mut signals, &mut state, source, sink, requested);

        // Teardown is done; the sink has been flushed and closed.
        let late_fault = drain_signals(&mut signals).err();
        let outcome = match driven {
            Err(e) => Err(late_fault.unwrap_or(e)),
            Ok(duration) => match late_fault {
                Some(fault) => Err(fault),
                None => self.conclude(&ctx, requested, duration, started.elapsed()),
            },
        };

        let terminal = match &outcome {
            Ok(_) => SessionState::Stopped,
            Err(_) => SessionState::Aborted,
        };
        advance(&mut state, terminal);

        match &outcome {
            Ok(report) => {
                info!(
                    bytes_written = report.bytes_written,
                    buffers = report.buffers_drained,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Decode complete"
                );
                ctx.emit(DecodeEvent::Stopped {
                    session_id: ctx.id().to_string(),
                    bytes_written: report.bytes_written,
                    buffers_drained: report.buffers_drained,
                });
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "Decode failed");
                ctx.emit(DecodeEvent::Failed {
                    session_id: ctx.id().to_string(),
                    message: e.to_string(),
                    recoverable: e.is_recoverable(),
                });
            }
        }

        outcome
    }

    /// Create the player, run it until end of stream and always destroy it.
    fn drive(
        &self,
        ctx: &Arc<SessionContext>,
        signals: &mut UnboundedReceiver<SessionSignal>,
        state: &mut SessionState,
        source: ResolvedSource,
        sink: Box<dyn Write + Send>,
        requested: SampleRate,
    ) -> Result<Option<Duration>> {
        let format = PcmFormat::mono_pcm16le(requested);
        let mut player = self
            .engine
            .create_player(source, format, self.config.buffer_count)?;
        debug!(engine = self.engine.name(), "Player created");

        let result = self.play(ctx, signals, state, player.as_mut(), sink);

        if let Err(e) = player.set_play_state(PlayState::Stopped) {
            debug!(error = %e, "Stopping player failed");
        }
        player.destroy();
        debug!("Player destroyed");

        result
    }

    fn play(
        &self,
        ctx: &Arc<SessionContext>,
        signals: &mut UnboundedReceiver<SessionSignal>,
        state: &mut SessionState,
        player: &mut dyn DecodePlayer,
        sink: Box<dyn Write + Send>,
    ) -> Result<Option<Duration>> {
        let config = &self.config;
        player.realize()?;

        let mut play_mask = PlayEventMask::HEAD_AT_END;
        if let Some(period) = config.position_update_period {
            player.set_position_update_period(period)?;
            play_mask = play_mask | PlayEventMask::HEAD_AT_NEW_POS;
        }
        if let Some(marker) = config.marker_position {
            player.set_marker_position(marker)?;
            play_mask = play_mask | PlayEventMask::HEAD_AT_MARKER;
        }
        player.register_play_callback(PlayEventHandler::new(Arc::clone(ctx)).into_callback(), play_mask)?;

        let mut pool = FrameBufferPool::new(config.buffer_count, config.buffer_size_bytes());
        let buffers = pool.allocate()?;
        let handler =
            BufferReadyHandler::new(Arc::clone(ctx), sink, pool, config.progress_log_interval);
        player.register_buffer_callback(handler.into_callback())?;

        for buffer in buffers {
            player.enqueue(buffer)?;
        }

        player.register_prefetch_callback(
            PrefetchEventHandler::new(Arc::clone(ctx)).into_callback(),
            PrefetchEventMask::STATUS_CHANGE | PrefetchEventMask::FILL_LEVEL_CHANGE,
        )?;

        // Configured → Prefetching
        advance(state, SessionState::Prefetching);
        ctx.emit(DecodeEvent::Prefetching {
            session_id: ctx.id().to_string(),
        });
        player.set_play_state(PlayState::Paused)?;

        let outcome = PrefetchHandshake::from_config(config).run(player.prefetch(), ctx, &self.cancel)?;
        drain_signals(signals)?;
        outcome.into_result()?;

        let duration = player.duration()?;
        info!(
            duration_ms = duration.map(|d| d.as_millis() as u64),
            polls = outcome.polls,
            "Prefetch ready"
        );
        ctx.emit(DecodeEvent::PrefetchReady {
            session_id: ctx.id().to_string(),
            duration_ms: duration.map(|d| d.as_millis() as u64),
        });

        let indices = bootstrap(player.metadata())?;
        indices.store(ctx);

        // Prefetching → Playing
        advance(state, SessionState::Playing);
        player.set_play_state(PlayState::Playing)?;

        loop {
            thread::sleep(config.eos_poll_interval);
            drain_signals(signals)?;

            if self.cancel.is_cancelled() {
                ctx.signal_end_of_stream(EndCause::Cancelled);
                return Err(DecodeError::Cancelled);
            }
            if ctx.is_end_of_stream() {
                break;
            }
        }

        Ok(duration)
    }

    /// Choose between clean completion and a reported error once the
    /// engine is gone.
    fn conclude(
        &self,
        ctx: &SessionContext,
        requested: SampleRate,
        duration: Option<Duration>,
        elapsed: Duration,
    ) -> Result<DecodeReport> {
        let end = ctx.end_cause().unwrap_or(EndCause::Natural);

        if end == EndCause::Cancelled {
            return Err(DecodeError::Cancelled);
        }
        if ctx.has_prefetch_error() {
            return Err(DecodeError::PrefetchFailed(
                "engine reported an underflow with an empty buffer while playing".to_string(),
            ));
        }
        if ctx.has_write_failed() {
            return Err(DecodeError::SinkWriteFailed {
                bytes_written: ctx.bytes_written(),
            });
        }

        let reported_sample_rate = ctx.reported_sample_rate();
        if let Some(rate) = reported_sample_rate {
            if rate != requested.as_hz() {
                warn!(
                    requested = requested.as_hz(),
                    reported = rate,
                    "Decoder output rate differs from the requested rate"
                );
            }
        }

        Ok(DecodeReport {
            session_id: ctx.id().to_string(),
            requested_sample_rate: requested,
            reported_sample_rate,
            reported_channels: ctx.reported_channels(),
            bytes_written: ctx.bytes_written(),
            buffers_drained: ctx.buffers_drained(),
            duration,
            elapsed,
            end,
        })
    }
}

/// Decode with the default [`Flac2Raw`].
pub fn decode(
    source: SourceDescriptor,
    destination: impl AsRef<Path>,
    target_sample_rate_hz: u32,
) -> Result<DecodeReport> {
    Flac2Raw::new().decode(source, destination, target_sample_rate_hz)
}

fn advance(state: &mut SessionState, next: SessionState) {
    debug_assert!(state.can_transition_to(next), "{:?} -> {:?}", state, next);
    debug!(from = ?*state, to = ?next, "Session state");
    *state = next;
}

/// Empty the signal queue. The first engine fault found is returned as the error.
fn drain_signals(signals: &mut UnboundedReceiver<SessionSignal>) -> Result<()> {
    while let Ok(signal) = signals.try_recv() {
        match signal {
            SessionSignal::EngineFault(e) => return Err(e),
            SessionSignal::BufferFilled { slot, bytes } => trace!(slot, bytes, "buffer signal"),
            SessionSignal::EndOfStream(cause) => debug!(%cause, "end-of-stream signal"),
            SessionSignal::PrefetchError => debug!("prefetch error signal"),
        }
    }
    Ok(())
}
