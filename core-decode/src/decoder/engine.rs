//! # Threaded Decode Engine
//!
//! [`SymphoniaEngine`] builds [`SymphoniaPlayer`]s. Each player owns one
//! engine thread that opens the source when paused, then fills enqueued
//! buffers in order while playing and hands each full buffer to the buffer
//! callback.
//!
//! ## Locking
//!
//! - `state` guards play state, the fill queue and shutdown. It is never
//!   held while a callback runs.
//! - `callbacks` is held for the duration of a callback. Callbacks may call
//!   back into the engine through [`EngineHandle`]; none of those paths take
//!   the `callbacks` lock.

use super::{MetadataCatalogue, PcmStream};
use crate::error::{DecodeError, Result};
use crate::pool::FrameBuffer;
use crate::source::ResolvedSource;
use crate::traits::{
    ensure_mono_pcm16le, BufferCallback, DecodeEngine, DecodePlayer, EngineHandle,
    MetadataExtraction, MetadataInfo, PcmFormat, Permille, PlayCallback, PlayEventMask,
    PlayState, PrefetchCallback, PrefetchEventMask, PrefetchStatus, PrefetchStatusQuery,
    BUFFER_SIZE_IN_BYTES,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ENGINE_THREAD_NAME: &str = "flac2raw-engine";

const UNKNOWN_DURATION: u64 = u64::MAX;

/// Engine backed by Symphonia's pure-Rust demuxers and codecs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaEngine;

impl DecodeEngine for SymphoniaEngine {
    fn name(&self) -> &str {
        "symphonia"
    }

    fn create_player(
        &self,
        source: ResolvedSource,
        format: PcmFormat,
        buffer_count: usize,
    ) -> Result<Box<dyn DecodePlayer>> {
        ensure_mono_pcm16le(&format)?;
        if buffer_count == 0 {
            return Err(DecodeError::engine(
                "create_player",
                "buffer queue depth must be positive",
            ));
        }

        debug!(
            source = %source.name(),
            requested = %format.sample_rate,
            buffer_count,
            "Creating player"
        );
        Ok(Box::new(SymphoniaPlayer::new(source, format, buffer_count)))
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct EngineState {
    play_state: PlayState,
    queue: VecDeque<FrameBuffer>,
    shutdown: bool,
}

#[derive(Default)]
struct Callbacks {
    buffer: Option<BufferCallback>,
    play: Option<(PlayCallback, PlayEventMask)>,
    prefetch: Option<(PrefetchCallback, PrefetchEventMask)>,
    marker: Option<Duration>,
    update_period: Option<Duration>,
}

fn status_to_u8(status: PrefetchStatus) -> u8 {
    match status {
        PrefetchStatus::Underflow => 0,
        PrefetchStatus::SufficientData => 1,
        PrefetchStatus::Overflow => 2,
    }
}

fn status_from_u8(value: u8) -> PrefetchStatus {
    match value {
        1 => PrefetchStatus::SufficientData,
        2 => PrefetchStatus::Overflow,
        _ => PrefetchStatus::Underflow,
    }
}

/// State shared between a player and its engine thread. This is the
/// `&dyn EngineHandle` every callback receives.
struct Shared {
    state: Mutex<EngineState>,
    wake: Condvar,
    callbacks: Mutex<Callbacks>,
    catalogue: RwLock<MetadataCatalogue>,
    prefetch_status: AtomicU8,
    fill_level: AtomicU16,
    frames_out: AtomicU64,
    sample_rate: AtomicU32,
    duration_ms: AtomicU64,
    buffer_count: usize,
}

impl Shared {
    fn new(buffer_count: usize) -> Self {
        Self {
            state: Mutex::new(EngineState {
                play_state: PlayState::Stopped,
                queue: VecDeque::with_capacity(buffer_count),
                shutdown: false,
            }),
            wake: Condvar::new(),
            callbacks: Mutex::new(Callbacks::default()),
            catalogue: RwLock::new(MetadataCatalogue::new()),
            prefetch_status: AtomicU8::new(status_to_u8(PrefetchStatus::Underflow)),
            fill_level: AtomicU16::new(0),
            frames_out: AtomicU64::new(0),
            sample_rate: AtomicU32::new(0),
            duration_ms: AtomicU64::new(UNKNOWN_DURATION),
            buffer_count,
        }
    }

    fn is_playing(&self) -> bool {
        let state = self.state.lock();
        !state.shutdown && state.play_state == PlayState::Playing
    }

    fn requeue(&self, buffer: FrameBuffer) {
        self.state.lock().queue.push_front(buffer);
    }

    fn set_prefetch(&self, status: PrefetchStatus, level: Permille) {
        self.fill_level.store(level, Ordering::Release);
        self.prefetch_status
            .store(status_to_u8(status), Ordering::Release);
    }

    fn fire_prefetch(&self, event: PrefetchEventMask) {
        let mut callbacks = self.callbacks.lock();
        if let Some((callback, mask)) = callbacks.prefetch.as_mut() {
            let delivered = event & *mask;
            if !delivered.is_empty() {
                callback(self as &dyn EngineHandle, delivered);
            }
        }
    }

    fn fire_play(&self, event: PlayEventMask) {
        let mut callbacks = self.callbacks.lock();
        if let Some((callback, mask)) = callbacks.play.as_mut() {
            let delivered = event & *mask;
            if !delivered.is_empty() {
                callback(self as &dyn EngineHandle, delivered);
            }
        }
    }

    fn duration(&self) -> Option<Duration> {
        match self.duration_ms.load(Ordering::Acquire) {
            UNKNOWN_DURATION => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl EngineHandle for Shared {
    fn enqueue(&self, buffer: FrameBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(DecodeError::engine("enqueue", "player destroyed"));
        }
        if state.queue.len() >= self.buffer_count {
            return Err(DecodeError::engine(
                "enqueue",
                format!("buffer queue full ({} buffers)", self.buffer_count),
            ));
        }
        state.queue.push_back(buffer);
        drop(state);

        self.wake.notify_all();
        Ok(())
    }

    fn metadata(&self) -> &dyn MetadataExtraction {
        self
    }

    fn prefetch(&self) -> &dyn PrefetchStatusQuery {
        self
    }

    fn position(&self) -> Result<Duration> {
        let rate = self.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return Ok(Duration::ZERO);
        }
        let frames = self.frames_out.load(Ordering::Acquire);
        Ok(Duration::from_nanos(
            (frames as u128 * 1_000_000_000 / rate as u128) as u64,
        ))
    }
}

impl MetadataExtraction for Shared {
    fn item_count(&self) -> Result<u32> {
        self.catalogue.read().item_count()
    }

    fn key_size(&self, index: u32) -> Result<u32> {
        self.catalogue.read().key_size(index)
    }

    fn value_size(&self, index: u32) -> Result<u32> {
        self.catalogue.read().value_size(index)
    }

    fn key(&self, index: u32, size: u32) -> Result<MetadataInfo> {
        self.catalogue.read().key(index, size)
    }

    fn value(&self, index: u32, size: u32) -> Result<MetadataInfo> {
        self.catalogue.read().value(index, size)
    }
}

impl PrefetchStatusQuery for Shared {
    fn prefetch_status(&self) -> Result<PrefetchStatus> {
        Ok(status_from_u8(self.prefetch_status.load(Ordering::Acquire)))
    }

    fn fill_level(&self) -> Result<Permille> {
        Ok(self.fill_level.load(Ordering::Acquire))
    }
}

// ============================================================================
// Engine Thread
// ============================================================================

enum Work {
    Open,
    Fill(FrameBuffer),
}

struct Worker {
    shared: Arc<Shared>,
    source: Option<ResolvedSource>,
    stream: Option<PcmStream>,
    failed: bool,
    finished: bool,
    position_ticks: u64,
    marker_fired: bool,
}

impl Worker {
    fn run(mut self) {
        debug!("Engine thread started");
        while let Some(work) = self.next_work() {
            match work {
                Work::Open => self.open(),
                Work::Fill(buffer) => self.fill(buffer),
            }
        }
        debug!("Engine thread exiting");
    }

    /// Block until there is something to do. `None` means shut down.
    fn next_work(&self) -> Option<Work> {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return None;
            }

            let opened = self.stream.is_some() || self.failed;
            match state.play_state {
                PlayState::Paused | PlayState::Playing if !opened => return Some(Work::Open),
                PlayState::Playing if !self.failed && !self.finished => {
                    if let Some(buffer) = state.queue.pop_front() {
                        return Some(Work::Fill(buffer));
                    }
                }
                _ => {}
            }

            self.shared.wake.wait(&mut state);
        }
    }

    /// Bytes the queued buffers can hold; prefetch aims to stage that much.
    fn prefetch_target(&self) -> usize {
        let state = self.shared.state.lock();
        let queued: usize = state.queue.iter().map(FrameBuffer::capacity).sum();
        if queued == 0 {
            BUFFER_SIZE_IN_BYTES * self.shared.buffer_count
        } else {
            queued
        }
    }

    fn open(&mut self) {
        let Some(source) = self.source.take() else {
            self.failed = true;
            return;
        };

        let target = self.prefetch_target();
        let opened = PcmStream::open(source).and_then(|mut stream| {
            let staged = stream.prefetch(target)?;
            Ok((stream, staged))
        });

        match opened {
            Ok((stream, staged)) => {
                let sample_rate = stream.sample_rate();
                *self.shared.catalogue.write() = MetadataCatalogue::mono_pcm16le(sample_rate);
                self.shared.sample_rate.store(sample_rate, Ordering::Release);
                if let Some(duration) = stream.duration() {
                    self.shared
                        .duration_ms
                        .store(duration.as_millis() as u64, Ordering::Release);
                }

                let level = (staged.saturating_mul(1000) / target.max(1)).min(1000) as Permille;
                info!(
                    codec = stream.codec(),
                    sample_rate,
                    staged,
                    fill_level = level,
                    "Prefetch complete"
                );
                self.stream = Some(stream);
                self.shared
                    .set_prefetch(PrefetchStatus::SufficientData, level);
            }
            Err(e) => {
                warn!(error = %e, "Prefetch failed");
                self.failed = true;
                self.shared.set_prefetch(PrefetchStatus::Underflow, 0);
            }
        }

        self.shared
            .fire_prefetch(PrefetchEventMask::STATUS_CHANGE | PrefetchEventMask::FILL_LEVEL_CHANGE);
    }

    fn fill(&mut self, mut buffer: FrameBuffer) {
        let filled = match self.stream.as_mut() {
            Some(stream) => stream.fill(buffer.spare_mut()),
            None => {
                self.shared.requeue(buffer);
                return;
            }
        };

        match filled {
            Ok(n) => {
                buffer.advance(n);
                let frames = (n / 2) as u64;
                if buffer.is_full() {
                    self.deliver(buffer, frames);
                    return;
                }

                self.finished = true;
                if buffer.filled() > 0 {
                    buffer.pad_with_silence();
                    self.deliver(buffer, frames);
                } else {
                    self.shared.requeue(buffer);
                }
                info!(
                    frames = self.shared.frames_out.load(Ordering::Acquire),
                    "End of stream"
                );
                self.shared.fire_play(PlayEventMask::HEAD_AT_END);
            }
            Err(e) => {
                error!(error = %e, "Decoding failed mid-stream");
                self.failed = true;
                self.shared.requeue(buffer);
                self.shared.set_prefetch(PrefetchStatus::Underflow, 0);
                self.shared.fire_prefetch(
                    PrefetchEventMask::STATUS_CHANGE | PrefetchEventMask::FILL_LEVEL_CHANGE,
                );
            }
        }
    }

    /// `frames` is the decoded PCM in `buffer`; trailing silence is not counted.
    fn deliver(&mut self, buffer: FrameBuffer, frames: u64) {
        if !self.shared.is_playing() {
            self.shared.requeue(buffer);
            return;
        }

        self.shared.frames_out.fetch_add(frames, Ordering::AcqRel);

        let delivered = {
            let mut callbacks = self.shared.callbacks.lock();
            match callbacks.buffer.as_mut() {
                Some(callback) => {
                    callback(&*self.shared as &dyn EngineHandle, buffer);
                    true
                }
                None => false,
            }
        };
        if !delivered {
            warn!("No buffer callback registered, buffer discarded");
        }

        self.position_events();
    }

    fn position_events(&mut self) {
        let (period, marker) = {
            let callbacks = self.shared.callbacks.lock();
            (callbacks.update_period, callbacks.marker)
        };
        let Ok(position) = self.shared.position() else {
            return;
        };

        if let Some(period) = period.filter(|p| !p.is_zero()) {
            let ticks = (position.as_nanos() / period.as_nanos()) as u64;
            while self.position_ticks < ticks {
                self.position_ticks += 1;
                self.shared.fire_play(PlayEventMask::HEAD_AT_NEW_POS);
            }
        }

        if let Some(marker) = marker {
            if !self.marker_fired && position >= marker {
                self.marker_fired = true;
                self.shared.fire_play(PlayEventMask::HEAD_AT_MARKER);
            }
        }
    }
}

// ============================================================================
// Player
// ============================================================================

/// One engine thread decoding one source.
pub struct SymphoniaPlayer {
    shared: Arc<Shared>,
    format: PcmFormat,
    source: Option<ResolvedSource>,
    thread: Option<JoinHandle<()>>,
}

impl SymphoniaPlayer {
    fn new(source: ResolvedSource, format: PcmFormat, buffer_count: usize) -> Self {
        Self {
            shared: Arc::new(Shared::new(buffer_count)),
            format,
            source: Some(source),
            thread: None,
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    /// Stop and join the engine thread, then drop the callbacks outside
    /// any lock. Idempotent.
    fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.play_state = PlayState::Stopped;
            state.queue.clear();
        }
        self.shared.wake.notify_all();

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Engine thread panicked");
            }
        }

        let callbacks = std::mem::take(&mut *self.shared.callbacks.lock());
        drop(callbacks);
    }
}

impl Drop for SymphoniaPlayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineHandle for SymphoniaPlayer {
    fn enqueue(&self, buffer: FrameBuffer) -> Result<()> {
        self.shared.enqueue(buffer)
    }

    fn metadata(&self) -> &dyn MetadataExtraction {
        &*self.shared
    }

    fn prefetch(&self) -> &dyn PrefetchStatusQuery {
        &*self.shared
    }

    fn position(&self) -> Result<Duration> {
        self.shared.position()
    }
}

impl DecodePlayer for SymphoniaPlayer {
    fn realize(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Err(DecodeError::engine("realize", "player already realized"));
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| DecodeError::engine("realize", "source already consumed"))?;

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            source: Some(source),
            stream: None,
            failed: false,
            finished: false,
            position_ticks: 0,
            marker_fired: false,
        };
        let handle = thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .spawn(move || worker.run())
            .map_err(|e| DecodeError::engine("realize", e.to_string()))?;

        self.thread = Some(handle);
        debug!("Player realized");
        Ok(())
    }

    fn register_buffer_callback(&mut self, callback: BufferCallback) -> Result<()> {
        self.shared.callbacks.lock().buffer = Some(callback);
        Ok(())
    }

    fn register_play_callback(
        &mut self,
        callback: PlayCallback,
        mask: PlayEventMask,
    ) -> Result<()> {
        self.shared.callbacks.lock().play = Some((callback, mask));
        Ok(())
    }

    fn set_marker_position(&mut self, position: Duration) -> Result<()> {
        self.shared.callbacks.lock().marker = Some(position);
        Ok(())
    }

    fn set_position_update_period(&mut self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(DecodeError::engine(
                "set_position_update_period",
                "period must be positive",
            ));
        }
        self.shared.callbacks.lock().update_period = Some(period);
        Ok(())
    }

    fn register_prefetch_callback(
        &mut self,
        callback: PrefetchCallback,
        mask: PrefetchEventMask,
    ) -> Result<()> {
        self.shared.callbacks.lock().prefetch = Some((callback, mask));
        Ok(())
    }

    fn set_play_state(&self, play_state: PlayState) -> Result<()> {
        if self.thread.is_none() {
            return Err(DecodeError::engine("set_play_state", "player not realized"));
        }

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(DecodeError::engine("set_play_state", "player destroyed"));
        }
        debug!(from = ?state.play_state, to = ?play_state, "Play state change");
        state.play_state = play_state;
        drop(state);

        self.shared.wake.notify_all();
        Ok(())
    }

    fn duration(&self) -> Result<Option<Duration>> {
        Ok(self.shared.duration())
    }

    fn destroy(self: Box<Self>) {
        let mut player = self;
        player.shutdown();
        debug!("Player destroyed");
    }
}

#[cfg(all(test, feature = "decoder-wav"))]
mod tests {
    use super::*;
    use crate::decoder::test_wav;
    use crate::pool::FrameBufferPool;
    use crate::traits::SampleRate;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Debug)]
    enum Seen {
        Buffer(usize, Vec<u8>),
        Play(PlayEventMask),
        Prefetch(PrefetchStatus, Permille),
    }

    fn player_for(data: Vec<u8>, extension: &str) -> Box<dyn DecodePlayer> {
        let source = ResolvedSource::Memory {
            data: Bytes::from(data),
            name: format!("memory.{}", extension),
            extension: Some(extension.to_string()),
        };
        SymphoniaEngine
            .create_player(source, PcmFormat::mono_pcm16le(SampleRate::Hz8000), 4)
            .unwrap()
    }

    fn register_recorders(player: &mut Box<dyn DecodePlayer>, tx: mpsc::Sender<Seen>) {
        let buffers = tx.clone();
        player
            .register_buffer_callback(Box::new(
                move |engine: &dyn EngineHandle, mut buffer: FrameBuffer| {
                    let _ = buffers.send(Seen::Buffer(buffer.slot(), buffer.as_slice().to_vec()));
                    buffer.reset();
                    engine.enqueue(buffer).unwrap();
                },
            ))
            .unwrap();

        let play = tx.clone();
        player
            .register_play_callback(
                Box::new(move |_: &dyn EngineHandle, mask: PlayEventMask| {
                    let _ = play.send(Seen::Play(mask));
                }),
                PlayEventMask::HEAD_AT_END,
            )
            .unwrap();

        player
            .register_prefetch_callback(
                Box::new(move |engine: &dyn EngineHandle, _: PrefetchEventMask| {
                    let prefetch = engine.prefetch();
                    let _ = tx.send(Seen::Prefetch(
                        prefetch.prefetch_status().unwrap(),
                        prefetch.fill_level().unwrap(),
                    ));
                }),
                PrefetchEventMask::STATUS_CHANGE | PrefetchEventMask::FILL_LEVEL_CHANGE,
            )
            .unwrap();
    }

    fn enqueue_all(player: &dyn DecodePlayer) {
        let mut pool = FrameBufferPool::new(4, BUFFER_SIZE_IN_BYTES);
        for buffer in pool.allocate().unwrap() {
            player.enqueue(buffer).unwrap();
        }
    }

    fn wait_for_sufficient(player: &dyn DecodePlayer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while player.prefetch().prefetch_status().unwrap() != PrefetchStatus::SufficientData {
            assert!(Instant::now() < deadline, "prefetch never completed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_full_lifecycle() {
        // 5000 frames = 10000 bytes: four full buffers and one padded.
        let mut player = player_for(test_wav::mono_ramp(8000, 5000), "wav");
        player.realize().unwrap();

        let (tx, rx) = mpsc::channel();
        register_recorders(&mut player, tx);
        enqueue_all(player.as_ref());

        player.set_play_state(PlayState::Paused).unwrap();
        wait_for_sufficient(player.as_ref());
        assert_eq!(player.metadata().item_count().unwrap(), 6);
        assert_eq!(player.duration().unwrap(), Some(Duration::from_millis(625)));

        player.set_play_state(PlayState::Playing).unwrap();

        let mut slots = Vec::new();
        let mut pcm = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Seen::Buffer(slot, data) => {
                    slots.push(slot);
                    pcm.extend_from_slice(&data);
                }
                Seen::Play(mask) => {
                    assert_eq!(mask, PlayEventMask::HEAD_AT_END);
                    break;
                }
                Seen::Prefetch(status, _) => assert_eq!(status, PrefetchStatus::SufficientData),
            }
        }

        assert_eq!(slots, vec![0, 1, 2, 3, 0]);
        assert_eq!(pcm.len(), 5 * BUFFER_SIZE_IN_BYTES);
        assert_eq!(&pcm[..4], &[0, 0, 1, 0]);
        assert!(pcm[10000..].iter().all(|b| *b == 0));
        // Padding after the last decoded frame does not move the head.
        assert_eq!(player.position().unwrap(), Duration::from_millis(625));

        player.destroy();
    }

    #[test]
    fn test_unreadable_stream_underflows_empty() {
        let mut player = player_for(vec![0x13; 4096], "flac");
        player.realize().unwrap();

        let (tx, rx) = mpsc::channel();
        register_recorders(&mut player, tx);
        enqueue_all(player.as_ref());
        player.set_play_state(PlayState::Paused).unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Seen::Prefetch(status, level) => {
                assert_eq!(status, PrefetchStatus::Underflow);
                assert_eq!(level, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(player.metadata().item_count().unwrap(), 0);
        player.destroy();
    }

    #[test]
    fn test_queue_depth_and_lifecycle_errors() {
        let mut player = player_for(test_wav::mono_ramp(8000, 100), "wav");
        assert!(player.set_play_state(PlayState::Paused).is_err());

        enqueue_all(player.as_ref());
        let mut extra = FrameBufferPool::new(1, 16);
        let overflow = extra.allocate().unwrap().pop().unwrap();
        assert!(matches!(
            player.enqueue(overflow),
            Err(DecodeError::Engine { operation: "enqueue", .. })
        ));

        player.realize().unwrap();
        assert!(player.realize().is_err());
        player.destroy();
    }

    #[test]
    fn test_destroy_drops_callbacks() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));

        let mut player = player_for(test_wav::mono_ramp(8000, 100), "wav");
        player.realize().unwrap();
        player
            .register_buffer_callback(Box::new(
                move |_: &dyn EngineHandle, _: FrameBuffer| {
                    let _held = &flag;
                },
            ))
            .unwrap();

        assert!(!dropped.load(Ordering::SeqCst));
        player.destroy();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
