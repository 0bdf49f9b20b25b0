//! Shared fixtures for the integration tests: a scripted engine, sinks and a
//! minimal FLAC encoder.

#![allow(dead_code)]

use core_decode::decoder::MetadataCatalogue;
use core_decode::traits::{
    BufferCallback, Permille, PlayCallback, PrefetchCallback, PrefetchStatus,
};
use core_decode::{
    DecodeEngine, DecodeError, DecodePlayer, EngineHandle, FrameBuffer, MetadataExtraction,
    PcmFormat, PlayEventMask, PlayState, PrefetchEventMask, PrefetchStatusQuery, ResolvedSource,
    Result,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Scripted engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefetch {
    /// Sufficient data as soon as the player is paused.
    Ready,
    /// Underflow with an empty buffer: an open failure.
    Error,
    /// Never leaves underflow and never fires an event.
    Stalled,
}

/// What a [`ScriptedPlayer`] does. Delivery is synchronous: all buffers are
/// delivered from inside `set_play_state(Playing)`.
#[derive(Debug, Clone)]
pub struct Script {
    pub prefetch: Prefetch,
    /// Buffers delivered once playing. Buffer `i` is filled with byte `i`.
    pub buffers: usize,
    /// Fire `HEAD_AT_END` after the last buffer.
    pub end_of_stream: bool,
    /// Enqueue calls after this many succeed with an error.
    pub fail_enqueue_after: Option<usize>,
    /// Deliver the second buffer from the back of the queue.
    pub out_of_order: bool,
    pub sample_rate: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            prefetch: Prefetch::Ready,
            buffers: 6,
            end_of_stream: true,
            fail_enqueue_after: None,
            out_of_order: false,
            sample_rate: 44100,
        }
    }
}

#[derive(Default)]
pub struct ScriptedEngine {
    pub script: Script,
    pub players_created: AtomicUsize,
    pub delivered: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    pub fn players_created(&self) -> usize {
        self.players_created.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl DecodeEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn create_player(
        &self,
        _source: ResolvedSource,
        format: PcmFormat,
        _buffer_count: usize,
    ) -> Result<Box<dyn DecodePlayer>> {
        core_decode::traits::ensure_mono_pcm16le(&format)?;
        self.players_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPlayer {
            script: self.script.clone(),
            realized: false,
            queue: Mutex::new(VecDeque::new()),
            buffer_cb: Mutex::new(None),
            play_cb: Mutex::new(None),
            prefetch_cb: Mutex::new(None),
            status: Mutex::new((PrefetchStatus::Underflow, 0)),
            catalogue: Mutex::new(MetadataCatalogue::new()),
            enqueues: AtomicUsize::new(0),
            delivered: Arc::clone(&self.delivered),
        }))
    }
}

pub struct ScriptedPlayer {
    script: Script,
    realized: bool,
    queue: Mutex<VecDeque<FrameBuffer>>,
    buffer_cb: Mutex<Option<BufferCallback>>,
    play_cb: Mutex<Option<(PlayCallback, PlayEventMask)>>,
    prefetch_cb: Mutex<Option<(PrefetchCallback, PrefetchEventMask)>>,
    status: Mutex<(PrefetchStatus, Permille)>,
    catalogue: Mutex<MetadataCatalogue>,
    enqueues: AtomicUsize,
    delivered: Arc<AtomicUsize>,
}

impl ScriptedPlayer {
    fn fire_prefetch(&self, event: PrefetchEventMask) {
        if let Some((callback, mask)) = self.prefetch_cb.lock().as_mut() {
            if mask.intersects(event) {
                callback(self, event);
            }
        }
    }

    fn fire_play(&self, event: PlayEventMask) {
        if let Some((callback, mask)) = self.play_cb.lock().as_mut() {
            if mask.intersects(event) {
                callback(self, event);
            }
        }
    }

    fn play(&self) {
        for i in 0..self.script.buffers {
            let next = {
                let mut queue = self.queue.lock();
                if self.script.out_of_order && i == 1 {
                    queue.pop_back()
                } else {
                    queue.pop_front()
                }
            };
            let Some(mut buffer) = next else {
                break;
            };

            buffer.spare_mut().fill(i as u8);
            let capacity = buffer.capacity();
            buffer.advance(capacity);

            self.delivered.fetch_add(1, Ordering::SeqCst);
            if let Some(callback) = self.buffer_cb.lock().as_mut() {
                callback(self, buffer);
            }
        }

        if self.script.end_of_stream {
            self.fire_play(PlayEventMask::HEAD_AT_END);
        }
    }
}

impl EngineHandle for ScriptedPlayer {
    fn enqueue(&self, buffer: FrameBuffer) -> Result<()> {
        let count = self.enqueues.fetch_add(1, Ordering::SeqCst);
        if matches!(self.script.fail_enqueue_after, Some(limit) if count >= limit) {
            return Err(DecodeError::engine("enqueue", "scripted failure"));
        }
        self.queue.lock().push_back(buffer);
        Ok(())
    }

    fn metadata(&self) -> &dyn MetadataExtraction {
        self
    }

    fn prefetch(&self) -> &dyn PrefetchStatusQuery {
        self
    }

    fn position(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.delivered.load(Ordering::SeqCst) as u64 * 26))
    }
}

impl MetadataExtraction for ScriptedPlayer {
    fn item_count(&self) -> Result<u32> {
        self.catalogue.lock().item_count()
    }

    fn key_size(&self, index: u32) -> Result<u32> {
        self.catalogue.lock().key_size(index)
    }

    fn value_size(&self, index: u32) -> Result<u32> {
        self.catalogue.lock().value_size(index)
    }

    fn key(&self, index: u32, size: u32) -> Result<core_decode::traits::MetadataInfo> {
        self.catalogue.lock().key(index, size)
    }

    fn value(&self, index: u32, size: u32) -> Result<core_decode::traits::MetadataInfo> {
        self.catalogue.lock().value(index, size)
    }
}

impl PrefetchStatusQuery for ScriptedPlayer {
    fn prefetch_status(&self) -> Result<PrefetchStatus> {
        Ok(self.status.lock().0)
    }

    fn fill_level(&self) -> Result<Permille> {
        Ok(self.status.lock().1)
    }
}

impl DecodePlayer for ScriptedPlayer {
    fn realize(&mut self) -> Result<()> {
        self.realized = true;
        Ok(())
    }

    fn register_buffer_callback(&mut self, callback: BufferCallback) -> Result<()> {
        *self.buffer_cb.lock() = Some(callback);
        Ok(())
    }

    fn register_play_callback(
        &mut self,
        callback: PlayCallback,
        mask: PlayEventMask,
    ) -> Result<()> {
        *self.play_cb.lock() = Some((callback, mask));
        Ok(())
    }

    fn set_marker_position(&mut self, _position: Duration) -> Result<()> {
        Ok(())
    }

    fn set_position_update_period(&mut self, _period: Duration) -> Result<()> {
        Ok(())
    }

    fn register_prefetch_callback(
        &mut self,
        callback: PrefetchCallback,
        mask: PrefetchEventMask,
    ) -> Result<()> {
        *self.prefetch_cb.lock() = Some((callback, mask));
        Ok(())
    }

    fn set_play_state(&self, state: PlayState) -> Result<()> {
        if !self.realized {
            return Err(DecodeError::engine("set_play_state", "not realized"));
        }

        let both = PrefetchEventMask::STATUS_CHANGE | PrefetchEventMask::FILL_LEVEL_CHANGE;
        match (state, self.script.prefetch) {
            (PlayState::Paused, Prefetch::Ready) => {
                *self.catalogue.lock() = MetadataCatalogue::mono_pcm16le(self.script.sample_rate);
                *self.status.lock() = (PrefetchStatus::SufficientData, 1000);
                self.fire_prefetch(both);
            }
            (PlayState::Paused, Prefetch::Error) => {
                *self.status.lock() = (PrefetchStatus::Underflow, 0);
                self.fire_prefetch(both);
            }
            (PlayState::Playing, _) => self.play(),
            _ => {}
        }
        Ok(())
    }

    fn duration(&self) -> Result<Option<Duration>> {
        Ok(Some(Duration::from_secs(1)))
    }

    fn destroy(self: Box<Self>) {
        self.buffer_cb.lock().take();
        self.play_cb.lock().take();
        self.prefetch_cb.lock().take();
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Sink whose contents stay readable after the session dropped it.
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Accepts `remaining` bytes, then fails every write.
pub struct FailingSink {
    pub remaining: usize,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        let n = buf.len().min(self.remaining);
        self.remaining -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// FLAC fixtures
// ============================================================================

pub const FLAC_BLOCK_SIZE: usize = 1152;

/// A `seconds`-long 440 Hz sine as 16-bit samples.
pub fn sine(sample_rate: u32, seconds: f32) -> Vec<i16> {
    let frames = (sample_rate as f32 * seconds) as usize;
    (0..frames)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 12000.0) as i16
        })
        .collect()
}

/// Encode interleaved 16-bit samples as a FLAC stream of VERBATIM subframes.
pub fn encode_flac(sample_rate: u32, channels: u8, samples: &[i16]) -> Vec<u8> {
    let total_frames = samples.len() / channels as usize;

    let mut out = Vec::new();
    out.extend_from_slice(b"fLaC");

    // Last metadata block, type 0 (STREAMINFO), 34 bytes.
    out.extend_from_slice(&[0x80, 0x00, 0x00, 34]);
    out.extend_from_slice(&(FLAC_BLOCK_SIZE as u16).to_be_bytes());
    out.extend_from_slice(&(FLAC_BLOCK_SIZE as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    let packed: u64 = ((sample_rate as u64) << 44)
        | (((channels - 1) as u64) << 41)
        | (15u64 << 36)
        | total_frames as u64;
    out.extend_from_slice(&packed.to_be_bytes());
    out.extend_from_slice(&[0u8; 16]);

    let rate_code = match sample_rate {
        8000 => 0b0100,
        44100 => 0b1001,
        48000 => 0b1010,
        _ => 0b0000,
    };

    for (index, block) in samples
        .chunks(FLAC_BLOCK_SIZE * channels as usize)
        .enumerate()
    {
        let block_frames = block.len() / channels as usize;

        let mut frame = vec![0xFF, 0xF8, 0b0111_0000 | rate_code, ((channels - 1) << 4) | 0b1000];
        frame.extend_from_slice(&utf8_number(index as u32));
        frame.extend_from_slice(&((block_frames - 1) as u16).to_be_bytes());
        frame.push(crc8(&frame));

        for channel in 0..channels as usize {
            frame.push(0x02);
            for sample in block.iter().skip(channel).step_by(channels as usize) {
                frame.extend_from_slice(&sample.to_be_bytes());
            }
        }

        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&frame);
    }

    out
}

fn utf8_number(n: u32) -> Vec<u8> {
    match n {
        0..=0x7F => vec![n as u8],
        0x80..=0x7FF => vec![0xC0 | (n >> 6) as u8, 0x80 | (n & 0x3F) as u8],
        _ => vec![
            0xE0 | (n >> 12) as u8,
            0x80 | ((n >> 6) & 0x3F) as u8,
            0x80 | (n & 0x3F) as u8,
        ],
    }
}

fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}
