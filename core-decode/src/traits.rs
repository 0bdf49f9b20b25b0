//! # Decode Engine Traits
//!
//! The contract between the session supervisor and a decode engine.
//!
//! ## Architecture
//!
//! The pipeline uses a **buffer-queue producer-consumer model**:
//!
//! - **Producer (engine)**: runs on its own thread, pulls compressed data from
//!   the source and fills enqueued [`FrameBuffer`]s with PCM, in enqueue order.
//!
//! - **Consumer (buffer callback)**: invoked on the engine thread for every full
//!   buffer; drains it to the sink and hands it back with [`EngineHandle::enqueue`].
//!
//! Play and prefetch events reach the session through their own callbacks.
//! Every engine call returns a [`Result`]; a refused call becomes
//! [`DecodeError::Engine`](crate::DecodeError::Engine).
//!
//! ## Threading Model
//!
//! Callbacks are `FnMut + Send` and run on the engine thread, one at a time.
//! They receive a `&dyn EngineHandle` instead of capturing the player, so no
//! callback owns a reference cycle back to its engine.

use crate::error::{DecodeError, Result};
use crate::pool::FrameBuffer;
use crate::source::ResolvedSource;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Buffers enqueued with the engine per session.
pub const NB_BUFFERS_IN_QUEUE: usize = 4;

/// Samples per buffer (one MP3 frame).
pub const BUFFER_SIZE_IN_SAMPLES: usize = 1152;

/// Bytes per buffer at 16-bit mono.
pub const BUFFER_SIZE_IN_BYTES: usize = 2 * BUFFER_SIZE_IN_SAMPLES;

/// Capacity used when reading a PCM format metadata value.
pub const PCM_METADATA_VALUE_SIZE: u32 = 32;

pub const KEY_PCMFORMAT_NUMCHANNELS: &str = "AndroidPcmFormatNumChannels";
pub const KEY_PCMFORMAT_SAMPLERATE: &str = "AndroidPcmFormatSampleRate";
pub const KEY_PCMFORMAT_BITSPERSAMPLE: &str = "AndroidPcmFormatBitsPerSample";
pub const KEY_PCMFORMAT_CONTAINERSIZE: &str = "AndroidPcmFormatContainerSize";
pub const KEY_PCMFORMAT_CHANNELMASK: &str = "AndroidPcmFormatChannelMask";
pub const KEY_PCMFORMAT_ENDIANNESS: &str = "AndroidPcmFormatEndianness";

/// Speaker position bit for a single centre channel.
pub const SPEAKER_FRONT_CENTER: u32 = 0x0000_0004;

/// Fill level in thousandths (0..=1000).
pub type Permille = u16;

// ============================================================================
// PCM Format
// ============================================================================

/// Output rates the decoder can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleRate {
    Hz8000,
    Hz44100,
    Hz48000,
}

impl SampleRate {
    /// Map a requested rate onto a supported one. Unsupported rates become 48 kHz.
    pub fn from_hz(hz: u32) -> Self {
        match hz {
            8000 => SampleRate::Hz8000,
            44100 => SampleRate::Hz44100,
            _ => SampleRate::Hz48000,
        }
    }

    /// Whether `hz` maps onto itself.
    pub fn is_supported(hz: u32) -> bool {
        SampleRate::from_hz(hz).as_hz() == hz
    }

    pub fn as_hz(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::Hz48000
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.as_hz())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Numeric value published in the metadata catalogue.
    pub fn as_u32(&self) -> u32 {
        match self {
            Endianness::Big => 1,
            Endianness::Little => 2,
        }
    }
}

/// PCM layout requested from the engine's sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: SampleRate,
    pub bits_per_sample: u16,
    pub container_size: u16,
    pub channel_mask: u32,
    pub endianness: Endianness,
}

impl PcmFormat {
    /// The one layout this pipeline writes: mono, 16-bit, little-endian.
    pub fn mono_pcm16le(sample_rate: SampleRate) -> Self {
        Self {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            container_size: 16,
            channel_mask: SPEAKER_FRONT_CENTER,
            endianness: Endianness::Little,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.container_size as usize / 8)
    }
}

// ============================================================================
// Engine States & Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchStatus {
    Underflow,
    SufficientData,
    Overflow,
}

bitflags! {
    /// Play events a callback can subscribe to.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlayEventMask: u32 {
        const HEAD_AT_END = 0x0000_0001;
        const HEAD_AT_MARKER = 0x0000_0002;
        const HEAD_AT_NEW_POS = 0x0000_0004;
    }
}

bitflags! {
    /// Prefetch events a callback can subscribe to.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PrefetchEventMask: u32 {
        const STATUS_CHANGE = 0x0000_0001;
        const FILL_LEVEL_CHANGE = 0x0000_0002;
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataEncoding {
    Binary,
    Ascii,
    Utf8,
}

/// A key or value read from the engine's metadata catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataInfo {
    pub encoding: MetadataEncoding,
    pub data: Vec<u8>,
}

impl MetadataInfo {
    /// Key entry; stored NUL-terminated like the engine reports it.
    pub fn key(name: &str) -> Self {
        let mut data = Vec::with_capacity(name.len() + 1);
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        Self {
            encoding: MetadataEncoding::Ascii,
            data,
        }
    }

    pub fn u32_value(value: u32) -> Self {
        Self {
            encoding: MetadataEncoding::Binary,
            data: value.to_le_bytes().to_vec(),
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Text up to the first NUL.
    pub fn as_str(&self) -> Option<&str> {
        let end = self
            .data
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end]).ok()
    }

    /// Little-endian `u32` from the first four bytes.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

/// Index-based access to the decoder's output-format catalogue.
///
/// Sizes are payload byte counts. A read with a `size` smaller than the
/// entry fails.
pub trait MetadataExtraction: Send + Sync {
    fn item_count(&self) -> Result<u32>;

    fn key_size(&self, index: u32) -> Result<u32>;

    fn value_size(&self, index: u32) -> Result<u32>;

    fn key(&self, index: u32, size: u32) -> Result<MetadataInfo>;

    fn value(&self, index: u32, size: u32) -> Result<MetadataInfo>;
}

pub trait PrefetchStatusQuery: Send + Sync {
    fn prefetch_status(&self) -> Result<PrefetchStatus>;

    fn fill_level(&self) -> Result<Permille>;
}

// ============================================================================
// Engine & Player
// ============================================================================

/// What a callback can do with the engine that invoked it.
pub trait EngineHandle: Send + Sync {
    /// Hand a buffer to the engine's fill queue.
    fn enqueue(&self, buffer: FrameBuffer) -> Result<()>;

    fn metadata(&self) -> &dyn MetadataExtraction;

    fn prefetch(&self) -> &dyn PrefetchStatusQuery;

    /// Playback head position (duration of PCM delivered so far).
    fn position(&self) -> Result<Duration>;
}

/// Invoked for every filled buffer, in enqueue order.
pub type BufferCallback = Box<dyn FnMut(&dyn EngineHandle, FrameBuffer) + Send>;

pub type PlayCallback = Box<dyn FnMut(&dyn EngineHandle, PlayEventMask) + Send>;

pub type PrefetchCallback = Box<dyn FnMut(&dyn EngineHandle, PrefetchEventMask) + Send>;

/// One decode of one source into buffer-queue PCM.
///
/// The supervisor drives a player through
/// `realize → register callbacks → enqueue → Paused → Playing → Stopped → destroy`.
pub trait DecodePlayer: EngineHandle {
    /// Start the engine thread. Nothing is opened yet.
    fn realize(&mut self) -> Result<()>;

    fn register_buffer_callback(&mut self, callback: BufferCallback) -> Result<()>;

    fn register_play_callback(&mut self, callback: PlayCallback, mask: PlayEventMask)
        -> Result<()>;

    fn set_marker_position(&mut self, position: Duration) -> Result<()>;

    fn set_position_update_period(&mut self, period: Duration) -> Result<()>;

    fn register_prefetch_callback(
        &mut self,
        callback: PrefetchCallback,
        mask: PrefetchEventMask,
    ) -> Result<()>;

    /// `Paused` opens and prefetches the source; `Playing` starts delivery.
    fn set_play_state(&self, state: PlayState) -> Result<()>;

    /// Stream duration, once prefetch has probed it.
    fn duration(&self) -> Result<Option<Duration>>;

    /// Stop the engine thread and drop every registered callback.
    /// No callback runs after this returns.
    fn destroy(self: Box<Self>);
}

/// Factory for players.
pub trait DecodeEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Build a player reading `source` and writing `format` into
    /// `buffer_count`-deep buffer queues.
    fn create_player(
        &self,
        source: ResolvedSource,
        format: PcmFormat,
        buffer_count: usize,
    ) -> Result<Box<dyn DecodePlayer>>;
}

/// Reject formats other than the single layout this pipeline writes.
pub fn ensure_mono_pcm16le(format: &PcmFormat) -> Result<()> {
    if format.channels != 1
        || format.bits_per_sample != 16
        || format.container_size != 16
        || format.endianness != Endianness::Little
    {
        return Err(DecodeError::engine(
            "create_player",
            format!("unsupported PCM format {:?}", format),
        ));
    }
    Ok(())
}
