//! # Decode Pipeline Module
//!
//! Decodes a compressed audio stream (FLAC, MP3 and friends) into raw mono
//! 16-bit little-endian PCM, written incrementally to a sink.
//!
//! ## Overview
//!
//! This module handles:
//! - Source resolution (paths, `file://` URIs, file descriptor ranges, assets)
//! - A fixed pool of frame buffers cycled through an engine's buffer queue
//! - The prefetch handshake and the one-shot output format discovery
//! - A blocking supervisor that owns the whole session lifecycle
//! - The Symphonia-backed engine that ships with the crate
//!
//! ## Usage
//!
//! ```rust,no_run
//! use core_decode::{decode, SourceDescriptor};
//!
//! # fn main() -> core_decode::Result<()> {
//! let report = decode(SourceDescriptor::path("song.flac"), "song.raw", 44100)?;
//! assert_eq!(report.bytes_written % 2304, 0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod pool;
pub mod session;
pub mod source;
pub mod supervisor;
pub mod traits;

pub use config::{DecodeConfig, SessionState};
pub use decoder::{SymphoniaEngine, SymphoniaPlayer};
pub use error::{DecodeError, Result};
pub use pool::{FrameBuffer, FrameBufferPool};
pub use session::{EndCause, SessionContext, SessionSignal};
pub use source::{
    resolve, AssetResolver, DirectoryAssets, EmbeddedAssets, ResolvedSource, SourceDescriptor,
};
pub use supervisor::{decode, DecodeReport, Flac2Raw};
pub use traits::{
    DecodeEngine, DecodePlayer, EngineHandle, MetadataExtraction, PcmFormat, PlayEventMask,
    PlayState, PrefetchEventMask, PrefetchStatus, PrefetchStatusQuery, SampleRate,
};
