//! # Decode Engine
//!
//! The production [`DecodeEngine`](crate::traits::DecodeEngine), built on the
//! Symphonia pure-Rust audio library.
//!
//! ## Supported Formats
//!
//! | Format | Codec | Feature Flag |
//! |--------|-------|--------------|
//! | FLAC | Free Lossless Audio Codec | `decoder-flac` |
//! | MP3 | MPEG-1/2 Audio Layer III | `decoder-mp3` |
//! | Vorbis | Ogg Vorbis | `decoder-vorbis` |
//! | WAV | Waveform Audio | `decoder-wav` |
//! | AAC | Advanced Audio Coding (MP4) | `decoder-aac` |
//! | ALAC | Apple Lossless (MP4) | `decoder-alac` |
//!
//! ## Architecture
//!
//! ```text
//! ResolvedSource → MediaSourceStream → FormatReader → Decoder
//!     → SampleConverter (mono S16LE) → PcmStream staging → FrameBuffer
//! ```
//!
//! Output is always mono 16-bit little-endian at the source's native rate.
//! Channels are averaged together; nothing is resampled.

mod catalogue;
mod engine;
mod format_detector;
mod sample_converter;
mod symphonia;

pub use catalogue::MetadataCatalogue;
pub use engine::{SymphoniaEngine, SymphoniaPlayer};
pub use format_detector::FormatDetector;
pub use sample_converter::SampleConverter;
pub use self::symphonia::PcmStream;

#[cfg(not(any(
    feature = "decoder-flac",
    feature = "decoder-mp3",
    feature = "decoder-vorbis",
    feature = "decoder-wav",
    feature = "decoder-aac",
    feature = "decoder-alac"
)))]
compile_error!(
    "No audio decoder feature is enabled. Enable one of: \
     'decoder-flac', 'decoder-mp3', 'decoder-vorbis', 'decoder-wav', \
     'decoder-aac', 'decoder-alac', or 'decoder-all'"
);
