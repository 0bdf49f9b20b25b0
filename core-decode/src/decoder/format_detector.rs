//! # Format Detection Module
//!
//! Probe hints and codec checks for Symphonia.

use crate::error::{DecodeError, Result};
use symphonia::core::codecs::CodecType;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Format detector for compressed audio sources.
pub struct FormatDetector;

impl FormatDetector {
    /// Create a probe hint from a container extension.
    ///
    /// Without an extension Symphonia probes every enabled container format.
    ///
    /// ```rust
    /// use core_decode::decoder::FormatDetector;
    ///
    /// let _hint = FormatDetector::hint_from_extension(Some("flac"));
    /// let _blind = FormatDetector::hint_from_extension(None);
    /// ```
    pub fn hint_from_extension(extension: Option<&str>) -> Hint {
        let mut hint = Hint::new();
        match extension {
            Some(ext) => {
                debug!("Setting probe hint extension: {}", ext);
                hint.with_extension(ext);
            }
            None => debug!("No extension, probe will auto-detect"),
        }
        hint
    }

    /// Short codec name for logs.
    pub fn codec_name(codec_type: CodecType) -> &'static str {
        use symphonia::core::codecs::*;

        if codec_type == CODEC_TYPE_FLAC {
            "flac"
        } else if codec_type == CODEC_TYPE_MP3 {
            "mp3"
        } else if codec_type == CODEC_TYPE_VORBIS {
            "vorbis"
        } else if codec_type == CODEC_TYPE_AAC {
            "aac"
        } else if codec_type == CODEC_TYPE_ALAC {
            "alac"
        } else if Self::is_pcm(codec_type) {
            "pcm"
        } else {
            "unknown"
        }
    }

    fn is_pcm(codec_type: CodecType) -> bool {
        use symphonia::core::codecs::*;

        [
            CODEC_TYPE_PCM_S16LE,
            CODEC_TYPE_PCM_S16BE,
            CODEC_TYPE_PCM_S24LE,
            CODEC_TYPE_PCM_S24BE,
            CODEC_TYPE_PCM_S32LE,
            CODEC_TYPE_PCM_S32BE,
            CODEC_TYPE_PCM_U8,
            CODEC_TYPE_PCM_F32LE,
            CODEC_TYPE_PCM_F32BE,
            CODEC_TYPE_PCM_F64LE,
            CODEC_TYPE_PCM_F64BE,
        ]
        .contains(&codec_type)
    }

    /// Check that the codec was compiled in.
    pub fn validate_codec_support(codec_type: CodecType) -> Result<()> {
        let name = Self::codec_name(codec_type);
        let enabled = match name {
            "flac" => cfg!(feature = "decoder-flac"),
            "mp3" => cfg!(feature = "decoder-mp3"),
            "vorbis" => cfg!(feature = "decoder-vorbis"),
            "aac" => cfg!(feature = "decoder-aac"),
            "alac" => cfg!(feature = "decoder-alac"),
            "pcm" => cfg!(feature = "decoder-wav"),
            _ => false,
        };

        if enabled {
            Ok(())
        } else {
            Err(DecodeError::PrefetchFailed(format!(
                "{} decoder not enabled (codec {:?})",
                name, codec_type
            )))
        }
    }
}
