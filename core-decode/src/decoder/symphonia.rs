//! # Symphonia PCM Stream
//!
//! Pull-based decoding of one resolved source into mono S16LE bytes.
//!
//! ```text
//! ResolvedSource → MediaSourceStream → FormatReader → Decoder → staged PCM → FrameBuffer
//! ```
//!
//! Decoded packets are converted immediately and staged, so a frame buffer can
//! be filled from any number of packets and a packet can span buffers.

use crate::decoder::{FormatDetector, SampleConverter};
use crate::error::{DecodeError, Result};
use crate::source::ResolvedSource;
use std::fmt;
use std::io;
use std::time::Duration;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use tracing::{debug, error, info, instrument, trace, warn};

/// Consecutive bad packets tolerated before the stream is declared broken.
const MAX_CONSECUTIVE_ERRORS: usize = 10;

/// An opened, probed source producing mono 16-bit little-endian PCM.
pub struct PcmStream {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    codec: &'static str,
    sample_rate: u32,
    source_channels: usize,
    duration: Option<Duration>,
    staged: Vec<u8>,
    read_pos: usize,
    frames_out: u64,
    eof: bool,
}

impl PcmStream {
    /// Open and probe `source`, selecting its first decodable track.
    ///
    /// Every failure is reported as [`DecodeError::PrefetchFailed`]: to the
    /// session an unopenable or undecodable stream is a prefetch failure.
    #[instrument(skip(source), fields(source = %source.name()))]
    pub fn open(source: ResolvedSource) -> Result<Self> {
        let hint = FormatDetector::hint_from_extension(source.extension());
        let media = source
            .into_media_source()
            .map_err(|e| unopenable("open", e))?;

        let format_reader = symphonia::default::get_probe()
            .format(
                &hint,
                MediaSourceStream::new(media, Default::default()),
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| unopenable("probe", e))?
            .format;

        let (track_id, params) = format_reader
            .tracks()
            .iter()
            .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
            .map(|track| (track.id, track.codec_params.clone()))
            .ok_or_else(|| DecodeError::PrefetchFailed("no audio track in source".to_string()))?;

        FormatDetector::validate_codec_support(params.codec)?;
        let codec = FormatDetector::codec_name(params.codec);
        let sample_rate = params
            .sample_rate
            .filter(|rate| *rate > 0)
            .ok_or_else(|| DecodeError::PrefetchFailed(format!("{} track has no sample rate", codec)))?;
        let source_channels = params.channels.map_or(0, |channels| channels.count());
        let duration = params
            .n_frames
            .map(|frames| frames_to_duration(frames, sample_rate));

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| unopenable("codec", e))?;

        info!(
            codec,
            sample_rate,
            channels = source_channels,
            duration_ms = duration.map(|d| d.as_millis() as u64),
            "Source opened"
        );

        Ok(Self {
            format_reader,
            decoder,
            track_id,
            codec,
            sample_rate,
            source_channels,
            duration,
            staged: Vec::new(),
            read_pos: 0,
            frames_out: 0,
            eof: false,
        })
    }

    pub fn codec(&self) -> &'static str {
        self.codec
    }

    /// Source rate; also the output rate, since nothing is resampled.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the source before mixdown. `0` until known.
    pub fn source_channels(&self) -> usize {
        self.source_channels
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Decoded bytes not yet handed out.
    pub fn staged_bytes(&self) -> usize {
        self.staged.len() - self.read_pos
    }

    /// True once the source is exhausted and every staged byte was consumed.
    pub fn is_finished(&self) -> bool {
        self.eof && self.staged_bytes() == 0
    }

    /// Mono frames handed out so far.
    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// Decode ahead until `target` bytes are staged or the source ends.
    pub fn prefetch(&mut self, target: usize) -> Result<usize> {
        while self.staged_bytes() < target {
            if !self.decode_next_packet()? {
                break;
            }
        }
        Ok(self.staged_bytes())
    }

    /// Fill `out` with PCM, decoding as needed.
    ///
    /// Returns the bytes written. Less than `out.len()` means the source
    /// ended; `0` means it had already ended.
    pub fn fill(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        while written < out.len() {
            if self.staged_bytes() == 0 && !self.decode_next_packet()? {
                break;
            }

            let take = (out.len() - written).min(self.staged_bytes());
            out[written..written + take]
                .copy_from_slice(&self.staged[self.read_pos..self.read_pos + take]);
            self.read_pos += take;
            written += take;
        }

        self.compact();
        self.frames_out += (written / 2) as u64;
        Ok(written)
    }

    fn compact(&mut self) {
        if self.read_pos == self.staged.len() {
            self.staged.clear();
            self.read_pos = 0;
        } else if self.read_pos > self.staged.len() / 2 {
            self.staged.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Decode the next packet of the selected track into the staging area.
    ///
    /// Returns `false` at end of stream. I/O and decode errors on single
    /// packets are skipped, at most [`MAX_CONSECUTIVE_ERRORS`] in a row.
    fn decode_next_packet(&mut self) -> Result<bool> {
        let mut bad_packets = 0;

        while !self.eof {
            let failure = match self.format_reader.next_packet() {
                Ok(packet) => {
                    self.discard_metadata_revisions();
                    if packet.track_id() != self.track_id {
                        continue;
                    }
                    match self.decoder.decode(&packet) {
                        Ok(decoded) => {
                            let channels = decoded.spec().channels.count();
                            if channels != self.source_channels {
                                debug!(from = self.source_channels, to = channels, "channel count");
                                self.source_channels = channels;
                            }
                            let frames =
                                SampleConverter::append_mono_s16le(&decoded, &mut self.staged);
                            trace!(frames, staged = self.staged.len() - self.read_pos, "packet");
                            return Ok(true);
                        }
                        Err(e) => e,
                    }
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(frames = self.frames_out, "source exhausted");
                    self.eof = true;
                    break;
                }
                Err(e) => e,
            };

            if !is_skippable(&failure) {
                error!(error = %failure, "stream unreadable");
                return Err(DecodeError::PrefetchFailed(format!(
                    "stream unreadable: {}",
                    failure
                )));
            }

            bad_packets += 1;
            warn!(
                bad_packets,
                limit = MAX_CONSECUTIVE_ERRORS,
                error = %failure,
                "skipping bad packet"
            );
            if bad_packets >= MAX_CONSECUTIVE_ERRORS {
                return Err(DecodeError::PrefetchFailed(format!(
                    "{} bad packets in a row, last: {}",
                    bad_packets, failure
                )));
            }
        }

        Ok(false)
    }

    /// Only the newest metadata revision is kept.
    fn discard_metadata_revisions(&mut self) {
        let mut metadata = self.format_reader.metadata();
        while !metadata.is_latest() {
            metadata.pop();
        }
    }
}

fn unopenable(stage: &str, e: impl fmt::Display) -> DecodeError {
    DecodeError::PrefetchFailed(format!("{} failed: {}", stage, e))
}

/// Packet-level failures; anything else (reset, unsupported, limits) ends the stream.
fn is_skippable(e: &SymphoniaError) -> bool {
    matches!(e, SymphoniaError::IoError(_) | SymphoniaError::DecodeError(_))
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_nanos((frames as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}
