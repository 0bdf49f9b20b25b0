//! # Sample Format Converter
//!
//! Turns decoded Symphonia buffers of any sample type and channel layout
//! into mono 16-bit little-endian PCM bytes.

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::conv::IntoSample;
use symphonia::core::sample::Sample;

/// Sample converter producing the pipeline's output layout.
pub struct SampleConverter;

impl SampleConverter {
    /// Append `buffer` to `out` as mono S16LE.
    ///
    /// Multi-channel audio is mixed down by averaging channels. Returns the
    /// number of frames appended.
    pub fn append_mono_s16le(buffer: &AudioBufferRef<'_>, out: &mut Vec<u8>) -> usize {
        match buffer {
            AudioBufferRef::S16(buf) if buf.spec().channels.count() == 1 => {
                let samples = buf.chan(0);
                out.reserve(samples.len() * 2);
                for sample in samples {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
                samples.len()
            }
            AudioBufferRef::U8(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::U16(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::U24(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::U32(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::S8(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::S16(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::S24(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::S32(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::F32(buf) => Self::mix_down(&**buf, out),
            AudioBufferRef::F64(buf) => Self::mix_down(&**buf, out),
        }
    }

    /// Average every frame across channels in f32, then requantize.
    fn mix_down<T>(buf: &AudioBuffer<T>, out: &mut Vec<u8>) -> usize
    where
        T: Sample + IntoSample<f32>,
    {
        let channels = buf.spec().channels.count();
        let frames = buf.frames();
        if channels == 0 {
            return 0;
        }

        let planes: Vec<&[T]> = (0..channels).map(|ch| buf.chan(ch)).collect();
        let scale = 1.0 / channels as f32;
        out.reserve(frames * 2);

        for frame in 0..frames {
            let sum: f32 = planes
                .iter()
                .map(|plane| IntoSample::<f32>::into_sample(plane[frame]))
                .sum();
            let mixed: i16 = (sum * scale).clamp(-1.0, 1.0).into_sample();
            out.extend_from_slice(&mixed.to_le_bytes());
        }

        frames
    }
}
