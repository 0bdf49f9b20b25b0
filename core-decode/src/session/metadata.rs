//! Locating the decoder's sample-rate and channel-count metadata keys.
//!
//! The engine exposes its output format as a catalogue addressed by index.
//! Key positions are found once, before playback starts, by scanning the
//! catalogue. The values themselves are read later, from the first buffer
//! callback, when the decoder has actually produced output.

use super::SessionContext;
use crate::error::Result;
use crate::traits::{
    MetadataExtraction, KEY_PCMFORMAT_NUMCHANNELS, KEY_PCMFORMAT_SAMPLERATE,
    PCM_METADATA_VALUE_SIZE,
};
use tracing::debug;

/// Catalogue positions of the two keys the session cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataKeyIndices {
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
}

impl MetadataKeyIndices {
    pub fn is_complete(&self) -> bool {
        self.sample_rate.is_some() && self.channel_count.is_some()
    }

    /// Publish the indices to the callbacks.
    pub fn store(&self, ctx: &SessionContext) {
        ctx.sample_rate_key.set(self.sample_rate);
        ctx.channel_count_key.set(self.channel_count);
    }

    pub fn load(ctx: &SessionContext) -> Self {
        Self {
            sample_rate: ctx.sample_rate_key.get(),
            channel_count: ctx.channel_count_key.get(),
        }
    }
}

/// Scan the catalogue for the sample-rate and channel-count keys.
///
/// Missing keys leave their index unresolved; that is logged, not an error.
/// If a key appears more than once the last position wins.
pub fn bootstrap(metadata: &dyn MetadataExtraction) -> Result<MetadataKeyIndices> {
    let count = metadata.item_count()?;
    debug!(items = count, "scanning decoder metadata");

    let mut indices = MetadataKeyIndices::default();
    for index in 0..count {
        let key_size = metadata.key_size(index)?;
        let value_size = metadata.value_size(index)?;
        let key = metadata.key(index, key_size)?;

        match key.as_str() {
            Some(KEY_PCMFORMAT_SAMPLERATE) => indices.sample_rate = Some(index),
            Some(KEY_PCMFORMAT_NUMCHANNELS) => indices.channel_count = Some(index),
            _ => continue,
        }

        if value_size > PCM_METADATA_VALUE_SIZE {
            debug!(index, value_size, "metadata value larger than read buffer");
        }
    }

    if indices.sample_rate.is_none() {
        debug!(key = KEY_PCMFORMAT_SAMPLERATE, "key not found");
    }
    if indices.channel_count.is_none() {
        debug!(key = KEY_PCMFORMAT_NUMCHANNELS, "key not found");
    }

    Ok(indices)
}

/// Read a `u32` value at a resolved index with the fixed-size value buffer.
pub fn read_u32(metadata: &dyn MetadataExtraction, index: u32) -> Result<Option<u32>> {
    Ok(metadata.value(index, PCM_METADATA_VALUE_SIZE)?.as_u32())
}
