//! Output-format metadata catalogue published by the engine after prefetch.

use crate::error::{DecodeError, Result};
use crate::traits::{
    Endianness, MetadataEncoding, MetadataExtraction, MetadataInfo, KEY_PCMFORMAT_BITSPERSAMPLE,
    KEY_PCMFORMAT_CHANNELMASK, KEY_PCMFORMAT_CONTAINERSIZE, KEY_PCMFORMAT_ENDIANNESS,
    KEY_PCMFORMAT_NUMCHANNELS, KEY_PCMFORMAT_SAMPLERATE, SPEAKER_FRONT_CENTER,
};

/// Ordered `u32` entries keyed by name. Empty until the source is probed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataCatalogue {
    entries: Vec<(&'static str, u32)>,
}

impl MetadataCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The six PCM format keys describing mono S16LE output at `sample_rate`.
    pub fn mono_pcm16le(sample_rate: u32) -> Self {
        Self {
            entries: vec![
                (KEY_PCMFORMAT_NUMCHANNELS, 1),
                (KEY_PCMFORMAT_SAMPLERATE, sample_rate),
                (KEY_PCMFORMAT_BITSPERSAMPLE, 16),
                (KEY_PCMFORMAT_CONTAINERSIZE, 16),
                (KEY_PCMFORMAT_CHANNELMASK, SPEAKER_FRONT_CENTER),
                (KEY_PCMFORMAT_ENDIANNESS, Endianness::Little.as_u32()),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
    }

    fn entry(&self, operation: &'static str, index: u32) -> Result<(&'static str, u32)> {
        self.entries.get(index as usize).copied().ok_or_else(|| {
            DecodeError::engine(
                operation,
                format!("index {} out of range ({} items)", index, self.entries.len()),
            )
        })
    }
}

impl MetadataExtraction for MetadataCatalogue {
    fn item_count(&self) -> Result<u32> {
        Ok(self.entries.len() as u32)
    }

    fn key_size(&self, index: u32) -> Result<u32> {
        let (name, _) = self.entry("metadata_key_size", index)?;
        Ok(name.len() as u32 + 1)
    }

    fn value_size(&self, index: u32) -> Result<u32> {
        self.entry("metadata_value_size", index)?;
        Ok(4)
    }

    fn key(&self, index: u32, size: u32) -> Result<MetadataInfo> {
        let (name, _) = self.entry("metadata_key", index)?;
        let info = MetadataInfo::key(name);
        if size < info.size() {
            return Err(DecodeError::engine(
                "metadata_key",
                format!("buffer of {} bytes too small for key of {}", size, info.size()),
            ));
        }
        Ok(info)
    }

    fn value(&self, index: u32, size: u32) -> Result<MetadataInfo> {
        let (_, value) = self.entry("metadata_value", index)?;
        if size < 4 {
            return Err(DecodeError::engine(
                "metadata_value",
                format!("buffer of {} bytes too small for a u32 value", size),
            ));
        }
        Ok(MetadataInfo {
            encoding: MetadataEncoding::Binary,
            data: value.to_le_bytes().to_vec(),
        })
    }
}
