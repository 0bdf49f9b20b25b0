//! # Decode Configuration
//!
//! Tunables for a decode session: buffer pool geometry, prefetch handshake
//! budget, completion polling and diagnostic cadence.

use crate::error::{DecodeError, Result};
use crate::traits::{BUFFER_SIZE_IN_SAMPLES, NB_BUFFERS_IN_QUEUE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Decode session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Number of buffers in the pool (all enqueued before prefetch).
    ///
    /// Default: 4.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Samples per buffer. Output is mono 16-bit, so a buffer holds twice
    /// this many bytes.
    ///
    /// Default: 1152 (one MP3 frame).
    #[serde(default = "default_buffer_size_samples")]
    pub buffer_size_samples: usize,

    /// Delay between prefetch status polls.
    ///
    /// Default: 10ms.
    #[serde(default = "default_prefetch_poll_interval")]
    pub prefetch_poll_interval: Duration,

    /// Prefetch polls before giving up.
    ///
    /// Default: 50 (half a second with the default interval).
    #[serde(default = "default_prefetch_max_polls")]
    pub prefetch_max_polls: u32,

    /// Delay between end-of-stream checks while playing.
    ///
    /// Default: 10ms.
    #[serde(default = "default_eos_poll_interval")]
    pub eos_poll_interval: Duration,

    /// Period of position events. `None` disables them.
    ///
    /// Default: 500ms.
    #[serde(default = "default_position_update_period")]
    pub position_update_period: Option<Duration>,

    /// Position at which a marker event fires. `None` disables it.
    #[serde(default)]
    pub marker_position: Option<Duration>,

    /// Log the engine position every this many drained buffers. `0` disables it.
    ///
    /// Default: 1000.
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            buffer_size_samples: default_buffer_size_samples(),
            prefetch_poll_interval: default_prefetch_poll_interval(),
            prefetch_max_polls: default_prefetch_max_polls(),
            eos_poll_interval: default_eos_poll_interval(),
            position_update_period: default_position_update_period(),
            marker_position: None,
            progress_log_interval: default_progress_log_interval(),
        }
    }
}

impl DecodeConfig {
    /// Longer prefetch budget for slow storage (SD cards, network mounts).
    ///
    /// - 5 second prefetch budget
    /// - Larger buffers, fewer callbacks
    pub fn slow_media() -> Self {
        Self {
            buffer_size_samples: 4608,
            prefetch_poll_interval: Duration::from_millis(20),
            prefetch_max_polls: 250,
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DecodeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| DecodeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(DecodeError::InvalidConfig(
                "buffer_count must be > 0".to_string(),
            ));
        }

        if self.buffer_size_samples == 0 {
            return Err(DecodeError::InvalidConfig(
                "buffer_size_samples must be > 0".to_string(),
            ));
        }

        if self.prefetch_max_polls == 0 {
            return Err(DecodeError::InvalidConfig(
                "prefetch_max_polls must be > 0".to_string(),
            ));
        }

        if self.eos_poll_interval.is_zero() {
            return Err(DecodeError::InvalidConfig(
                "eos_poll_interval must be > 0".to_string(),
            ));
        }

        if matches!(self.position_update_period, Some(period) if period.is_zero()) {
            return Err(DecodeError::InvalidConfig(
                "position_update_period must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Size of one pool buffer in bytes (mono, 16-bit).
    pub fn buffer_size_bytes(&self) -> usize {
        self.buffer_size_samples * 2
    }

    /// Upper bound on the prefetch handshake wait.
    pub fn prefetch_budget(&self) -> Duration {
        self.prefetch_poll_interval * self.prefetch_max_polls
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_buffer_count() -> usize {
    NB_BUFFERS_IN_QUEUE
}

fn default_buffer_size_samples() -> usize {
    BUFFER_SIZE_IN_SAMPLES
}

fn default_prefetch_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_prefetch_max_polls() -> u32 {
    50
}

fn default_eos_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_position_update_period() -> Option<Duration> {
    Some(Duration::from_millis(500))
}

fn default_progress_log_interval() -> u64 {
    1000
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle of one decode session, as driven by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Player created, callbacks registered, buffers enqueued.
    Configured,
    /// Paused, waiting for the engine to report sufficient data.
    Prefetching,
    /// Engine delivering buffers.
    Playing,
    /// End of stream reached and engine torn down.
    Stopped,
    /// Session ended by an error or cancellation.
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }

    /// Whether the supervisor may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Configured, Prefetching)
                | (Configured, Aborted)
                | (Prefetching, Playing)
                | (Prefetching, Aborted)
                | (Playing, Stopped)
                | (Playing, Aborted)
        )
    }
}
