//! Bounded wait for the engine to buffer enough data before playback.

use super::SessionContext;
use crate::config::DecodeConfig;
use crate::error::{DecodeError, Result};
use crate::traits::{PrefetchStatus, PrefetchStatusQuery};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handshake progress. `Underflow` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    Underflow,
    Sufficient,
    /// The prefetch callback flagged an open or fetch failure.
    Error,
    Timeout,
    Cancelled,
}

impl PrefetchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PrefetchState::Underflow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchOutcome {
    pub state: PrefetchState,
    /// Sleeps taken before the state became terminal.
    pub polls: u32,
    pub waited: Duration,
}

impl PrefetchOutcome {
    /// `Ok` only for [`PrefetchState::Sufficient`].
    pub fn into_result(self) -> Result<Self> {
        match self.state {
            PrefetchState::Sufficient => Ok(self),
            PrefetchState::Error => Err(DecodeError::PrefetchFailed(
                "engine reported an underflow with an empty buffer".to_string(),
            )),
            PrefetchState::Timeout => Err(DecodeError::PrefetchTimeout {
                polls: self.polls,
                waited: self.waited,
            }),
            PrefetchState::Cancelled => Err(DecodeError::Cancelled),
            PrefetchState::Underflow => Err(DecodeError::Internal(
                "prefetch handshake ended while still underflowing".to_string(),
            )),
        }
    }
}

/// Polls prefetch status every `interval`, at most `max_polls` times.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchHandshake {
    interval: Duration,
    max_polls: u32,
}

impl PrefetchHandshake {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    pub fn from_config(config: &DecodeConfig) -> Self {
        Self::new(config.prefetch_poll_interval, config.prefetch_max_polls)
    }

    /// Run the handshake. The engine must already have been asked to pause.
    ///
    /// Sufficient data wins over a timeout observed on the same poll. Status
    /// query failures are returned as errors. An engine fault raised by a
    /// callback ends the wait as [`PrefetchState::Error`]; the supervisor
    /// reports the fault itself.
    pub fn run(
        &self,
        query: &dyn PrefetchStatusQuery,
        ctx: &SessionContext,
        cancel: &CancellationToken,
    ) -> Result<PrefetchOutcome> {
        let started = Instant::now();
        let mut polls = 0u32;

        let state = loop {
            if ctx.has_prefetch_error() || ctx.has_engine_fault() {
                break PrefetchState::Error;
            }
            if cancel.is_cancelled() {
                break PrefetchState::Cancelled;
            }
            if query.prefetch_status()? == PrefetchStatus::SufficientData {
                break PrefetchState::Sufficient;
            }
            if polls >= self.max_polls {
                break PrefetchState::Timeout;
            }

            thread::sleep(self.interval);
            polls += 1;
        };

        let outcome = PrefetchOutcome {
            state,
            polls,
            waited: started.elapsed(),
        };
        match state {
            PrefetchState::Sufficient => debug!(polls, waited = ?outcome.waited, "prefetch ready"),
            _ => warn!(?state, polls, "prefetch handshake failed"),
        }
        Ok(outcome)
    }
}
