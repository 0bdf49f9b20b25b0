//! flac2raw facade crate.
//!
//! Re-exports the decode pipeline (`core-decode`) and its ambient runtime
//! (`core-runtime`) so hosts depend on one crate. Decoder feature flags
//! (`decoder-flac`, `decoder-mp3`, ...) are forwarded to `core-decode`.

pub use core_decode::*;

pub use core_runtime as runtime;
pub use core_runtime::events::{DecodeEvent, EventBus, EventStream};
pub use core_runtime::logging::{init_logging, LogFormat, LogPriority, LoggingConfig};
