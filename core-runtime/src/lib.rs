//! # Core Runtime Module
//!
//! Provides the ambient runtime infrastructure shared by the decode crates:
//! - Logging and tracing infrastructure
//! - Logcat-style host log forwarding (`HostLogSink`)
//! - Decode event bus
//!
//! ## Overview
//!
//! This crate establishes the logging conventions and event broadcasting
//! mechanism used by `core-decode`. Nothing in here knows about audio; the
//! decode pipeline publishes into it.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
