//! # Logging
//!
//! One `tracing` subscriber for the whole process:
//!
//! ```text
//! registry ─┬─ EnvFilter         (explicit directives, else RUST_LOG, else workspace defaults)
//!           ├─ fmt layer         (Pretty / Json / Compact, written to stderr)
//!           └─ HostSinkLayer     (optional, Logcat-style records for the embedding host)
//! ```
//!
//! Formatted output goes to stderr so a decode can stream raw PCM to stdout.
//!
//! Decode sessions log from the engine thread. A [`HostLogSink`] is called
//! inline on that thread and must not block on the thread that started the
//! decode.
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LogPriority, LoggingConfig, StderrLogcat};
//! use std::sync::Arc;
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogPriority::Debug)
//!         .with_host_sink(Arc::new(StderrLogcat::default())),
//! )?;
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

/// Tag on host log lines, matching the native library name.
pub const LOG_TAG: &str = "flac2raw";

/// Crates whose events follow the configured level by default.
const WORKSPACE_TARGETS: &[&str] = &["flac2raw", "core_runtime", "core_decode"];

/// Codec crates stay at warn unless asked otherwise.
const CODEC_DIRECTIVE: &str = "symphonia=warn";

/// Logcat priorities, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogPriority {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogPriority {
    /// The letter Logcat prints before the tag.
    pub fn letter(self) -> char {
        match self {
            LogPriority::Verbose => 'V',
            LogPriority::Debug => 'D',
            LogPriority::Info => 'I',
            LogPriority::Warn => 'W',
            LogPriority::Error => 'E',
        }
    }

    fn directive(self) -> &'static str {
        match self {
            LogPriority::Verbose => "trace",
            LogPriority::Debug => "debug",
            LogPriority::Info => "info",
            LogPriority::Warn => "warn",
            LogPriority::Error => "error",
        }
    }
}

impl From<tracing::Level> for LogPriority {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogPriority::Verbose,
            tracing::Level::DEBUG => LogPriority::Debug,
            tracing::Level::INFO => LogPriority::Info,
            tracing::Level::WARN => LogPriority::Warn,
            tracing::Level::ERROR => LogPriority::Error,
        }
    }
}

// ============================================================================
// Host Records
// ============================================================================

/// One event as handed to a [`HostLogSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub priority: LogPriority,
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub message: String,
    /// Event fields in the order they were recorded.
    pub fields: Vec<(String, String)>,
    /// Innermost span the event was recorded in.
    pub span: Option<String>,
}

impl LogRecord {
    pub fn new(priority: LogPriority, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            priority,
            timestamp: Utc::now(),
            target: target.into(),
            message: message.into(),
            fields: Vec::new(),
            span: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `P/tag: message key=value ...`
    pub fn logcat_line(&self, tag: &str) -> String {
        let mut line = format!("{}/{}: {}", self.priority.letter(), tag, self.message);
        for (key, value) in &self.fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line
    }
}

/// Receives log records for a host logging system (Logcat, os_log, a
/// file, a test buffer).
pub trait HostLogSink: Send + Sync {
    fn write(&self, record: &LogRecord);

    /// Records below this priority are not forwarded.
    fn threshold(&self) -> LogPriority {
        LogPriority::Info
    }
}

/// Writes Logcat `threadtime`-like lines to stderr.
#[derive(Debug, Clone)]
pub struct StderrLogcat {
    tag: String,
    threshold: LogPriority,
}

impl Default for StderrLogcat {
    fn default() -> Self {
        Self::new(LOG_TAG, LogPriority::Info)
    }
}

impl StderrLogcat {
    pub fn new(tag: impl Into<String>, threshold: LogPriority) -> Self {
        Self {
            tag: tag.into(),
            threshold,
        }
    }
}

impl HostLogSink for StderrLogcat {
    fn write(&self, record: &LogRecord) {
        let _ = writeln!(
            io::stderr().lock(),
            "{} {}",
            record.timestamp.format("%m-%d %H:%M:%S%.3f"),
            record.logcat_line(&self.tag)
        );
    }

    fn threshold(&self) -> LogPriority {
        self.threshold
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// One JSON object per event
    Json,
    /// Single line per event
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level for the workspace crates when no directives are given.
    pub level: LogPriority,
    /// `EnvFilter` directives, e.g. `core_decode=trace,symphonia=warn`.
    pub directives: Option<String>,
    pub host_sink: Option<Arc<dyn HostLogSink>>,
    /// Log span enter/exit (Pretty/Compact) or span context (Json).
    pub span_events: bool,
    pub show_target: bool,
    /// Thread names and ids; the engine thread is named `flac2raw-engine`.
    pub show_threads: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogPriority::Info,
            directives: None,
            host_sink: None,
            span_events: true,
            show_target: true,
            show_threads: false,
            ansi: true,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("directives", &self.directives)
            .field("host_sink", &self.host_sink.is_some())
            .field("span_events", &self.span_events)
            .field("show_target", &self.show_target)
            .field("show_threads", &self.show_threads)
            .field("ansi", &self.ansi)
            .finish()
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogPriority) -> Self {
        self.level = level;
        self
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    pub fn with_host_sink(mut self, sink: Arc<dyn HostLogSink>) -> Self {
        self.host_sink = Some(sink);
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.span_events = enable;
        self
    }

    pub fn with_target(mut self, show: bool) -> Self {
        self.show_target = show;
        self
    }

    pub fn with_thread_info(mut self, show: bool) -> Self {
        self.show_threads = show;
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }
}

// ============================================================================
// Initialisation
// ============================================================================

type FilteredRegistry = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync + 'static>;

/// Install the global subscriber. Call once at startup.
///
/// # Errors
///
/// - [`Error::InvalidDirectives`] if the filter directives do not parse
/// - [`Error::AlreadyInitialized`] if a global subscriber is already set
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = filter_for(&config)?;
    let fmt = fmt_layer(&config);
    let host = config.host_sink.map(|sink| HostSinkLayer { sink });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(host)
        .try_init()
        .map_err(|e| Error::AlreadyInitialized(e.to_string()))
}

/// Directives used when neither the config nor `RUST_LOG` provide any.
pub fn default_directives(level: LogPriority) -> String {
    let mut directives: Vec<String> = WORKSPACE_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level.directive()))
        .collect();
    directives.push(CODEC_DIRECTIVE.to_string());
    directives.join(",")
}

fn filter_for(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = config
        .directives
        .clone()
        .or_else(|| {
            std::env::var(EnvFilter::DEFAULT_ENV)
                .ok()
                .filter(|raw| !raw.trim().is_empty())
        })
        .unwrap_or_else(|| default_directives(config.level));

    parse_directives(&directives)
}

fn parse_directives(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| Error::InvalidDirectives {
        directives: directives.to_string(),
        reason: e.to_string(),
    })
}

fn fmt_layer(config: &LoggingConfig) -> BoxedLayer {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.show_target)
        .with_thread_ids(config.show_threads)
        .with_thread_names(config.show_threads);

    match config.format {
        LogFormat::Pretty => base.pretty().with_span_events(span_events).boxed(),
        LogFormat::Compact => base.compact().with_span_events(span_events).boxed(),
        LogFormat::Json => base
            .json()
            .flatten_event(true)
            .with_current_span(config.span_events)
            .with_span_list(false)
            .boxed(),
    }
}

/// Mirrors filtered events into a [`HostLogSink`].
struct HostSinkLayer {
    sink: Arc<dyn HostLogSink>,
}

impl<S> Layer<S> for HostSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let priority = LogPriority::from(*metadata.level());
        if priority < self.sink.threshold() {
            return;
        }

        let mut record = LogRecord::new(priority, metadata.target(), String::new());
        event.record(&mut RecordVisitor(&mut record));
        if record.message.is_empty() {
            record.message = metadata.name().to_string();
        }
        record.span = ctx.event_span(event).map(|span| span.name().to_string());

        self.sink.write(&record);
    }
}

struct RecordVisitor<'a>(&'a mut LogRecord);

impl RecordVisitor<'_> {
    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.0.message = value;
        } else {
            self.0.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for RecordVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }
}

/// File name of a path, for logs. Handles both separators.
///
/// ```
/// use core_runtime::logging::strip_path;
///
/// assert_eq!(strip_path("/sdcard/Music/test.flac"), "test.flac");
/// ```
pub fn strip_path(path: &str) -> &str {
    match path.rfind(|c: char| c == '/' || c == '\\') {
        Some(separator) => &path[separator + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured(Mutex<Vec<LogRecord>>);

    impl HostLogSink for Captured {
        fn write(&self, record: &LogRecord) {
            self.0.lock().unwrap().push(record.clone());
        }

        fn threshold(&self) -> LogPriority {
            LogPriority::Debug
        }
    }

    #[test]
    fn test_default_directives_follow_level() {
        let directives = default_directives(LogPriority::Debug);
        assert_eq!(
            directives,
            "flac2raw=debug,core_runtime=debug,core_decode=debug,symphonia=warn"
        );
        assert!(parse_directives(&directives).is_ok());
    }

    #[test]
    fn test_explicit_directives_win() {
        let config = LoggingConfig::default().with_directives("core_decode=trace");
        let filter = filter_for(&config).unwrap();
        assert_eq!(filter.to_string(), "core_decode=trace");
    }

    #[test]
    fn test_bad_directives_are_reported() {
        let err = parse_directives("core_decode=[").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidDirectives { ref directives, .. } if directives == "core_decode=["
        ));
    }

    #[test]
    fn test_strip_path() {
        assert_eq!(strip_path("/sdcard/Music/test.flac"), "test.flac");
        assert_eq!(strip_path("C:\\Users\\me\\song.mp3"), "song.mp3");
        assert_eq!(strip_path("mixed/dir\\name.raw"), "name.raw");
        assert_eq!(strip_path("song.mp3"), "song.mp3");
        assert_eq!(strip_path("/var/log/"), "");
    }

    #[test]
    fn test_logcat_line_keeps_field_order() {
        let mut record = LogRecord::new(LogPriority::Warn, "core_decode", "rate mismatch");
        record.fields.push(("requested".into(), "48000".into()));
        record.fields.push(("reported".into(), "44100".into()));

        assert_eq!(
            record.logcat_line(LOG_TAG),
            "W/flac2raw: rate mismatch requested=48000 reported=44100"
        );
        assert_eq!(record.field("reported"), Some("44100"));
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn test_host_layer_records_fields_and_span() {
        let sink = Arc::new(Captured::default());
        let layer = HostSinkLayer { sink: sink.clone() };
        let subscriber = tracing_subscriber::registry().with(layer);
        let _guard = tracing::subscriber::set_default(subscriber);

        let span = tracing::info_span!("session");
        span.in_scope(|| {
            tracing::info!(target: "core_decode::session", slot = 2u64, cause = "natural", "buffer drained");
        });
        tracing::trace!(target: "core_decode::session", "below threshold");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.priority, LogPriority::Info);
        assert_eq!(record.target, "core_decode::session");
        assert_eq!(record.message, "buffer drained");
        assert_eq!(record.field("slot"), Some("2"));
        assert_eq!(record.field("cause"), Some("natural"));
        assert_eq!(record.span.as_deref(), Some("session"));
    }

    #[test]
    fn test_priority_order() {
        assert!(LogPriority::Verbose < LogPriority::Debug);
        assert!(LogPriority::Warn < LogPriority::Error);
        assert_eq!(LogPriority::from(tracing::Level::TRACE).letter(), 'V');
    }
}
