//! Supervisor behaviour against a scripted engine.

mod support;

use core_decode::traits::BUFFER_SIZE_IN_BYTES;
use core_decode::{
    DecodeConfig, DecodeError, DecodeReport, EndCause, Flac2Raw, SampleRate, SourceDescriptor,
};
use core_runtime::events::{DecodeEvent, EventBus, EventStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use support::{FailingSink, Prefetch, Script, ScriptedEngine, SharedSink};

fn source() -> SourceDescriptor {
    SourceDescriptor::memory(vec![0u8; 64], Some("flac"))
}

fn fast_config() -> DecodeConfig {
    DecodeConfig {
        prefetch_poll_interval: Duration::from_millis(1),
        prefetch_max_polls: 20,
        eos_poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn decoder(engine: &Arc<ScriptedEngine>) -> Flac2Raw {
    Flac2Raw::new()
        .with_engine(engine.clone())
        .with_config(fast_config())
}

fn run(engine: &Arc<ScriptedEngine>, sink: SharedSink) -> core_decode::Result<DecodeReport> {
    decoder(engine).decode_to_writer(source(), Box::new(sink), 44100)
}

#[test]
fn test_completes_and_drains_every_buffer() {
    let engine = ScriptedEngine::new(Script::default());
    let sink = SharedSink::default();

    let report = run(&engine, sink.clone()).unwrap();

    assert_eq!(report.buffers_drained, 6);
    assert_eq!(report.bytes_written, 6 * BUFFER_SIZE_IN_BYTES as u64);
    assert_eq!(report.end, EndCause::Natural);
    assert_eq!(report.reported_sample_rate, Some(44100));
    assert_eq!(report.reported_channels, Some(1));
    assert_eq!(report.duration, Some(Duration::from_secs(1)));

    let bytes = sink.bytes();
    assert_eq!(bytes.len() % BUFFER_SIZE_IN_BYTES, 0);
    for (i, chunk) in bytes.chunks(BUFFER_SIZE_IN_BYTES).enumerate() {
        assert!(chunk.iter().all(|b| *b == i as u8), "buffer {} out of order", i);
    }
}

#[test]
fn test_slot_order_wraps_around_small_pool() {
    let engine = ScriptedEngine::new(Script {
        buffers: 7,
        ..Default::default()
    });
    let config = DecodeConfig {
        buffer_count: 2,
        ..fast_config()
    };

    let report = Flac2Raw::new()
        .with_engine(engine.clone())
        .with_config(config)
        .decode_to_writer(source(), Box::new(SharedSink::default()), 44100)
        .unwrap();

    assert_eq!(report.buffers_drained, 7);
}

#[test]
fn test_out_of_order_delivery_is_engine_protocol_error() {
    let engine = ScriptedEngine::new(Script {
        out_of_order: true,
        ..Default::default()
    });

    let err = run(&engine, SharedSink::default()).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::BufferOrderViolation {
            expected: 1,
            actual: 0
        }
    ));
    assert!(!err.is_recoverable());
}

#[test]
fn test_enqueue_failure_is_engine_error() {
    let engine = ScriptedEngine::new(Script {
        fail_enqueue_after: Some(4),
        ..Default::default()
    });

    let err = run(&engine, SharedSink::default()).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::Engine {
            operation: "enqueue",
            ..
        }
    ));
}

#[test]
fn test_initial_enqueue_failure_propagates() {
    let engine = ScriptedEngine::new(Script {
        fail_enqueue_after: Some(2),
        ..Default::default()
    });

    let err = run(&engine, SharedSink::default()).unwrap_err();
    assert!(matches!(err, DecodeError::Engine { operation: "enqueue", .. }));
    assert_eq!(engine.delivered(), 0);
}

#[test]
fn test_write_failure_is_reported_not_engine() {
    let engine = ScriptedEngine::new(Script::default());

    let err = decoder(&engine)
        .decode_to_writer(source(), Box::new(FailingSink { remaining: 0 }), 44100)
        .unwrap_err();
    assert!(matches!(err, DecodeError::SinkWriteFailed { bytes_written: 0 }));
    assert!(err.is_recoverable());
}

#[test]
fn test_short_write_keeps_earlier_buffers() {
    let engine = ScriptedEngine::new(Script::default());
    let sink = FailingSink {
        remaining: 2 * BUFFER_SIZE_IN_BYTES + 100,
    };

    let err = decoder(&engine)
        .decode_to_writer(source(), Box::new(sink), 44100)
        .unwrap_err();
    assert!(matches!(
        err,
        DecodeError::SinkWriteFailed { bytes_written } if bytes_written == 2 * BUFFER_SIZE_IN_BYTES as u64
    ));
}

#[test]
fn test_handshake_timeout_drains_nothing() {
    let engine = ScriptedEngine::new(Script {
        prefetch: Prefetch::Stalled,
        ..Default::default()
    });
    let sink = SharedSink::default();
    let config = DecodeConfig {
        prefetch_max_polls: 3,
        ..fast_config()
    };

    let err = Flac2Raw::new()
        .with_engine(engine.clone())
        .with_config(config)
        .decode_to_writer(source(), Box::new(sink.clone()), 44100)
        .unwrap_err();

    assert!(matches!(err, DecodeError::PrefetchTimeout { polls: 3, .. }));
    assert_eq!(engine.delivered(), 0);
    assert!(sink.bytes().is_empty());
}

#[test]
fn test_prefetch_error_writes_nothing() {
    let engine = ScriptedEngine::new(Script {
        prefetch: Prefetch::Error,
        ..Default::default()
    });
    let sink = SharedSink::default();

    let err = run(&engine, sink.clone()).unwrap_err();

    assert!(matches!(err, DecodeError::PrefetchFailed(_)));
    assert_eq!(engine.delivered(), 0);
    assert!(sink.bytes().is_empty());
}

#[test]
fn test_cancel_while_playing() {
    let engine = ScriptedEngine::new(Script {
        buffers: 2,
        end_of_stream: false,
        ..Default::default()
    });
    let decoder = decoder(&engine);
    let token = decoder.cancellation_token();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
    });

    let err = decoder
        .decode_to_writer(source(), Box::new(SharedSink::default()), 44100)
        .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, DecodeError::Cancelled));
    assert_eq!(engine.delivered(), 2);
}

#[test]
fn test_cancel_before_prefetch_completes() {
    let engine = ScriptedEngine::new(Script {
        prefetch: Prefetch::Stalled,
        ..Default::default()
    });
    let decoder = decoder(&engine);
    decoder.cancellation_token().cancel();

    let err = decoder
        .decode_to_writer(source(), Box::new(SharedSink::default()), 44100)
        .unwrap_err();
    assert!(matches!(err, DecodeError::Cancelled));
    assert_eq!(engine.delivered(), 0);
}

#[test]
fn test_unsupported_rate_requests_48k() {
    let engine = ScriptedEngine::new(Script::default());

    let report = decoder(&engine)
        .decode_to_writer(source(), Box::new(SharedSink::default()), 96000)
        .unwrap();

    assert_eq!(report.requested_sample_rate, SampleRate::Hz48000);
    // The reported rate is logged, not enforced.
    assert_eq!(report.reported_sample_rate, Some(44100));
}

#[test]
fn test_lifecycle_events() {
    let engine = ScriptedEngine::new(Script::default());
    let bus = EventBus::default();
    let mut stream = EventStream::new(bus.subscribe());

    let report = decoder(&engine)
        .with_event_bus(bus)
        .decode_to_writer(source(), Box::new(SharedSink::default()), 44100)
        .unwrap();

    let events = stream.drain();
    assert!(events.iter().all(|e| e.session_id() == report.session_id));

    let names: Vec<&str> = events
        .iter()
        .map(|e| match e {
            DecodeEvent::Configured { .. } => "configured",
            DecodeEvent::Prefetching { .. } => "prefetching",
            DecodeEvent::PrefetchReady { .. } => "prefetch_ready",
            DecodeEvent::FormatDiscovered { .. } => "format",
            DecodeEvent::Progress { .. } => "progress",
            DecodeEvent::EndOfStream { .. } => "eos",
            DecodeEvent::Stopped { .. } => "stopped",
            DecodeEvent::Failed { .. } => "failed",
        })
        .collect();
    assert_eq!(
        names,
        vec!["configured", "prefetching", "prefetch_ready", "format", "eos", "stopped"]
    );

    assert!(matches!(
        events.last(),
        Some(DecodeEvent::Stopped { buffers_drained: 6, .. })
    ));
}

#[test]
fn test_failure_event_carries_tier() {
    let engine = ScriptedEngine::new(Script {
        prefetch: Prefetch::Error,
        ..Default::default()
    });
    let bus = EventBus::default();
    let mut stream = EventStream::new(bus.subscribe());

    let _ = decoder(&engine)
        .with_event_bus(bus)
        .decode_to_writer(source(), Box::new(SharedSink::default()), 44100);

    let events = stream.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        DecodeEvent::EndOfStream { cause, .. } if cause == "prefetch_error"
    )));
    assert!(matches!(
        events.last(),
        Some(DecodeEvent::Failed {
            recoverable: true,
            ..
        })
    ));
}

#[test]
fn test_missing_source_never_configures_engine() {
    let engine = ScriptedEngine::new(Script::default());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("out.raw");

    let err = decoder(&engine)
        .decode(
            SourceDescriptor::path(dir.path().join("absent.flac")),
            &destination,
            44100,
        )
        .unwrap_err();

    assert!(matches!(err, DecodeError::SourceUnreadable(_)));
    assert!(!destination.exists());
    assert_eq!(engine.players_created(), 0);
}

#[test]
fn test_unwritable_destination_never_configures_engine() {
    let engine = ScriptedEngine::new(Script::default());
    let dir = tempfile::tempdir().unwrap();

    let err = decoder(&engine)
        .decode(source(), dir.path().join("no/such/dir/out.raw"), 44100)
        .unwrap_err();

    assert!(matches!(err, DecodeError::DestinationUnwritable(_)));
    assert_eq!(engine.players_created(), 0);
}

#[tokio::test]
async fn test_decode_async_writes_file() {
    let engine = ScriptedEngine::new(Script::default());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("out.raw");

    let report = decoder(&engine)
        .decode_async(source(), destination.clone(), 8000)
        .await
        .unwrap();

    assert_eq!(report.requested_sample_rate, SampleRate::Hz8000);
    let written = std::fs::metadata(&destination).unwrap().len();
    assert_eq!(written, report.bytes_written);
    assert_eq!(written, 6 * BUFFER_SIZE_IN_BYTES as u64);
}
