//! Decode one file to raw mono PCM16LE.
//!
//! Run with: `cargo run --example decode_file --package core-decode -- in.flac out.raw 44100`

use anyhow::{bail, Context};
use core_decode::{DecodeConfig, Flac2Raw, SourceDescriptor};
use core_runtime::events::{DecodeEvent, EventBus};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use std::env;

fn main() -> anyhow::Result<()> {
    init_logging(
        LoggingConfig::default()
            .with_format(LogFormat::Compact)
            .with_thread_info(true),
    )
    .context("logging init")?;

    let args: Vec<String> = env::args().skip(1).collect();
    let (source, destination, rate) = match args.as_slice() {
        [source, destination] => (source, destination, 44100),
        [source, destination, rate] => (
            source,
            destination,
            rate.parse().context("sample rate must be an integer")?,
        ),
        _ => bail!("usage: decode_file <source> <destination.raw> [sample-rate]"),
    };

    let config = match env::var("FLAC2RAW_CONFIG") {
        Ok(path) => DecodeConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", path))?,
        Err(_) => DecodeConfig::default(),
    };

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let printer = std::thread::spawn(move || {
        while let Ok(event) = events.blocking_recv() {
            if let DecodeEvent::Progress { position_ms, .. } = &event {
                eprintln!("  {:>6} ms", position_ms);
            }
            if matches!(
                event,
                DecodeEvent::Stopped { .. } | DecodeEvent::Failed { .. }
            ) {
                break;
            }
        }
    });

    let report = Flac2Raw::new()
        .with_config(config)
        .with_event_bus(bus)
        .decode(SourceDescriptor::uri(source.as_str()), destination, rate)?;
    let _ = printer.join();

    println!(
        "wrote {} bytes ({} buffers) at {} Hz, {} channel(s), in {:?}",
        report.bytes_written,
        report.buffers_drained,
        report
            .reported_sample_rate
            .unwrap_or(report.requested_sample_rate.as_hz()),
        report.reported_channels.unwrap_or(1),
        report.elapsed,
    );
    Ok(())
}
