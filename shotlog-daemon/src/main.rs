//! Shotlog Daemon - continuous acoustic event detector and recorder
//!
//! Runs as a background service: pulls stereo blocks from the capture
//! device, watches the level against a dBFS threshold, and persists a
//! pre/post window around each qualifying impulse to removable storage.
//! Ingestion owns the device on a dedicated thread; persistence runs on a
//! blocking worker so storage latency can never stall the live path.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use shotlog_daemon::config::{Cli, DaemonConfig};
use shotlog_daemon::engine::{run_capture_loop, Engine};
use shotlog_daemon::state::SequenceTracker;
use shotlog_daemon::writer::run_writer;
use shotlog_audio::AudioSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        return list_devices();
    }

    info!("starting shotlog daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    config.apply_cli(&cli);
    config.validate().context("invalid configuration")?;

    info!("configuration loaded from {}", config.config_path.display());
    info!(
        "audio: {} Hz, {} channels, {}-frame blocks{}",
        config.sample_rate,
        config.channels,
        config.blocksize,
        config
            .device_index
            .map(|i| format!(", device index {i}"))
            .unwrap_or_else(|| ", default device".to_string())
    );
    info!(
        "detection: threshold {} dBFS, pre {}s / post {}s, re-arm {}s, overlap {:?}",
        config.threshold_dbfs,
        config.pre_trigger_secs,
        config.post_trigger_secs,
        config.rearm_secs,
        config.overlap_policy
    );
    info!("destination: {}", config.destination.display());

    if !config.destination.is_dir() {
        warn!(
            "destination {} is not present yet; captures will be discarded until it appears",
            config.destination.display()
        );
    }

    let tracker = SequenceTracker::load(&config.destination);
    info!("next recording sequence: {}", tracker.next());

    let (capture_tx, capture_rx) = crossbeam_channel::bounded(config.writer_queue_capacity);
    let shutdown = Arc::new(AtomicBool::new(false));

    // Persistence worker: all blocking storage I/O lives here.
    let writer_dest = config.destination.clone();
    let writer_task =
        tokio::task::spawn_blocking(move || run_writer(capture_rx, tracker, writer_dest));

    // Ingestion thread: the cpal stream and the capture state machine.
    // The capture sender moves in with it; when the thread exits, the
    // writer's queue disconnects and the worker drains out.
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
    let ingest_shutdown = Arc::clone(&shutdown);
    let ingest_config = config.clone();
    let ingest = std::thread::Builder::new()
        .name("shotlog-ingest".to_string())
        .spawn(move || {
            let mut engine = Engine::new(&ingest_config, capture_tx);
            let source_config = ingest_config.source_config();
            let result = run_capture_loop(
                || AudioSource::open(&source_config),
                &mut engine,
                &ingest_shutdown,
                ingest_config.stream_retry_limit,
                ingest_config.stream_retry_backoff(),
            );
            engine.shutdown();
            let _ = exit_tx.send(result);
        })
        .context("failed to spawn ingestion thread")?;

    info!("shotlog daemon ready");

    let mut fatal = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = exit_rx => {
            match result {
                Ok(Err(err)) => {
                    error!("audio source failed: {err}");
                    fatal = Some(err);
                }
                _ => error!("ingestion stopped unexpectedly"),
            }
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    if ingest.join().is_err() {
        error!("ingestion thread panicked");
    }

    // The capture sender is gone now; the worker finishes the queue.
    match writer_task.await {
        Ok(stats) => info!(
            "writer stopped: {} recordings written, {} failed",
            stats.written, stats.failed
        ),
        Err(err) => error!("writer worker panicked: {err}"),
    }

    info!("shotlog daemon stopped");
    match fatal {
        Some(err) => Err(err).context("audio source failed after exhausting retries"),
        None => Ok(()),
    }
}

fn list_devices() -> Result<()> {
    let devices = AudioSource::list_devices().context("failed to enumerate input devices")?;
    if devices.is_empty() {
        println!("no audio input devices found");
        return Ok(());
    }
    println!("available audio input devices:");
    for device in devices {
        println!(
            "  [{}] {}{} ({} ch, {} Hz)",
            device.index,
            device.name,
            if device.is_default { " [default]" } else { "" },
            device.max_input_channels,
            device.default_sample_rate
        );
    }
    Ok(())
}
