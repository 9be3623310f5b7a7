//! End-to-end detector tests without audio hardware
//!
//! A synthetic `SampleSource` drives the full ingest → detect → capture →
//! persist path, checking the properties the deployment depends on:
//! exact capture spans, the re-arm law, durable sequence numbering across
//! a simulated crash, and a writer that can never stall ingestion.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use shotlog_audio::{AudioError, SampleBlock, SampleSource};
use shotlog_daemon::config::{DaemonConfig, TriggerOverlap};
use shotlog_daemon::engine::{run_capture_loop, Engine};
use shotlog_daemon::state::SequenceTracker;
use shotlog_daemon::writer::{recording_name, run_writer};

const RATE: u32 = 8_000;
const CHANNELS: u16 = 2;
const BLOCK_FRAMES: usize = 800; // 0.1 s per block
const SAMPLES_PER_BLOCK: usize = BLOCK_FRAMES * CHANNELS as usize;

fn range_config(dest: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        sample_rate: RATE,
        channels: CHANNELS,
        blocksize: BLOCK_FRAMES,
        pre_trigger_secs: 2.0,
        post_trigger_secs: 2.0,
        threshold_dbfs: -15.0,
        rearm_secs: 3.0,
        destination: dest.to_path_buf(),
        overlap_policy: TriggerOverlap::Coalesce,
        ..DaemonConfig::default()
    }
}

/// Constant-amplitude block: `amplitude` 0.01 is -40 dBFS background,
/// 0.5 is a -6 dBFS impulse.
fn block(amplitude: f32) -> SampleBlock {
    SampleBlock {
        samples: vec![amplitude; SAMPLES_PER_BLOCK],
    }
}

/// 20 s range soundscape: -40 dBFS background with a 0.5 s -6 dBFS
/// impulse starting at t = 10.0 s.
fn scenario_a_blocks() -> VecDeque<SampleBlock> {
    (0..200)
        .map(|i| {
            if (100..105).contains(&i) {
                block(0.5)
            } else {
                block(0.01)
            }
        })
        .collect()
}

/// Pops prepared blocks, then faults like a dead device.
struct SyntheticSource {
    blocks: VecDeque<SampleBlock>,
}

impl SampleSource for SyntheticSource {
    fn read_block(&mut self) -> Result<SampleBlock, AudioError> {
        self.blocks
            .pop_front()
            .ok_or_else(|| AudioError::stream("synthetic source exhausted"))
    }
}

#[test]
fn scenario_a_one_recording_spanning_the_impulse() {
    let dir = tempfile::tempdir().unwrap();
    let config = range_config(dir.path());

    let (tx, rx) = crossbeam_channel::bounded(config.writer_queue_capacity);
    let mut engine = Engine::new(&config, tx);

    let tracker = SequenceTracker::load(dir.path());
    let dest = dir.path().to_path_buf();
    let writer = std::thread::spawn(move || run_writer(rx, tracker, dest));

    for b in scenario_a_blocks() {
        engine.handle_block(b);
    }
    let stats = engine.stats();
    engine.shutdown(); // drops the sender; the writer drains and exits

    let writer_stats = writer.join().unwrap();
    assert_eq!(stats.triggers, 1, "impulse inside re-arm window fires once");
    assert_eq!(writer_stats.written, 1);
    assert_eq!(writer_stats.failed, 0);

    let path = dir.path().join(recording_name(1));
    assert!(path.exists(), "exactly one recording under its final name");
    let wavs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().map(|x| x == "wav").unwrap_or(false))
        .collect();
    assert_eq!(wavs.len(), 1);

    // The file spans exactly pre + post = 4 s around the trigger and
    // carries the impulse at full amplitude.
    let mut reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, RATE);
    assert_eq!(spec.channels, CHANNELS);
    assert_eq!(spec.bits_per_sample, 16);
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 4 * RATE as usize * CHANNELS as usize);
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert_eq!(peak, (0.5 * f32::from(i16::MAX)) as u16);

    // The impulse sits where the pre-trigger window puts it: its first
    // block ends the 2 s pre-window, so its half second occupies frames
    // [15200, 19200) of the 32000-frame file. A misplaced window (for
    // example a missing pre-trigger stitch) shifts these bounds.
    let loud = |s: &i16| s.unsigned_abs() > 1_000;
    let first = samples.iter().position(loud).unwrap();
    let last = samples.iter().rposition(loud).unwrap();
    assert_eq!(first, 15_200 * CHANNELS as usize);
    assert_eq!(last, 19_200 * CHANNELS as usize - 1);

    // One sequence commit: the state file survives reload at 2.
    let reloaded = SequenceTracker::load(dir.path());
    assert_eq!(reloaded.next(), 2);
    assert_eq!(reloaded.last_written(), Some(recording_name(1).as_str()));
}

#[test]
fn capture_loop_feeds_engine_until_retries_exhaust() {
    let dir = tempfile::tempdir().unwrap();
    let config = range_config(dir.path());

    let (tx, rx) = crossbeam_channel::bounded(8);
    let mut engine = Engine::new(&config, tx);
    let shutdown = AtomicBool::new(false);

    // One good source, then the device is gone for good.
    let mut opened = false;
    let result = run_capture_loop(
        || {
            if opened {
                Err(AudioError::device("device unplugged"))
            } else {
                opened = true;
                Ok(SyntheticSource {
                    blocks: scenario_a_blocks(),
                })
            }
        },
        &mut engine,
        &shutdown,
        2,
        Duration::from_millis(1),
    );

    assert!(matches!(result, Err(AudioError::DeviceUnavailable(_))));
    let stats = engine.stats();
    assert_eq!(stats.blocks_processed, 200, "every block reached the engine");
    assert_eq!(stats.triggers, 1);
    engine.shutdown();
    assert_eq!(rx.try_iter().count(), 1, "the capture was handed off before the fault");
}

#[test]
fn non_retryable_open_error_aborts_without_retries() {
    let dir = tempfile::tempdir().unwrap();
    let config = range_config(dir.path());
    let (tx, _rx) = crossbeam_channel::bounded(1);
    let mut engine = Engine::new(&config, tx);
    let shutdown = AtomicBool::new(false);

    let mut opens = 0u32;
    let result = run_capture_loop(
        || -> Result<SyntheticSource, AudioError> {
            opens += 1;
            Err(AudioError::invalid_config("blocksize must be non-zero"))
        },
        &mut engine,
        &shutdown,
        5,
        Duration::from_millis(1),
    );

    assert!(matches!(result, Err(AudioError::InvalidConfig(_))));
    assert_eq!(opens, 1, "a configuration error is not retried");
    engine.shutdown();
}

#[test]
fn rearm_law_separates_events() {
    let dir = tempfile::tempdir().unwrap();
    let config = range_config(dir.path());
    let (tx, rx) = crossbeam_channel::bounded(8);
    let mut engine = Engine::new(&config, tx);

    // Two spikes 2 s apart (inside the 3 s re-arm window), then two
    // spikes 5 s apart.
    let mut timeline = vec![0.01f32; 400]; // 40 s of background, per block
    timeline[50] = 0.5;
    timeline[70] = 0.5; // +2 s: swallowed
    timeline[150] = 0.5;
    timeline[200] = 0.5; // +5 s: distinct
    for &amp in &timeline {
        engine.handle_block(block(amp));
    }

    assert_eq!(engine.stats().triggers, 3);
    engine.shutdown();
    assert_eq!(rx.try_iter().count(), 3);
}

#[test]
fn sequence_law_survives_crash_between_write_and_commit() {
    let dir = tempfile::tempdir().unwrap();
    let config = range_config(dir.path());

    // Three events through the normal path.
    let (tx, rx) = crossbeam_channel::bounded(8);
    let mut engine = Engine::new(&config, tx);
    let tracker = SequenceTracker::load(dir.path());
    let dest = dir.path().to_path_buf();
    let writer = std::thread::spawn(move || run_writer(rx, tracker, dest));

    for _ in 0..3 {
        // 4 s of background then a spike: comfortably past re-arm.
        for _ in 0..40 {
            engine.handle_block(block(0.01));
        }
        engine.handle_block(block(0.5));
    }
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }
    engine.shutdown();
    assert_eq!(writer.join().unwrap().written, 3);

    for seq in 1..=3u64 {
        assert!(dir.path().join(recording_name(seq)).exists());
    }

    // Crash simulation: recording 4 hits the disk but the commit never
    // does. The restart scan must advance past it.
    std::fs::copy(
        dir.path().join(recording_name(3)),
        dir.path().join(recording_name(4)),
    )
    .unwrap();

    let restarted = SequenceTracker::load(dir.path());
    assert_eq!(restarted.next(), 5, "number 4 is never reused");

    // One more event after the restart lands as number 5: the observed
    // sequence 1..=5 is gapless and strictly increasing.
    let (tx, rx) = crossbeam_channel::bounded(8);
    let mut engine = Engine::new(&config, tx);
    let dest = dir.path().to_path_buf();
    let writer = std::thread::spawn(move || run_writer(rx, restarted, dest));
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }
    engine.handle_block(block(0.5));
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }
    engine.shutdown();
    assert_eq!(writer.join().unwrap().written, 1);
    assert!(dir.path().join(recording_name(5)).exists());
}

#[test]
fn slow_writer_never_stalls_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let config = range_config(dir.path());

    let (tx, rx) = crossbeam_channel::bounded(1);
    let mut engine = Engine::new(&config, tx);

    // A pathologically slow consumer: 300 ms per capture.
    let slow_writer = std::thread::spawn(move || {
        let mut consumed = 0u64;
        while let Ok(_capture) = rx.recv() {
            std::thread::sleep(Duration::from_millis(300));
            consumed += 1;
        }
        consumed
    });

    // Five well-separated events back to back; the writer would need
    // 1.5 s to keep up, ingestion must not wait for it.
    let started = Instant::now();
    for _ in 0..5 {
        for _ in 0..40 {
            engine.handle_block(block(0.01));
        }
        engine.handle_block(block(0.5));
    }
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }
    let elapsed = started.elapsed();

    let stats = engine.stats();
    engine.shutdown();
    let consumed = slow_writer.join().unwrap();

    assert_eq!(stats.triggers, 5);
    assert_eq!(
        stats.captures_sent + stats.captures_dropped,
        5,
        "every capture is accounted for: queued or dropped, never blocking"
    );
    assert!(stats.captures_dropped > 0, "overload sheds pending writes");
    assert_eq!(consumed, stats.captures_sent);
    assert!(
        elapsed < Duration::from_secs(1),
        "ingestion stalled for {elapsed:?} behind a slow writer"
    );
}

#[cfg(unix)]
#[test]
fn scenario_b_read_only_destination_recovers() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
    if std::fs::write(dir.path().join(".probe"), b"x").is_ok() {
        // Root ignores mode bits; the scenario cannot be exercised.
        return;
    }

    let config = range_config(dir.path());
    let (tx, rx) = crossbeam_channel::bounded(8);
    let mut engine = Engine::new(&config, tx);
    let tracker = SequenceTracker::load(dir.path());
    let dest = dir.path().to_path_buf();
    let writer = std::thread::spawn(move || run_writer(rx, tracker, dest));

    // First event against the read-only directory.
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }
    engine.handle_block(block(0.5));
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }

    // Give the worker time to fail the first write, then restore
    // writability and raise the next event.
    std::thread::sleep(Duration::from_millis(500));
    let wavs = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().map(|x| x == "wav").unwrap_or(false))
        .count();
    assert_eq!(wavs, 0, "no recording while read-only");
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    engine.handle_block(block(0.5));
    for _ in 0..40 {
        engine.handle_block(block(0.01));
    }
    engine.shutdown();

    let stats = writer.join().unwrap();
    assert_eq!(stats.failed, 1, "one NotWritable outcome");
    assert_eq!(stats.written, 1, "monitoring continued and the next event landed");
    assert!(dir.path().join(recording_name(1)).exists());
}
