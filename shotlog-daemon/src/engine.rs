//! Capture orchestrator
//!
//! Consumes sample blocks at the device cadence, keeps the rolling
//! history current, evaluates the trigger policy, and stitches pre-trigger
//! history together with live post-trigger audio into one contiguous
//! capture. Completed captures are handed to the persistence worker over
//! a bounded channel with `try_send`: under sustained overload a pending
//! capture's write is dropped before a single live sample ever is.
//!
//! Time is a sample clock (frames ingested / sample rate), so every state
//! transition is deterministic and testable without hardware.

use chrono::{DateTime, Local};
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use shotlog_audio::{block_dbfs, AudioError, HistoryBuffer, SampleBlock, SampleSource};
use shotlog_audio::LevelMonitor;

use crate::config::{DaemonConfig, TriggerOverlap};

/// Ring slack beyond pre + post, in seconds. Covers monitor latency and
/// the queued-overlap catch-up snapshot.
const HISTORY_SLACK_SECS: u64 = 1;

/// A threshold crossing, pinned to the sample clock at the end of the
/// block that crossed it.
#[derive(Debug, Clone)]
struct TriggerEvent {
    at_frames: u64,
    dbfs: f32,
    wall_time: DateTime<Local>,
}

/// A finished waveform on its way to storage.
#[derive(Debug, Clone)]
pub struct Capture {
    /// Interleaved samples spanning [trigger − pre, trigger + post].
    pub samples: Vec<f32>,
    /// Loudness that fired the trigger (dBFS).
    pub trigger_dbfs: f32,
    /// Trigger instant on the stream clock.
    pub trigger_at: Duration,
    /// Wall-clock time of the trigger, for forensic logs.
    pub wall_time: DateTime<Local>,
    /// True when the history could not supply the full pre-trigger window
    /// (trigger close to startup).
    pub short: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Capture {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as u64 / u64::from(self.channels.max(1));
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }
}

struct InFlight {
    samples: Vec<f32>,
    /// Interleaved sample count at which the capture is complete.
    target: usize,
    trigger: TriggerEvent,
    short: bool,
    /// Newest overlapping trigger awaiting its own capture (queue policy).
    queued: Option<TriggerEvent>,
}

enum Phase {
    Idle,
    Capturing(InFlight),
}

/// Counters for observability and the backpressure tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub blocks_processed: u64,
    pub triggers: u64,
    pub captures_sent: u64,
    /// Captures dropped because the writer queue was full.
    pub captures_dropped: u64,
}

/// The detection/capture state machine. Owned by the ingestion thread;
/// [`Engine::handle_block`] never blocks.
pub struct Engine {
    history: Arc<HistoryBuffer>,
    monitor: LevelMonitor,
    phase: Phase,
    tx: Sender<Capture>,
    sample_rate: u32,
    channels: u16,
    /// Pre/post windows in interleaved samples.
    pre_samples: usize,
    post_samples: usize,
    overlap: TriggerOverlap,
    frames_ingested: u64,
    stats: EngineStats,
}

impl Engine {
    pub fn new(config: &DaemonConfig, tx: Sender<Capture>) -> Self {
        let channels = usize::from(config.channels.max(1));
        let pre_frames = (config.pre_trigger_secs as f64 * f64::from(config.sample_rate)).round() as usize;
        let post_frames =
            (config.post_trigger_secs as f64 * f64::from(config.sample_rate)).round() as usize;
        let slack_frames = config.sample_rate as usize * HISTORY_SLACK_SECS as usize;
        let capacity = (pre_frames + post_frames + slack_frames) * channels;

        Self {
            history: Arc::new(HistoryBuffer::new(capacity.max(channels))),
            monitor: LevelMonitor::new(config.threshold_dbfs, config.rearm()),
            phase: Phase::Idle,
            tx,
            sample_rate: config.sample_rate,
            channels: config.channels,
            pre_samples: pre_frames * channels,
            post_samples: post_frames * channels,
            overlap: config.overlap_policy,
            frames_ingested: 0,
            stats: EngineStats::default(),
        }
    }

    /// Stream time at the end of the last ingested block.
    pub fn stream_time(&self) -> Duration {
        Duration::from_secs_f64(self.frames_ingested as f64 / f64::from(self.sample_rate))
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Process one live block: history, loudness, trigger policy, capture
    /// progress. Never blocks on storage.
    pub fn handle_block(&mut self, block: SampleBlock) {
        self.history.append(&block.samples);
        self.frames_ingested += block.frames(self.channels) as u64;
        self.stats.blocks_processed += 1;

        let dbfs = block_dbfs(&block.samples);
        if let Phase::Capturing(inflight) = &mut self.phase {
            inflight.samples.extend_from_slice(&block.samples);
        }

        // Blocks before the ring holds a full pre-trigger window are
        // appended but never evaluated against the threshold.
        let armed = self.history.available() >= self.pre_samples;
        if armed && self.monitor.should_trigger(dbfs, self.stream_time()) {
            self.on_trigger(dbfs);
        }

        self.finalize_completed();
    }

    fn on_trigger(&mut self, dbfs: f32) {
        self.stats.triggers += 1;
        let event = TriggerEvent {
            at_frames: self.frames_ingested,
            dbfs,
            wall_time: Local::now(),
        };
        info!(
            "trigger at {:.3}s ({:.1} dBFS)",
            self.stream_time().as_secs_f64(),
            dbfs
        );

        match &mut self.phase {
            Phase::Idle => {
                let snapshot = self.history.snapshot(self.pre_samples);
                if snapshot.truncated {
                    warn!(
                        "pre-trigger history short: {} of {} samples",
                        snapshot.samples.len(),
                        self.pre_samples
                    );
                }
                let target = snapshot.samples.len() + self.post_samples;
                self.phase = Phase::Capturing(InFlight {
                    samples: snapshot.samples,
                    target,
                    short: snapshot.truncated,
                    trigger: event,
                    queued: None,
                });
            }
            Phase::Capturing(inflight) => match self.overlap {
                TriggerOverlap::Coalesce => {
                    // Current block is already in the capture, so the new
                    // deadline is simply post-trigger samples from here.
                    inflight.target = inflight.samples.len() + self.post_samples;
                    debug!("coalesced trigger; capture extended");
                }
                TriggerOverlap::Queue => {
                    inflight.queued = Some(event);
                    debug!("trigger queued behind in-flight capture");
                }
                TriggerOverlap::Drop => {
                    debug!("trigger dropped: capture already in flight");
                }
            },
        }
    }

    /// Finalize every capture whose deadline has been reached. A loop,
    /// because finishing one capture can immediately start (and in edge
    /// cases immediately complete) a queued one.
    fn finalize_completed(&mut self) {
        loop {
            let done = matches!(&self.phase, Phase::Capturing(f) if f.samples.len() >= f.target);
            if !done {
                return;
            }
            let Phase::Capturing(mut inflight) = std::mem::replace(&mut self.phase, Phase::Idle)
            else {
                unreachable!()
            };
            inflight.samples.truncate(inflight.target);
            let queued = inflight.queued.take();
            self.dispatch(inflight);
            if let Some(event) = queued {
                self.start_queued(event);
            }
        }
    }

    fn dispatch(&mut self, inflight: InFlight) {
        let capture = Capture {
            samples: inflight.samples,
            trigger_dbfs: inflight.trigger.dbfs,
            trigger_at: Duration::from_secs_f64(
                inflight.trigger.at_frames as f64 / f64::from(self.sample_rate),
            ),
            wall_time: inflight.trigger.wall_time,
            short: inflight.short,
            sample_rate: self.sample_rate,
            channels: self.channels,
        };
        match self.tx.try_send(capture) {
            Ok(()) => {
                self.stats.captures_sent += 1;
            }
            Err(TrySendError::Full(capture)) => {
                self.stats.captures_dropped += 1;
                warn!(
                    "writer queue full; dropping {:.1}s capture ({:.1} dBFS)",
                    capture.duration().as_secs_f64(),
                    capture.trigger_dbfs
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.captures_dropped += 1;
                error!("persistence worker gone; capture lost");
            }
        }
    }

    /// Begin the capture for a trigger that fired while the previous one
    /// was in flight. The portion between its pre-window start and now is
    /// already in history; the remainder arrives live.
    fn start_queued(&mut self, event: TriggerEvent) {
        let channels = usize::from(self.channels.max(1));
        let elapsed = (self.frames_ingested - event.at_frames) as usize * channels;
        let snapshot = self.history.snapshot(self.pre_samples + elapsed);
        if snapshot.truncated {
            warn!("queued-trigger history short; capture will be truncated");
        }
        let target = snapshot.samples.len() + self.post_samples.saturating_sub(elapsed);
        self.phase = Phase::Capturing(InFlight {
            samples: snapshot.samples,
            target,
            short: snapshot.truncated,
            trigger: event,
            queued: None,
        });
    }

    /// Drop any in-flight capture on shutdown, loudly: a partial window
    /// must never reach storage as if it were complete.
    pub fn shutdown(self) {
        if let Phase::Capturing(inflight) = self.phase {
            warn!(
                "shutdown: discarding in-flight capture ({} of {} samples)",
                inflight.samples.len(),
                inflight.target
            );
        }
        info!(
            "engine stopped: {} blocks, {} triggers, {} captures sent, {} dropped",
            self.stats.blocks_processed,
            self.stats.triggers,
            self.stats.captures_sent,
            self.stats.captures_dropped
        );
    }
}

fn log_overflow<S: SampleSource>(source: &S) {
    let overflowed = source.overflowed_blocks();
    if overflowed > 0 {
        warn!("{overflowed} blocks lost at the device boundary");
    }
}

/// Ingestion loop: pulls blocks from the source and feeds the engine
/// until shutdown. Recoverable stream faults re-open the source with
/// linear backoff; a non-retryable error or an exhausted retry budget
/// are the fatal paths out.
pub fn run_capture_loop<S, F>(
    mut open: F,
    engine: &mut Engine,
    shutdown: &AtomicBool,
    retry_limit: u32,
    backoff: Duration,
) -> Result<(), AudioError>
where
    S: SampleSource,
    F: FnMut() -> Result<S, AudioError>,
{
    let mut attempts = 0u32;
    'reopen: while !shutdown.load(Ordering::Relaxed) {
        let mut source = match open() {
            Ok(source) => {
                if attempts > 0 {
                    info!("audio source reopened");
                }
                source
            }
            Err(err) => {
                attempts += 1;
                if !err.is_retryable() || attempts > retry_limit {
                    error!("audio source unavailable: {err}");
                    return Err(err);
                }
                warn!("failed to open audio source: {err} (attempt {attempts}/{retry_limit})");
                std::thread::sleep(backoff * attempts);
                continue 'reopen;
            }
        };

        while !shutdown.load(Ordering::Relaxed) {
            match source.read_block() {
                Ok(block) => {
                    attempts = 0;
                    engine.handle_block(block);
                }
                Err(err) => {
                    log_overflow(&source);
                    attempts += 1;
                    if !err.is_retryable() || attempts > retry_limit {
                        error!("audio stream failed permanently: {err}");
                        return Err(err);
                    }
                    warn!("stream fault: {err}; reopening (attempt {attempts}/{retry_limit})");
                    std::thread::sleep(backoff * attempts);
                    continue 'reopen;
                }
            }
        }
        log_overflow(&source);
        return Ok(());
    }
    Ok(())
}
