//! Persistence of captured waveforms
//!
//! Converts a capture to a 16-bit interleaved PCM WAV on removable
//! storage. The file is written under a temporary name and renamed into
//! place, so a crash mid-write never leaves a truncated file visible
//! under its final name. Destination problems are probed before any
//! samples are encoded and surface as `NotWritable`, which the daemon
//! treats as recoverable: the capture is lost, monitoring continues.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::Capture;
use crate::state::SequenceTracker;

#[derive(Error, Debug)]
pub enum WriteError {
    /// Destination missing, not a directory, or read-only. The capture is
    /// discarded and monitoring continues.
    #[error("destination not writable: {0}")]
    NotWritable(String),

    /// Write or rename failed partway. The temporary file is removed; no
    /// partial recording becomes visible.
    #[error("recording write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Final file name for a sequence number: zero-padded so directory
/// listings sort chronologically.
pub fn recording_name(sequence: u64) -> String {
    format!("gunshot_{sequence:06}.wav")
}

fn map_hound(err: hound::Error) -> WriteError {
    match err {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            WriteError::NotWritable(io.to_string())
        }
        hound::Error::IoError(io) => WriteError::Io(io),
        other => WriteError::Io(std::io::Error::other(other.to_string())),
    }
}

/// Write one capture as `gunshot_NNNNNN.wav` under `dest`.
///
/// Returns the final path on success. Verifies the destination first and
/// fails fast; the temporary-file create doubles as the writability
/// probe.
pub fn write_capture(capture: &Capture, dest: &Path, sequence: u64) -> Result<PathBuf, WriteError> {
    if !dest.is_dir() {
        return Err(WriteError::NotWritable(format!(
            "{} is not a directory",
            dest.display()
        )));
    }

    let final_path = dest.join(recording_name(sequence));
    let tmp_path = dest.join(format!(".{}.tmp", recording_name(sequence)));

    let spec = hound::WavSpec {
        channels: capture.channels,
        sample_rate: capture.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let result = (|| {
        let mut writer = hound::WavWriter::create(&tmp_path, spec).map_err(map_hound)?;
        for &sample in &capture.samples {
            let quantized = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer.write_sample(quantized).map_err(map_hound)?;
        }
        writer.finalize().map_err(map_hound)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path.clone())
    })();

    if result.is_err() {
        // Best effort: a leftover temp file is harmless but untidy.
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Outcome counters for the persistence worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub failed: u64,
}

/// Persistence worker loop. Runs on a blocking thread, draining the
/// capture queue until every sender is gone. Sequence numbers are
/// committed only after the corresponding write succeeded; a failed
/// write reuses its number for the next capture.
pub fn run_writer(
    rx: crossbeam_channel::Receiver<Capture>,
    mut tracker: SequenceTracker,
    dest: PathBuf,
) -> WriterStats {
    let mut stats = WriterStats::default();
    while let Ok(capture) = rx.recv() {
        let sequence = tracker.next();
        match write_capture(&capture, &dest, sequence) {
            Ok(path) => {
                stats.written += 1;
                info!(
                    "{} recorded at {} ({:.1} dBFS{})",
                    path.display(),
                    capture.wall_time.format("%Y-%m-%d %H:%M:%S"),
                    capture.trigger_dbfs,
                    if capture.short { ", short pre-window" } else { "" }
                );
                if let Err(err) = tracker.commit(sequence, &recording_name(sequence)) {
                    warn!("sequence state not persisted: {err}");
                }
            }
            Err(WriteError::NotWritable(reason)) => {
                stats.failed += 1;
                warn!("capture discarded, destination not writable: {reason}");
            }
            Err(WriteError::Io(err)) => {
                stats.failed += 1;
                warn!(
                    "capture lost, write failed ({:.1}s at {:.1} dBFS): {err}",
                    capture.duration().as_secs_f64(),
                    capture.trigger_dbfs
                );
            }
        }
    }
    stats
}
