//! Durable sequence numbering
//!
//! Recordings are named by a monotonically increasing counter that must
//! survive restarts without ever pairing one number with two different
//! waveforms. The counter lives in a small JSON file next to the
//! recordings; at startup the destination directory itself is the
//! authority: if a crash landed between write and commit, the scan finds
//! the orphaned file and advances past it. A missing or corrupt state
//! file is a warning and a safe default, never a startup failure.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const STATE_FILE: &str = "gunshot_state.json";

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    next_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_written: Option<String>,
}

/// Sequence number of a recording file name, if it is one of ours.
fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix("gunshot_")?
        .strip_suffix(".wav")?
        .parse()
        .ok()
}

/// Durable next-sequence-number record.
pub struct SequenceTracker {
    path: PathBuf,
    next: u64,
    last_written: Option<String>,
}

impl SequenceTracker {
    /// Load state from `dest`, reconciling against the files actually on
    /// disk. Never fails: corruption resets to a safe value with a
    /// warning.
    pub fn load(dest: &Path) -> Self {
        let path = dest.join(STATE_FILE);
        let mut next = 1u64;
        let mut last_written = None;

        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<StateRecord>(&contents) {
                Ok(record) => {
                    next = record.next_sequence.max(1);
                    last_written = record.last_written;
                }
                Err(err) => {
                    warn!(
                        "corrupt sequence state in {}; starting from a safe value: {err}",
                        path.display()
                    );
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no sequence state at {}; starting fresh", path.display());
            }
            Err(err) => {
                warn!(
                    "cannot read sequence state {}; starting from a safe value: {err}",
                    path.display()
                );
            }
        }

        // The directory outranks the state file: a crash between write
        // and commit leaves a recording the counter does not know about.
        if let Some(highest) = Self::highest_on_disk(dest) {
            if highest >= next {
                warn!(
                    "found gunshot_{highest:06}.wav past the committed counter; advancing to {}",
                    highest + 1
                );
                next = highest + 1;
            }
        }

        Self {
            path,
            next,
            last_written,
        }
    }

    fn highest_on_disk(dest: &Path) -> Option<u64> {
        let entries = std::fs::read_dir(dest).ok()?;
        entries
            .flatten()
            .filter_map(|entry| parse_sequence(&entry.file_name().to_string_lossy()))
            .max()
    }

    /// The sequence number the next recording will use. Not advanced
    /// until [`commit`](Self::commit) confirms a successful write.
    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn last_written(&self) -> Option<&str> {
        self.last_written.as_deref()
    }

    /// Record that `sequence` was written as `filename` and persist the
    /// advanced counter atomically (temp + rename). The in-memory counter
    /// advances even if persistence fails, so one process never reuses a
    /// number; the on-disk scan covers the restart case.
    pub fn commit(&mut self, sequence: u64, filename: &str) -> std::io::Result<()> {
        self.next = sequence + 1;
        self.last_written = Some(filename.to_string());

        let record = StateRecord {
            next_sequence: self.next,
            last_written: self.last_written.clone(),
        };
        let contents = serde_json::to_string_pretty(&record)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)
    }
}
