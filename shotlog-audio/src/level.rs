//! Block loudness and the trigger policy
//!
//! Loudness is the peak amplitude of a block expressed in dBFS
//! (0 dBFS = full scale). Silence is floored to a sentinel so a quiet
//! block can never push NaN or -inf into a threshold comparison.

use std::time::Duration;

/// Loudness reported for an all-zero block. Well below any usable
/// detection threshold.
pub const SILENCE_FLOOR_DBFS: f32 = -100.0;

/// Peak level of a block in dBFS. Empty or silent input returns
/// [`SILENCE_FLOOR_DBFS`].
pub fn block_dbfs(samples: &[f32]) -> f32 {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak <= 0.0 {
        return SILENCE_FLOOR_DBFS;
    }
    (20.0 * peak.log10()).max(SILENCE_FLOOR_DBFS)
}

/// Threshold-plus-re-arm trigger policy.
///
/// A trigger fires when loudness reaches the threshold and at least the
/// re-arm interval has passed since the previous trigger. Time is stream
/// time (derived from the sample count), so the policy is deterministic
/// and independent of wall-clock jitter.
#[derive(Debug)]
pub struct LevelMonitor {
    threshold_dbfs: f32,
    rearm: Duration,
    last_trigger: Option<Duration>,
}

impl LevelMonitor {
    pub fn new(threshold_dbfs: f32, rearm: Duration) -> Self {
        Self {
            threshold_dbfs,
            rearm,
            last_trigger: None,
        }
    }

    /// Evaluate one block's loudness at stream time `now`. Updates the
    /// re-arm clock when it fires.
    pub fn should_trigger(&mut self, dbfs: f32, now: Duration) -> bool {
        if dbfs < self.threshold_dbfs {
            return false;
        }
        if let Some(last) = self.last_trigger {
            if now.saturating_sub(last) < self.rearm {
                return false;
            }
        }
        self.last_trigger = Some(now);
        true
    }

    pub fn threshold_dbfs(&self) -> f32 {
        self.threshold_dbfs
    }
}
