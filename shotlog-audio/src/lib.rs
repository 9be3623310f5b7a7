//! Shotlog audio capture and detection primitives
//!
//! Continuous two-channel capture with a rolling history and a level
//! trigger, built for a detector that must run forever without dropping
//! samples.
//!
//! ## Architecture
//!
//! ```text
//! Audio Device (cpal)
//!   │  callback: format → f32, exact blocks, bounded channel
//!   ▼
//! AudioSource::read_block ──> HistoryBuffer (overwrite-on-wrap ring)
//!                         └─> block_dbfs / LevelMonitor (trigger policy)
//! ```
//!
//! The capture orchestrator and persistence live in `shotlog-daemon`;
//! everything here is reachable without hardware through the
//! [`SampleSource`] trait.

pub mod error;
pub mod history;
pub mod level;
pub mod source;

pub use error::{AudioError, Result};
pub use history::{HistoryBuffer, Snapshot};
pub use level::{block_dbfs, LevelMonitor, SILENCE_FLOOR_DBFS};
pub use source::{AudioSource, DeviceInfo, SampleBlock, SampleSource};

/// Default capture sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default audio blocksize (frames per block).
pub const DEFAULT_BLOCKSIZE: usize = 1024;

/// Capture device configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Sample rate in Hz (default: 48000).
    pub sample_rate: u32,
    /// Interleaved channel count (default: 2).
    pub channels: u16,
    /// Frames per delivered block (default: 1024).
    pub blocksize: usize,
    /// Input device index (None = default device).
    pub device_index: Option<usize>,
    /// Bounded block-channel capacity between callback and consumer.
    pub channel_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            blocksize: DEFAULT_BLOCKSIZE,
            device_index: None,
            channel_capacity: 32,
        }
    }
}
