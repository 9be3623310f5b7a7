//! Configuration management
//!
//! One immutable [`DaemonConfig`] is built at startup from a TOML file
//! (created with defaults on first run) plus command-line overrides, then
//! passed by reference to every component. No ambient mutable state.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use shotlog_audio::SourceConfig;

/// What to do when a trigger fires while a capture is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOverlap {
    /// Extend the running capture's post-trigger deadline (default).
    Coalesce,
    /// Finish the running capture, then start one for the new trigger,
    /// stitching its elapsed portion from history.
    Queue,
    /// Ignore the overlapping trigger.
    Drop,
}

/// Command-line arguments. File values apply first; flags given here win.
#[derive(Debug, Parser)]
#[command(name = "shotlog-daemon", about = "Acoustic event detector and recorder", version)]
pub struct Cli {
    /// Path to the TOML config file (default: platform config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Destination directory for recordings and state
    #[arg(long)]
    pub destination: Option<PathBuf>,

    /// Audio input device index (default: system default device)
    #[arg(long)]
    pub device_index: Option<usize>,

    /// Detection threshold in dBFS
    #[arg(long)]
    pub threshold_dbfs: Option<f32>,

    /// Audio retained before the trigger instant (seconds)
    #[arg(long)]
    pub pre_trigger_secs: Option<f32>,

    /// Audio captured after the trigger instant (seconds)
    #[arg(long)]
    pub post_trigger_secs: Option<f32>,

    /// Minimum time between two distinct triggers (seconds)
    #[arg(long)]
    pub rearm_secs: Option<f32>,

    /// Overlapping-trigger policy
    #[arg(long, value_enum)]
    pub overlap_policy: Option<TriggerOverlap>,

    /// Print detected audio input devices and exit
    #[arg(long, default_value_t = false)]
    pub list_devices: bool,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path the config was loaded from
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Capture sample rate (Hz)
    pub sample_rate: u32,

    /// Channel count (2 = stereo microphone pair)
    pub channels: u16,

    /// Frames per sample block
    pub blocksize: usize,

    /// Audio device index (None = default device)
    pub device_index: Option<usize>,

    /// Seconds of audio kept before the trigger instant
    pub pre_trigger_secs: f32,

    /// Seconds of audio captured after the trigger instant
    pub post_trigger_secs: f32,

    /// Detection threshold (dBFS; 0 = full scale)
    pub threshold_dbfs: f32,

    /// Re-arm interval between distinct triggers (seconds)
    pub rearm_secs: f32,

    /// Destination directory on removable storage
    pub destination: PathBuf,

    /// Overlapping-trigger policy
    pub overlap_policy: TriggerOverlap,

    /// Pending-capture queue depth between engine and writer
    pub writer_queue_capacity: usize,

    /// Stream-fault retries before the process gives up
    pub stream_retry_limit: u32,

    /// Base backoff between stream-fault retries (milliseconds)
    pub stream_retry_backoff_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            sample_rate: shotlog_audio::DEFAULT_SAMPLE_RATE,
            channels: 2,
            blocksize: shotlog_audio::DEFAULT_BLOCKSIZE,
            device_index: None,
            pre_trigger_secs: 2.0,
            post_trigger_secs: 2.0,
            threshold_dbfs: -15.0,
            rearm_secs: 3.0,
            destination: PathBuf::from("/media/usb/gunshots"),
            overlap_policy: TriggerOverlap::Coalesce,
            writer_queue_capacity: 4,
            stream_retry_limit: 5,
            stream_retry_backoff_ms: 500,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file, or create the default one.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("failed to read config file")?;
            let mut config: DaemonConfig =
                toml::from_str(&contents).context("failed to parse config file")?;
            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Self {
                config_path,
                ..Self::default()
            };
            config.save().context("failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to its file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&self.config_path, contents).context("failed to write config file")?;
        Ok(())
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dest) = &cli.destination {
            self.destination = dest.clone();
        }
        if cli.device_index.is_some() {
            self.device_index = cli.device_index;
        }
        if let Some(v) = cli.threshold_dbfs {
            self.threshold_dbfs = v;
        }
        if let Some(v) = cli.pre_trigger_secs {
            self.pre_trigger_secs = v;
        }
        if let Some(v) = cli.post_trigger_secs {
            self.post_trigger_secs = v;
        }
        if let Some(v) = cli.rearm_secs {
            self.rearm_secs = v;
        }
        if let Some(v) = cli.overlap_policy {
            self.overlap_policy = v;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            bail!("sample_rate must be non-zero");
        }
        if self.channels == 0 {
            bail!("channels must be non-zero");
        }
        if self.blocksize == 0 {
            bail!("blocksize must be non-zero");
        }
        if self.pre_trigger_secs <= 0.0 || self.post_trigger_secs <= 0.0 {
            bail!("pre/post trigger windows must be positive");
        }
        if self.rearm_secs < 0.0 {
            bail!("rearm_secs must not be negative");
        }
        if self.threshold_dbfs > 0.0 {
            bail!("threshold_dbfs above 0 dBFS can never fire");
        }
        if self.writer_queue_capacity == 0 {
            bail!("writer_queue_capacity must be non-zero");
        }
        Ok(())
    }

    /// Capture-device view of this configuration.
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            blocksize: self.blocksize,
            device_index: self.device_index,
            channel_capacity: 32,
        }
    }

    pub fn pre_trigger(&self) -> Duration {
        Duration::from_secs_f32(self.pre_trigger_secs)
    }

    pub fn post_trigger(&self) -> Duration {
        Duration::from_secs_f32(self.post_trigger_secs)
    }

    pub fn rearm(&self) -> Duration {
        Duration::from_secs_f32(self.rearm_secs)
    }

    pub fn stream_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.stream_retry_backoff_ms)
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shotlog")
            .join("config.toml")
    }
}
