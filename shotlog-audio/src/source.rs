//! Audio source adapter over cpal
//!
//! Wraps the capture device and delivers fixed-size interleaved sample
//! blocks at the device cadence. The cpal callback converts whatever
//! sample format the backend hands us to f32, cuts exact blocks, and
//! pushes them over a bounded channel; `read_block` on the consumer side
//! suspends until one full block is available and never returns a short
//! one. Everything downstream of this module is hardware-free.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AudioError, Result};
use crate::SourceConfig;

/// One fixed-size group of interleaved samples, delivered atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Interleaved f32 samples; length = blocksize × channels.
    pub samples: Vec<f32>,
}

impl SampleBlock {
    /// Number of per-channel frames in the block.
    pub fn frames(&self, channels: u16) -> usize {
        self.samples.len() / usize::from(channels.max(1))
    }
}

/// Anything that can deliver sample blocks to the capture engine.
///
/// Implemented by [`AudioSource`] for real hardware and by synthetic
/// sources in tests.
pub trait SampleSource {
    /// Block until exactly one full block has arrived.
    fn read_block(&mut self) -> Result<SampleBlock>;

    /// Blocks lost at the device boundary because the consumer fell a
    /// full channel behind. Stays zero in a healthy deployment.
    fn overflowed_blocks(&self) -> usize {
        0
    }
}

/// Audio input device information for `--list-devices`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub max_input_channels: u16,
    pub default_sample_rate: u32,
}

/// Accumulates converted samples from arbitrary callback slice lengths
/// and emits exact blocks. Lives inside the cpal callback closure.
struct BlockCutter {
    block_samples: usize,
    pending: Vec<f32>,
    sender: Sender<SampleBlock>,
    overflowed: Arc<AtomicUsize>,
}

impl BlockCutter {
    fn new(block_samples: usize, sender: Sender<SampleBlock>, overflowed: Arc<AtomicUsize>) -> Self {
        Self {
            block_samples: block_samples.max(1),
            pending: Vec::with_capacity(block_samples * 2),
            sender,
            overflowed,
        }
    }

    fn push<T, F>(&mut self, data: &[T], mut convert: F)
    where
        T: Copy,
        F: FnMut(T) -> f32,
    {
        self.pending.extend(data.iter().copied().map(&mut convert));
        while self.pending.len() >= self.block_samples {
            let samples: Vec<f32> = self.pending.drain(..self.block_samples).collect();
            match self.sender.try_send(SampleBlock { samples }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.overflowed.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Live capture device delivering fixed-size stereo blocks.
pub struct AudioSource {
    receiver: Receiver<SampleBlock>,
    fault: Arc<Mutex<Option<String>>>,
    overflowed: Arc<AtomicUsize>,
    read_timeout: Duration,
    // Held for its Drop: releasing the stream releases the device.
    _stream: cpal::Stream,
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl AudioSource {
    /// Open the configured device and start the stream.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        if config.sample_rate == 0 {
            return Err(AudioError::invalid_config("sample_rate must be non-zero"));
        }
        if config.channels == 0 {
            return Err(AudioError::invalid_config("channels must be non-zero"));
        }
        if config.blocksize == 0 {
            return Err(AudioError::invalid_config("blocksize must be non-zero"));
        }

        let host = cpal::default_host();
        let device = match config.device_index {
            Some(index) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| AudioError::device(format!("failed to enumerate devices: {e}")))?;
                devices
                    .nth(index)
                    .ok_or_else(|| AudioError::device(format!("device index {index} not found")))?
            }
            None => host
                .default_input_device()
                .ok_or_else(|| AudioError::device("no default input device found"))?,
        };

        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::device(format!("failed to get device config: {e}")))?;
        let format = supported.sample_format();

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.blocksize as u32),
        };

        let block_samples = config.blocksize * usize::from(config.channels);
        let (sender, receiver) = bounded::<SampleBlock>(config.channel_capacity.max(1));
        let overflowed = Arc::new(AtomicUsize::new(0));
        let fault: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let err_fault = Arc::clone(&fault);
        let err_fn = move |err: cpal::StreamError| {
            *err_fault.lock() = Some(err.to_string());
        };

        let stream = match format {
            SampleFormat::F32 => {
                let mut cutter = BlockCutter::new(block_samples, sender, Arc::clone(&overflowed));
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        cutter.push(data, |s| s);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut cutter = BlockCutter::new(block_samples, sender, Arc::clone(&overflowed));
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        cutter.push(data, |s| f32::from(s) / 32_768.0);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let mut cutter = BlockCutter::new(block_samples, sender, Arc::clone(&overflowed));
                device.build_input_stream(
                    &stream_config,
                    move |data: &[u16], _: &cpal::InputCallbackInfo| {
                        cutter.push(data, |s| (f32::from(s) - 32_768.0) / 32_768.0);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(AudioError::device(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| AudioError::device(format!("failed to build stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AudioError::device(format!("failed to start stream: {e}")))?;

        // A fault is a prolonged absence of data, not ordinary jitter:
        // wait many block periods before declaring the device dead.
        let block_period = Duration::from_secs_f64(config.blocksize as f64 / config.sample_rate as f64);
        let read_timeout = (block_period * 50).max(Duration::from_secs(2));

        Ok(Self {
            receiver,
            fault,
            overflowed,
            read_timeout,
            _stream: stream,
        })
    }

    /// Enumerate input devices for the `--list-devices` flag.
    pub fn list_devices() -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host
            .default_input_device()
            .and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        for (index, device) in host
            .input_devices()
            .map_err(|e| AudioError::device(format!("failed to enumerate devices: {e}")))?
            .enumerate()
        {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Unknown Device {index}"));
            let (max_input_channels, default_sample_rate) = device
                .default_input_config()
                .map(|c| (c.channels(), c.sample_rate().0))
                .unwrap_or((0, 0));
            devices.push(DeviceInfo {
                index,
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                max_input_channels,
                default_sample_rate,
            });
        }
        Ok(devices)
    }
}

impl SampleSource for AudioSource {
    fn overflowed_blocks(&self) -> usize {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn read_block(&mut self) -> Result<SampleBlock> {
        if let Some(msg) = self.fault.lock().take() {
            return Err(AudioError::stream(msg));
        }
        match self.receiver.recv_timeout(self.read_timeout) {
            Ok(block) => Ok(block),
            Err(RecvTimeoutError::Timeout) => {
                let msg = self
                    .fault
                    .lock()
                    .take()
                    .unwrap_or_else(|| {
                        format!("no audio for {:.1}s", self.read_timeout.as_secs_f32())
                    });
                Err(AudioError::stream(msg))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(AudioError::stream("capture stream disconnected"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutter_emits_exact_blocks() {
        let (tx, rx) = bounded(8);
        let overflowed = Arc::new(AtomicUsize::new(0));
        let mut cutter = BlockCutter::new(4, tx, overflowed);

        cutter.push(&[1.0f32, 2.0, 3.0], |s| s);
        assert!(rx.try_recv().is_err(), "no full block yet");

        cutter.push(&[4.0f32, 5.0], |s| s);
        let block = rx.try_recv().unwrap();
        assert_eq!(block.samples, vec![1.0, 2.0, 3.0, 4.0]);
        // The leftover sample stays pending for the next block.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cutter_converts_i16() {
        let (tx, rx) = bounded(8);
        let overflowed = Arc::new(AtomicUsize::new(0));
        let mut cutter = BlockCutter::new(2, tx, overflowed);

        cutter.push(&[i16::MIN, 16_384], |s| f32::from(s) / 32_768.0);
        let block = rx.try_recv().unwrap();
        assert_eq!(block.samples, vec![-1.0, 0.5]);
    }

    #[test]
    fn bad_config_is_rejected_before_the_device_is_touched() {
        let config = SourceConfig {
            blocksize: 0,
            ..SourceConfig::default()
        };
        let err = AudioSource::open(&config).unwrap_err();
        assert!(matches!(err, AudioError::InvalidConfig(_)));
        // A broken configuration cannot be fixed by reopening.
        assert!(!err.is_retryable());
    }

    #[test]
    fn cutter_counts_overflow_instead_of_blocking() {
        let (tx, rx) = bounded(1);
        let overflowed = Arc::new(AtomicUsize::new(0));
        let mut cutter = BlockCutter::new(2, tx, Arc::clone(&overflowed));

        cutter.push(&[0.0f32; 6], |s| s);
        // One block queued, two dropped on the full channel.
        assert_eq!(overflowed.load(Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap().samples.len(), 2);
    }
}
