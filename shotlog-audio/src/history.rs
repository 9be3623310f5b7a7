//! Rolling history of recent audio
//!
//! A fixed-capacity ring that always holds the most recent N samples.
//! The ingestion path is the only writer; the capture orchestrator reads
//! independent snapshots of the tail. Overwrite-on-wrap means old audio is
//! replaced in place, so both sides go through one mutex held only for
//! short copies. A snapshot therefore sees either the old or the fully
//! written new value of every slot, never a torn one.

use parking_lot::Mutex;

/// An independent copy of the most recent samples in the ring.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Interleaved samples, oldest first, ending at the newest sample
    /// appended before the snapshot was taken.
    pub samples: Vec<f32>,
    /// True when less history was available than requested.
    pub truncated: bool,
}

struct Ring {
    data: Vec<f32>,
    /// Next write position.
    head: usize,
    /// Set once the ring has wrapped at least once.
    filled: bool,
}

impl Ring {
    fn available(&self) -> usize {
        if self.filled {
            self.data.len()
        } else {
            self.head
        }
    }
}

/// Fixed-duration rolling store of recent audio.
///
/// `append` runs on the ingestion path only; `snapshot` may run from any
/// thread. Capacity is fixed at construction; the oldest data is
/// overwritten, never freed.
pub struct HistoryBuffer {
    inner: Mutex<Ring>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create a ring holding `capacity` interleaved samples. Callers size
    /// this to pre-trigger + post-trigger + slack and keep it a multiple
    /// of the channel count so snapshots stay frame-aligned.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            inner: Mutex::new(Ring {
                data: vec![0.0; capacity],
                head: 0,
                filled: false,
            }),
            capacity,
        }
    }

    /// Append samples, overwriting the oldest data at capacity. O(1)
    /// amortized: at most two slice copies per call.
    pub fn append(&self, samples: &[f32]) {
        // An input longer than the ring reduces to its tail.
        let input = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        if input.is_empty() {
            return;
        }

        let mut ring = self.inner.lock();
        let head = ring.head;
        let first = (self.capacity - head).min(input.len());
        ring.data[head..head + first].copy_from_slice(&input[..first]);
        let rest = input.len() - first;
        if rest > 0 {
            ring.data[..rest].copy_from_slice(&input[first..]);
        }
        ring.head = (head + input.len()) % self.capacity;
        if ring.filled || head + input.len() >= self.capacity {
            ring.filled = true;
        }
    }

    /// Copy the most recent `count` samples out of the ring, capped to the
    /// history actually available. `truncated` is set when capped.
    pub fn snapshot(&self, count: usize) -> Snapshot {
        let ring = self.inner.lock();
        let available = ring.available();
        let take = count.min(available);
        let mut samples = Vec::with_capacity(take);
        if take > 0 {
            // Oldest requested sample sits `take` slots behind head,
            // modulo the ring length.
            let start = (ring.head + self.capacity - take) % self.capacity;
            let first = (self.capacity - start).min(take);
            samples.extend_from_slice(&ring.data[start..start + first]);
            samples.extend_from_slice(&ring.data[..take - first]);
        }
        Snapshot {
            samples,
            truncated: take < count,
        }
    }

    /// Number of samples currently held.
    pub fn available(&self) -> usize {
        self.inner.lock().available()
    }

    /// Total ring capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
