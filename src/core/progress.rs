use crate::event::TransferProgress;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default sampling window for instantaneous speed
const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Minimum interval between emitted progress samples
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Computes cumulative bytes, percentage and instantaneous speed for one
/// active transfer.
///
/// Speed is a windowed rate (byte delta over time delta across the most
/// recent window), not a lifetime average, so it reflects current throughput.
#[derive(Debug)]
pub struct ProgressTracker {
    transfer_id: String,
    total_bytes: u64,
    current_file: Option<String>,
    samples: VecDeque<(Instant, u64)>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(transfer_id: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            total_bytes,
            current_file: None,
            samples: VecDeque::new(),
            last_emit: None,
        }
    }

    /// Record cumulative bytes for the current attempt.
    ///
    /// Returns a progress event when the active file changed, the sampling
    /// interval elapsed, or the transfer just reached its total; `None` means
    /// the sample was absorbed without emitting.
    pub fn record(&mut self, current_file: Option<&str>, bytes: u64) -> Option<TransferProgress> {
        let now = Instant::now();
        self.push_sample(now, bytes);

        let file_changed = current_file != self.current_file.as_deref();
        if file_changed {
            self.current_file = current_file.map(str::to_string);
        }

        let due = match self.last_emit {
            Some(prev) => now.duration_since(prev) >= SAMPLE_INTERVAL,
            None => true,
        };

        if file_changed || due || bytes >= self.total_bytes {
            self.last_emit = Some(now);
            Some(self.snapshot(bytes))
        } else {
            None
        }
    }

    /// Forget samples from the aborted attempt; progress restarts at
    /// `acknowledged` bytes. Callers emit a retry event alongside so the
    /// counter reset is explicit, never a silent backward jump.
    pub fn reset(&mut self, acknowledged: u64) {
        self.samples.clear();
        self.last_emit = None;
        self.current_file = None;
        self.push_sample(Instant::now(), acknowledged);
    }

    /// Completion percentage; 0 for an empty transfer rather than NaN
    pub fn percent(&self, bytes: u64) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    fn push_sample(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn speed_bps(&self) -> u64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let dt = t1.duration_since(t0).as_secs_f64();
        if dt <= 0.0 || b1 <= b0 {
            return 0;
        }
        ((b1 - b0) as f64 / dt) as u64
    }

    fn snapshot(&self, bytes: u64) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            current_file: self.current_file.clone(),
            bytes_transferred: bytes,
            total_bytes: self.total_bytes,
            speed_bps: self.speed_bps(),
        }
    }
}
