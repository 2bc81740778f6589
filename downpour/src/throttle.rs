//! Global download speed limiter.
//!
//! One limiter is shared by every worker of a download. Workers report the
//! bytes they have read and call [`SpeedLimiter::pause_if_needed`] between
//! reads; the limiter sleeps the calling thread just long enough to keep the
//! aggregate transfer rate under the configured cap.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Accounting window. Reset once a second so short stalls do not build up
/// an unbounded byte credit.
struct Window {
    started: Instant,
    bytes: u64,
}

/// Shared speed limiter. A `None` limit disables throttling entirely.
pub struct SpeedLimiter {
    limit: Option<u64>,
    window: Mutex<Window>,
}

impl SpeedLimiter {
    /// Create a limiter capped at `limit` bytes per second across all
    /// workers, or unlimited when `None`.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Record bytes transferred by one worker.
    pub fn record(&self, bytes: u64) {
        if self.limit.is_none() {
            return;
        }
        self.window.lock().bytes += bytes;
    }

    /// Sleep the calling thread if the window's byte count is ahead of the
    /// configured rate. Must not be called with any engine lock held.
    pub fn pause_if_needed(&self) {
        let Some(limit) = self.limit else {
            return;
        };
        let pause = {
            let mut window = self.window.lock();
            let elapsed = window.started.elapsed();
            let budget = Duration::from_secs_f64(window.bytes as f64 / limit as f64);
            if elapsed >= Duration::from_secs(1) {
                window.started = Instant::now();
                window.bytes = 0;
            }
            budget.checked_sub(elapsed)
        };
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
    }
}
