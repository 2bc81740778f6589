//! Thread coordination primitives for the download engine.
//!
//! Two small building blocks:
//! - [`Latch`]: a countdown latch used to join the parallel manifest probe
//!   threads, with an early-break path so a user-initiated stop unblocks the
//!   waiter even while a probe is still in flight.
//! - [`CancelToken`]: a cooperative cancellation flag checked by workers at
//!   well-defined points (before each request, between streamed reads).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{EngineError, EngineResult};

struct LatchState {
    remaining: usize,
    broken: bool,
}

/// Countdown latch with early break.
///
/// `wait` blocks until `count_down` has been called the configured number of
/// times, or until `break_latch` releases all waiters prematurely.
pub struct Latch {
    state: Mutex<LatchState>,
    cv: Condvar,
}

impl Latch {
    /// Create a latch that releases after `count` calls to `count_down`.
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                remaining: count,
                broken: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Record one completion. Releases waiters when the count reaches zero.
    pub fn count_down(&self) {
        let mut state = self.state.lock().expect("latch poisoned");
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Release all waiters immediately, regardless of the remaining count.
    pub fn break_latch(&self) {
        let mut state = self.state.lock().expect("latch poisoned");
        state.broken = true;
        self.cv.notify_all();
    }

    /// Block until the count reaches zero or the latch is broken.
    ///
    /// Returns `true` on a normal release, `false` if the latch was broken.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("latch poisoned");
        while state.remaining > 0 && !state.broken {
            state = self.cv.wait(state).expect("latch poisoned");
        }
        !state.broken
    }
}

/// Cooperative cancellation signal shared between the orchestrator and its
/// workers. Cloning is cheap; all clones observe the same flag.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out of the current operation if cancellation was signalled.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
