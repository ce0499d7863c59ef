//! One-shot rendezvous between submitting threads and the selector loop.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Single-use gate released exactly once by [`Latch::fire`].
///
/// A latch is never reused across selector cycles; every update that needs to
/// signal completion carries a fresh one.
pub struct Latch {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Latch {
        Self {
            fired: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Releases every current and future waiter. Idempotent.
    pub fn fire(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cv.notify_all();
    }

    /// Blocks until the latch fires.
    pub fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cv.wait(&mut fired);
        }
    }

    /// Blocks until the latch fires or `timeout` elapses. Returns whether the
    /// latch fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock();
        while !*fired {
            if self.cv.wait_until(&mut fired, deadline).timed_out() {
                return *fired;
            }
        }
        true
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn should_release_waiter_on_fire() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.fire();
        waiter.join().unwrap();
        // fire is idempotent and wait after fire returns immediately
        latch.fire();
        latch.wait();
    }

    #[test]
    fn should_time_out_when_not_fired() {
        let latch = Latch::new();
        assert!(!latch.wait_for(Duration::from_millis(20)));
        latch.fire();
        assert!(latch.wait_for(Duration::from_millis(20)));
    }
}
