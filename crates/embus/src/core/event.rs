// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Counting-semaphore wakeup primitive.
//!
//! `post` never blocks and its count persists, so a post racing a waiter
//! is never lost. `wait` may return `Signaled` spuriously after a
//! `wake_all`; callers re-check their own predicate, which every user in
//! this crate does anyway (pop from a ring, check a flag).

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of [`Event::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A post was consumed, or a broadcast woke us.
    Signaled,
    /// The timeout expired with no post.
    TimedOut,
}

/// In-process counting event.
pub struct Event {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Add one wakeup and release at most one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        drop(count);
        self.cond.notify_one();
    }

    /// Wake every waiter without adding a count.
    ///
    /// Used on shutdown so blocked receivers re-check their closed flag.
    pub fn wake_all(&self) {
        let _guard = self.count.lock();
        self.cond.notify_all();
    }

    /// Consume one wakeup, blocking up to `timeout` (forever if `None`).
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return WaitOutcome::Signaled;
            }
            match deadline {
                None => {
                    self.cond.wait(&mut count);
                    // A wake_all arrives with no count; report it and let
                    // the caller re-check its predicate.
                    if *count == 0 {
                        return WaitOutcome::Signaled;
                    }
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return WaitOutcome::TimedOut;
                    }
                    if self.cond.wait_for(&mut count, d - now).timed_out() && *count == 0 {
                        return WaitOutcome::TimedOut;
                    }
                    if *count == 0 {
                        return WaitOutcome::Signaled;
                    }
                }
            }
        }
    }

    /// Consume one wakeup if immediately available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for Event {
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
    fn post_before_wait_is_not_lost() {
        let ev = Event::new();
        ev.post();
        assert_eq!(ev.wait(Some(Duration::ZERO)), WaitOutcome::Signaled);
    }

    #[test]
    fn wait_times_out() {
        let ev = Event::new();
        assert_eq!(
            ev.wait(Some(Duration::from_millis(10))),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn post_wakes_blocked_waiter() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let handle = thread::spawn(move || ev2.wait(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        ev.post();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Signaled);
    }

    #[test]
    fn counts_accumulate() {
        let ev = Event::new();
        ev.post();
        ev.post();
        ev.post();
        assert!(ev.try_wait());
        assert!(ev.try_wait());
        assert!(ev.try_wait());
        assert!(!ev.try_wait());
    }

    #[test]
    fn wake_all_releases_every_waiter() {
        let ev = Arc::new(Event::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ev = Arc::clone(&ev);
            handles.push(thread::spawn(move || ev.wait(Some(Duration::from_secs(5)))));
        }
        thread::sleep(Duration::from_millis(30));
        ev.wake_all();
        for h in handles {
            assert_eq!(h.join().unwrap(), WaitOutcome::Signaled);
        }
    }
}
