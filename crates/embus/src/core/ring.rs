// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Bounded lock-free ring channel.
//!
//! Both ends use the same two-cursor protocol:
//!
//! ```text
//!            claim ----+            +---- read_claim
//!                      v            v
//!   [ committed writes | claimed .. | committed reads ]
//!                      ^            ^
//!            commit ---+            +---- read_commit
//! ```
//!
//! A producer CAS-claims the next write index (failing if the ring is
//! full), writes its slot, then commits in claim order: it spins until all
//! earlier claims have committed before publishing its own. Consumers
//! mirror the same protocol against the producer commit cursor. The
//! ordered commit is what lets readers treat everything below `commit` as
//! fully written without per-slot state.

use super::event::{Event, WaitOutcome};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Multi-producer multi-consumer bounded ring.
pub struct RingChannel<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    claim: AtomicUsize,
    commit: AtomicUsize,
    read_claim: AtomicUsize,
    read_commit: AtomicUsize,
}

// SAFETY: slot access is serialized by the claim/commit protocol; a slot
// is written only by the producer that claimed it and read only by the
// consumer that claimed it, with Release/Acquire edges on the cursors.
unsafe impl<T: Send> Send for RingChannel<T> {}
unsafe impl<T: Send> Sync for RingChannel<T> {}

impl<T> RingChannel<T> {
    /// Create a ring with at least `capacity` slots (rounded up to a
    /// power of two).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let mut slots = Vec::with_capacity(cap);
        for _ in 0..cap {
            slots.push(UnsafeCell::new(None));
        }
        Self {
            slots: slots.into_boxed_slice(),
            mask: cap - 1,
            claim: AtomicUsize::new(0),
            commit: AtomicUsize::new(0),
            read_claim: AtomicUsize::new(0),
            read_commit: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Committed entries not yet read-committed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commit
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_commit.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an entry; returns it back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let seq;
        loop {
            let cur = self.claim.load(Ordering::Acquire);
            if cur.wrapping_sub(self.read_commit.load(Ordering::Acquire)) >= self.capacity() {
                return Err(value);
            }
            if self
                .claim
                .compare_exchange_weak(
                    cur,
                    cur.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                seq = cur;
                break;
            }
        }

        // SAFETY: seq was claimed exclusively above; no other producer
        // writes this slot until read_commit passes it, which cannot
        // happen before our commit below.
        unsafe {
            *self.slots[seq & self.mask].get() = Some(value);
        }

        // Commit strictly in claim order.
        while self
            .commit
            .compare_exchange_weak(
                seq,
                seq.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Pop the oldest committed entry, if any.
    pub fn pop(&self) -> Option<T> {
        let seq;
        loop {
            let cur = self.read_claim.load(Ordering::Acquire);
            if cur == self.commit.load(Ordering::Acquire) {
                return None;
            }
            if self
                .read_claim
                .compare_exchange_weak(
                    cur,
                    cur.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                seq = cur;
                break;
            }
        }

        // SAFETY: seq was read-claimed exclusively; the producer committed
        // this slot before advancing commit past it.
        let value = unsafe { (*self.slots[seq & self.mask].get()).take() };
        debug_assert!(value.is_some(), "claimed slot was empty");

        while self
            .read_commit
            .compare_exchange_weak(
                seq,
                seq.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
        value
    }
}

/// Receive failure for [`RingQueue::pop_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The queue was closed.
    Closed,
    /// The timeout expired.
    TimedOut,
}

/// Ring channel plus an [`Event`] for blocking consumers.
pub struct RingQueue<T> {
    ring: RingChannel<T>,
    event: Event,
    closed: AtomicBool,
}

impl<T> RingQueue<T> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: RingChannel::with_capacity(capacity),
            event: Event::new(),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Push and wake one waiter. Fails on a full or closed queue.
    pub fn push(&self, value: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(value);
        }
        self.ring.push(value)?;
        self.event.post();
        Ok(())
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.ring.pop()
    }

    /// Blocking pop. A closed queue fails immediately, even non-empty;
    /// close severs the stream rather than draining it.
    pub fn pop_wait(&self, timeout: Option<Duration>) -> Result<T, RecvError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_closed() {
                return Err(RecvError::Closed);
            }
            if let Some(value) = self.ring.pop() {
                return Ok(value);
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(RecvError::TimedOut);
                    }
                    Some(d - now)
                }
            };
            if self.event.wait(remaining) == WaitOutcome::TimedOut {
                return Err(RecvError::TimedOut);
            }
        }
    }

    /// Close the queue and release every blocked waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.event.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_fifo() {
        let ring = RingChannel::with_capacity(8);
        for i in 0..5 {
            ring.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn full_ring_rejects_push() {
        let ring = RingChannel::with_capacity(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(99));
        assert_eq!(ring.pop(), Some(0));
        ring.push(99).unwrap();
    }

    #[test]
    fn wraparound_many_times() {
        let ring = RingChannel::with_capacity(4);
        for i in 0..1000 {
            ring.push(i).unwrap();
            assert_eq!(ring.pop(), Some(i));
        }
    }

    #[test]
    fn capacity_rounds_up() {
        let ring: RingChannel<u8> = RingChannel::with_capacity(5);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn mpmc_every_entry_delivered_once() {
        let ring = Arc::new(RingChannel::with_capacity(64));
        let producers = 4;
        let per_producer = 2500usize;

        let mut handles = Vec::new();
        for p in 0..producers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let v = p * per_producer + i;
                    loop {
                        if ring.push(v).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }));
        }

        let consumers = 3;
        let total = producers * per_producer;
        let popped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let remaining = Arc::new(AtomicUsize::new(total));
        let mut consumer_handles = Vec::new();
        for _ in 0..consumers {
            let ring = Arc::clone(&ring);
            let popped = Arc::clone(&popped);
            let remaining = Arc::clone(&remaining);
            consumer_handles.push(thread::spawn(move || {
                let mut local = Vec::new();
                loop {
                    if let Some(v) = ring.pop() {
                        local.push(v);
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            break;
                        }
                    } else if remaining.load(Ordering::Acquire) == 0 {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }
                popped.lock().extend(local);
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        for h in consumer_handles {
            h.join().unwrap();
        }

        let popped = popped.lock();
        assert_eq!(popped.len(), total);
        let unique: HashSet<_> = popped.iter().copied().collect();
        assert_eq!(unique.len(), total, "duplicate or lost entries");
    }

    #[test]
    fn single_producer_order_preserved_per_stream() {
        let ring = Arc::new(RingChannel::with_capacity(32));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..5000u32 {
                    while ring.push(i).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };
        let mut last = None;
        let mut seen = 0;
        while seen < 5000 {
            if let Some(v) = ring.pop() {
                if let Some(prev) = last {
                    assert!(v > prev, "out of order: {prev} then {v}");
                }
                last = Some(v);
                seen += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn queue_blocking_pop() {
        let q = Arc::new(RingQueue::with_capacity(8));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_wait(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        q.push(42).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(42));
    }

    #[test]
    fn queue_pop_times_out() {
        let q: RingQueue<u8> = RingQueue::with_capacity(8);
        assert_eq!(
            q.pop_wait(Some(Duration::from_millis(10))),
            Err(RecvError::TimedOut)
        );
    }

    #[test]
    fn close_releases_blocked_waiters() {
        let q: Arc<RingQueue<u8>> = Arc::new(RingQueue::with_capacity(8));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_wait(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), Err(RecvError::Closed));
        // Further operations keep failing.
        assert!(q.push(1).is_err());
        assert_eq!(q.pop_wait(None), Err(RecvError::Closed));
    }
}
