// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Bounded connection-id allocator.
//!
//! Ids are small integers handed to remote peers, so the pool is seeded
//! once with `[0, capacity)` and recycled forever. An `outstanding` bit
//! per id makes release idempotent: a double release (e.g. a racing close
//! and liveness teardown) is ignored instead of duplicating the id.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

pub struct IdPool {
    free: ArrayQueue<i32>,
    outstanding: Box<[AtomicBool]>,
}

impl IdPool {
    /// Pool over ids `0..capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for id in 0..capacity {
            // Cannot fail: queue was sized for exactly this many.
            let _ = free.push(id as i32);
        }
        let outstanding = (0..capacity)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { free, outstanding }
    }

    /// Take an id out of the pool.
    pub fn acquire(&self) -> Result<i32> {
        let id = self.free.pop().ok_or(Error::IdExhausted)?;
        self.outstanding[id as usize].store(true, Ordering::Release);
        Ok(id)
    }

    /// Return an id. Reports whether this release actually freed it;
    /// out-of-range or already-free ids are rejected.
    pub fn release(&self, id: i32) -> bool {
        let Ok(idx) = usize::try_from(id) else {
            return false;
        };
        if idx >= self.outstanding.len() {
            return false;
        }
        if self.outstanding[idx].swap(false, Ordering::AcqRel) {
            let _ = self.free.push(id);
            true
        } else {
            false
        }
    }

    /// Ids currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}
