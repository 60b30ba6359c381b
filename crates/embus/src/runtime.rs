// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Shared runtime context.
//!
//! Holds what the transports need in common: the data serial counter,
//! the connection-id pool and the reconnect sweeper. One runtime can be
//! shared by any number of devices; a device created without one gets a
//! private runtime of its own.
//!
//! The sweeper is a single background thread waking every
//! [`crate::config::RECONNECT_INTERVAL`]. Jobs are closures returning
//! `true` once the link is back (or permanently abandoned); the sweeper
//! takes each job out of the registry before running it, so a job is
//! free to register or cancel others without reentering the lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{MAX_PEERS, RECONNECT_INTERVAL};
use crate::core::IdPool;

/// A reconnect attempt; `true` means done (success or give-up).
pub(crate) type ReconnectJob = Box<dyn FnMut() -> bool + Send>;

struct SweeperShared {
    jobs: Mutex<HashMap<u64, ReconnectJob>>,
    stop: AtomicBool,
}

/// Process context shared by devices.
pub struct Runtime {
    serial: AtomicU32,
    peer_ids: IdPool,
    next_job: AtomicU64,
    shared: Arc<SweeperShared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(SweeperShared {
            jobs: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let sweeper = std::thread::Builder::new()
            .name("embus-reconnect".into())
            .spawn(move || sweeper_loop(&thread_shared, RECONNECT_INTERVAL))
            .ok();
        if sweeper.is_none() {
            log::error!("failed to spawn reconnect sweeper; reconnects disabled");
        }
        Arc::new(Self {
            serial: AtomicU32::new(1),
            peer_ids: IdPool::new(MAX_PEERS),
            next_job: AtomicU64::new(1),
            shared,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Next message serial; wraps at 2^32.
    pub fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection-id pool shared by every transport on this runtime.
    pub fn peer_ids(&self) -> &IdPool {
        &self.peer_ids
    }

    /// Register a reconnect job; returns a token for cancellation.
    pub(crate) fn register_reconnect(&self, job: ReconnectJob) -> u64 {
        let token = self.next_job.fetch_add(1, Ordering::Relaxed);
        self.shared.jobs.lock().insert(token, job);
        token
    }

    /// Drop a pending reconnect job, if still registered.
    pub(crate) fn cancel_reconnect(&self, token: u64) {
        self.shared.jobs.lock().remove(&token);
    }

    #[cfg(test)]
    pub(crate) fn pending_reconnects(&self) -> usize {
        self.shared.jobs.lock().len()
    }
}

fn sweeper_loop(shared: &SweeperShared, interval: Duration) {
    while !shared.stop.load(Ordering::Acquire) {
        std::thread::sleep(interval);

        // Take jobs out, run unlocked, put unfinished ones back.
        let tokens: Vec<u64> = shared.jobs.lock().keys().copied().collect();
        for token in tokens {
            let job = shared.jobs.lock().remove(&token);
            let Some(mut job) = job else { continue };
            if job() {
                log::debug!("reconnect job {token} finished");
            } else {
                shared.jobs.lock().entry(token).or_insert(job);
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }
}
