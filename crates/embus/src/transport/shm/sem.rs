// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Named POSIX semaphores: the cross-process counterpart of
//! [`crate::core::Event`].
//!
//! The server owns one well-known semaphore per port; every client
//! creates its own under a random key and reports that key at login.
//! Writers post after pushing a frame; the reader thread waits with a
//! short timeout so it also notices shutdown and liveness expiry.

use std::ffi::CString;
use std::io;
use std::time::Duration;

use crate::error::{Error, Result};

/// A named semaphore handle.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// SAFETY: sem_t operations are async-signal-safe and thread-safe; the
// handle itself is only read after construction.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a fresh semaphore (unlinking any stale one first). The
    /// creator unlinks the name again on drop.
    pub fn create(name: &str) -> Result<Self> {
        let c_name = to_c_name(name)?;
        // SAFETY: valid C string; a failed unlink of a missing name is
        // the expected case and ignored. sem_open with O_CREAT|O_EXCL
        // either yields a valid handle or SEM_FAILED.
        let sem = unsafe {
            libc::sem_unlink(c_name.as_ptr());
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(sem_err("sem_open(create)", name));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open a semaphore someone else created.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = to_c_name(name)?;
        // SAFETY: valid C string; result checked against SEM_FAILED.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(sem_err("sem_open", name));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Release one waiter.
    pub fn post(&self) {
        // SAFETY: self.sem is a valid handle from sem_open. Overflow of
        // the count is the only failure and is harmless here.
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    /// Wait up to `timeout` for a post. `Ok(true)` consumed a post,
    /// `Ok(false)` timed out.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: valid out-pointer; CLOCK_REALTIME always exists.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        let nanos = ts.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        ts.tv_sec += timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = nanos % 1_000_000_000;

        loop {
            // SAFETY: valid handle and a fully-initialized timespec.
            let ret = unsafe { libc::sem_timedwait(self.sem, &ts) };
            if ret == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Error::Shm(format!("sem_timedwait {}: {err}", self.name))),
            }
        }
    }

    /// Consume a post without blocking.
    pub fn try_wait(&self) -> bool {
        // SAFETY: valid handle; EAGAIN is the empty case.
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: valid handle, closed exactly once; unlink only touches
        // the namespace and only the creator performs it.
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                if let Ok(c_name) = to_c_name(&self.name) {
                    libc::sem_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

fn to_c_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > 250 {
        return Err(Error::Shm(format!("invalid semaphore name {name}")));
    }
    CString::new(name).map_err(|_| Error::Shm(format!("invalid semaphore name {name}")))
}

fn sem_err(what: &str, name: &str) -> Error {
    Error::Shm(format!("{what} {name}: {}", io::Error::last_os_error()))
}
