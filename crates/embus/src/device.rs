// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Devices.
//!
//! A device is the application-facing handle: it owns the option flags,
//! the monitor queue and the (lazily created) TCP manager its plugs
//! share. Plugs do the actual messaging; see [`crate::plug`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::ring::RecvError;
use crate::error::{Error, Result};
use crate::monitor::{MonitorEvent, MonitorSink};
use crate::msg::Mode;
use crate::plug::{Plug, PlugShared};
use crate::runtime::Runtime;
use crate::transport::tcp::TcpManager;
use crate::transport::TransportPreference;

/// Device-level knobs, set before the relevant machinery spins up.
#[derive(Debug, Clone, Copy)]
pub enum DeviceOption {
    /// Report connection lifecycle and send outcomes via `monitor`.
    Monitor(bool),
    /// Allow `Plug::control` to force-close peers.
    Control(bool),
    /// TCP I/O worker count. Takes effect only before the first
    /// bind/connect that needs TCP.
    Threads(usize),
    /// Pin the transport choice.
    Transport(TransportPreference),
}

pub(crate) struct DeviceShared {
    pub runtime: Arc<Runtime>,
    pub monitor: Arc<MonitorSink>,
    pub control: AtomicBool,
    threads: AtomicUsize,
    preference: Mutex<TransportPreference>,
    tcp: Mutex<Option<Arc<TcpManager>>>,
}

impl DeviceShared {
    /// The device's TCP manager, created on first use.
    pub(crate) fn tcp_manager(&self) -> Result<Arc<TcpManager>> {
        let mut guard = self.tcp.lock();
        if let Some(mgr) = guard.as_ref() {
            return Ok(Arc::clone(mgr));
        }
        let threads = self.threads.load(Ordering::Acquire);
        let mgr = Arc::new(TcpManager::new(Arc::clone(&self.runtime), threads)?);
        *guard = Some(Arc::clone(&mgr));
        Ok(mgr)
    }

    pub(crate) fn preference(&self) -> TransportPreference {
        *self.preference.lock()
    }
}

/// Application handle: options, monitoring, plug factory.
pub struct Device {
    shared: Arc<DeviceShared>,
    plugs: Mutex<Vec<Arc<PlugShared>>>,
    next_plug: AtomicU32,
    closed: AtomicBool,
}

impl Device {
    /// Device with a private runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_runtime(Runtime::new())
    }

    /// Device sharing `runtime` (and its connection-id pool) with others.
    #[must_use]
    pub fn with_runtime(runtime: Arc<Runtime>) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                runtime,
                monitor: Arc::new(MonitorSink::new()),
                control: AtomicBool::new(false),
                threads: AtomicUsize::new(1),
                preference: Mutex::new(TransportPreference::Auto),
                tcp: Mutex::new(None),
            }),
            plugs: Mutex::new(Vec::new()),
            next_plug: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_option(&self, option: DeviceOption) {
        match option {
            DeviceOption::Monitor(on) => self.shared.monitor.set_enabled(on),
            DeviceOption::Control(on) => self.shared.control.store(on, Ordering::Release),
            DeviceOption::Threads(n) => {
                if self.shared.tcp.lock().is_some() {
                    log::warn!("THREAD option ignored: TCP workers already running");
                } else {
                    self.shared.threads.store(n.max(1), Ordering::Release);
                }
            }
            DeviceOption::Transport(pref) => *self.shared.preference.lock() = pref,
        }
    }

    /// Create a plug in `mode`. The plug is unbound until `bind` or
    /// `connect`.
    pub fn plug(&self, mode: Mode) -> Result<Plug> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let id = self.next_plug.fetch_add(1, Ordering::Relaxed);
        let shared = PlugShared::new(id, mode, Arc::clone(&self.shared));
        self.plugs.lock().push(Arc::clone(&shared));
        Ok(Plug::from_shared(shared))
    }

    /// Pop the next monitor event, waiting up to `timeout` (forever if
    /// `None`). Events only accumulate while the MONITOR option is set.
    pub fn monitor(&self, timeout: Option<Duration>) -> Result<MonitorEvent> {
        match self.shared.monitor.queue().pop_wait(timeout) {
            Ok(event) => Ok(event),
            Err(RecvError::Closed) => Err(Error::Closed),
            Err(RecvError::TimedOut) => Err(Error::Timeout),
        }
    }

    /// Close every plug and stop the TCP machinery. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for plug in self.plugs.lock().drain(..) {
            plug.close();
        }
        self.shared.monitor.queue().close();
        if let Some(mgr) = self.shared.tcp.lock().take() {
            mgr.close();
        }
        log::debug!("device closed");
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_disabled_by_default_times_out() {
        let dev = Device::new();
        assert!(matches!(
            dev.monitor(Some(Duration::from_millis(10))),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn plug_after_close_fails() {
        let dev = Device::new();
        dev.close();
        assert!(matches!(dev.plug(Mode::Req), Err(Error::Closed)));
        // Second close is a no-op.
        dev.close();
    }

    #[test]
    fn monitor_close_releases_waiters() {
        let dev = Device::new();
        dev.close();
        assert!(matches!(
            dev.monitor(Some(Duration::from_millis(100))),
            Err(Error::Closed)
        ));
    }
}
