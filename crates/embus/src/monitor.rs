// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Monitor events.
//!
//! When a device enables monitoring, its transports report connection
//! lifecycle and send outcomes into a bounded queue the application
//! drains with `Device::monitor`. Emission is fire-and-forget: a full
//! queue drops the event with a log line rather than stalling a
//! transport thread.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::MONITOR_QUEUE_DEPTH;
use crate::core::RingQueue;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    /// A server-side endpoint completed a peer's login.
    Accept,
    /// A client-side endpoint completed its login.
    Connect,
    /// A peer link went down (logout, liveness expiry, socket error).
    Closed,
    /// A message finished transmitting to a peer.
    SndSucc,
    /// A message failed to reach a peer.
    SndFail,
}

/// One monitor record.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    /// Plug that owns the endpoint.
    pub plug: u32,
    pub kind: MonitorKind,
    /// Peer connection id, or -1 when none was assigned yet.
    pub peer: i32,
    /// Remote address, unspecified for shared-memory peers.
    pub addr: IpAddr,
    pub port: u16,
    /// User tag from the message (send events only).
    pub addition: u64,
}

impl MonitorEvent {
    pub(crate) fn link(plug: u32, kind: MonitorKind, peer: i32, addr: IpAddr, port: u16) -> Self {
        Self {
            plug,
            kind,
            peer,
            addr,
            port,
            addition: 0,
        }
    }

    pub(crate) fn local(plug: u32, kind: MonitorKind, peer: i32) -> Self {
        Self::link(
            plug,
            kind,
            peer,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        )
    }

    pub(crate) fn with_addition(mut self, addition: u64) -> Self {
        self.addition = addition;
        self
    }
}

/// Shared emission handle cloned into every transport.
pub(crate) struct MonitorSink {
    queue: Arc<RingQueue<MonitorEvent>>,
    enabled: AtomicBool,
}

impl MonitorSink {
    pub(crate) fn new() -> Self {
        Self {
            queue: Arc::new(RingQueue::with_capacity(MONITOR_QUEUE_DEPTH)),
            enabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn queue(&self) -> &Arc<RingQueue<MonitorEvent>> {
        &self.queue
    }

    pub(crate) fn emit(&self, event: MonitorEvent) {
        if !self.is_enabled() {
            return;
        }
        if self.queue.push(event).is_err() {
            log::warn!("monitor queue full, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_swallows_events() {
        let sink = MonitorSink::new();
        sink.emit(MonitorEvent::local(1, MonitorKind::Accept, 0));
        assert!(sink.queue().is_empty());
    }

    #[test]
    fn enabled_sink_queues_events() {
        let sink = MonitorSink::new();
        sink.set_enabled(true);
        sink.emit(MonitorEvent::local(1, MonitorKind::Connect, 7).with_addition(5));
        let ev = sink.queue().try_pop().unwrap();
        assert_eq!(ev.kind, MonitorKind::Connect);
        assert_eq!(ev.peer, 7);
        assert_eq!(ev.addition, 5);
    }
}
