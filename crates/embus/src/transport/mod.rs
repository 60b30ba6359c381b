// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Transport implementations and selection.
//!
//! Two transports carry the same frame protocol: POSIX shared memory for
//! peers on this machine and TCP for everything else. `connect` picks
//! automatically by asking whether the target IP belongs to a local
//! interface, unless the device pins a preference.

pub mod shm;
pub mod tcp;

use std::net::IpAddr;
use std::sync::Arc;

use crate::core::RingQueue;
use crate::monitor::MonitorSink;
use crate::msg::Message;

/// Which transport a device is willing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    /// Shared memory for local peers, TCP otherwise.
    #[default]
    Auto,
    /// TCP even for local peers.
    TcpOnly,
    /// Shared memory only; connecting to a remote address fails.
    ShmOnly,
}

/// Per-plug context handed to transports: where inbound messages land
/// and where lifecycle events are reported.
pub(crate) struct Endpoint {
    pub plug: u32,
    pub inbox: Arc<RingQueue<Arc<Message>>>,
    pub monitor: Arc<MonitorSink>,
}

impl Endpoint {
    /// Hand an inbound message to the plug. Best effort: a full inbox
    /// drops the message, matching the at-most-once contract.
    pub(crate) fn deliver(&self, msg: Arc<Message>) {
        if self.inbox.push(msg).is_err() {
            log::warn!("plug {} inbox full, inbound message dropped", self.plug);
        }
    }
}

/// Does `ip` resolve to this machine?
#[must_use]
pub(crate) fn is_local_addr(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas.iter().any(|(_, addr)| *addr == ip),
        Err(e) => {
            log::warn!("interface enumeration failed ({e}); treating {ip} as remote");
            false
        }
    }
}
