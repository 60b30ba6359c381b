// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! TCP transport.
//!
//! One [`TcpManager`] per device owns a pool of I/O workers sized by the
//! device's THREAD option. Each worker runs a mio poll loop: a waker +
//! command channel feeds it registrations and send jobs, readiness
//! events drive the framed reads and the per-connection FIFO write
//! queues. A separate accept thread hands incoming sockets to the least
//! loaded worker; outbound connects are established inline and then
//! registered the same way.
//!
//! ```text
//!   accept thread --+            +-> worker 0 (mio poll, conns)
//!                   +-- assign --+-> worker 1
//!   connect()     --+            +-> worker N-1
//!                                      |
//!                          teardown -> reconnect queue -> runtime sweeper
//! ```

mod codec;
mod manager;
mod worker;

pub use manager::TcpManager;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::Event;
use crate::msg::{Mode, NO_PEER};
use crate::transport::Endpoint;

/// Where a connection lives: which worker, which poll token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route {
    pub worker: usize,
    pub token: usize,
}

/// Client-side link state shared between the plug, the manager and the
/// worker that owns the connection. Survives reconnects.
pub(crate) struct TcpLink {
    pub peer: AtomicI32,
    pub connected: AtomicBool,
    pub closed: AtomicBool,
    pub login_ack: Event,
    pub route: Mutex<Option<Route>>,
}

impl TcpLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: AtomicI32::new(NO_PEER),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            login_ack: Event::new(),
            route: Mutex::new(None),
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn peer_id(&self) -> i32 {
        self.peer.load(Ordering::Acquire)
    }
}

/// Server-side routing entry for a logged-in peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerRoute {
    pub route: Route,
    pub mode: Mode,
    pub addr: SocketAddr,
}

/// A client link that went down and wants to come back.
pub(crate) struct ReconnectRequest {
    pub addr: SocketAddr,
    pub mode: Mode,
    pub endpoint: Arc<Endpoint>,
    pub link: Arc<TcpLink>,
}
