// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Plugs: the messaging endpoints.
//!
//! A plug is created in a mode, then bound (server role) or connected
//! (client role) exactly once. Both transports feed the same inbound
//! queue, so `recv` is transport-agnostic. Send dispatch:
//!
//! - server REQ is coerced to REP; REP routes by the message's stamped
//!   peer id; PUB fans out to every connected SUB peer; SUB cannot send.
//! - client PUB/REP are coerced to SUB/REQ at connect; REQ and SUB both
//!   address the single server the plug is connected to.
//!
//! Blocking sends wait (bounded) until every in-flight transmit settles
//! and report the recorded outcome; NOWAIT sends return after enqueue
//! and report failures through monitor events only.

use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{MAX_PAYLOAD_SIZE, PLUG_QUEUE_DEPTH, SEND_WAIT_TIMEOUT};
use crate::core::ring::RecvError;
use crate::core::RingQueue;
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::msg::{Message, Mode, NO_PEER};
use crate::transport::shm::{ShmClient, ShmServer};
use crate::transport::tcp::{TcpLink, TcpManager};
use crate::transport::{is_local_addr, Endpoint, TransportPreference};

/// Peer control verbs for [`Plug::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Force-close the peer's connection.
    Close,
}

struct ServerRole {
    shm: Option<Arc<ShmServer>>,
    tcp: Option<Arc<TcpManager>>,
    port: u16,
}

struct ClientRole {
    shm: Option<Arc<ShmClient>>,
    tcp: Option<(Arc<TcpManager>, Arc<TcpLink>)>,
    /// Mode after client-side coercion (REQ or SUB).
    mode: Mode,
}

enum Role {
    Unbound,
    Server(ServerRole),
    Client(ClientRole),
}

pub(crate) struct PlugShared {
    id: u32,
    mode: Mode,
    device: Arc<DeviceShared>,
    inbox: Arc<RingQueue<Arc<Message>>>,
    endpoint: Arc<Endpoint>,
    role: Mutex<Role>,
    closed: AtomicBool,
}

/// A messaging endpoint. Dropping does not close it; the owning device
/// closes all its plugs.
pub struct Plug {
    shared: Arc<PlugShared>,
}

impl PlugShared {
    pub(crate) fn new(id: u32, mode: Mode, device: Arc<DeviceShared>) -> Arc<Self> {
        let inbox = Arc::new(RingQueue::with_capacity(PLUG_QUEUE_DEPTH));
        let endpoint = Arc::new(Endpoint {
            plug: id,
            inbox: Arc::clone(&inbox),
            monitor: Arc::clone(&device.monitor),
        });
        Arc::new(Self {
            id,
            mode,
            device,
            inbox,
            endpoint,
            role: Mutex::new(Role::Unbound),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let role = std::mem::replace(&mut *self.role.lock(), Role::Unbound);
        match role {
            Role::Unbound => {}
            Role::Server(server) => {
                if let Some(shm) = server.shm {
                    shm.close();
                }
                // The TCP manager is device-owned; the device closes it.
            }
            Role::Client(client) => {
                if let Some(shm) = client.shm {
                    shm.close();
                }
                if let Some((mgr, link)) = client.tcp {
                    mgr.close_link(&link);
                }
            }
        }
        self.inbox.close();
        log::debug!("plug {} closed", self.id);
    }
}

impl Plug {
    pub(crate) fn from_shared(shared: Arc<PlugShared>) -> Self {
        Self { shared }
    }

    /// The mode this plug was created in.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// New outbound message stamped with this plug's mode and the next
    /// runtime serial.
    #[must_use]
    pub fn message(&self, payload: Vec<u8>) -> Arc<Message> {
        Message::new(self.shared.device.runtime.next_serial(), self.shared.mode, payload)
    }

    /// Bind as a server on `port` (0 picks a free TCP port). Opens both
    /// transports unless the device pins one. Returns the actual port.
    pub fn bind(&self, port: u16) -> Result<u16> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut role = shared.role.lock();
        if !matches!(*role, Role::Unbound) {
            return Err(Error::AlreadyBound);
        }
        let pref = shared.device.preference();

        let mut tcp = None;
        let mut actual = port;
        if pref != TransportPreference::ShmOnly {
            let mgr = shared.device.tcp_manager()?;
            actual = mgr.listen(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
                Arc::clone(&shared.endpoint),
            )?;
            tcp = Some(mgr);
        }
        let shm = if pref == TransportPreference::TcpOnly {
            None
        } else {
            if actual == 0 {
                return Err(Error::InvalidAddress(
                    "shared memory needs a concrete port".into(),
                ));
            }
            Some(Arc::new(ShmServer::bind(
                actual,
                Arc::clone(&shared.endpoint),
                Arc::clone(&shared.device.runtime),
            )?))
        };

        *role = Role::Server(ServerRole {
            shm,
            tcp,
            port: actual,
        });
        log::info!("plug {} bound on port {actual} ({:?})", shared.id, shared.mode);
        Ok(actual)
    }

    /// Connect to a server at `addr` ("ip:port"). Local targets use
    /// shared memory, remote ones TCP, unless the device pins a
    /// transport. PUB connects as SUB, REP as REQ.
    pub fn connect(&self, addr: &str) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let target: SocketAddr = addr
            .parse()
            .map_err(|_| Error::InvalidAddress(addr.into()))?;
        let mut role = shared.role.lock();
        if !matches!(*role, Role::Unbound) {
            return Err(Error::AlreadyBound);
        }
        let mode = shared.mode.client_side();
        let pref = shared.device.preference();
        let use_shm = match pref {
            TransportPreference::TcpOnly => false,
            TransportPreference::ShmOnly => {
                if !is_local_addr(target.ip()) {
                    return Err(Error::InvalidAddress(format!(
                        "{target} is not local but transport is pinned to shared memory"
                    )));
                }
                true
            }
            TransportPreference::Auto => is_local_addr(target.ip()),
        };

        let client = if use_shm {
            let shm = ShmClient::connect(target.port(), mode, Arc::clone(&shared.endpoint))?;
            ClientRole {
                shm: Some(Arc::new(shm)),
                tcp: None,
                mode,
            }
        } else {
            let mgr = shared.device.tcp_manager()?;
            let link = mgr.connect(target, mode, Arc::clone(&shared.endpoint))?;
            ClientRole {
                shm: None,
                tcp: Some((mgr, link)),
                mode,
            }
        };

        *role = Role::Client(client);
        log::info!("plug {} connected to {target} as {mode:?}", shared.id);
        Ok(())
    }

    /// Blocking send: waits (bounded) for every enqueued transmit and
    /// reports the recorded outcome.
    pub fn send(&self, msg: &Arc<Message>) -> Result<()> {
        self.dispatch(msg, false)
    }

    /// Fire-and-forget send: returns once enqueued; failures surface as
    /// monitor events only.
    pub fn send_nowait(&self, msg: &Arc<Message>) -> Result<()> {
        self.dispatch(msg, true)
    }

    fn dispatch(&self, msg: &Arc<Message>, nowait: bool) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if msg.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: msg.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        // Clone the transport handles out of the lock; the actual writes
        // must not hold it.
        enum Target {
            Server(ServerSend),
            Client(ClientSend),
        }
        struct ServerSend {
            shm: Option<Arc<ShmServer>>,
            tcp: Option<Arc<TcpManager>>,
        }
        struct ClientSend {
            shm: Option<Arc<ShmClient>>,
            tcp: Option<(Arc<TcpManager>, Arc<TcpLink>)>,
            mode: Mode,
        }

        let target = {
            let role = shared.role.lock();
            match &*role {
                Role::Unbound => return Err(Error::NoEndpoint),
                Role::Server(s) => Target::Server(ServerSend {
                    shm: s.shm.clone(),
                    tcp: s.tcp.clone(),
                }),
                Role::Client(c) => Target::Client(ClientSend {
                    shm: c.shm.clone(),
                    tcp: c.tcp.clone(),
                    mode: c.mode,
                }),
            }
        };

        match target {
            Target::Server(s) => match shared.mode {
                Mode::Sub => Err(Error::ModeMismatch),
                Mode::Pub => {
                    let mut targeted = 0;
                    if let Some(shm) = &s.shm {
                        targeted += shm.publish(msg, nowait);
                    }
                    if let Some(tcp) = &s.tcp {
                        targeted += tcp.publish(msg);
                    }
                    // Zero subscribers is a trivially successful publish.
                    if nowait || targeted == 0 {
                        Ok(())
                    } else {
                        wait_outcome(msg)
                    }
                }
                // Server-side REQ speaks REP.
                Mode::Req | Mode::Rep => {
                    let peer = msg.peer();
                    if peer == NO_PEER {
                        return Err(Error::UnknownPeer(peer));
                    }
                    if let Some(shm) = &s.shm {
                        if shm.has_peer(peer) {
                            shm.send(peer, msg, nowait)?;
                            return if nowait { Ok(()) } else { wait_outcome(msg) };
                        }
                    }
                    if let Some(tcp) = &s.tcp {
                        if tcp.has_peer(peer) {
                            tcp.send_peer(peer, msg)?;
                            return if nowait { Ok(()) } else { wait_outcome(msg) };
                        }
                    }
                    Err(Error::UnknownPeer(peer))
                }
            },
            Target::Client(c) => match c.mode {
                // Both address the single server this plug is connected
                // to; SUB traffic flows upstream the same way REQ does.
                Mode::Req | Mode::Sub => {
                    if let Some(shm) = &c.shm {
                        shm.send(msg, nowait)?;
                    } else if let Some((mgr, link)) = &c.tcp {
                        msg.set_peer(link.peer_id());
                        mgr.send_link(link, msg)?;
                    } else {
                        return Err(Error::NoEndpoint);
                    }
                    if nowait {
                        Ok(())
                    } else {
                        wait_outcome(msg)
                    }
                }
                // client_side() never yields these.
                Mode::Rep | Mode::Pub => Err(Error::ModeMismatch),
            },
        }
    }

    /// Pop the next inbound message, waiting up to `timeout` (forever if
    /// `None`).
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Arc<Message>> {
        match self.shared.inbox.pop_wait(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvError::Closed) => Err(Error::Closed),
            Err(RecvError::TimedOut) => Err(Error::Timeout),
        }
    }

    /// Apply a control verb to one peer. Requires the device CONTROL
    /// option and a server role.
    pub fn control(&self, peer: i32, ctl: Control) -> Result<()> {
        let shared = &self.shared;
        if !shared.device.control.load(Ordering::Acquire) {
            return Err(Error::OptionDisabled("CONTROL"));
        }
        let (shm, tcp) = {
            let role = shared.role.lock();
            match &*role {
                Role::Server(s) => (s.shm.clone(), s.tcp.clone()),
                _ => return Err(Error::NoEndpoint),
            }
        };
        match ctl {
            Control::Close => {
                if let Some(shm) = &shm {
                    if shm.kick(peer) {
                        return Ok(());
                    }
                }
                if let Some(tcp) = &tcp {
                    return tcp.kick(peer);
                }
                Err(Error::UnknownPeer(peer))
            }
        }
    }

    /// Connection id assigned by the server (client role), or
    /// [`NO_PEER`].
    #[must_use]
    pub fn peer_id(&self) -> i32 {
        let role = self.shared.role.lock();
        match &*role {
            Role::Client(c) => {
                if let Some(shm) = &c.shm {
                    shm.peer_id()
                } else if let Some((_, link)) = &c.tcp {
                    link.peer_id()
                } else {
                    NO_PEER
                }
            }
            _ => NO_PEER,
        }
    }

    /// Bound port (server role), or 0.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        let role = self.shared.role.lock();
        match &*role {
            Role::Server(s) => s.port,
            _ => 0,
        }
    }

    /// Close this plug: release receive waiters, log out of the server
    /// (client role) or drop every peer (server role). Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

fn wait_outcome(msg: &Arc<Message>) -> Result<()> {
    if !msg.wait_idle(SEND_WAIT_TIMEOUT) {
        return Err(Error::Timeout);
    }
    if msg.transmit_succeeded() {
        Ok(())
    } else {
        Err(Error::SendFailed)
    }
}
