// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! TCP connection manager.
//!
//! Owns the worker pool, the accept thread (once a plug binds) and a
//! housekeeping thread that turns dropped client links into runtime
//! reconnect jobs and sweeps the reassembly table. Send paths only
//! build frames and hand them to the owning worker; all socket I/O
//! happens on worker threads.

use crossbeam::channel::{unbounded, Sender};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{
    CONNECT_TIMEOUT, HOUSEKEEPING_INTERVAL, KEEPALIVE_INTERVAL, KEEPALIVE_TIME, LOGIN_TIMEOUT,
    MERGER_SWEEP_INTERVAL, MERGER_TASK_TIMEOUT, TCP_CHUNK_SIZE,
};
use crate::error::{Error, Result};
use crate::merger::Merger;
use crate::msg::{Message, Mode};
use crate::protocol::{encode_tcp_frame, for_each_fragment, FrameHeader, CMD_DATA, CMD_LOGOUT};
use crate::runtime::Runtime;
use crate::transport::Endpoint;

use super::worker::{ClientSide, Cmd, Registration, Worker};
use super::{PeerRoute, ReconnectRequest, Route, TcpLink};

struct WorkerHandle {
    tx: Sender<Cmd>,
    waker: Arc<mio::Waker>,
    load: Arc<AtomicUsize>,
    join: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    runtime: Arc<Runtime>,
    workers: Vec<WorkerHandle>,
    peers: Arc<DashMap<i32, PeerRoute>>,
    merger: Arc<Merger>,
    reconnects: Arc<SegQueue<ReconnectRequest>>,
    // Token 0 is every worker's waker.
    next_token: AtomicUsize,
    local_port: AtomicU16,
    stop: AtomicBool,
    closed: AtomicBool,
    accept: Mutex<Option<JoinHandle<()>>>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

/// One per device; lazily created when a plug first needs TCP.
pub struct TcpManager {
    inner: Arc<ManagerInner>,
}

impl TcpManager {
    pub(crate) fn new(runtime: Arc<Runtime>, threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let peers = Arc::new(DashMap::new());
        let merger = Arc::new(Merger::new());
        let reconnects = Arc::new(SegQueue::new());

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let (tx, rx) = unbounded();
            let load = Arc::new(AtomicUsize::new(0));
            let (worker, waker) = Worker::new(
                index,
                rx,
                Arc::clone(&load),
                Arc::clone(&runtime),
                Arc::clone(&peers),
                Arc::clone(&merger),
                Arc::clone(&reconnects),
            )?;
            let join = std::thread::Builder::new()
                .name(format!("embus-tcp-{index}"))
                .spawn(move || worker.run())?;
            workers.push(WorkerHandle {
                tx,
                waker,
                load,
                join: Mutex::new(Some(join)),
            });
        }

        let inner = Arc::new(ManagerInner {
            runtime,
            workers,
            peers,
            merger,
            reconnects,
            next_token: AtomicUsize::new(1),
            local_port: AtomicU16::new(0),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            accept: Mutex::new(None),
            housekeeping: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = std::thread::Builder::new()
            .name("embus-tcp-mgr".into())
            .spawn(move || housekeeping_loop(&weak))?;
        *inner.housekeeping.lock() = Some(handle);

        Ok(Self { inner })
    }

    /// Start accepting on `ip:port`; returns the bound port (useful with
    /// port 0).
    pub(crate) fn listen(&self, ip: IpAddr, port: u16, endpoint: Arc<Endpoint>) -> Result<u16> {
        let mut guard = self.inner.accept.lock();
        if guard.is_some() {
            return Err(Error::AlreadyBound);
        }
        let listener = TcpListener::bind((ip, port))?;
        listener.set_nonblocking(true)?;
        let actual = listener.local_addr()?.port();
        self.inner.local_port.store(actual, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("embus-tcp-accept".into())
            .spawn(move || accept_loop(&inner, &listener, &endpoint))?;
        *guard = Some(handle);
        log::info!("tcp listening on {ip}:{actual}");
        Ok(actual)
    }

    /// Connect out and complete the login handshake.
    pub(crate) fn connect(
        &self,
        addr: SocketAddr,
        mode: Mode,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<TcpLink>> {
        let link = TcpLink::new();
        self.inner
            .establish(addr, mode, Arc::clone(&endpoint), Arc::clone(&link))?;

        let deadline = Instant::now() + LOGIN_TIMEOUT;
        loop {
            if link.is_connected() {
                return Ok(link);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            link.login_ack.wait(Some(deadline - now));
        }
        link.closed.store(true, Ordering::Release);
        if let Some(route) = *link.route.lock() {
            self.inner.close_route(route);
        }
        Err(Error::Timeout)
    }

    /// Send over a client link; `msg` settles when the last frame is
    /// written (or the link dies).
    pub(crate) fn send_link(&self, link: &TcpLink, msg: &Arc<Message>) -> Result<()> {
        if !link.is_connected() {
            return Err(Error::NotConnected);
        }
        let Some(route) = *link.route.lock() else {
            return Err(Error::NotConnected);
        };
        let frames = data_frames(link.peer_id(), msg);
        self.inner.send_route(route, frames, Some(Arc::clone(msg)))
    }

    /// Send to one logged-in peer on the server side.
    pub(crate) fn send_peer(&self, peer: i32, msg: &Arc<Message>) -> Result<()> {
        let Some(entry) = self.inner.peers.get(&peer) else {
            return Err(Error::UnknownPeer(peer));
        };
        let route = entry.route;
        drop(entry);
        let frames = data_frames(peer, msg);
        self.inner.send_route(route, frames, Some(Arc::clone(msg)))
    }

    /// Fan a message out to every logged-in SUB peer. Returns how many
    /// transmits were enqueued.
    pub(crate) fn publish(&self, msg: &Arc<Message>) -> usize {
        let targets: Vec<(i32, Route)> = self
            .inner
            .peers
            .iter()
            .filter(|e| e.value().mode == Mode::Sub)
            .map(|e| (*e.key(), e.value().route))
            .collect();
        let mut sent = 0;
        for (peer, route) in targets {
            let frames = data_frames(peer, msg);
            if self
                .inner
                .send_route(route, frames, Some(Arc::clone(msg)))
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    pub(crate) fn has_peer(&self, peer: i32) -> bool {
        self.inner.peers.contains_key(&peer)
    }

    pub(crate) fn sub_peers(&self) -> Vec<i32> {
        self.inner
            .peers
            .iter()
            .filter(|e| e.value().mode == Mode::Sub)
            .map(|e| *e.key())
            .collect()
    }

    /// Force-close a logged-in peer's connection.
    pub(crate) fn kick(&self, peer: i32) -> Result<()> {
        let Some(entry) = self.inner.peers.get(&peer) else {
            return Err(Error::UnknownPeer(peer));
        };
        let worker = entry.route.worker;
        drop(entry);
        let handle = &self.inner.workers[worker];
        handle
            .tx
            .send(Cmd::Kick { peer })
            .map_err(|_| Error::Closed)?;
        let _ = handle.waker.wake();
        Ok(())
    }

    /// Close one client link and stop its reconnects. Sends an orderly
    /// LOGOUT first when the link is still up.
    pub(crate) fn close_link(&self, link: &TcpLink) {
        link.closed.store(true, Ordering::Release);
        if let Some(route) = *link.route.lock() {
            if link.is_connected() {
                let bye = FrameHeader::control(CMD_LOGOUT, link.peer_id());
                let _ = self
                    .inner
                    .send_route(route, vec![encode_tcp_frame(&bye, &[])], None);
            }
            self.inner.close_route(route);
        }
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.inner.local_port.load(Ordering::Acquire)
    }

    /// Stop everything. Idempotent; joins the accept, housekeeping and
    /// worker threads.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.accept.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.inner.housekeeping.lock().take() {
            let _ = handle.join();
        }
        for worker in &self.inner.workers {
            let _ = worker.tx.send(Cmd::Shutdown);
            let _ = worker.waker.wake();
        }
        for worker in &self.inner.workers {
            if let Some(handle) = worker.join.lock().take() {
                let _ = handle.join();
            }
        }
        log::debug!("tcp manager closed");
    }
}

impl Drop for TcpManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl ManagerInner {
    /// Open a socket to `addr` and hand it to the least loaded worker
    /// with a pending login. The handshake completes asynchronously.
    fn establish(
        &self,
        addr: SocketAddr,
        mode: Mode,
        endpoint: Arc<Endpoint>,
        link: Arc<TcpLink>,
    ) -> Result<()> {
        let stream = StdTcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        configure_stream(&stream)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let reg = Registration {
            stream: mio::net::TcpStream::from_std(stream),
            token,
            addr,
            endpoint,
            client: Some(ClientSide { mode, link }),
        };
        self.assign(reg)
    }

    fn assign(&self, reg: Registration) -> Result<()> {
        let index = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.load.load(Ordering::Acquire))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let handle = &self.workers[index];
        handle
            .tx
            .send(Cmd::Register(Box::new(reg)))
            .map_err(|_| Error::Closed)?;
        let _ = handle.waker.wake();
        Ok(())
    }

    fn send_route(&self, route: Route, frames: Vec<Vec<u8>>, msg: Option<Arc<Message>>) -> Result<()> {
        if let Some(msg) = &msg {
            msg.begin_transmit();
        }
        let handle = &self.workers[route.worker];
        let sent = handle.tx.send(Cmd::Send {
            token: route.token,
            frames,
            msg: msg.clone(),
        });
        if sent.is_err() {
            if let Some(msg) = msg {
                msg.end_transmit(false);
            }
            return Err(Error::Closed);
        }
        let _ = handle.waker.wake();
        Ok(())
    }

    fn close_route(&self, route: Route) {
        let handle = &self.workers[route.worker];
        let _ = handle.tx.send(Cmd::CloseToken { token: route.token });
        let _ = handle.waker.wake();
    }
}

/// DATA frames for one message; `peer` is the link's connection id in
/// both directions.
fn data_frames(peer: i32, msg: &Arc<Message>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for_each_fragment(msg.payload(), TCP_CHUNK_SIZE, |total, frag_no, bytes| {
        let header = FrameHeader {
            cmd: CMD_DATA,
            peer,
            serial: msg.serial(),
            total,
            frag_no,
        };
        frames.push(encode_tcp_frame(&header, bytes));
    });
    frames
}

fn configure_stream(stream: &StdTcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

fn accept_loop(inner: &Arc<ManagerInner>, listener: &TcpListener, endpoint: &Arc<Endpoint>) {
    while !inner.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = configure_stream(&stream) {
                    log::warn!("tcp accept from {addr}: setup failed: {e}");
                    continue;
                }
                let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
                let reg = Registration {
                    stream: mio::net::TcpStream::from_std(stream),
                    token,
                    addr,
                    endpoint: Arc::clone(endpoint),
                    client: None,
                };
                if inner.assign(reg).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("tcp accept failed: {e}");
                std::thread::sleep(HOUSEKEEPING_INTERVAL);
            }
        }
    }
    log::debug!("tcp accept thread stopped");
}

/// Turns dropped client links into runtime reconnect jobs and sweeps
/// stale reassembly units.
fn housekeeping_loop(weak: &Weak<ManagerInner>) {
    let mut last_sweep = Instant::now();
    loop {
        std::thread::sleep(HOUSEKEEPING_INTERVAL);
        let Some(inner) = weak.upgrade() else { return };
        if inner.stop.load(Ordering::Acquire) {
            return;
        }

        while let Some(req) = inner.reconnects.pop() {
            let ReconnectRequest {
                addr,
                mode,
                endpoint,
                link,
            } = req;
            let mgr = Arc::downgrade(&inner);
            inner.runtime.register_reconnect(Box::new(move || {
                if link.closed.load(Ordering::Acquire) || link.is_connected() {
                    return true;
                }
                let Some(inner) = mgr.upgrade() else { return true };
                if inner.stop.load(Ordering::Acquire) {
                    return true;
                }
                match inner.establish(addr, mode, Arc::clone(&endpoint), Arc::clone(&link)) {
                    // Login completes on the worker; a failed handshake
                    // tears down and requeues.
                    Ok(()) => true,
                    Err(e) => {
                        log::debug!("reconnect to {addr} failed: {e}");
                        false
                    }
                }
            }));
        }

        if last_sweep.elapsed() >= MERGER_SWEEP_INTERVAL {
            last_sweep = Instant::now();
            let evicted = inner.merger.sweep(MERGER_TASK_TIMEOUT);
            if evicted > 0 {
                log::debug!("tcp merger sweep evicted {evicted} stale units");
            }
        }
    }
}
