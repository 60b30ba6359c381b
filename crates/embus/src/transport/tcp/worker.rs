// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! TCP I/O worker.
//!
//! One thread per worker, one mio poll per thread. Commands arrive over
//! an mpsc channel paired with a waker; readiness events drive framed
//! reads and the per-connection write queues. A connection's queued
//! frames drain strictly FIFO: a frame that hits `WouldBlock` stays at
//! the head with its partial offset until the socket turns writable
//! again, so per-peer ordering survives backpressure.

use crossbeam::channel::{Receiver, TryRecvError};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{FRAME_HEADER_SIZE, TCP_CHUNK_SIZE, TCP_POLL_TIMEOUT};
use crate::merger::Merger;
use crate::monitor::{MonitorEvent, MonitorKind};
use crate::msg::{Message, Mode, NO_PEER};
use crate::protocol::{
    encode_tcp_frame, FrameHeader, LoginBody, CMD_DATA, CMD_LOGIN, CMD_LOGOUT,
};
use crate::runtime::Runtime;
use crate::transport::Endpoint;

use super::codec::Codec;
use super::{PeerRoute, ReconnectRequest, Route, TcpLink};

/// Token reserved for the waker; connection tokens start above it.
pub(crate) const WAKER_TOKEN: Token = Token(0);

const MAX_EVENTS: usize = 128;

/// Commands accepted by a worker.
pub(crate) enum Cmd {
    Register(Box<Registration>),
    Send {
        token: usize,
        frames: Vec<Vec<u8>>,
        /// Attached to the last frame; settled when it finishes writing.
        msg: Option<Arc<Message>>,
    },
    /// Force-close the connection serving this peer id.
    Kick { peer: i32 },
    /// Close one connection without scheduling a reconnect.
    CloseToken { token: usize },
    Shutdown,
}

/// A socket handed to a worker, already connected and nonblocking.
pub(crate) struct Registration {
    pub stream: TcpStream,
    pub token: usize,
    pub addr: SocketAddr,
    pub endpoint: Arc<Endpoint>,
    /// Present on outbound (client-side) connections.
    pub client: Option<ClientSide>,
}

pub(crate) struct ClientSide {
    pub mode: Mode,
    pub link: Arc<TcpLink>,
}

struct Pending {
    buf: Vec<u8>,
    msg: Option<Arc<Message>>,
}

struct CloseWhy {
    reconnect: bool,
    reason: String,
}

struct Conn {
    stream: TcpStream,
    token: Token,
    addr: SocketAddr,
    endpoint: Arc<Endpoint>,
    client: Option<ClientSide>,
    peer: i32,
    /// Server side: the logged-in peer's mode.
    peer_mode: Mode,
    logged_in: bool,
    codec: Codec,
    sendq: VecDeque<Pending>,
    write_off: usize,
    want_write: bool,
    closing: Option<CloseWhy>,
}

impl Conn {
    fn close_with(&mut self, reconnect: bool, reason: impl Into<String>) {
        if self.closing.is_none() {
            self.closing = Some(CloseWhy {
                reconnect,
                reason: reason.into(),
            });
        }
    }
}

pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    cmd_rx: Receiver<Cmd>,
    conns: HashMap<Token, Conn>,
    load: Arc<AtomicUsize>,
    runtime: Arc<Runtime>,
    peers: Arc<DashMap<i32, PeerRoute>>,
    merger: Arc<Merger>,
    reconnects: Arc<SegQueue<ReconnectRequest>>,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        cmd_rx: Receiver<Cmd>,
        load: Arc<AtomicUsize>,
        runtime: Arc<Runtime>,
        peers: Arc<DashMap<i32, PeerRoute>>,
        merger: Arc<Merger>,
        reconnects: Arc<SegQueue<ReconnectRequest>>,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok((
            Self {
                index,
                poll,
                cmd_rx,
                conns: HashMap::new(),
                load,
                runtime,
                peers,
                merger,
                reconnects,
            },
            waker,
        ))
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        'outer: loop {
            if let Err(e) = self.poll.poll(&mut events, Some(TCP_POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("tcp worker {} poll failed: {e}", self.index);
                break;
            }

            loop {
                match self.cmd_rx.try_recv() {
                    Ok(Cmd::Shutdown) | Err(TryRecvError::Disconnected) => break 'outer,
                    Ok(cmd) => self.handle_cmd(cmd),
                    Err(TryRecvError::Empty) => break,
                }
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if event.is_readable() {
                    self.on_readable(token);
                }
                if event.is_writable() {
                    self.on_writable(token);
                }
            }
        }

        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.conns.remove(&token) {
                self.teardown(conn, false, "worker shutdown");
            }
        }
        log::debug!("tcp worker {} stopped", self.index);
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Register(reg) => self.register(*reg),
            Cmd::Send { token, frames, msg } => {
                let Some(mut conn) = self.conns.remove(&Token(token)) else {
                    if let Some(msg) = msg {
                        msg.end_transmit(false);
                    }
                    return;
                };
                self.queue_frames(&mut conn, frames, msg);
                self.settle_or_keep(conn);
            }
            Cmd::Kick { peer } => {
                let found = self
                    .conns
                    .iter()
                    .find(|(_, c)| c.peer == peer && c.logged_in)
                    .map(|(t, _)| *t);
                if let Some(token) = found {
                    if let Some(conn) = self.conns.remove(&token) {
                        self.teardown(conn, false, "kicked");
                    }
                }
            }
            Cmd::CloseToken { token } => {
                if let Some(conn) = self.conns.remove(&Token(token)) {
                    self.teardown(conn, false, "closed");
                }
            }
            Cmd::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn register(&mut self, reg: Registration) {
        let token = Token(reg.token);
        let mut conn = Conn {
            stream: reg.stream,
            token,
            addr: reg.addr,
            endpoint: reg.endpoint,
            client: reg.client,
            peer: NO_PEER,
            peer_mode: Mode::Req,
            logged_in: false,
            codec: Codec::new(),
            sendq: VecDeque::new(),
            write_off: 0,
            want_write: false,
            closing: None,
        };
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, token, Interest::READABLE)
        {
            log::warn!("tcp worker {}: register failed: {e}", self.index);
            conn.close_with(conn.client.is_some(), e.to_string());
        }
        self.load.fetch_add(1, Ordering::AcqRel);

        // Outbound connections introduce themselves immediately.
        if conn.closing.is_none() {
            if let Some(client) = &conn.client {
                *client.link.route.lock() = Some(Route {
                    worker: self.index,
                    token: token.0,
                });
                let body = LoginBody {
                    mode: client.mode.to_wire(),
                    slot: 0,
                    sem_key: 0,
                };
                let login = encode_tcp_frame(
                    &FrameHeader::control(CMD_LOGIN, NO_PEER),
                    &body.encode(),
                );
                self.queue_frames(&mut conn, vec![login], None);
            }
        }
        self.settle_or_keep(conn);
    }

    /// Reinsert a live connection or finish closing it.
    fn settle_or_keep(&mut self, conn: Conn) {
        if let Some(why) = &conn.closing {
            let reconnect = why.reconnect;
            let reason = why.reason.clone();
            self.teardown(conn, reconnect, &reason);
        } else {
            self.conns.insert(conn.token, conn);
        }
    }

    fn on_readable(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        let mut frames = Vec::new();
        if let Err(e) = conn.codec.read_frames(&mut conn.stream, &mut frames) {
            conn.close_with(conn.client.is_some(), e.to_string());
        }
        for frame in &frames {
            self.handle_frame(&mut conn, frame);
        }
        self.settle_or_keep(conn);
    }

    fn on_writable(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.flush(&mut conn);
        self.settle_or_keep(conn);
    }

    fn handle_frame(&mut self, conn: &mut Conn, frame: &[u8]) {
        if conn.closing.is_some() {
            return;
        }
        let Some(header) = FrameHeader::decode(frame) else {
            log::warn!("tcp worker {}: undecodable frame from {}", self.index, conn.addr);
            conn.close_with(conn.client.is_some(), "protocol error");
            return;
        };
        let body = &frame[FRAME_HEADER_SIZE..];
        match header.cmd {
            CMD_LOGIN => self.handle_login(conn, &header, body),
            CMD_LOGOUT => {
                conn.close_with(conn.client.is_some(), "peer logout");
            }
            CMD_DATA => self.handle_data(conn, &header, body),
            _ => unreachable!("decode() filters unknown commands"),
        }
    }

    fn handle_login(&mut self, conn: &mut Conn, header: &FrameHeader, body: &[u8]) {
        if let Some(client) = &conn.client {
            // Server's ack carries our assigned id.
            conn.peer = header.peer;
            conn.logged_in = true;
            client.link.peer.store(header.peer, Ordering::Release);
            client.link.connected.store(true, Ordering::Release);
            client.link.login_ack.post();
            log::debug!("tcp connected to {} as peer {}", conn.addr, header.peer);
            conn.endpoint.monitor.emit(MonitorEvent::link(
                conn.endpoint.plug,
                MonitorKind::Connect,
                header.peer,
                conn.addr.ip(),
                conn.addr.port(),
            ));
            return;
        }

        let Some(login) = LoginBody::decode(body) else {
            conn.close_with(false, "malformed login");
            return;
        };
        let Some(mode) = Mode::from_wire(login.mode) else {
            conn.close_with(false, "invalid login mode");
            return;
        };
        let id = match self.runtime.peer_ids().acquire() {
            Ok(id) => id,
            Err(_) => {
                log::warn!("tcp login from {} rejected: ids exhausted", conn.addr);
                conn.close_with(false, "ids exhausted");
                return;
            }
        };
        conn.peer = id;
        conn.peer_mode = mode;
        conn.logged_in = true;
        self.peers.insert(
            id,
            PeerRoute {
                route: Route {
                    worker: self.index,
                    token: conn.token.0,
                },
                mode,
                addr: conn.addr,
            },
        );
        let ack = encode_tcp_frame(&FrameHeader::control(CMD_LOGIN, id), &[]);
        self.queue_frames(conn, vec![ack], None);
        log::debug!("tcp peer {id} logged in from {} ({mode:?})", conn.addr);
        conn.endpoint.monitor.emit(MonitorEvent::link(
            conn.endpoint.plug,
            MonitorKind::Accept,
            id,
            conn.addr.ip(),
            conn.addr.port(),
        ));
    }

    fn handle_data(&mut self, conn: &mut Conn, header: &FrameHeader, body: &[u8]) {
        if !conn.logged_in {
            log::debug!("tcp data before login from {}, dropping", conn.addr);
            return;
        }
        // A frame carrying the whole declared payload completes on its
        // own; anything else goes through the merger, which validates
        // the declared geometry.
        let payload = if header.total as usize == body.len() {
            Some(body.to_vec())
        } else {
            self.merger.add(
                header.peer,
                header.serial,
                header.total,
                header.frag_no,
                TCP_CHUNK_SIZE,
                body,
            )
        };
        if let Some(payload) = payload {
            let mode = match &conn.client {
                Some(client) => client.mode.inbound(),
                None => conn.peer_mode,
            };
            conn.endpoint
                .deliver(Message::from_wire(header.serial, mode, header.peer, payload));
        }
    }

    fn queue_frames(&mut self, conn: &mut Conn, frames: Vec<Vec<u8>>, mut msg: Option<Arc<Message>>) {
        let count = frames.len();
        for (i, buf) in frames.into_iter().enumerate() {
            let attached = if i + 1 == count { msg.take() } else { None };
            conn.sendq.push_back(Pending { buf, msg: attached });
        }
        self.flush(conn);
    }

    fn flush(&mut self, conn: &mut Conn) {
        while let Some(front) = conn.sendq.front() {
            match conn.stream.write(&front.buf[conn.write_off..]) {
                Ok(n) => {
                    conn.write_off += n;
                    if conn.write_off == front.buf.len() {
                        conn.write_off = 0;
                        if let Some(done) = conn.sendq.pop_front() {
                            self.settle_send(conn, done, true);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    conn.close_with(conn.client.is_some(), e.to_string());
                    return;
                }
            }
        }
        self.update_interest(conn);
    }

    fn update_interest(&mut self, conn: &mut Conn) {
        if conn.closing.is_some() {
            return;
        }
        let want_write = !conn.sendq.is_empty();
        if want_write == conn.want_write {
            return;
        }
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, conn.token, interest)
        {
            conn.close_with(conn.client.is_some(), e.to_string());
            return;
        }
        conn.want_write = want_write;
    }

    fn settle_send(&self, conn: &Conn, pending: Pending, ok: bool) {
        let Some(msg) = pending.msg else { return };
        msg.end_transmit(ok);
        let kind = if ok {
            MonitorKind::SndSucc
        } else {
            MonitorKind::SndFail
        };
        conn.endpoint.monitor.emit(
            MonitorEvent::link(
                conn.endpoint.plug,
                kind,
                conn.peer,
                conn.addr.ip(),
                conn.addr.port(),
            )
            .with_addition(msg.addition()),
        );
    }

    fn teardown(&mut self, mut conn: Conn, allow_reconnect: bool, reason: &str) {
        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.load.fetch_sub(1, Ordering::AcqRel);

        let pending: Vec<Pending> = conn.sendq.drain(..).collect();
        for p in pending {
            self.settle_send(&conn, p, false);
        }

        if conn.logged_in {
            self.merger.forget_peer(conn.peer);
            conn.endpoint.monitor.emit(MonitorEvent::link(
                conn.endpoint.plug,
                MonitorKind::Closed,
                conn.peer,
                conn.addr.ip(),
                conn.addr.port(),
            ));
        }

        match &conn.client {
            None => {
                if conn.logged_in {
                    self.peers.remove(&conn.peer);
                    self.runtime.peer_ids().release(conn.peer);
                }
            }
            Some(client) => {
                client.link.connected.store(false, Ordering::Release);
                *client.link.route.lock() = None;
                if allow_reconnect && !client.link.closed.load(Ordering::Acquire) {
                    log::info!("tcp link to {} lost ({reason}), scheduling reconnect", conn.addr);
                    self.reconnects.push(ReconnectRequest {
                        addr: conn.addr,
                        mode: client.mode,
                        endpoint: Arc::clone(&conn.endpoint),
                        link: Arc::clone(&client.link),
                    });
                }
            }
        }
        log::debug!(
            "tcp worker {}: connection to {} closed ({reason})",
            self.index,
            conn.addr
        );
    }
}
