// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Shared-memory server endpoint.
//!
//! Owns the segment for its port. Three threads:
//! - reader: drains the server inbound ring on semaphore posts and
//!   dispatches LOGIN/LOGOUT/DATA,
//! - housekeeping: stamps the server heartbeat, expires silent peers,
//!   sweeps the reassembly table,
//! - sender: drains the asynchronous send-job queue (NOWAIT sends and
//!   PUB fan-out).

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{
    HOUSEKEEPING_INTERVAL, MERGER_SWEEP_INTERVAL, MERGER_TASK_TIMEOUT, RING_FULL_RETRY,
    SEND_JOB_DEPTH, SHM_CHUNK_SIZE, SHM_LIVENESS_TIMEOUT, SHM_MAX_CLIENTS,
};
use crate::core::RingQueue;
use crate::error::{Error, Result};
use crate::merger::Merger;
use crate::monitor::{MonitorEvent, MonitorKind};
use crate::msg::{Message, Mode};
use crate::protocol::{
    encode_frame, for_each_fragment, FrameHeader, LoginBody, CMD_DATA, CMD_LOGIN, CMD_LOGOUT,
};
use crate::runtime::Runtime;
use crate::transport::Endpoint;

use super::{
    client_beat, client_ring, client_sem_name, free_ring, now_ms, segment_name, server_beat,
    server_ring, server_sem_name, NamedSemaphore, SendJob, ShmSegment, SEGMENT_SIZE,
};

struct Peer {
    slot: u32,
    mode: Mode,
    sem: Arc<NamedSemaphore>,
    last_rx: AtomicU32,
}

struct Inner {
    segment: ShmSegment,
    sem: NamedSemaphore,
    port: u16,
    endpoint: Arc<Endpoint>,
    runtime: Arc<Runtime>,
    merger: Merger,
    peers: DashMap<i32, Arc<Peer>>,
    send_jobs: Arc<RingQueue<SendJob>>,
    stop: AtomicBool,
}

/// Bound shared-memory endpoint.
pub struct ShmServer {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ShmServer {
    /// Create the segment for `port` and start serving logins.
    pub fn bind(port: u16, endpoint: Arc<Endpoint>, runtime: Arc<Runtime>) -> Result<Self> {
        let segment = ShmSegment::create(&segment_name(port), SEGMENT_SIZE)?;
        let sem = NamedSemaphore::create(&server_sem_name(port))?;

        let slots = free_ring(&segment);
        for slot in 0..SHM_MAX_CLIENTS as u32 {
            slots.push_index(slot);
        }
        server_beat(&segment).store(now_ms(), Ordering::Release);

        let inner = Arc::new(Inner {
            segment,
            sem,
            port,
            endpoint,
            runtime,
            merger: Merger::new(),
            peers: DashMap::new(),
            send_jobs: Arc::new(RingQueue::with_capacity(SEND_JOB_DEPTH)),
            stop: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        for (name, f) in [
            ("embus-shm-srv-rx", reader_loop as fn(&Inner)),
            ("embus-shm-srv-hk", housekeeping_loop as fn(&Inner)),
            ("embus-shm-srv-tx", sender_loop as fn(&Inner)),
        ] {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name(name.into())
                    .spawn(move || f(&inner))
                    .map_err(Error::Io)?,
            );
        }

        log::debug!("shm server bound on port {port}");
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
            closed: AtomicBool::new(false),
        })
    }

    /// Is this peer logged in here?
    #[must_use]
    pub fn has_peer(&self, peer: i32) -> bool {
        self.inner.peers.contains_key(&peer)
    }

    /// Connected peers in SUB mode (PUB fan-out targets).
    #[must_use]
    pub fn sub_peers(&self) -> Vec<i32> {
        self.inner
            .peers
            .iter()
            .filter(|e| e.value().mode == Mode::Sub)
            .map(|e| *e.key())
            .collect()
    }

    /// Send one message to one peer. Blocking sends write inline on the
    /// caller thread; NOWAIT sends go through the sender thread.
    pub fn send(&self, peer: i32, msg: &Arc<Message>, nowait: bool) -> Result<()> {
        if !self.inner.peers.contains_key(&peer) {
            return Err(Error::UnknownPeer(peer));
        }
        msg.begin_transmit();
        if nowait {
            let job = SendJob {
                peer,
                msg: Arc::clone(msg),
            };
            if self.inner.send_jobs.push(job).is_err() {
                msg.end_transmit(false);
                return Err(Error::QueueFull);
            }
            return Ok(());
        }
        if self.inner.write_to_peer(peer, msg) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Queue `msg` for every SUB peer. Returns how many were targeted.
    pub fn publish(&self, msg: &Arc<Message>, nowait: bool) -> usize {
        let targets = self.sub_peers();
        let mut queued = 0;
        for peer in targets {
            msg.begin_transmit();
            if nowait {
                let job = SendJob {
                    peer,
                    msg: Arc::clone(msg),
                };
                if self.inner.send_jobs.push(job).is_err() {
                    msg.end_transmit(false);
                    log::warn!("shm send queue full, dropping publish to peer {peer}");
                    continue;
                }
            } else if !self.inner.write_to_peer(peer, msg) {
                continue;
            }
            queued += 1;
        }
        queued
    }

    /// Force-close one peer (CONTROL option path).
    pub fn kick(&self, peer: i32) -> bool {
        self.inner.drop_peer(peer, true)
    }

    /// Stop threads, log out every peer, remove the segment. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        inner.stop.store(true, Ordering::Release);
        inner.sem.post();
        inner.send_jobs.close();

        let ids: Vec<i32> = inner.peers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, peer)) = inner.peers.remove(&id) {
                let bye = FrameHeader::control(CMD_LOGOUT, id);
                client_ring(&inner.segment, peer.slot).push_frame(&encode_frame(&bye, &[]));
                peer.sem.post();
                inner.runtime.peer_ids().release(id);
            }
        }

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        let _ = ShmSegment::unlink(inner.segment.name());
        log::debug!("shm server on port {} closed", inner.port);
    }
}

impl Drop for ShmServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn handle_frame(&self, frame: &[u8]) {
        let Some(header) = FrameHeader::decode(frame) else {
            log::warn!("shm server: undecodable frame, dropping");
            return;
        };
        let body = &frame[crate::config::FRAME_HEADER_SIZE..];
        match header.cmd {
            CMD_LOGIN => self.handle_login(body),
            CMD_LOGOUT => {
                self.drop_peer(header.peer, true);
            }
            CMD_DATA => self.handle_data(&header, body),
            _ => unreachable!("decode() filters unknown commands"),
        }
    }

    fn handle_login(&self, body: &[u8]) {
        let Some(login) = LoginBody::decode(body) else {
            log::warn!("shm login with malformed body");
            return;
        };
        let Some(mode) = Mode::from_wire(login.mode) else {
            log::warn!("shm login with invalid mode {:#x}", login.mode);
            return;
        };
        if login.slot as usize >= SHM_MAX_CLIENTS {
            log::warn!("shm login claims out-of-range slot {}", login.slot);
            return;
        }
        let sem = match NamedSemaphore::open(&client_sem_name(login.sem_key)) {
            Ok(sem) => Arc::new(sem),
            Err(e) => {
                log::warn!("shm login: cannot open client semaphore: {e}");
                return;
            }
        };
        let id = match self.runtime.peer_ids().acquire() {
            Ok(id) => id,
            Err(_) => {
                log::warn!("shm login rejected: connection ids exhausted");
                return;
            }
        };

        let peer = Arc::new(Peer {
            slot: login.slot,
            mode,
            sem,
            last_rx: AtomicU32::new(now_ms()),
        });
        let ack = FrameHeader::control(CMD_LOGIN, id);
        client_ring(&self.segment, peer.slot).push_frame(&encode_frame(&ack, &[]));
        peer.sem.post();
        self.peers.insert(id, peer);

        log::debug!("shm peer {id} logged in (slot {}, {mode:?})", login.slot);
        self.endpoint.monitor.emit(MonitorEvent::link(
            self.endpoint.plug,
            MonitorKind::Accept,
            id,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.port,
        ));
    }

    fn handle_data(&self, header: &FrameHeader, body: &[u8]) {
        let Some(peer) = self.peers.get(&header.peer).map(|e| Arc::clone(e.value())) else {
            log::debug!("shm data from unknown peer {}", header.peer);
            return;
        };
        peer.last_rx.store(now_ms(), Ordering::Release);

        let payload = if header.total as usize == body.len() {
            Some(body.to_vec())
        } else {
            self.merger.add(
                header.peer,
                header.serial,
                header.total,
                header.frag_no,
                SHM_CHUNK_SIZE,
                body,
            )
        };
        if let Some(payload) = payload {
            self.endpoint.deliver(Message::from_wire(
                header.serial,
                peer.mode,
                header.peer,
                payload,
            ));
        }
    }

    /// Write all fragments of `msg` into `peer`'s ring, retrying while
    /// the ring is full and the peer stays logged in. Settles the
    /// message's transmit reference and emits the send event.
    fn write_to_peer(&self, id: i32, msg: &Arc<Message>) -> bool {
        let Some(peer) = self.peers.get(&id).map(|e| Arc::clone(e.value())) else {
            self.settle(id, msg, false);
            return false;
        };

        let ring = client_ring(&self.segment, peer.slot);
        let mut frame_buf = Vec::new();
        let mut failed = false;
        for_each_fragment(msg.payload(), SHM_CHUNK_SIZE, |total, no, chunk| {
            if failed {
                return;
            }
            let header = FrameHeader {
                cmd: CMD_DATA,
                peer: id,
                serial: msg.serial(),
                total,
                frag_no: no,
            };
            frame_buf = encode_frame(&header, chunk);
            loop {
                if ring.push_frame(&frame_buf) {
                    peer.sem.post();
                    break;
                }
                if self.stop.load(Ordering::Acquire) || !self.peers.contains_key(&id) {
                    failed = true;
                    return;
                }
                std::thread::sleep(RING_FULL_RETRY);
            }
        });

        self.settle(id, msg, !failed);
        !failed
    }

    fn settle(&self, id: i32, msg: &Arc<Message>, ok: bool) {
        msg.end_transmit(ok);
        let kind = if ok {
            MonitorKind::SndSucc
        } else {
            MonitorKind::SndFail
        };
        self.endpoint.monitor.emit(
            MonitorEvent::link(
                self.endpoint.plug,
                kind,
                id,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.port,
            )
            .with_addition(msg.addition()),
        );
    }

    /// Tear down one peer: reclaim its slot, free its id. Returns
    /// whether the peer existed.
    fn drop_peer(&self, id: i32, emit: bool) -> bool {
        let Some((_, peer)) = self.peers.remove(&id) else {
            return false;
        };
        // Quiesce the area before the slot is handed to the next login.
        client_ring(&self.segment, peer.slot).reset();
        client_beat(&self.segment, peer.slot).store(0, Ordering::Release);
        free_ring(&self.segment).push_index(peer.slot);
        self.runtime.peer_ids().release(id);
        self.merger.forget_peer(id);

        log::debug!("shm peer {id} dropped (slot {})", peer.slot);
        if emit {
            self.endpoint.monitor.emit(MonitorEvent::link(
                self.endpoint.plug,
                MonitorKind::Closed,
                id,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.port,
            ));
        }
        true
    }
}

fn reader_loop(inner: &Inner) {
    let ring = server_ring(&inner.segment);
    let mut frame = Vec::new();
    while !inner.stop.load(Ordering::Acquire) {
        match inner.sem.wait(HOUSEKEEPING_INTERVAL) {
            Ok(_) => {}
            Err(e) => {
                log::error!("shm server semaphore wait failed: {e}");
                break;
            }
        }
        while ring.pop_frame(&mut frame) {
            inner.handle_frame(&frame);
        }
    }
}

fn housekeeping_loop(inner: &Inner) {
    let timeout_ms = SHM_LIVENESS_TIMEOUT.as_millis() as u32;
    let mut last_sweep = Instant::now();
    while !inner.stop.load(Ordering::Acquire) {
        std::thread::sleep(HOUSEKEEPING_INTERVAL);
        let now = now_ms();
        server_beat(&inner.segment).store(now, Ordering::Release);

        // Collect, then mutate: drop_peer takes shard locks itself.
        let mut dead = Vec::new();
        for entry in inner.peers.iter() {
            let peer = entry.value();
            let beat = client_beat(&inner.segment, peer.slot).load(Ordering::Acquire);
            let rx = peer.last_rx.load(Ordering::Acquire);
            let idle_beat = now.wrapping_sub(beat);
            let idle_rx = now.wrapping_sub(rx);
            if idle_beat.min(idle_rx) > timeout_ms {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            log::info!("shm peer {id} liveness expired");
            inner.drop_peer(id, true);
        }

        if last_sweep.elapsed() >= MERGER_SWEEP_INTERVAL {
            inner.merger.sweep(MERGER_TASK_TIMEOUT);
            last_sweep = Instant::now();
        }
    }
}

fn sender_loop(inner: &Inner) {
    while !inner.stop.load(Ordering::Acquire) {
        match inner.send_jobs.pop_wait(Some(HOUSEKEEPING_INTERVAL)) {
            Ok(job) => {
                inner.write_to_peer(job.peer, &job.msg);
            }
            Err(crate::core::ring::RecvError::Closed) => break,
            Err(crate::core::ring::RecvError::TimedOut) => {}
        }
    }
}
