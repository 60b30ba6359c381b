// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Shared-memory client endpoint.
//!
//! Attaches to the server's segment, claims a client slot off the free
//! ring and logs in through the server's inbound ring. Three threads:
//! reader (drains this client's area ring), housekeeping (heartbeat,
//! server liveness, reconnect) and sender (NOWAIT jobs). A dropped link
//! reattaches to the shared-memory object from scratch on every
//! reconnect attempt, one attempt in flight at a time, so a restarted
//! server's fresh segment is picked up; the slot claimed by a login the
//! server never acked goes back on the free ring before the next try.

use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{
    HOUSEKEEPING_INTERVAL, LOGIN_TIMEOUT, MERGER_SWEEP_INTERVAL, MERGER_TASK_TIMEOUT,
    RING_FULL_RETRY, SEND_JOB_DEPTH, SHM_CHUNK_SIZE, SHM_LIVENESS_TIMEOUT,
};
use crate::core::{Event, RingQueue, WaitOutcome};
use crate::error::{Error, Result};
use crate::merger::Merger;
use crate::monitor::{MonitorEvent, MonitorKind};
use crate::msg::{Message, Mode, NO_PEER};
use crate::protocol::{
    encode_frame, for_each_fragment, FrameHeader, LoginBody, CMD_DATA, CMD_LOGIN, CMD_LOGOUT,
};
use crate::transport::Endpoint;

use super::{
    client_beat, client_ring, client_sem_name, free_ring, now_ms, segment_name, server_beat,
    server_ring, server_sem_name, NamedSemaphore, SendJob, ShmSegment, SEGMENT_SIZE,
};

/// The server-side handles this client is currently attached to. Swapped
/// wholesale on reconnect; rings and heartbeat views must not outlive the
/// read guard they were taken under.
struct Attachment {
    segment: ShmSegment,
    server_sem: NamedSemaphore,
}

impl Attachment {
    fn open(port: u16) -> Result<Self> {
        Ok(Self {
            segment: ShmSegment::open(&segment_name(port), SEGMENT_SIZE)?,
            server_sem: NamedSemaphore::open(&server_sem_name(port))?,
        })
    }
}

struct Inner {
    attach: RwLock<Attachment>,
    my_sem: NamedSemaphore,
    sem_key: u32,
    port: u16,
    mode: Mode,
    slot: AtomicU32,
    /// Login sent but not yet acked; the claimed slot is ours to return.
    unacked: AtomicBool,
    peer_id: AtomicI32,
    connected: AtomicBool,
    login_ack: Event,
    endpoint: Arc<Endpoint>,
    merger: Merger,
    send_jobs: Arc<RingQueue<SendJob>>,
    last_rx: AtomicU32,
    stop: AtomicBool,
}

/// Connected (client-side) shared-memory endpoint.
pub struct ShmClient {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ShmClient {
    /// Attach to the segment for `port` and log in as `mode`.
    pub fn connect(port: u16, mode: Mode, endpoint: Arc<Endpoint>) -> Result<Self> {
        let attach = Attachment::open(port)?;
        let sem_key = random_key();
        let my_sem = NamedSemaphore::create(&client_sem_name(sem_key))?;

        let inner = Arc::new(Inner {
            attach: RwLock::new(attach),
            my_sem,
            sem_key,
            port,
            mode,
            slot: AtomicU32::new(0),
            unacked: AtomicBool::new(false),
            peer_id: AtomicI32::new(NO_PEER),
            connected: AtomicBool::new(false),
            login_ack: Event::new(),
            endpoint,
            merger: Merger::new(),
            send_jobs: Arc::new(RingQueue::with_capacity(SEND_JOB_DEPTH)),
            last_rx: AtomicU32::new(now_ms()),
            stop: AtomicBool::new(false),
        });

        inner.begin_login()?;

        let mut threads = Vec::new();
        for (name, f) in [
            ("embus-shm-cli-rx", reader_loop as fn(&Inner)),
            ("embus-shm-cli-hk", housekeeping_loop as fn(&Inner)),
            ("embus-shm-cli-tx", sender_loop as fn(&Inner)),
        ] {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name(name.into())
                    .spawn(move || f(&inner))
                    .map_err(Error::Io)?,
            );
        }

        let client = Self {
            inner,
            threads: Mutex::new(threads),
            closed: AtomicBool::new(false),
        };
        if client.inner.login_ack.wait(Some(LOGIN_TIMEOUT)) == WaitOutcome::TimedOut
            || !client.is_connected()
        {
            client.close();
            return Err(Error::Timeout);
        }
        Ok(client)
    }

    /// Server-assigned connection id, or [`NO_PEER`] before login.
    #[must_use]
    pub fn peer_id(&self) -> i32 {
        self.inner.peer_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Send towards the server.
    pub fn send(&self, msg: &Arc<Message>, nowait: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        msg.set_peer(self.peer_id());
        msg.begin_transmit();
        if nowait {
            let job = SendJob {
                peer: self.peer_id(),
                msg: Arc::clone(msg),
            };
            if self.inner.send_jobs.push(job).is_err() {
                msg.end_transmit(false);
                return Err(Error::QueueFull);
            }
            return Ok(());
        }
        if self.inner.write_to_server(msg) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Log out and stop. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        if inner.connected.swap(false, Ordering::AcqRel) {
            let attach = inner.attach.read();
            let bye = FrameHeader::control(CMD_LOGOUT, inner.peer_id.load(Ordering::Acquire));
            server_ring(&attach.segment).push_frame(&encode_frame(&bye, &[]));
            attach.server_sem.post();
        }
        inner.reclaim_unacked_slot();
        inner.stop.store(true, Ordering::Release);
        inner.my_sem.post();
        inner.send_jobs.close();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        log::debug!("shm client on port {} closed", inner.port);
    }
}

impl Drop for ShmClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Claim a slot and push a LOGIN frame. The ack lands on the reader
    /// thread, which flips `connected` and posts `login_ack`.
    fn begin_login(&self) -> Result<()> {
        let attach = self.attach.read();
        let Some(slot) = free_ring(&attach.segment).pop_index() else {
            return Err(Error::SlotsExhausted);
        };
        self.slot.store(slot, Ordering::Release);
        client_beat(&attach.segment, slot).store(now_ms(), Ordering::Release);

        let body = LoginBody {
            mode: self.mode.to_wire(),
            slot,
            sem_key: self.sem_key,
        };
        let login = FrameHeader::control(CMD_LOGIN, NO_PEER);
        if !server_ring(&attach.segment).push_frame(&encode_frame(&login, &body.encode())) {
            free_ring(&attach.segment).push_index(slot);
            return Err(Error::QueueFull);
        }
        self.unacked.store(true, Ordering::Release);
        attach.server_sem.post();
        Ok(())
    }

    /// Drop the current mapping, attach to whatever shared-memory object
    /// the server now owns, and log in again. A restarted server creates
    /// a fresh segment, so the old mapping has no reader behind it.
    fn reattach_and_login(&self) -> Result<()> {
        self.reclaim_unacked_slot();
        let fresh = Attachment::open(self.port)?;
        *self.attach.write() = fresh;
        self.begin_login()
    }

    /// Return the slot of a login the server never acked. Acked slots
    /// are the server's to reclaim through logout or liveness expiry.
    fn reclaim_unacked_slot(&self) {
        if !self.unacked.swap(false, Ordering::AcqRel) {
            return;
        }
        let attach = self.attach.read();
        free_ring(&attach.segment).push_index(self.slot.load(Ordering::Acquire));
    }

    fn handle_frame(&self, frame: &[u8]) {
        let Some(header) = FrameHeader::decode(frame) else {
            log::warn!("shm client: undecodable frame, dropping");
            return;
        };
        let body = &frame[crate::config::FRAME_HEADER_SIZE..];
        match header.cmd {
            CMD_LOGIN => {
                self.unacked.store(false, Ordering::Release);
                self.peer_id.store(header.peer, Ordering::Release);
                self.last_rx.store(now_ms(), Ordering::Release);
                self.connected.store(true, Ordering::Release);
                self.login_ack.post();
                log::debug!("shm client logged in as peer {}", header.peer);
                self.endpoint.monitor.emit(MonitorEvent::link(
                    self.endpoint.plug,
                    MonitorKind::Connect,
                    header.peer,
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    self.port,
                ));
            }
            CMD_LOGOUT => self.mark_disconnected("server logout"),
            CMD_DATA => {
                self.last_rx.store(now_ms(), Ordering::Release);
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
                        self.mode.inbound(),
                        header.peer,
                        payload,
                    ));
                }
            }
            _ => unreachable!("decode() filters unknown commands"),
        }
    }

    fn mark_disconnected(&self, why: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let id = self.peer_id.swap(NO_PEER, Ordering::AcqRel);
        log::info!("shm client lost server ({why})");
        self.endpoint.monitor.emit(MonitorEvent::link(
            self.endpoint.plug,
            MonitorKind::Closed,
            id,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.port,
        ));
    }

    fn write_to_server(&self, msg: &Arc<Message>) -> bool {
        let attach = self.attach.read();
        let ring = server_ring(&attach.segment);
        let id = self.peer_id.load(Ordering::Acquire);
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
            let frame = encode_frame(&header, chunk);
            loop {
                if ring.push_frame(&frame) {
                    attach.server_sem.post();
                    break;
                }
                if self.stop.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire) {
                    failed = true;
                    return;
                }
                std::thread::sleep(RING_FULL_RETRY);
            }
        });

        msg.end_transmit(!failed);
        let kind = if failed {
            MonitorKind::SndFail
        } else {
            MonitorKind::SndSucc
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
        !failed
    }
}

fn random_key() -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id().rotate_left(16)
}

fn reader_loop(inner: &Inner) {
    let mut frame = Vec::new();
    while !inner.stop.load(Ordering::Acquire) {
        match inner.my_sem.wait(HOUSEKEEPING_INTERVAL) {
            Ok(_) => {}
            Err(e) => {
                log::error!("shm client semaphore wait failed: {e}");
                break;
            }
        }
        let attach = inner.attach.read();
        let ring = client_ring(&attach.segment, inner.slot.load(Ordering::Acquire));
        while ring.pop_frame(&mut frame) {
            inner.handle_frame(&frame);
        }
    }
}

fn housekeeping_loop(inner: &Inner) {
    let timeout_ms = SHM_LIVENESS_TIMEOUT.as_millis() as u32;
    let mut last_sweep = Instant::now();
    let mut retry_backoff = Duration::ZERO;
    while !inner.stop.load(Ordering::Acquire) {
        std::thread::sleep(HOUSEKEEPING_INTERVAL);
        let now = now_ms();

        if inner.connected.load(Ordering::Acquire) {
            retry_backoff = Duration::ZERO;
            let attach = inner.attach.read();
            client_beat(&attach.segment, inner.slot.load(Ordering::Acquire))
                .store(now, Ordering::Release);

            let srv = server_beat(&attach.segment).load(Ordering::Acquire);
            drop(attach);
            let idle_srv = now.wrapping_sub(srv);
            let idle_rx = now.wrapping_sub(inner.last_rx.load(Ordering::Acquire));
            if idle_srv.min(idle_rx) > timeout_ms {
                inner.mark_disconnected("liveness expired");
            }
        } else {
            // One reconnect attempt per liveness interval; the login ack
            // (or its absence) decides the next step.
            if retry_backoff.is_zero() {
                retry_backoff = SHM_LIVENESS_TIMEOUT;
                match inner.reattach_and_login() {
                    Ok(()) => log::debug!("shm client reconnect attempt sent"),
                    Err(e) => log::debug!("shm client reconnect failed: {e}"),
                }
            } else {
                retry_backoff = retry_backoff.saturating_sub(HOUSEKEEPING_INTERVAL);
            }
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
                inner.write_to_server(&job.msg);
            }
            Err(crate::core::ring::RecvError::Closed) => break,
            Err(crate::core::ring::RecvError::TimedOut) => {}
        }
    }
}
