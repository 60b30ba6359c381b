// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Messages and socket modes.
//!
//! A message is an immutable payload plus a small mutable header
//! (mode, peer id, user tag), shared as `Arc<Message>` between the caller
//! and the transports. Transmit accounting rides on the same object:
//! each transport enqueue takes an in-flight reference that is dropped
//! when the frame hits the wire or fails, so a blocking send can wait for
//! quiescence without any external bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Socket mode. `Req`/`Sub` connect out; `Rep`/`Pub` answer binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Req,
    Rep,
    Pub,
    Sub,
}

impl Mode {
    /// Wire encoding used in LOGIN bodies.
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Req => 0x01,
            Self::Rep => 0x02,
            Self::Pub => 0x04,
            Self::Sub => 0x08,
        }
    }

    /// Decode a LOGIN mode word.
    #[must_use]
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0x01 => Some(Self::Req),
            0x02 => Some(Self::Rep),
            0x04 => Some(Self::Pub),
            0x08 => Some(Self::Sub),
            _ => None,
        }
    }

    /// Mode actually negotiated when this mode connects out.
    /// PUB and REP flip to their client-side counterparts.
    #[must_use]
    pub fn client_side(self) -> Self {
        match self {
            Self::Pub => Self::Sub,
            Self::Rep => Self::Req,
            m => m,
        }
    }

    /// What a peer in this mode sends back down the link.
    #[must_use]
    pub fn inbound(self) -> Self {
        match self {
            Self::Req => Self::Rep,
            Self::Rep => Self::Req,
            Self::Pub | Self::Sub => Self::Pub,
        }
    }
}

/// Sentinel for a message not yet addressed to any peer.
pub const NO_PEER: i32 = -1;

/// A refcounted message.
pub struct Message {
    serial: u32,
    mode: AtomicU16,
    peer: AtomicI32,
    addition: AtomicU64,
    in_flight: AtomicU32,
    result: AtomicBool,
    payload: Box<[u8]>,
}

impl Message {
    pub(crate) fn new(serial: u32, mode: Mode, payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            serial,
            mode: AtomicU16::new(mode.to_wire()),
            peer: AtomicI32::new(NO_PEER),
            addition: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            result: AtomicBool::new(false),
            payload: payload.into_boxed_slice(),
        })
    }

    /// Build an inbound message from wire fields.
    pub(crate) fn from_wire(serial: u32, mode: Mode, peer: i32, payload: Vec<u8>) -> Arc<Self> {
        let msg = Self::new(serial, mode, payload);
        msg.peer.store(peer, Ordering::Release);
        msg
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        // Stores only ever write valid encodings.
        Mode::from_wire(self.mode.load(Ordering::Acquire)).unwrap_or(Mode::Req)
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode.to_wire(), Ordering::Release);
    }

    /// Peer id this message is addressed to (or arrived from).
    #[must_use]
    pub fn peer(&self) -> i32 {
        self.peer.load(Ordering::Acquire)
    }

    pub fn set_peer(&self, peer: i32) {
        self.peer.store(peer, Ordering::Release);
    }

    /// Opaque user tag echoed through monitor events.
    #[must_use]
    pub fn addition(&self) -> u64 {
        self.addition.load(Ordering::Acquire)
    }

    pub fn set_addition(&self, tag: u64) {
        self.addition.store(tag, Ordering::Release);
    }

    /// Take one in-flight transmit reference.
    pub(crate) fn begin_transmit(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one in-flight reference, recording the transmit outcome.
    pub(crate) fn end_transmit(&self, ok: bool) {
        if ok {
            self.result.store(true, Ordering::Release);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn transmits_pending(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// True once any transport delivered a frame set for this message.
    pub(crate) fn transmit_succeeded(&self) -> bool {
        self.result.load(Ordering::Acquire)
    }

    /// Wait for all in-flight transmits to finish. Bounded: returns
    /// `false` if `timeout` expires first.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.transmits_pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("serial", &self.serial)
            .field("mode", &self.mode())
            .field("peer", &self.peer())
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mode_wire_roundtrip() {
        for mode in [Mode::Req, Mode::Rep, Mode::Pub, Mode::Sub] {
            assert_eq!(Mode::from_wire(mode.to_wire()), Some(mode));
        }
        assert_eq!(Mode::from_wire(0x03), None);
        assert_eq!(Mode::from_wire(0), None);
    }

    #[test]
    fn client_side_coercion() {
        assert_eq!(Mode::Pub.client_side(), Mode::Sub);
        assert_eq!(Mode::Rep.client_side(), Mode::Req);
        assert_eq!(Mode::Req.client_side(), Mode::Req);
        assert_eq!(Mode::Sub.client_side(), Mode::Sub);
    }

    #[test]
    fn header_fields_mutable_in_place() {
        let msg = Message::new(7, Mode::Req, b"hello".to_vec());
        assert_eq!(msg.peer(), NO_PEER);
        msg.set_peer(12);
        msg.set_mode(Mode::Rep);
        msg.set_addition(0xdead);
        assert_eq!(msg.peer(), 12);
        assert_eq!(msg.mode(), Mode::Rep);
        assert_eq!(msg.addition(), 0xdead);
        assert_eq!(msg.serial(), 7);
        assert_eq!(msg.payload(), b"hello");
    }

    #[test]
    fn transmit_accounting() {
        let msg = Message::new(1, Mode::Pub, vec![0u8; 16]);
        msg.begin_transmit();
        msg.begin_transmit();
        assert_eq!(msg.transmits_pending(), 2);
        msg.end_transmit(false);
        assert!(!msg.transmit_succeeded());
        msg.end_transmit(true);
        assert!(msg.transmit_succeeded());
        assert!(msg.wait_idle(Duration::from_millis(1)));
    }

    #[test]
    fn wait_idle_blocks_until_transmits_finish() {
        let msg = Message::new(1, Mode::Req, vec![]);
        msg.begin_transmit();
        let m2 = Arc::clone(&msg);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            m2.end_transmit(true);
        });
        assert!(msg.wait_idle(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_idle_is_bounded() {
        let msg = Message::new(1, Mode::Req, vec![]);
        msg.begin_transmit();
        assert!(!msg.wait_idle(Duration::from_millis(20)));
        msg.end_transmit(false);
    }

    #[test]
    fn concurrent_drops_free_once() {
        // Arc guarantees a single free; this exercises heavy clone/drop
        // churn from many threads to back the refcount-safety property.
        let msg = Message::new(9, Mode::Pub, vec![0u8; 1024]);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&msg);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    let c = Arc::clone(&m);
                    drop(c);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(Arc::strong_count(&msg), 1);
    }
}
