// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Wire format shared by both transports.
//!
//! Every frame starts with a fixed 17-byte header, little-endian:
//!
//! ```text
//! +-----+---------+----------+---------+----------+
//! | cmd | peer:i32| serial:u32| total:u32| frag:u32 |
//! | 1B  |   4B    |    4B    |   4B    |    4B    |
//! +-----+---------+----------+---------+----------+
//! ```
//!
//! LOGIN/LOGOUT frames carry small fixed bodies; DATA frames carry one
//! payload fragment. Payloads larger than a frame's chunk capacity split
//! into sequential fragments sharing one serial; `total` carries the
//! full payload byte length so the merger on the receiving side can size
//! and validate its reassembly buffer. TCP prepends a 4-byte
//! preamble (magic + frame length) for resynchronizable framing; the
//! shared-memory rings are slot-delimited and need no preamble.

use crate::config::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, TCP_PREAMBLE_SIZE, WIRE_MAGIC};

/// Connection handshake, carries a [`LoginBody`] (client to server) or an
/// assigned peer id in the header (server ack).
pub const CMD_LOGIN: u8 = 0x61;
/// Orderly disconnect, header only.
pub const CMD_LOGOUT: u8 = 0x62;
/// One payload fragment.
pub const CMD_DATA: u8 = 0x63;

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: u8,
    pub peer: i32,
    pub serial: u32,
    /// Full payload byte length for DATA; unused otherwise.
    pub total: u32,
    /// Fragment index, counting from 0.
    pub frag_no: u32,
}

impl FrameHeader {
    /// Header-only frame for control commands.
    #[must_use]
    pub fn control(cmd: u8, peer: i32) -> Self {
        Self {
            cmd,
            peer,
            serial: 0,
            total: 0,
            frag_no: 0,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        buf[0] = self.cmd;
        buf[1..5].copy_from_slice(&self.peer.to_le_bytes());
        buf[5..9].copy_from_slice(&self.serial.to_le_bytes());
        buf[9..13].copy_from_slice(&self.total.to_le_bytes());
        buf[13..17].copy_from_slice(&self.frag_no.to_le_bytes());
    }

    /// Decode the header off the front of `buf`.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let cmd = buf[0];
        if !matches!(cmd, CMD_LOGIN | CMD_LOGOUT | CMD_DATA) {
            return None;
        }
        Some(Self {
            cmd,
            peer: i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
            serial: u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]),
            total: u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]),
            frag_no: u32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]]),
        })
    }
}

/// LOGIN body sent by a connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginBody {
    /// Client's negotiated mode (wire encoding).
    pub mode: u16,
    /// Shared-memory client slot; unused over TCP.
    pub slot: u32,
    /// Shared-memory semaphore key; unused over TCP.
    pub sem_key: u32,
}

impl LoginBody {
    pub const SIZE: usize = 10;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.mode.to_le_bytes());
        buf[2..6].copy_from_slice(&self.slot.to_le_bytes());
        buf[6..10].copy_from_slice(&self.sem_key.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            mode: u16::from_le_bytes([buf[0], buf[1]]),
            slot: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            sem_key: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

/// Fragments needed for `len` payload bytes at `chunk` bytes per frame.
/// An empty payload still takes one (empty) fragment.
#[must_use]
pub fn fragment_count(len: usize, chunk: usize) -> u32 {
    if len == 0 {
        1
    } else {
        (len.div_ceil(chunk)) as u32
    }
}

/// Visit each fragment of `payload` as `(total_len, frag_no, bytes)`,
/// where `total_len` is the whole payload's byte length.
pub fn for_each_fragment(payload: &[u8], chunk: usize, mut f: impl FnMut(u32, u32, &[u8])) {
    let total = payload.len() as u32;
    if payload.is_empty() {
        f(0, 0, &[]);
        return;
    }
    for (no, piece) in payload.chunks(chunk).enumerate() {
        f(total, no as u32, piece);
    }
}

/// Encode header + body into one raw frame (no preamble).
#[must_use]
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Vec<u8> {
    debug_assert!(FRAME_HEADER_SIZE + body.len() <= MAX_FRAME_SIZE);
    let mut buf = vec![0u8; FRAME_HEADER_SIZE + body.len()];
    header.encode_into(&mut buf);
    buf[FRAME_HEADER_SIZE..].copy_from_slice(body);
    buf
}

/// Encode header + body with the TCP preamble prepended.
#[must_use]
pub fn encode_tcp_frame(header: &FrameHeader, body: &[u8]) -> Vec<u8> {
    let frame_len = FRAME_HEADER_SIZE + body.len();
    debug_assert!(TCP_PREAMBLE_SIZE + frame_len <= MAX_FRAME_SIZE);
    let mut buf = vec![0u8; TCP_PREAMBLE_SIZE + frame_len];
    buf[0..2].copy_from_slice(&WIRE_MAGIC.to_le_bytes());
    buf[2..4].copy_from_slice(&(frame_len as u16).to_le_bytes());
    header.encode_into(&mut buf[TCP_PREAMBLE_SIZE..]);
    buf[TCP_PREAMBLE_SIZE + FRAME_HEADER_SIZE..].copy_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TCP_CHUNK_SIZE;

    #[test]
    fn header_roundtrip() {
        let h = FrameHeader {
            cmd: CMD_DATA,
            peer: -1,
            serial: 0xdead_beef,
            total: 3,
            frag_no: 2,
        };
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        h.encode_into(&mut buf);
        assert_eq!(FrameHeader::decode(&buf), Some(h));
    }

    #[test]
    fn decode_rejects_short_or_unknown() {
        assert_eq!(FrameHeader::decode(&[0u8; 5]), None);
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = 0x7f;
        assert_eq!(FrameHeader::decode(&buf), None);
    }

    #[test]
    fn login_body_roundtrip() {
        let body = LoginBody {
            mode: 0x08,
            slot: 3,
            sem_key: 0xcafe_f00d,
        };
        assert_eq!(LoginBody::decode(&body.encode()), Some(body));
        assert_eq!(LoginBody::decode(&[0u8; 4]), None);
    }

    #[test]
    fn fragment_counting() {
        assert_eq!(fragment_count(0, 100), 1);
        assert_eq!(fragment_count(1, 100), 1);
        assert_eq!(fragment_count(100, 100), 1);
        assert_eq!(fragment_count(101, 100), 2);
        assert_eq!(fragment_count(20_000, TCP_CHUNK_SIZE), 3);
    }

    #[test]
    fn fragments_cover_payload_in_order() {
        let payload: Vec<u8> = (0..250u8).collect();
        let mut rebuilt = Vec::new();
        let mut expect_no = 0;
        for_each_fragment(&payload, 100, |total, no, bytes| {
            assert_eq!(total, 250);
            assert_eq!(no, expect_no);
            expect_no += 1;
            rebuilt.extend_from_slice(bytes);
        });
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn empty_payload_yields_one_empty_fragment() {
        let mut calls = 0;
        for_each_fragment(&[], 100, |total, no, bytes| {
            calls += 1;
            assert_eq!((total, no), (0, 0));
            assert!(bytes.is_empty());
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn tcp_frame_layout() {
        let h = FrameHeader::control(CMD_LOGOUT, 5);
        let frame = encode_tcp_frame(&h, &[]);
        assert_eq!(frame.len(), TCP_PREAMBLE_SIZE + FRAME_HEADER_SIZE);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), WIRE_MAGIC);
        assert_eq!(
            u16::from_le_bytes([frame[2], frame[3]]) as usize,
            FRAME_HEADER_SIZE
        );
        assert_eq!(
            FrameHeader::decode(&frame[TCP_PREAMBLE_SIZE..]),
            Some(h)
        );
    }
}
