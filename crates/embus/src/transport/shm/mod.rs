// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Shared-memory transport.
//!
//! One segment per bound port, laid out as a server area followed by a
//! fixed array of client areas:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | server heartbeat (u32)                                       |
//! | free-slot ring   (SHM_MAX_CLIENTS entries of u32)            |
//! | server inbound ring (SHM_RING_DEPTH slots, all clients push) |
//! +--------------------------------------------------------------+
//! | client area 0: heartbeat (u32) + inbound ring                |
//! | ...                                                          |
//! | client area N-1                                              |
//! +--------------------------------------------------------------+
//! ```
//!
//! A client pops a slot index off the free ring, claims that area, and
//! logs in through the server ring. The server answers into the client's
//! area ring. Each side posts the other's named semaphore after a write
//! and stamps its own heartbeat word so the other side can detect a
//! silent death.

mod client;
mod ring;
mod segment;
mod sem;
mod server;

pub use client::ShmClient;
pub use ring::ShmRing;
pub use segment::ShmSegment;
pub use sem::NamedSemaphore;
pub use server::ShmServer;

use crate::config::{MAX_FRAME_SIZE, SHM_MAX_CLIENTS, SHM_RING_DEPTH};

/// Bytes per ring slot: a u32 length prefix plus the frame itself.
pub const SLOT_SIZE: usize = 4 + MAX_FRAME_SIZE;

/// Heartbeat word at the head of the server and each client area; padded
/// to a cache line so the ring headers behind it stay 64-byte aligned.
const HEARTBEAT_SIZE: usize = 64;

/// Free-slot ring entries are bare u32 slot indexes.
const FREE_SLOT_ENTRY: usize = 4;

const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

pub(crate) const FREE_RING_OFFSET: usize = HEARTBEAT_SIZE;
pub(crate) const SERVER_RING_OFFSET: usize =
    FREE_RING_OFFSET + align64(ring::ring_bytes(SHM_MAX_CLIENTS, FREE_SLOT_ENTRY));
pub(crate) const CLIENT_AREA_OFFSET: usize =
    SERVER_RING_OFFSET + align64(ring::ring_bytes(SHM_RING_DEPTH, SLOT_SIZE));
pub(crate) const CLIENT_AREA_SIZE: usize =
    HEARTBEAT_SIZE + align64(ring::ring_bytes(SHM_RING_DEPTH, SLOT_SIZE));

/// Total segment size for one bound port.
pub const SEGMENT_SIZE: usize = CLIENT_AREA_OFFSET + SHM_MAX_CLIENTS * CLIENT_AREA_SIZE;

pub(crate) const fn client_area_offset(slot: usize) -> usize {
    CLIENT_AREA_OFFSET + slot * CLIENT_AREA_SIZE
}

/// Segment name for a bound port.
#[must_use]
pub fn segment_name(port: u16) -> String {
    format!("/embus_{port}")
}

/// Server semaphore name for a bound port.
#[must_use]
pub fn server_sem_name(port: u16) -> String {
    format!("/embus_{port}_srv")
}

/// Client semaphore name from its random key.
#[must_use]
pub fn client_sem_name(key: u32) -> String {
    format!("/embus_c{key:08x}")
}

/// Send work queued for the transport sender thread.
pub(crate) struct SendJob {
    pub peer: i32,
    pub msg: std::sync::Arc<crate::msg::Message>,
}

// View helpers over a mapped segment. Creating a ring view is free; the
// cursors live in the segment itself.

pub(crate) fn server_ring(seg: &ShmSegment) -> ShmRing {
    // SAFETY: the segment is SEGMENT_SIZE bytes and the offset constants
    // place this ring wholly inside it.
    unsafe { ShmRing::attach(seg.as_ptr().add(SERVER_RING_OFFSET), SHM_RING_DEPTH, SLOT_SIZE) }
}

pub(crate) fn free_ring(seg: &ShmSegment) -> ShmRing {
    // SAFETY: as above.
    unsafe {
        ShmRing::attach(
            seg.as_ptr().add(FREE_RING_OFFSET),
            SHM_MAX_CLIENTS,
            FREE_SLOT_ENTRY,
        )
    }
}

pub(crate) fn client_ring(seg: &ShmSegment, slot: u32) -> ShmRing {
    debug_assert!((slot as usize) < SHM_MAX_CLIENTS);
    // SAFETY: slot is bounds-checked and the area layout is fixed.
    unsafe {
        ShmRing::attach(
            seg.as_ptr()
                .add(client_area_offset(slot as usize) + HEARTBEAT_SIZE),
            SHM_RING_DEPTH,
            SLOT_SIZE,
        )
    }
}

pub(crate) fn server_beat(seg: &ShmSegment) -> &std::sync::atomic::AtomicU32 {
    // SAFETY: offset 0 is the server heartbeat word; mmap regions are
    // page aligned, satisfying AtomicU32 alignment.
    unsafe { &*seg.as_ptr().cast::<std::sync::atomic::AtomicU32>() }
}

pub(crate) fn client_beat(seg: &ShmSegment, slot: u32) -> &std::sync::atomic::AtomicU32 {
    debug_assert!((slot as usize) < SHM_MAX_CLIENTS);
    // SAFETY: each client area starts with its heartbeat word; area
    // offsets are 8-byte multiples.
    unsafe {
        &*seg
            .as_ptr()
            .add(client_area_offset(slot as usize))
            .cast::<std::sync::atomic::AtomicU32>()
    }
}

/// Monotonic milliseconds used for cross-process heartbeats. Wraps at
/// u32; comparisons use wrapping subtraction.
#[must_use]
pub(crate) fn now_ms() -> u32 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always
    // supported on the platforms this transport compiles for.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_consistent() {
        assert!(SERVER_RING_OFFSET > FREE_RING_OFFSET);
        assert!(CLIENT_AREA_OFFSET > SERVER_RING_OFFSET);
        assert_eq!(
            SEGMENT_SIZE,
            client_area_offset(SHM_MAX_CLIENTS - 1) + CLIENT_AREA_SIZE
        );
    }

    #[test]
    fn names_are_posix_friendly() {
        assert_eq!(segment_name(4242), "/embus_4242");
        assert_eq!(server_sem_name(4242), "/embus_4242_srv");
        assert_eq!(client_sem_name(0xab), "/embus_c000000ab");
        assert!(!segment_name(1)[1..].contains('/'));
    }

    #[test]
    fn now_ms_advances() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b.wrapping_sub(a) >= 4);
    }
}
