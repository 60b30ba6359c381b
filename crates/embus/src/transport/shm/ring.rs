// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! The ring channel laid out over raw shared memory.
//!
//! Same claim/commit protocol as [`crate::core::ring`], expressed over a
//! cache-line header of four u32 cursors followed by fixed-size slots.
//! Frame slots hold a u32 length prefix plus the frame bytes; the
//! free-slot ring reuses the structure with bare u32 entries.
//!
//! Cursors are u32 and wrap; all comparisons use wrapping subtraction.
//! Both processes map the same physical pages, so Release/Acquire on the
//! cursors orders the slot copies across the process boundary exactly as
//! it does between threads.

use std::sync::atomic::{AtomicU32, Ordering};

/// Ring header, one cache line.
#[repr(C, align(64))]
struct RingHdr {
    claim: AtomicU32,
    commit: AtomicU32,
    read_claim: AtomicU32,
    read_commit: AtomicU32,
    _pad: [u8; 48],
}

const HDR_SIZE: usize = std::mem::size_of::<RingHdr>();

/// Bytes a ring occupies for `depth` slots of `slot_size` bytes.
#[must_use]
pub const fn ring_bytes(depth: usize, slot_size: usize) -> usize {
    HDR_SIZE + depth * slot_size
}

/// View of one ring inside a mapped segment.
pub struct ShmRing {
    base: *mut u8,
    depth: u32,
    slot_size: usize,
}

// SAFETY: all shared state behind `base` is modified through atomics and
// the claim/commit protocol; the raw pointer itself is never reassigned.
unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Attach to ring storage at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `ring_bytes(depth, slot_size)` bytes
    /// of live, 64-byte-aligned mapping that outlives this value, and
    /// `depth` must be a power of two. Freshly created segments are
    /// zeroed, which is a valid empty ring.
    pub unsafe fn attach(base: *mut u8, depth: usize, slot_size: usize) -> Self {
        debug_assert!(depth.is_power_of_two());
        Self {
            base,
            depth: depth as u32,
            slot_size,
        }
    }

    fn hdr(&self) -> &RingHdr {
        // SAFETY: attach() guarantees base points to a live RingHdr.
        unsafe { &*(self.base.cast::<RingHdr>()) }
    }

    fn slot_ptr(&self, seq: u32) -> *mut u8 {
        let idx = (seq & (self.depth - 1)) as usize;
        // SAFETY: idx < depth and the mapping covers all slots.
        unsafe { self.base.add(HDR_SIZE + idx * self.slot_size) }
    }

    /// Claim the next write sequence, or `None` when full.
    fn claim(&self) -> Option<u32> {
        let hdr = self.hdr();
        loop {
            let cur = hdr.claim.load(Ordering::Acquire);
            if cur.wrapping_sub(hdr.read_commit.load(Ordering::Acquire)) >= self.depth {
                return None;
            }
            if hdr
                .claim
                .compare_exchange_weak(
                    cur,
                    cur.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(cur);
            }
        }
    }

    fn commit(&self, seq: u32) {
        let hdr = self.hdr();
        while hdr
            .commit
            .compare_exchange_weak(
                seq,
                seq.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn read_claim(&self) -> Option<u32> {
        let hdr = self.hdr();
        loop {
            let cur = hdr.read_claim.load(Ordering::Acquire);
            if cur == hdr.commit.load(Ordering::Acquire) {
                return None;
            }
            if hdr
                .read_claim
                .compare_exchange_weak(
                    cur,
                    cur.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(cur);
            }
        }
    }

    fn read_commit(&self, seq: u32) {
        let hdr = self.hdr();
        while hdr
            .read_commit
            .compare_exchange_weak(
                seq,
                seq.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Push one frame (length-prefixed slot). `false` when full or the
    /// frame does not fit a slot.
    pub fn push_frame(&self, frame: &[u8]) -> bool {
        if frame.len() + 4 > self.slot_size {
            return false;
        }
        let Some(seq) = self.claim() else {
            return false;
        };
        let ptr = self.slot_ptr(seq);
        // SAFETY: seq was claimed exclusively; slot_ptr stays in bounds
        // and frame fits per the check above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (frame.len() as u32).to_le_bytes().as_ptr(),
                ptr,
                4,
            );
            std::ptr::copy_nonoverlapping(frame.as_ptr(), ptr.add(4), frame.len());
        }
        self.commit(seq);
        true
    }

    /// Pop one frame into `out` (cleared first). `false` when empty.
    pub fn pop_frame(&self, out: &mut Vec<u8>) -> bool {
        let Some(seq) = self.read_claim() else {
            return false;
        };
        let ptr = self.slot_ptr(seq);
        // SAFETY: seq was read-claimed exclusively and was committed by
        // a writer that length-checked the slot.
        let len = unsafe {
            let mut len_bytes = [0u8; 4];
            std::ptr::copy_nonoverlapping(ptr, len_bytes.as_mut_ptr(), 4);
            u32::from_le_bytes(len_bytes) as usize
        };
        out.clear();
        if len + 4 <= self.slot_size {
            out.reserve(len);
            // SAFETY: len is within the slot per the check above.
            unsafe {
                out.extend_from_slice(std::slice::from_raw_parts(ptr.add(4), len));
            }
        } else {
            log::error!("shm slot carries impossible length {len}, dropping");
        }
        self.read_commit(seq);
        !out.is_empty() || len == 0
    }

    /// Push a bare u32 entry (free-slot ring).
    pub fn push_index(&self, value: u32) -> bool {
        debug_assert!(self.slot_size >= 4);
        let Some(seq) = self.claim() else {
            return false;
        };
        let ptr = self.slot_ptr(seq);
        // SAFETY: exclusive claimed slot of at least 4 bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), ptr, 4);
        }
        self.commit(seq);
        true
    }

    /// Pop a bare u32 entry.
    pub fn pop_index(&self) -> Option<u32> {
        let seq = self.read_claim()?;
        let ptr = self.slot_ptr(seq);
        // SAFETY: exclusive read-claimed slot of at least 4 bytes.
        let value = unsafe {
            let mut bytes = [0u8; 4];
            std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), 4);
            u32::from_le_bytes(bytes)
        };
        self.read_commit(seq);
        Some(value)
    }

    /// Entries committed but not yet consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        let hdr = self.hdr();
        hdr.commit
            .load(Ordering::Acquire)
            .wrapping_sub(hdr.read_commit.load(Ordering::Acquire)) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero the cursors. Only valid while no other process touches the
    /// ring (reclaiming a client area between logins).
    pub fn reset(&self) {
        let hdr = self.hdr();
        hdr.claim.store(0, Ordering::Release);
        hdr.commit.store(0, Ordering::Release);
        hdr.read_claim.store(0, Ordering::Release);
        hdr.read_commit.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct Backing {
        // u64 backing keeps the header alignment promise.
        _mem: Vec<u64>,
        ptr: *mut u8,
    }

    // SAFETY: test scaffolding; the Vec is never reallocated.
    unsafe impl Send for Backing {}
    unsafe impl Sync for Backing {}

    fn backing(depth: usize, slot: usize) -> Backing {
        let words = ring_bytes(depth, slot) / 8 + 8;
        let mut mem = vec![0u64; words];
        // Align up to 64 inside the allocation.
        let addr = mem.as_mut_ptr() as usize;
        let aligned = (addr + 63) & !63;
        let ptr = aligned as *mut u8;
        Backing { _mem: mem, ptr }
    }

    #[test]
    fn frame_roundtrip() {
        let b = backing(8, 64);
        // SAFETY: backing() sized and aligned the region for this ring.
        let ring = unsafe { ShmRing::attach(b.ptr, 8, 64) };
        assert!(ring.push_frame(b"hello"));
        let mut out = Vec::new();
        assert!(ring.pop_frame(&mut out));
        assert_eq!(out, b"hello");
        assert!(!ring.pop_frame(&mut out));
    }

    #[test]
    fn full_ring_rejects() {
        let b = backing(4, 64);
        // SAFETY: region sized for the ring.
        let ring = unsafe { ShmRing::attach(b.ptr, 4, 64) };
        for i in 0..4u8 {
            assert!(ring.push_frame(&[i]));
        }
        assert!(!ring.push_frame(&[9]));
        let mut out = Vec::new();
        assert!(ring.pop_frame(&mut out));
        assert_eq!(out, [0]);
        assert!(ring.push_frame(&[9]));
    }

    #[test]
    fn oversized_frame_rejected() {
        let b = backing(4, 16);
        // SAFETY: region sized for the ring.
        let ring = unsafe { ShmRing::attach(b.ptr, 4, 16) };
        assert!(!ring.push_frame(&[0u8; 13]));
        assert!(ring.push_frame(&[0u8; 12]));
    }

    #[test]
    fn index_ring_roundtrip() {
        let b = backing(8, 4);
        // SAFETY: region sized for the ring.
        let ring = unsafe { ShmRing::attach(b.ptr, 8, 4) };
        for i in 0..8 {
            assert!(ring.push_index(i));
        }
        assert!(!ring.push_index(99));
        for i in 0..8 {
            assert_eq!(ring.pop_index(), Some(i));
        }
        assert_eq!(ring.pop_index(), None);
    }

    #[test]
    fn reset_empties_the_ring() {
        let b = backing(4, 64);
        // SAFETY: region sized for the ring.
        let ring = unsafe { ShmRing::attach(b.ptr, 4, 64) };
        ring.push_frame(b"x");
        ring.reset();
        assert!(ring.is_empty());
        let mut out = Vec::new();
        assert!(!ring.pop_frame(&mut out));
    }

    #[test]
    fn concurrent_producers_one_consumer() {
        let b = Arc::new(backing(64, 32));
        // SAFETY: region sized for the ring; Backing keeps it alive.
        let ring = Arc::new(unsafe { ShmRing::attach(b.ptr, 64, 32) });
        let producers: u8 = 4;
        let per = 1000u32;

        let mut handles = Vec::new();
        for p in 0..producers {
            let ring = Arc::clone(&ring);
            let b = Arc::clone(&b);
            handles.push(thread::spawn(move || {
                let _hold = b;
                for i in 0..per {
                    let v = (u32::from(p) << 16) | i;
                    while !ring.push_frame(&v.to_le_bytes()) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let total = usize::from(producers) * per as usize;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        while seen.len() < total {
            if ring.pop_frame(&mut out) {
                let v = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
                assert!(seen.insert(v), "duplicate frame {v:#x}");
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
