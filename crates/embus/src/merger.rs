// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Fragment reassembly.
//!
//! Fragments of one logical message share a (peer id, serial) pair; the
//! two pack into a single u64 key so lookups stay one map probe. Units
//! accept fragments in any order, tolerate duplicates, and release the
//! rebuilt payload bit-for-bit once all fragments landed. Buffers are
//! recycled through a small pool. Wire-declared lengths are checked
//! against the payload bound before any buffer is sized, so a forged
//! header cannot pin memory, and units a sender abandoned (peer died
//! mid-message) are evicted by the periodic sweep.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::protocol::fragment_count;

fn frag_key(peer: i32, serial: u32) -> u64 {
    (u64::from(peer as u32) << 32) | u64::from(serial)
}

struct Unit {
    buf: Vec<u8>,
    seen: Vec<bool>,
    /// Declared payload length in bytes.
    len: usize,
    frags: u32,
    received: u32,
    touched: Instant,
}

/// Reassembly table for one transport.
pub struct Merger {
    units: DashMap<u64, Unit>,
    pool: Mutex<Vec<(Vec<u8>, Vec<bool>)>>,
}

impl Merger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Account one DATA fragment. Returns the complete payload when this
    /// fragment was the last missing piece. `total` is the full payload
    /// byte length declared on the wire; `chunk` is the transport's
    /// per-frame capacity. Declared lengths over [`MAX_PAYLOAD_SIZE`],
    /// and fragments whose geometry disagrees with the declared length,
    /// are dropped before any buffer is sized.
    pub fn add(
        &self,
        peer: i32,
        serial: u32,
        total: u32,
        frag_no: u32,
        chunk: usize,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        let len = total as usize;
        if len > MAX_PAYLOAD_SIZE {
            log::warn!(
                "dropping fragment from peer {peer}: declared {len} bytes exceeds the \
                 {MAX_PAYLOAD_SIZE}-byte payload bound"
            );
            return None;
        }
        let frags = fragment_count(len, chunk);
        if frag_no >= frags {
            log::warn!("dropping malformed fragment {frag_no}/{frags} from peer {peer}");
            return None;
        }
        let expect = if frag_no + 1 == frags {
            len - (frags as usize - 1) * chunk
        } else {
            chunk
        };
        if data.len() != expect {
            log::warn!(
                "dropping fragment {frag_no} from peer {peer}: {} bytes where {expect} were \
                 declared",
                data.len()
            );
            return None;
        }

        let key = frag_key(peer, serial);
        let mut unit = self.units.entry(key).or_insert_with(|| {
            let (mut buf, mut seen) = self.pool.lock().pop().unwrap_or_default();
            buf.clear();
            buf.resize(len, 0);
            seen.clear();
            seen.resize(frags as usize, false);
            Unit {
                buf,
                seen,
                len,
                frags,
                received: 0,
                touched: Instant::now(),
            }
        });

        if unit.len != len || unit.seen.get(frag_no as usize).copied().unwrap_or(true) {
            // Duplicate, or a retransmission disagreeing with the unit
            // already in flight; either way count it once at most.
            unit.touched = Instant::now();
            return None;
        }

        let off = frag_no as usize * chunk;
        unit.buf[off..off + data.len()].copy_from_slice(data);
        unit.seen[frag_no as usize] = true;
        unit.received += 1;
        unit.touched = Instant::now();

        if unit.received < unit.frags {
            return None;
        }
        drop(unit);

        let (_, unit) = self.units.remove(&key)?;
        let payload = unit.buf.clone();
        self.pool.lock().push((unit.buf, unit.seen));
        Some(payload)
    }

    /// Evict units idle longer than `timeout`. Returns how many.
    pub fn sweep(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        // Collect keys first; removing while iterating a shard deadlocks.
        let stale: Vec<u64> = self
            .units
            .iter()
            .filter(|e| now.duration_since(e.value().touched) >= timeout)
            .map(|e| *e.key())
            .collect();
        let mut evicted = 0;
        for key in stale {
            if let Some((_, unit)) = self.units.remove(&key) {
                log::debug!(
                    "evicting stale reassembly unit ({}/{} fragments)",
                    unit.received,
                    unit.frags
                );
                self.pool.lock().push((unit.buf, unit.seen));
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop all state for one peer (its serials may be reused by the
    /// next connection on the same id).
    pub fn forget_peer(&self, peer: i32) {
        let doomed: Vec<u64> = self
            .units
            .iter()
            .filter(|e| (*e.key() >> 32) as u32 == peer as u32)
            .map(|e| *e.key())
            .collect();
        for key in doomed {
            if let Some((_, unit)) = self.units.remove(&key) {
                self.pool.lock().push((unit.buf, unit.seen));
            }
        }
    }

    /// Units currently in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.units.len()
    }
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}
