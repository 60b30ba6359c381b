// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Protocol constants and runtime tunables.
//!
//! Everything wire-visible lives here so the shm and TCP transports agree
//! on frame geometry, and so the timeouts that drive liveness, reconnect
//! and housekeeping are in one place.

use std::time::Duration;

/// Magic word prefixed to every TCP frame.
pub const WIRE_MAGIC: u16 = 0x5876;

/// Upper bound on one encoded frame, preamble included.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Encoded size of [`crate::protocol::FrameHeader`].
pub const FRAME_HEADER_SIZE: usize = 17;

/// TCP frame preamble: magic (u16) + frame length (u16).
pub const TCP_PREAMBLE_SIZE: usize = 4;

/// Payload bytes carried by one TCP DATA frame.
pub const TCP_CHUNK_SIZE: usize = MAX_FRAME_SIZE - TCP_PREAMBLE_SIZE - FRAME_HEADER_SIZE;

/// Payload bytes carried by one shared-memory DATA frame.
pub const SHM_CHUNK_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Largest payload a single message may carry.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 26;

/// Slots per shared-memory ring (power of two).
pub const SHM_RING_DEPTH: usize = 128;

/// Client slots per shared-memory segment.
pub const SHM_MAX_CLIENTS: usize = 8;

/// Connection ids available per runtime.
pub const MAX_PEERS: usize = 0x4000;

/// Depth of a plug's inbound message queue (power of two).
pub const PLUG_QUEUE_DEPTH: usize = 8192;

/// Depth of the device monitor queue (power of two).
pub const MONITOR_QUEUE_DEPTH: usize = 1024;

/// Depth of a transport's asynchronous send-job queue (power of two).
pub const SEND_JOB_DEPTH: usize = 4096;

/// A silent shm peer is presumed dead after this long.
pub const SHM_LIVENESS_TIMEOUT: Duration = Duration::from_millis(5000);

/// Cadence of transport housekeeping (heartbeats, liveness checks).
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);

/// Cadence of the runtime reconnect sweeper.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Reassembly units idle longer than this are evicted.
pub const MERGER_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// How often stale reassembly units are swept.
pub const MERGER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Poll tick bounding write-retry latency on a congested TCP socket.
pub const TCP_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Outbound TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a login handshake may take before `connect` gives up.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a blocking send waiting for its transmits to finish.
pub const SEND_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff while a full shared-memory ring is retried.
pub const RING_FULL_RETRY: Duration = Duration::from_millis(1);

/// TCP keepalive idle time before probes start.
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// TCP keepalive probe interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
