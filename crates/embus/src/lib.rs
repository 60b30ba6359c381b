// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! embus: a small messaging runtime with REQ/REP and PUB/SUB semantics
//! over two interchangeable transports.
//!
//! ```text
//!   Device ── options, monitor queue, TCP manager
//!     └── Plug ── bind / connect, send / recv
//!           ├── shm endpoint   (POSIX shared memory, local peers)
//!           └── tcp endpoint   (mio worker pool, remote peers)
//!                 └── shared frame protocol + fragment merger
//! ```
//!
//! A plug binds (server role) or connects (client role) exactly once;
//! `connect` picks shared memory for local targets and TCP otherwise.
//! Both transports speak the same 17-byte frame header, fragment large
//! payloads, and reassemble them through the merger. Delivery is
//! at-most-once: sends either report failure explicitly (blocking sends
//! and monitor events) or drop silently under overload (full bounded
//! queues).
//!
//! # Example
//!
//! ```no_run
//! use embus::{Device, Mode};
//!
//! let server = Device::new();
//! let rep = server.plug(Mode::Rep)?;
//! let port = rep.bind(0)?;
//!
//! let client = Device::new();
//! let req = client.plug(Mode::Req)?;
//! req.connect(&format!("127.0.0.1:{port}"))?;
//!
//! req.send(&req.message(b"ping".to_vec()))?;
//! let question = rep.recv(None)?;
//! let answer = rep.message(b"pong".to_vec());
//! answer.set_peer(question.peer());
//! rep.send(&answer)?;
//! # Ok::<(), embus::Error>(())
//! ```

pub mod config;
pub mod core;
mod device;
pub mod error;
pub mod merger;
mod monitor;
pub mod msg;
mod plug;
pub mod protocol;
mod runtime;
mod transport;

pub use device::{Device, DeviceOption};
pub use error::{Error, Result};
pub use monitor::{MonitorEvent, MonitorKind};
pub use msg::{Message, Mode, NO_PEER};
pub use plug::{Control, Plug};
pub use runtime::Runtime;
pub use transport::TransportPreference;

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
