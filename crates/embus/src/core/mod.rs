// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Lock-free and blocking building blocks shared by the transports.

pub mod event;
pub mod idpool;
pub mod ring;

pub use event::{Event, WaitOutcome};
pub use idpool::IdPool;
pub use ring::{RingChannel, RingQueue};
