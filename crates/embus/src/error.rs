// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Crate-wide error type.

use std::fmt;
use std::io;

/// Errors surfaced by devices, plugs and transports.
#[derive(Debug)]
pub enum Error {
    /// The connection-id pool is empty.
    IdExhausted,
    /// A bounded queue rejected a push.
    QueueFull,
    /// Payload exceeds what the transport can fragment.
    PayloadTooLarge {
        /// Offending payload size.
        size: usize,
        /// Largest accepted size.
        max: usize,
    },
    /// No peer with this connection id.
    UnknownPeer(i32),
    /// The link to the peer is down.
    NotConnected,
    /// Operation not valid for the plug/message mode.
    ModeMismatch,
    /// The plug was already bound or connected.
    AlreadyBound,
    /// The plug has no endpoint yet.
    NoEndpoint,
    /// The plug or device was closed.
    Closed,
    /// A bounded wait expired.
    Timeout,
    /// No transport accepted the message.
    SendFailed,
    /// A device option gating this operation is not set.
    OptionDisabled(&'static str),
    /// Address could not be parsed or bound.
    InvalidAddress(String),
    /// All shared-memory client slots are taken.
    SlotsExhausted,
    /// Shared-memory plumbing failure.
    Shm(String),
    /// Underlying socket failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdExhausted => write!(f, "connection-id pool exhausted"),
            Self::QueueFull => write!(f, "queue full"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload too large: {size} bytes exceeds {max}")
            }
            Self::UnknownPeer(id) => write!(f, "unknown peer id {id}"),
            Self::NotConnected => write!(f, "peer not connected"),
            Self::ModeMismatch => write!(f, "operation incompatible with mode"),
            Self::AlreadyBound => write!(f, "plug already bound or connected"),
            Self::NoEndpoint => write!(f, "plug has no endpoint"),
            Self::Closed => write!(f, "closed"),
            Self::Timeout => write!(f, "timed out"),
            Self::SendFailed => write!(f, "send failed on every transport"),
            Self::OptionDisabled(opt) => write!(f, "device option {opt} not enabled"),
            Self::InvalidAddress(addr) => write!(f, "invalid address: {addr}"),
            Self::SlotsExhausted => write!(f, "no free shared-memory client slot"),
            Self::Shm(msg) => write!(f, "shared memory: {msg}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::IdExhausted.to_string(), "connection-id pool exhausted");
        assert_eq!(Error::UnknownPeer(7).to_string(), "unknown peer id 7");
        let e = Error::PayloadTooLarge { size: 10, max: 5 };
        assert_eq!(e.to_string(), "payload too large: 10 bytes exceeds 5");
    }

    #[test]
    fn io_source_preserved() {
        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
