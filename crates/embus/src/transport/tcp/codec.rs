// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Incremental TCP frame reader.
//!
//! Wire layout per frame: `magic:u16 | frame_len:u16 | frame bytes`.
//! The reader accumulates across partial reads and hands back complete
//! frame bodies (header + payload, preamble stripped). A wrong magic or
//! an impossible length is a protocol error that kills the connection;
//! there is no resync scanning.

use std::io::{self, Read};

use crate::config::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, TCP_PREAMBLE_SIZE, WIRE_MAGIC};

enum ReadState {
    Preamble { buf: [u8; TCP_PREAMBLE_SIZE], got: usize },
    Body { buf: Vec<u8>, got: usize },
}

pub(crate) struct Codec {
    state: ReadState,
}

impl Codec {
    pub(crate) fn new() -> Self {
        Self {
            state: ReadState::Preamble {
                buf: [0u8; TCP_PREAMBLE_SIZE],
                got: 0,
            },
        }
    }

    /// Pull whatever the socket has, appending complete frames to `out`.
    ///
    /// Returns `Ok(())` when the socket would block (come back on the
    /// next readable event); any `Err` is fatal for the connection,
    /// including a clean EOF surfaced as `UnexpectedEof`.
    pub(crate) fn read_frames(
        &mut self,
        stream: &mut impl Read,
        out: &mut Vec<Vec<u8>>,
    ) -> io::Result<()> {
        loop {
            match &mut self.state {
                ReadState::Preamble { buf, got } => {
                    match stream.read(&mut buf[*got..]) {
                        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                        Ok(n) => *got += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                    if *got < TCP_PREAMBLE_SIZE {
                        continue;
                    }
                    let magic = u16::from_le_bytes([buf[0], buf[1]]);
                    let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
                    if magic != WIRE_MAGIC {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad frame magic {magic:#06x}"),
                        ));
                    }
                    if len < FRAME_HEADER_SIZE || len > MAX_FRAME_SIZE - TCP_PREAMBLE_SIZE {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad frame length {len}"),
                        ));
                    }
                    self.state = ReadState::Body {
                        buf: vec![0u8; len],
                        got: 0,
                    };
                }
                ReadState::Body { buf, got } => {
                    match stream.read(&mut buf[*got..]) {
                        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                        Ok(n) => *got += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                    if *got < buf.len() {
                        continue;
                    }
                    let frame = std::mem::take(buf);
                    out.push(frame);
                    self.state = ReadState::Preamble {
                        buf: [0u8; TCP_PREAMBLE_SIZE],
                        got: 0,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_tcp_frame, FrameHeader, CMD_DATA};

    /// Reader that yields its script in fixed-size dribbles, then blocks.
    struct Dribble {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Dribble {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn sample_frame(payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader {
            cmd: CMD_DATA,
            peer: 3,
            serial: 11,
            total: 1,
            frag_no: 0,
        };
        encode_tcp_frame(&header, payload)
    }

    #[test]
    fn whole_frame_in_one_read() {
        let wire = sample_frame(b"payload");
        let mut stream = Dribble {
            data: wire.clone(),
            pos: 0,
            step: wire.len(),
        };
        let mut codec = Codec::new();
        let mut out = Vec::new();
        codec.read_frames(&mut stream, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], wire[TCP_PREAMBLE_SIZE..]);
    }

    #[test]
    fn byte_at_a_time_reassembles() {
        let wire = sample_frame(b"slow and steady");
        let mut stream = Dribble {
            data: wire.clone(),
            pos: 0,
            step: 1,
        };
        let mut codec = Codec::new();
        let mut out = Vec::new();
        codec.read_frames(&mut stream, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], wire[TCP_PREAMBLE_SIZE..]);
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut wire = sample_frame(b"one");
        wire.extend(sample_frame(b"two"));
        wire.extend(sample_frame(b"three"));
        let mut stream = Dribble {
            data: wire,
            pos: 0,
            step: 7,
        };
        let mut codec = Codec::new();
        let mut out = Vec::new();
        codec.read_frames(&mut stream, &mut out).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut wire = sample_frame(b"x");
        wire[0] ^= 0xff;
        let mut stream = Dribble {
            data: wire,
            pos: 0,
            step: 64,
        };
        let mut codec = Codec::new();
        let mut out = Vec::new();
        let err = codec.read_frames(&mut stream, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn short_length_is_fatal() {
        let mut wire = vec![0u8; TCP_PREAMBLE_SIZE];
        wire[0..2].copy_from_slice(&WIRE_MAGIC.to_le_bytes());
        wire[2..4].copy_from_slice(&3u16.to_le_bytes());
        let mut stream = Dribble {
            data: wire,
            pos: 0,
            step: 4,
        };
        let mut codec = Codec::new();
        let mut out = Vec::new();
        let err = codec.read_frames(&mut stream, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_is_fatal() {
        struct Eof;
        impl Read for Eof {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut codec = Codec::new();
        let mut out = Vec::new();
        let err = codec.read_frames(&mut Eof, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
