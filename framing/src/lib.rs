// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! Decoding and encoding for Thrift's length-prefixed framed transport.
//!
//! A frame on the wire is a 4-byte big-endian signed length, followed by that many
//! payload bytes. This crate only understands framing; it has no notion of the Thrift
//! binary protocol carried inside a frame's payload.

use std::fmt::Display;

/// Size in bytes of the frame length header (`i32`, big-endian).
pub const LENGTH_SIZE: usize = 4;

/// Default cap on a single frame's payload size: 16 MiB.
///
/// Chosen as the fixed value for an implementation-defined "sane cap" — earlier
/// revisions of this transport disagreed on the exact number and on whether negative
/// lengths were even checked; this crate picks one constant and enforces it uniformly.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A fatal error while decoding a frame. Any occurrence of this error means the
/// connection carrying the frame stream must be closed; framing has no recoverable
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The 4-byte length header decoded to a value `<= 0`.
    NonPositiveLength(i32),
    /// The 4-byte length header decoded to a value larger than the configured cap.
    FrameTooLarge {
        /// The length requested by the peer.
        requested: u32,
        /// The configured maximum.
        max: usize,
    },
}

impl Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveLength(len) => {
                write!(f, "frame length {len} is not positive")
            }
            Self::FrameTooLarge { requested, max } => {
                write!(f, "frame length {requested} exceeds max_frame_size {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Progress of a single call to [`FrameDecoder::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// All bytes handed in were consumed and no error occurred; the decoder may hold a
    /// partial header or body, to be completed by a future call.
    Partial,
    /// A fatal framing error was hit; the byte stream must not be fed further.
    Fatal(FrameError),
}

#[derive(Debug)]
enum State {
    ReadLength { header: [u8; LENGTH_SIZE], filled: usize },
    ReadBody { body: Vec<u8>, filled: usize },
}

/// Incremental decoder for one connection's inbound byte stream.
///
/// `feed` may be called with arbitrarily small or large chunks — a single call can
/// complete zero, one, or many frames, and a header or body can be split across any
/// number of calls. The decoder never blocks and never looks beyond the bytes it is
/// given.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Returns `true` while the decoder is still accumulating the 4-byte length
    /// header (as opposed to a frame body). Exposed so a caller can answer "what state
    /// is this connection's parser in" without duplicating the state machine.
    pub fn in_header(&self) -> bool {
        matches!(self.state, State::ReadLength { .. })
    }

    /// Creates a decoder that rejects any frame whose declared length exceeds
    /// `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: State::ReadLength { header: [0; LENGTH_SIZE], filled: 0 },
            max_frame_size,
        }
    }

    /// Feeds `bytes` into the decoder, calling `on_frame` once per completed frame (in
    /// the order frames complete, i.e. wire order). Returns [`Status::Fatal`] as soon as
    /// an invalid length header is observed; bytes already consumed before the error are
    /// still reported via `on_frame`. Once `Fatal` is returned the decoder must be
    /// discarded — further calls panic in debug builds via the invariant below and
    /// otherwise continue to report the same error.
    pub fn feed(&mut self, mut bytes: &[u8], mut on_frame: impl FnMut(Vec<u8>)) -> Status {
        while !bytes.is_empty() {
            match &mut self.state {
                State::ReadLength { header, filled } => {
                    let need = LENGTH_SIZE - *filled;
                    let take = need.min(bytes.len());
                    header[*filled..*filled + take].copy_from_slice(&bytes[..take]);
                    *filled += take;
                    bytes = &bytes[take..];

                    if *filled == LENGTH_SIZE {
                        let length = i32::from_be_bytes(*header);
                        if length <= 0 {
                            return Status::Fatal(FrameError::NonPositiveLength(length));
                        }
                        let length = length as u32;
                        if length as usize > self.max_frame_size {
                            return Status::Fatal(FrameError::FrameTooLarge {
                                requested: length,
                                max: self.max_frame_size,
                            });
                        }
                        self.state = State::ReadBody {
                            body: vec![0; length as usize],
                            filled: 0,
                        };
                    }
                }
                State::ReadBody { body, filled } => {
                    let need = body.len() - *filled;
                    let take = need.min(bytes.len());
                    body[*filled..*filled + take].copy_from_slice(&bytes[..take]);
                    *filled += take;
                    bytes = &bytes[take..];

                    if *filled == body.len() {
                        let State::ReadBody { body, .. } =
                            std::mem::replace(&mut self.state, State::ReadLength {
                                header: [0; LENGTH_SIZE],
                                filled: 0,
                            })
                        else {
                            unreachable!()
                        };
                        on_frame(body);
                    }
                }
            }
        }

        Status::Partial
    }
}

/// Serializes `payload` as a complete frame (length header + body) appended to `out`.
///
/// Callers must never invoke this for a one-way method's empty response — those are
/// not emitted on the wire at all.
pub fn encode_into(out: &mut Vec<u8>, payload: &[u8]) {
    debug_assert!(payload.len() <= i32::MAX as usize);
    out.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Serializes `payload` as a standalone frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_SIZE + payload.len());
    encode_into(&mut out, payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        encode(payload)
    }

    #[test]
    fn decodes_single_frame_delivered_whole() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let mut frames = Vec::new();
        let wire = frame(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let status = dec.feed(&wire, |f| frames.push(f));
        assert_eq!(status, Status::Partial);
        assert_eq!(frames, vec![vec![0xDE, 0xAD, 0xBE, 0xEF]]);
    }

    #[test]
    fn decodes_frame_split_at_every_byte_boundary() {
        let wire = frame(b"hello world");
        for split in 0..=wire.len() {
            let (a, b) = wire.split_at(split);
            let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
            let mut frames = Vec::new();
            dec.feed(a, |f| frames.push(f));
            dec.feed(b, |f| frames.push(f));
            assert_eq!(frames, vec![b"hello world".to_vec()], "split at {split}");
        }
    }

    #[test]
    fn decodes_multiple_frames_in_one_call() {
        let mut wire = frame(&[1]);
        wire.extend(frame(&[2]));
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let mut frames = Vec::new();
        dec.feed(&wire, |f| frames.push(f));
        assert_eq!(frames, vec![vec![1], vec![2]]);
    }

    #[test]
    fn rejects_zero_length() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let status = dec.feed(&0i32.to_be_bytes(), |_| panic!("no frame expected"));
        assert_eq!(status, Status::Fatal(FrameError::NonPositiveLength(0)));
    }

    #[test]
    fn rejects_negative_length() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let status = dec.feed(&(-1i32).to_be_bytes(), |_| panic!("no frame expected"));
        assert_eq!(status, Status::Fatal(FrameError::NonPositiveLength(-1)));
    }

    #[test]
    fn rejects_oversized_length() {
        let mut dec = FrameDecoder::new(16);
        let status = dec.feed(&17i32.to_be_bytes(), |_| panic!("no frame expected"));
        assert_eq!(
            status,
            Status::Fatal(FrameError::FrameTooLarge { requested: 17, max: 16 })
        );
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let wire = encode(b"pong");
        let mut frames = Vec::new();
        dec.feed(&wire, |f| frames.push(f));
        assert_eq!(frames, vec![b"pong".to_vec()]);
    }
}
