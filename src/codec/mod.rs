// Copyright 2025 jonefeewang@gmail.com
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

//! Framing Codecs
//!
//! A TCP stream has no message boundaries, so every payload is wrapped in a
//! frame before it is written and recovered from the byte stream on the other
//! side. The supported wire formats are:
//!
//! - length header: `[N big-endian][N bytes]`, header width 1, 2 or 4 bytes
//! - STX/ETX: `[0x02][payload][0x03]`
//! - CRLF: `[payload][0x0D 0x0A]`
//! - custom delimiter: `[payload][delimiter]`
//!
//! Delimited formats do not escape their delimiter bytes. A payload that
//! contains them is split or rejected by the decoder on the other side.
//!
//! Decoding is incremental. `FramingCodec::decode` looks at the bytes buffered
//! so far plus a small [`DecodeState`] cursor, and either extracts one payload
//! or leaves everything in place until more bytes arrive, so any chunking of
//! the same stream yields the same payloads.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::{AppError, AppResult};

pub use delimited::{DelimiterCodec, StxEtxCodec, CRLF, ETX, STX};
pub use length_header::{HeaderWidth, LengthHeaderCodec};

mod delimited;
mod length_header;

/// No limit beyond what a 4 byte header can express.
pub const DEFAULT_MAX_FRAME_SIZE: usize = u32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of length {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("stream closed after {received} of {expected} header bytes")]
    MalformedHeader { received: usize, expected: usize },

    #[error("stream closed inside a frame with {0} bytes buffered")]
    Truncated(usize),
}

/// Progress through the frame at the front of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    /// Between frames.
    #[default]
    Idle,
    /// Length header consumed, `len` payload bytes expected.
    Body { len: usize },
    /// Inside a delimited frame; the first `scanned` buffered bytes hold no terminator.
    Scanning { scanned: usize },
}

#[derive(Debug, Clone)]
pub enum FramingCodec {
    LengthHeader(LengthHeaderCodec),
    StxEtx(StxEtxCodec),
    Crlf(DelimiterCodec),
    Delimiter(DelimiterCodec),
}

impl FramingCodec {
    pub fn length_header() -> Self {
        FramingCodec::LengthHeader(LengthHeaderCodec::new(HeaderWidth::Four))
    }

    pub fn stx_etx() -> Self {
        FramingCodec::StxEtx(StxEtxCodec::new())
    }

    pub fn crlf() -> Self {
        FramingCodec::Crlf(DelimiterCodec::crlf())
    }

    /// A codec terminating each frame with `delimiter`, which must not be empty.
    pub fn delimiter(delimiter: impl Into<Bytes>) -> AppResult<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(AppError::InvalidValue(
                "frame delimiter must not be empty".to_string(),
            ));
        }
        Ok(FramingCodec::Delimiter(DelimiterCodec::new(delimiter)))
    }

    /// Sets the largest payload the codec accepts in either direction.
    pub fn with_max_frame_size(self, max_frame_size: usize) -> AppResult<Self> {
        if max_frame_size == 0 {
            return Err(AppError::InvalidValue(
                "max frame size must be positive".to_string(),
            ));
        }
        Ok(match self {
            FramingCodec::LengthHeader(codec) => {
                FramingCodec::LengthHeader(codec.with_max_frame_size(max_frame_size))
            }
            FramingCodec::StxEtx(codec) => {
                FramingCodec::StxEtx(codec.with_max_frame_size(max_frame_size))
            }
            FramingCodec::Crlf(codec) => {
                FramingCodec::Crlf(codec.with_max_frame_size(max_frame_size))
            }
            FramingCodec::Delimiter(codec) => {
                FramingCodec::Delimiter(codec.with_max_frame_size(max_frame_size))
            }
        })
    }

    pub fn max_frame_size(&self) -> usize {
        match self {
            FramingCodec::LengthHeader(codec) => codec.max_frame_size(),
            FramingCodec::StxEtx(codec) => codec.max_frame_size(),
            FramingCodec::Crlf(codec) | FramingCodec::Delimiter(codec) => codec.max_frame_size(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FramingCodec::LengthHeader(_) => "length_header",
            FramingCodec::StxEtx(_) => "stx_etx",
            FramingCodec::Crlf(_) => "crlf",
            FramingCodec::Delimiter(_) => "delimiter",
        }
    }

    /// Appends the frame for `payload` to `dst`.
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            FramingCodec::LengthHeader(codec) => codec.encode(payload, dst),
            FramingCodec::StxEtx(codec) => codec.encode(payload, dst),
            FramingCodec::Crlf(codec) | FramingCodec::Delimiter(codec) => {
                codec.encode(payload, dst)
            }
        }
    }

    pub fn encode_to_bytes(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(payload.len() + 4);
        self.encode(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Extracts the next payload from the front of `src`, or returns `None`
    /// and keeps the partial frame buffered.
    pub fn decode(
        &self,
        state: &mut DecodeState,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, FrameError> {
        match self {
            FramingCodec::LengthHeader(codec) => codec.decode(state, src),
            FramingCodec::StxEtx(codec) => codec.decode(state, src),
            FramingCodec::Crlf(codec) | FramingCodec::Delimiter(codec) => codec.decode(state, src),
        }
    }

    /// Checks what is left when the stream ends. Leftover bytes mean the peer
    /// closed in the middle of a frame.
    pub fn finish(&self, state: &DecodeState, src: &BytesMut) -> Result<(), FrameError> {
        match (self, state) {
            (_, DecodeState::Idle) if src.is_empty() => Ok(()),
            (FramingCodec::LengthHeader(codec), DecodeState::Idle)
                if src.len() < codec.header_width().len() =>
            {
                Err(FrameError::MalformedHeader {
                    received: src.len(),
                    expected: codec.header_width().len(),
                })
            }
            _ => Err(FrameError::Truncated(src.len())),
        }
    }
}

impl Encoder<Bytes> for FramingCodec {
    type Error = AppError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        FramingCodec::encode(self, &item, dst).map_err(AppError::from)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn decode_stream(codec: &FramingCodec, chunks: &[&[u8]]) -> Result<Vec<Bytes>, FrameError> {
        let mut state = DecodeState::default();
        let mut buffer = BytesMut::new();
        let mut payloads = Vec::new();
        for chunk in chunks {
            buffer.extend_from_slice(chunk);
            while let Some(payload) = codec.decode(&mut state, &mut buffer)? {
                payloads.push(payload);
            }
        }
        codec.finish(&state, &buffer)?;
        Ok(payloads)
    }

    #[rstest]
    #[case::length_header(FramingCodec::length_header(), &b"\x00\x00\x00\x06abcdef"[..])]
    #[case::stx_etx(FramingCodec::stx_etx(), &b"\x02abcdef\x03"[..])]
    #[case::crlf(FramingCodec::crlf(), &b"abcdef\r\n"[..])]
    fn test_abcdef_wire_bytes(#[case] codec: FramingCodec, #[case] wire: &[u8]) {
        let frame = codec.encode_to_bytes(b"abcdef").unwrap();
        assert_eq!(&frame[..], wire);
        let payloads = decode_stream(&codec, &[wire]).unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"abcdef")]);
    }

    #[rstest]
    #[case::length_header(FramingCodec::length_header())]
    #[case::short_header(FramingCodec::LengthHeader(LengthHeaderCodec::new(HeaderWidth::Two)))]
    #[case::byte_header(FramingCodec::LengthHeader(LengthHeaderCodec::new(HeaderWidth::One)))]
    #[case::stx_etx(FramingCodec::stx_etx())]
    #[case::crlf(FramingCodec::crlf())]
    #[case::pipe(FramingCodec::delimiter(&b"||"[..]).unwrap())]
    fn test_chunking_does_not_change_payloads(#[case] codec: FramingCodec) {
        let messages: [&[u8]; 5] = [b"first", b"", b"a\rb", b"fourth message", b"z"];
        let mut stream = BytesMut::new();
        for message in messages {
            codec.encode(message, &mut stream).unwrap();
        }

        let whole = decode_stream(&codec, &[&stream[..]]).unwrap();
        let single_bytes: Vec<&[u8]> = stream.chunks(1).collect();
        let bytewise = decode_stream(&codec, &single_bytes).unwrap();
        let threes: Vec<&[u8]> = stream.chunks(3).collect();
        let by_threes = decode_stream(&codec, &threes).unwrap();

        let expected: Vec<Bytes> = messages.iter().map(|m| Bytes::copy_from_slice(m)).collect();
        assert_eq!(whole, expected);
        assert_eq!(bytewise, expected);
        assert_eq!(by_threes, expected);
    }

    #[rstest]
    #[case::stx_etx(FramingCodec::stx_etx(), &b"\x02one\x03\x02two\x03"[..])]
    #[case::crlf(FramingCodec::crlf(), &b"one\r\ntwo\r\n"[..])]
    fn test_back_to_back_frames_in_one_read(#[case] codec: FramingCodec, #[case] wire: &[u8]) {
        let payloads = decode_stream(&codec, &[wire]).unwrap();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[test]
    fn test_max_frame_size_must_be_positive() {
        assert!(FramingCodec::crlf().with_max_frame_size(0).is_err());
        let codec = FramingCodec::stx_etx().with_max_frame_size(16).unwrap();
        assert_eq!(codec.max_frame_size(), 16);
    }

    #[test]
    fn test_empty_delimiter_rejected() {
        assert!(matches!(
            FramingCodec::delimiter(Bytes::new()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_finish_reports_partial_frames() {
        let codec = FramingCodec::length_header();
        assert_eq!(
            decode_stream(&codec, &[&b"\x00\x00"[..]]),
            Err(FrameError::MalformedHeader {
                received: 2,
                expected: 4
            })
        );
        assert_eq!(
            decode_stream(&codec, &[&b"\x00\x00\x00\x05ab"[..]]),
            Err(FrameError::Truncated(2))
        );
        assert_eq!(
            decode_stream(&FramingCodec::crlf(), &[&b"abc\r"[..]]),
            Err(FrameError::Truncated(4))
        );
        assert_eq!(
            decode_stream(&FramingCodec::stx_etx(), &[&b"\x02ab"[..]]),
            Err(FrameError::Truncated(2))
        );
    }

    #[test]
    fn test_tokio_encoder() {
        let mut codec = FramingCodec::crlf();
        let mut dst = BytesMut::new();
        Encoder::encode(&mut codec, Bytes::from_static(b"hi"), &mut dst).unwrap();
        Encoder::encode(&mut codec, Bytes::from_static(b"there"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"hi\r\nthere\r\n");
    }
}
