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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecodeState, FrameError, DEFAULT_MAX_FRAME_SIZE};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const CRLF: &[u8] = b"\r\n";

/// `[STX][payload][ETX]`
#[derive(Debug, Clone)]
pub struct StxEtxCodec {
    max_frame_size: usize,
}

impl Default for StxEtxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StxEtxCodec {
    pub fn new() -> Self {
        StxEtxCodec {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub(super) fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        check_size(payload.len(), self.max_frame_size)?;
        dst.reserve(payload.len() + 2);
        dst.put_u8(STX);
        dst.extend_from_slice(payload);
        dst.put_u8(ETX);
        Ok(())
    }

    pub(super) fn decode(
        &self,
        state: &mut DecodeState,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, FrameError> {
        let scanned = match *state {
            DecodeState::Scanning { scanned } => scanned,
            _ => {
                let Some(&first) = src.first() else {
                    return Ok(None);
                };
                if first != STX {
                    return Err(FrameError::MalformedFrame(format!(
                        "expected STX to begin frame, found {:#04x}",
                        first
                    )));
                }
                src.advance(1);
                *state = DecodeState::Scanning { scanned: 0 };
                0
            }
        };

        match src[scanned..].iter().position(|&b| b == ETX) {
            Some(offset) => {
                let end = scanned + offset;
                check_size(end, self.max_frame_size)?;
                let payload = src.split_to(end).freeze();
                src.advance(1);
                *state = DecodeState::Idle;
                Ok(Some(payload))
            }
            None => {
                check_size(src.len(), self.max_frame_size)?;
                *state = DecodeState::Scanning { scanned: src.len() };
                Ok(None)
            }
        }
    }
}

/// `[payload][delimiter]`, CRLF being the common two byte case.
#[derive(Debug, Clone)]
pub struct DelimiterCodec {
    delimiter: Bytes,
    max_frame_size: usize,
}

impl DelimiterCodec {
    /// `delimiter` must be non-empty; `FramingCodec::delimiter` checks it.
    pub(super) fn new(delimiter: Bytes) -> Self {
        DelimiterCodec {
            delimiter,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn crlf() -> Self {
        Self::new(Bytes::from_static(CRLF))
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub(super) fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        check_size(payload.len(), self.max_frame_size)?;
        dst.reserve(payload.len() + self.delimiter.len());
        dst.extend_from_slice(payload);
        dst.extend_from_slice(&self.delimiter);
        Ok(())
    }

    pub(super) fn decode(
        &self,
        state: &mut DecodeState,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, FrameError> {
        let scanned = match *state {
            DecodeState::Scanning { scanned } => scanned,
            _ => 0,
        };
        // a delimiter may have started in the bytes already scanned
        let start = scanned.saturating_sub(self.delimiter.len() - 1);

        match find(&src[start..], &self.delimiter) {
            Some(offset) => {
                let end = start + offset;
                check_size(end, self.max_frame_size)?;
                let payload = src.split_to(end).freeze();
                src.advance(self.delimiter.len());
                *state = DecodeState::Idle;
                Ok(Some(payload))
            }
            None => {
                // the tail may be the first bytes of a delimiter
                let payload_len = src.len().saturating_sub(self.delimiter.len() - 1);
                check_size(payload_len, self.max_frame_size)?;
                *state = if src.is_empty() {
                    DecodeState::Idle
                } else {
                    DecodeState::Scanning { scanned: src.len() }
                };
                Ok(None)
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if let [byte] = needle {
        return haystack.iter().position(|b| b == byte);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn check_size(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::FrameTooLarge { size, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lone_cr_is_payload() {
        let codec = DelimiterCodec::crlf();
        let mut state = DecodeState::Idle;
        let mut src = BytesMut::from(&b"a\rb\r"[..]);
        assert_eq!(codec.decode(&mut state, &mut src).unwrap(), None);
        assert_eq!(state, DecodeState::Scanning { scanned: 4 });
        src.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut state, &mut src).unwrap(),
            Some(Bytes::from_static(b"a\rb"))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let codec = DelimiterCodec::new(Bytes::from_static(b"<END>"));
        let mut state = DecodeState::Idle;
        let mut src = BytesMut::from(&b"hello<EN"[..]);
        assert_eq!(codec.decode(&mut state, &mut src).unwrap(), None);
        src.extend_from_slice(b"D>rest");
        assert_eq!(
            codec.decode(&mut state, &mut src).unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(&src[..], b"rest");
    }

    #[test]
    fn test_unterminated_frame_over_max() {
        let codec = DelimiterCodec::crlf().with_max_frame_size(4);
        let mut state = DecodeState::Idle;
        // four payload bytes and a pending CR still fit
        let mut src = BytesMut::from(&b"abcd\r"[..]);
        assert_eq!(codec.decode(&mut state, &mut src).unwrap(), None);
        src.extend_from_slice(b"x");
        assert_eq!(
            codec.decode(&mut state, &mut src),
            Err(FrameError::FrameTooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn test_stx_required_between_frames() {
        let codec = StxEtxCodec::new();
        let mut state = DecodeState::Idle;
        let mut src = BytesMut::from(&b"\x02ok\x03junk"[..]);
        assert_eq!(
            codec.decode(&mut state, &mut src).unwrap(),
            Some(Bytes::from_static(b"ok"))
        );
        assert!(matches!(
            codec.decode(&mut state, &mut src),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_stx_scan_resumes_where_it_stopped() {
        let codec = StxEtxCodec::new().with_max_frame_size(6);
        let mut state = DecodeState::Idle;
        let mut src = BytesMut::from(&b"\x02abc"[..]);
        assert_eq!(codec.decode(&mut state, &mut src).unwrap(), None);
        assert_eq!(state, DecodeState::Scanning { scanned: 3 });
        src.extend_from_slice(b"def");
        assert_eq!(codec.decode(&mut state, &mut src).unwrap(), None);
        src.extend_from_slice(b"g");
        assert_eq!(
            codec.decode(&mut state, &mut src),
            Err(FrameError::FrameTooLarge { size: 7, max: 6 })
        );
    }
}
