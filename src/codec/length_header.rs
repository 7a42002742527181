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
use serde::{Deserialize, Serialize};

use super::{DecodeState, FrameError, DEFAULT_MAX_FRAME_SIZE};

/// Width of the unsigned big-endian length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum HeaderWidth {
    One,
    Two,
    #[default]
    Four,
}

impl HeaderWidth {
    pub fn len(self) -> usize {
        match self {
            HeaderWidth::One => 1,
            HeaderWidth::Two => 2,
            HeaderWidth::Four => 4,
        }
    }

    /// Largest length the header can carry.
    pub fn max_len(self) -> usize {
        match self {
            HeaderWidth::One => u8::MAX as usize,
            HeaderWidth::Two => u16::MAX as usize,
            HeaderWidth::Four => u32::MAX as usize,
        }
    }

    fn read(self, src: &[u8]) -> usize {
        let mut src = src;
        match self {
            HeaderWidth::One => src.get_u8() as usize,
            HeaderWidth::Two => src.get_u16() as usize,
            HeaderWidth::Four => src.get_u32() as usize,
        }
    }

    fn write(self, len: usize, dst: &mut BytesMut) {
        match self {
            HeaderWidth::One => dst.put_u8(len as u8),
            HeaderWidth::Two => dst.put_u16(len as u16),
            HeaderWidth::Four => dst.put_u32(len as u32),
        }
    }
}

impl TryFrom<u8> for HeaderWidth {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HeaderWidth::One),
            2 => Ok(HeaderWidth::Two),
            4 => Ok(HeaderWidth::Four),
            other => Err(format!("length header width must be 1, 2 or 4, got {}", other)),
        }
    }
}

impl From<HeaderWidth> for u8 {
    fn from(value: HeaderWidth) -> Self {
        value.len() as u8
    }
}

#[derive(Debug, Clone)]
pub struct LengthHeaderCodec {
    header_width: HeaderWidth,
    max_frame_size: usize,
}

impl LengthHeaderCodec {
    pub fn new(header_width: HeaderWidth) -> Self {
        LengthHeaderCodec {
            header_width,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn header_width(&self) -> HeaderWidth {
        self.header_width
    }

    /// The configured maximum, narrowed to what the header can express.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.min(self.header_width.max_len())
    }

    pub(super) fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        let max = self.max_frame_size();
        if payload.len() > max {
            return Err(FrameError::FrameTooLarge {
                size: payload.len(),
                max,
            });
        }
        dst.reserve(self.header_width.len() + payload.len());
        self.header_width.write(payload.len(), dst);
        dst.extend_from_slice(payload);
        Ok(())
    }

    pub(super) fn decode(
        &self,
        state: &mut DecodeState,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, FrameError> {
        let len = match *state {
            DecodeState::Body { len } => len,
            _ => {
                let width = self.header_width.len();
                if src.len() < width {
                    return Ok(None);
                }
                let len = self.header_width.read(&src[..width]);
                // reject before any body byte is consumed
                let max = self.max_frame_size();
                if len > max {
                    return Err(FrameError::FrameTooLarge { size: len, max });
                }
                src.advance(width);
                *state = DecodeState::Body { len };
                len
            }
        };

        if src.len() < len {
            return Ok(None);
        }
        *state = DecodeState::Idle;
        Ok(Some(src.split_to(len).freeze()))
    }
}
