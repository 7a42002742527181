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

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::codec::{DecodeState, FrameError, FramingCodec};
use crate::AppError;

/// Per-connection reassembly of payloads from successive reads.
///
/// The assembler is owned by whichever reader drives the connection, so it is
/// never shared and needs no locking. Bytes that do not yet form a complete
/// frame stay buffered for the next read. Once decoding fails the error is
/// latched: every later call returns it, and only a new assembler (that is, a
/// new connection) starts over.
#[derive(Debug)]
pub struct Assembler {
    codec: FramingCodec,
    state: DecodeState,
    pending: BytesMut,
    failure: Option<FrameError>,
}

impl Assembler {
    pub fn new(codec: FramingCodec) -> Self {
        Assembler {
            codec,
            state: DecodeState::Idle,
            pending: BytesMut::with_capacity(4 * 1024),
            failure: None,
        }
    }

    /// Feeds `bytes` and hands every completed payload to `on_payload`, in
    /// stream order. Payloads completed before a decode error are still
    /// delivered.
    pub fn consume_with<F>(&mut self, bytes: &[u8], mut on_payload: F) -> Result<(), FrameError>
    where
        F: FnMut(Bytes),
    {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.pending.extend_from_slice(bytes);
        loop {
            match self.codec.decode(&mut self.state, &mut self.pending) {
                Ok(Some(payload)) => on_payload(payload),
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.latch(err)),
            }
        }
    }

    pub fn consume(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        let mut payloads = Vec::new();
        self.consume_with(bytes, |payload| payloads.push(payload))?;
        Ok(payloads)
    }

    /// Called at end of stream. Ok when the peer closed between frames.
    pub fn finish(&mut self) -> Result<(), FrameError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.codec
            .finish(&self.state, &self.pending)
            .map_err(|err| self.latch(err))
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn codec(&self) -> &FramingCodec {
        &self.codec
    }

    fn latch(&mut self, err: FrameError) -> FrameError {
        self.failure = Some(err.clone());
        err
    }
}

/// Lets the assembler drive a `tokio_util` framed reader. `Framed` owns the
/// read buffer in this mode, so `pending` stays empty.
impl Decoder for Assembler {
    type Item = Bytes;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone().into());
        }
        match self.codec.decode(&mut self.state, src) {
            Ok(payload) => Ok(payload),
            Err(err) => Err(self.latch(err).into()),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Decoder::decode(self, src)? {
            Some(payload) => Ok(Some(payload)),
            None => {
                self.codec
                    .finish(&self.state, src)
                    .map_err(|err| self.latch(err))?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leftover_bytes_kept_between_reads() {
        let mut assembler = Assembler::new(FramingCodec::length_header());
        let payloads = assembler.consume(b"\x00\x00\x00\x02hi\x00\x00").unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"hi")]);
        assert_eq!(assembler.buffered(), 2);

        let payloads = assembler.consume(b"\x00\x03abc").unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"abc")]);
        assert_eq!(assembler.buffered(), 0);
        assert!(assembler.finish().is_ok());
    }

    #[test]
    fn test_failure_is_latched() {
        let codec = FramingCodec::length_header().with_max_frame_size(4).unwrap();
        let mut assembler = Assembler::new(codec);

        let mut delivered = Vec::new();
        let result = assembler.consume_with(b"\x00\x00\x00\x01a\x00\x00\x00\x05", |payload| {
            delivered.push(payload)
        });
        // the complete frame ahead of the bad header still arrives
        assert_eq!(delivered, vec![Bytes::from_static(b"a")]);
        let expected = FrameError::FrameTooLarge { size: 5, max: 4 };
        assert_eq!(result, Err(expected.clone()));
        assert!(assembler.is_failed());

        assert_eq!(assembler.consume(b"\x00\x00\x00\x01b"), Err(expected.clone()));
        assert_eq!(assembler.finish(), Err(expected));
    }

    #[test]
    fn test_finish_mid_header() {
        let mut assembler = Assembler::new(FramingCodec::length_header());
        assembler.consume(b"\x00\x00\x00").unwrap();
        assert_eq!(
            assembler.finish(),
            Err(FrameError::MalformedHeader {
                received: 3,
                expected: 4
            })
        );
    }

    #[test]
    fn test_as_tokio_decoder() {
        let mut assembler = Assembler::new(FramingCodec::stx_etx());
        let mut src = BytesMut::from(&b"\x02one\x03\x02tw"[..]);
        assert_eq!(
            Decoder::decode(&mut assembler, &mut src).unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert_eq!(Decoder::decode(&mut assembler, &mut src).unwrap(), None);
        src.extend_from_slice(b"o\x03");
        assert_eq!(
            assembler.decode_eof(&mut src).unwrap(),
            Some(Bytes::from_static(b"two"))
        );
        assert_eq!(assembler.decode_eof(&mut src).unwrap(), None);

        src.extend_from_slice(b"\x02cut");
        assert!(matches!(
            assembler.decode_eof(&mut src),
            Err(AppError::ConnectionReset(_))
        ));
    }
}
