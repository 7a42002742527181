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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::trace;

use crate::{AppError, AppResult, IoOperation};

/// Encoded frames waiting for the socket, oldest first.
///
/// A frame the socket only partly accepted keeps its unwritten tail at the
/// front, so the next flush resumes exactly where the last one stopped.
#[derive(Debug, Default)]
pub struct WriteQueue {
    frames: VecDeque<Bytes>,
    queued_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        self.queued_bytes += frame.len();
        self.frames.push_back(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Writes queued frames until the queue is empty.
    ///
    /// `write_interest` is raised while a partly written frame waits for the
    /// socket to become writable again and lowered once everything is out.
    /// Each write that makes no progress within `timeout` fails the flush
    /// with `WriteTimeout`.
    pub async fn flush<W>(
        &mut self,
        writer: &mut W,
        timeout: Duration,
        write_interest: &AtomicBool,
    ) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(front) = self.frames.front_mut() {
            let written = match time::timeout(timeout, writer.write(&front[..])).await {
                Err(_) => {
                    return Err(AppError::WriteTimeout(format!(
                        "socket not writable within {:?}",
                        timeout
                    )))
                }
                Ok(result) => result.map_err(|err| AppError::from_io(IoOperation::Write, err))?,
            };
            if written == 0 {
                return Err(AppError::ConnectionReset(
                    "socket accepted no bytes".to_string(),
                ));
            }
            self.queued_bytes -= written;
            if written < front.len() {
                front.advance(written);
                write_interest.store(true, Ordering::Release);
                trace!(written, remaining = front.len(), "partial write");
            } else {
                self.frames.pop_front();
            }
        }
        write_interest.store(false, Ordering::Release);

        match time::timeout(timeout, writer.flush()).await {
            Err(_) => Err(AppError::WriteTimeout(format!(
                "flush did not complete within {:?}",
                timeout
            ))),
            Ok(result) => result.map_err(|err| AppError::from_io(IoOperation::Write, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::AsyncReadExt;

    use super::*;

    /// Accepts at most half of each write and every other poll is `Pending`.
    #[derive(Default)]
    struct ChokedWriter {
        written: Vec<u8>,
        choke: bool,
        pending_polls: usize,
    }

    impl AsyncWrite for ChokedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.choke = !self.choke;
            if self.choke {
                self.pending_polls += 1;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let n = buf.len().div_ceil(2);
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_writes_resume_in_order() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"\x02first\x03"));
        queue.push(Bytes::new());
        queue.push(Bytes::from_static(b"\x02second\x03"));
        assert_eq!(queue.queued_bytes(), 15);

        let mut writer = ChokedWriter::default();
        let interest = AtomicBool::new(false);
        queue
            .flush(&mut writer, Duration::from_secs(1), &interest)
            .await
            .unwrap();

        assert_eq!(writer.written, b"\x02first\x03\x02second\x03");
        assert!(writer.pending_polls > 0);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
        assert!(!interest.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_stalled_socket_times_out() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"stuck"));
        let interest = AtomicBool::new(false);

        let result = queue
            .flush(&mut StalledWriter, Duration::from_millis(20), &interest)
            .await;
        assert!(matches!(result, Err(AppError::WriteTimeout(_))));
        assert_eq!(queue.queued_bytes(), 5);
    }

    #[tokio::test]
    async fn test_small_pipe_receives_every_byte() {
        let (mut client, mut server) = tokio::io::duplex(4);
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut queue = WriteQueue::new();
        let mut expected = Vec::new();
        for i in 0..16u8 {
            let frame = vec![i; 10];
            expected.extend_from_slice(&frame);
            queue.push(Bytes::from(frame));
        }
        let interest = AtomicBool::new(false);
        queue
            .flush(&mut client, Duration::from_secs(1), &interest)
            .await
            .unwrap();
        drop(client);

        assert_eq!(reader.await.unwrap(), expected);
    }
}
