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

use std::io::{self, ErrorKind};
use std::sync::Arc;

use crate::codec::FrameError;

pub type AppResult<T> = Result<T, AppError>;

/// The socket operation an I/O error came from, used to pick the timeout variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Connect,
    Read,
    Write,
}

/// Errors are `Clone` so a failed connection can keep its cause while the
/// same error is reported to the caller and to the listener.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("connect timed out: {0}")]
    ConnectTimeout(String),

    #[error("write timed out: {0}")]
    WriteTimeout(String),

    #[error("read timed out: {0}")]
    ReadTimeout(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of length {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("buffer pool exhausted: requested {requested} bytes, {available} available")]
    BufferExhausted { requested: usize, available: usize },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(Arc<io::Error>),

    #[error("config file error: {0}")]
    ConfigFileError(Arc<config::ConfigError>),
}

impl AppError {
    /// Classifies a socket error into the transport taxonomy.
    pub fn from_io(operation: IoOperation, err: io::Error) -> AppError {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => match operation {
                IoOperation::Connect => AppError::ConnectTimeout(err.to_string()),
                IoOperation::Read => AppError::ReadTimeout(err.to_string()),
                IoOperation::Write => AppError::WriteTimeout(err.to_string()),
            },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => AppError::ConnectionReset(err.to_string()),
            _ => AppError::IoError(Arc::new(err)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AppError::ConnectTimeout(_) | AppError::ReadTimeout(_) | AppError::WriteTimeout(_)
        )
    }
}

impl From<io::Error> for AppError {
    fn from(value: io::Error) -> Self {
        AppError::IoError(Arc::new(value))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(value: config::ConfigError) -> Self {
        AppError::ConfigFileError(Arc::new(value))
    }
}

impl From<FrameError> for AppError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::FrameTooLarge { size, max } => AppError::FrameTooLarge { size, max },
            FrameError::MalformedFrame(msg) => AppError::MalformedFrame(msg),
            err @ FrameError::MalformedHeader { .. } => AppError::MalformedFrame(err.to_string()),
            err @ FrameError::Truncated(_) => AppError::ConnectionReset(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_follows_operation() {
        let err = io::Error::new(ErrorKind::WouldBlock, "resource temporarily unavailable");
        assert!(matches!(
            AppError::from_io(IoOperation::Read, err),
            AppError::ReadTimeout(_)
        ));
        let err = io::Error::new(ErrorKind::TimedOut, "timed out");
        assert!(matches!(
            AppError::from_io(IoOperation::Write, err),
            AppError::WriteTimeout(_)
        ));
        let err = io::Error::new(ErrorKind::TimedOut, "timed out");
        assert!(AppError::from_io(IoOperation::Connect, err).is_timeout());
    }

    #[test]
    fn test_peer_failures_are_resets() {
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::BrokenPipe,
            ErrorKind::ConnectionAborted,
        ] {
            let err = io::Error::new(kind, "peer gone");
            assert!(matches!(
                AppError::from_io(IoOperation::Write, err),
                AppError::ConnectionReset(_)
            ));
        }
        let err = io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            AppError::from_io(IoOperation::Read, err),
            AppError::IoError(_)
        ));
    }

    #[test]
    fn test_frame_errors_map_into_taxonomy() {
        let err: AppError = FrameError::FrameTooLarge { size: 10, max: 4 }.into();
        assert!(matches!(err, AppError::FrameTooLarge { size: 10, max: 4 }));
        let err: AppError = FrameError::MalformedHeader {
            received: 2,
            expected: 4,
        }
        .into();
        assert!(matches!(err, AppError::MalformedFrame(_)));
        let err: AppError = FrameError::Truncated(3).into();
        assert!(matches!(err, AppError::ConnectionReset(_)));
    }
}
