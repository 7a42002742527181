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

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Assembler, ConnectionRegistry, MessageListener};
use crate::codec::FramingCodec;
use crate::{AppError, AppResult};

/// `host:port:uuid`, unique per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn generate(remote_addr: &SocketAddr) -> Self {
        ConnectionId(
            format!(
                "{}:{}:{}",
                remote_addr.ip(),
                remote_addr.port(),
                Uuid::new_v4()
            )
            .into(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `Connecting -> Open -> Closing -> Closed`, or `Failed` from `Open` or from a
/// `Closing` connection whose last writes did not go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Closed by an error; the error stays available through `failure()`.
    Failed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// A framed TCP connection, whichever I/O model drives it.
pub trait TcpConnection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    fn remote_addr(&self) -> SocketAddr;

    fn state(&self) -> ConnectionState;

    /// The error that moved the connection to `Failed`.
    fn failure(&self) -> Option<AppError>;

    /// Frames `payload` with the connection's codec and transmits it. Sends
    /// on one connection go out in call order.
    fn send(&self, payload: &[u8]) -> AppResult<()>;

    /// Stops accepting sends, writes out what earlier sends accepted, then
    /// releases the socket and any buffer bound to it. Closing twice is a no-op.
    fn close(&self);

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    failure: Option<AppError>,
}

/// State shared by both connection types: identity, codec, lifecycle and the
/// listener that decoded payloads go to.
pub(crate) struct ConnectionCore {
    id: ConnectionId,
    remote_addr: SocketAddr,
    codec: FramingCodec,
    listener: Arc<dyn MessageListener>,
    registry: Weak<ConnectionRegistry>,
    lifecycle: Mutex<Lifecycle>,
}

impl ConnectionCore {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        codec: FramingCodec,
        listener: Arc<dyn MessageListener>,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        ConnectionCore {
            id: ConnectionId::generate(&remote_addr),
            remote_addr,
            codec,
            listener,
            registry,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                failure: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn codec(&self) -> &FramingCodec {
        &self.codec
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub(crate) fn failure(&self) -> Option<AppError> {
        self.lifecycle.lock().failure.clone()
    }

    pub(crate) fn mark_open(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ConnectionState::Connecting {
            lifecycle.state = ConnectionState::Open;
        }
    }

    pub(crate) fn ensure_open(&self) -> AppResult<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            state => Err(AppError::ConnectionClosed(format!(
                "connection {} is {:?}",
                self.id, state
            ))),
        }
    }

    /// Encodes outside the socket path; an oversized payload fails the send,
    /// not the connection.
    pub(crate) fn encode(&self, payload: &[u8]) -> AppResult<Bytes> {
        self.ensure_open()?;
        Ok(self.codec.encode_to_bytes(payload)?)
    }

    /// Moves to `Closing`. Only the caller that gets `true` tears the socket down.
    pub(crate) fn begin_close(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                lifecycle.state = ConnectionState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Completes a close started by `begin_close`. No-op in any other state.
    pub(crate) fn finish_close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConnectionState::Closing {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
        }
        self.deregister();
        debug!(connection_id = %self.id, "connection closed");
        self.listener.on_closed(&self.id);
    }

    /// Moves an open connection to `Failed` and reports `error` upward. Returns
    /// `false` when the connection was already closing, in which case the
    /// error is a side effect of that close and is not reported.
    pub(crate) fn fail(&self, error: AppError) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                ConnectionState::Connecting | ConnectionState::Open => {
                    lifecycle.state = ConnectionState::Failed;
                    lifecycle.failure = Some(error.clone());
                }
                state => {
                    trace!(connection_id = %self.id, ?state, cause = %error, "ignoring error on closed connection");
                    return false;
                }
            }
        }
        warn!(connection_id = %self.id, cause = %error, "connection failed");
        self.deregister();
        self.listener.on_error(&self.id, &error);
        true
    }

    /// Fails a connection that is still flushing after `begin_close`, so frames
    /// accepted by `send` are never dropped without an error.
    pub(crate) fn fail_closing(&self, error: AppError) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConnectionState::Closing {
                return false;
            }
            lifecycle.state = ConnectionState::Failed;
            lifecycle.failure = Some(error.clone());
        }
        warn!(connection_id = %self.id, cause = %error, "connection failed while closing");
        self.deregister();
        self.listener.on_error(&self.id, &error);
        true
    }

    /// Feeds freshly read bytes to the assembler and delivers each payload.
    pub(crate) fn on_readable(&self, assembler: &mut Assembler, bytes: &[u8]) -> AppResult<()> {
        trace!(connection_id = %self.id, len = bytes.len(), "bytes read");
        assembler
            .consume_with(bytes, |payload| {
                self.listener.on_message(&self.id, payload);
            })
            .map_err(AppError::from)
    }

    /// Handles end of stream: a clean close between frames, or an error when
    /// the peer went away mid-frame.
    pub(crate) fn on_end_of_stream(&self, assembler: &mut Assembler) -> AppResult<()> {
        assembler.finish().map_err(AppError::from)
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("codec", &self.codec.name())
            .field("state", &self.state())
            .finish()
    }
}
