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

//! Event-loop transport.
//!
//! A factory owns a tokio runtime with `event_loop_threads` workers. Every
//! connection runs a reader task and a writer task on it; `send` only encodes
//! and queues, the writer task drains the queue whenever the socket is
//! writable.
//!
//! `close` cancels only the reader: the writer drains every frame accepted
//! before the close, then shuts its half of the socket down. Cancelling the
//! factory token, on shutdown or failure, stops both tasks at once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{self, Runtime};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    Assembler, BufferMode, BufferPool, ConnectionCore, ConnectionFactory, ConnectionId,
    ConnectionRegistry, ConnectionState, MessageListener, TcpConnection, WriteQueue,
};
use crate::codec::FramingCodec;
use crate::{AppError, AppResult, IoOperation, TransportConfig};

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct MultiplexedConnection {
    core: ConnectionCore,
    /// Taken on close; the writer drains the channel once it is gone.
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    write_interest: AtomicBool,
    /// Stops both tasks.
    cancel: CancellationToken,
    /// Child of `cancel` that stops only the reader.
    read_cancel: CancellationToken,
}

impl MultiplexedConnection {
    /// True while a frame is partly written and the writer waits for the
    /// socket to drain.
    pub fn has_pending_writes(&self) -> bool {
        self.write_interest.load(Ordering::Acquire)
    }

    fn abort(&self, error: AppError) {
        if self.core.fail(error) {
            self.cancel.cancel();
        }
    }

    /// Like `abort`, but also fails a connection whose close is still draining.
    fn abort_write(&self, error: AppError) {
        if self.core.fail(error.clone()) || self.core.fail_closing(error) {
            self.cancel.cancel();
        }
    }
}

impl TcpConnection for MultiplexedConnection {
    fn id(&self) -> &ConnectionId {
        self.core.id()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.core.remote_addr()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn failure(&self) -> Option<AppError> {
        self.core.failure()
    }

    /// Queues the frame for the writer task. Write failures surface later
    /// through the listener's `on_error`.
    fn send(&self, payload: &[u8]) -> AppResult<()> {
        let frame = self.core.encode(payload)?;
        let outbound = self.outbound.lock();
        let sent = match outbound.as_ref() {
            Some(outbound) => outbound.send(frame).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(AppError::ConnectionClosed(format!(
                "connection {} no longer accepts frames",
                self.core.id()
            )))
        }
    }

    /// Returns at once; the connection reaches `Closed` when the writer has
    /// flushed what was already queued.
    fn close(&self) {
        if self.core.begin_close() {
            drop(self.outbound.lock().take());
            self.read_cancel.cancel();
            if self.cancel.is_cancelled() {
                // the writer has already stopped and will not finish the close
                self.core.finish_close();
            }
        }
    }
}

impl std::fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("core", &self.core)
            .field("write_interest", &self.has_pending_writes())
            .finish()
    }
}

async fn read_loop(
    connection: Arc<MultiplexedConnection>,
    mut reader: OwnedReadHalf,
    pool: BufferPool,
    buffer_size: usize,
    timeout: Duration,
) {
    let core = &connection.core;
    let mut assembler = Assembler::new(core.codec().clone());
    let mut bound = match pool.mode() {
        BufferMode::Direct => match pool.acquire(buffer_size) {
            Ok(buffer) => Some(buffer),
            Err(err) => {
                connection.abort(err);
                return;
            }
        },
        BufferMode::Heap => None,
    };

    loop {
        let mut scratch = None;
        let buffer = match bound.as_mut() {
            Some(buffer) => buffer,
            None => match pool.acquire(buffer_size) {
                Ok(buffer) => scratch.insert(buffer),
                Err(err) => {
                    connection.abort(err);
                    break;
                }
            },
        };

        let read = tokio::select! {
            _ = connection.read_cancel.cancelled() => break,
            read = time::timeout(timeout, reader.read(&mut buffer[..])) => read,
        };
        let outcome = match read {
            Err(_) => Err(AppError::ReadTimeout(format!(
                "no data within {:?}",
                timeout
            ))),
            Ok(Ok(0)) => core.on_end_of_stream(&mut assembler).map(|()| false),
            Ok(Ok(n)) => core.on_readable(&mut assembler, &buffer[..n]).map(|()| true),
            Ok(Err(err)) => Err(AppError::from_io(IoOperation::Read, err)),
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection_id = %core.id(), "peer closed connection");
                connection.close();
                break;
            }
            Err(err) => {
                connection.abort(err);
                break;
            }
        }
    }

    drop(bound);
    debug!(connection_id = %core.id(), "reader task exited");
}

/// What the writer task owns. Dropping it settles a closing connection,
/// including when the runtime drops the task at shutdown.
struct WriterState {
    connection: Arc<MultiplexedConnection>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    queue: WriteQueue,
}

impl Drop for WriterState {
    fn drop(&mut self) {
        if self.connection.core.state() != ConnectionState::Closing {
            return;
        }
        self.outbound.close();
        while let Ok(frame) = self.outbound.try_recv() {
            self.queue.push(frame);
        }
        match self.queue.queued_bytes() {
            0 => self.connection.core.finish_close(),
            unsent => self.connection.abort_write(AppError::ConnectionClosed(format!(
                "{} queued bytes were not written before shutdown",
                unsent
            ))),
        }
    }
}

async fn write_loop(mut state: WriterState, mut writer: OwnedWriteHalf, timeout: Duration) {
    let connection = state.connection.clone();
    loop {
        let frame = tokio::select! {
            _ = connection.cancel.cancelled() => return,
            frame = state.outbound.recv() => frame,
        };
        match frame {
            Some(frame) => state.queue.push(frame),
            // close() dropped the sender and every earlier frame is out
            None => break,
        }
        while let Ok(frame) = state.outbound.try_recv() {
            state.queue.push(frame);
        }

        let flushed = tokio::select! {
            _ = connection.cancel.cancelled() => return,
            flushed = state.queue.flush(&mut writer, timeout, &connection.write_interest) => flushed,
        };
        if let Err(err) = flushed {
            connection.abort_write(err);
            return;
        }
    }

    match time::timeout(timeout, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => trace!(connection_id = %connection.id(), cause = %err, "write shutdown"),
        Err(_) => trace!(connection_id = %connection.id(), "write shutdown timed out"),
    }
    trace!(connection_id = %connection.id(), "writer task drained");
}

struct FactoryShared {
    config: TransportConfig,
    codec: FramingCodec,
    pool: BufferPool,
    listener: Arc<dyn MessageListener>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl FactoryShared {
    /// Must run inside the factory runtime.
    fn register(&self, stream: TcpStream) -> AppResult<Arc<MultiplexedConnection>> {
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let read_cancel = cancel.child_token();

        let connection = Arc::new(MultiplexedConnection {
            core: ConnectionCore::new(
                remote_addr,
                self.codec.clone(),
                self.listener.clone(),
                Arc::downgrade(&self.registry),
            ),
            outbound: Mutex::new(Some(outbound)),
            write_interest: AtomicBool::new(false),
            cancel,
            read_cancel,
        });
        connection.core.mark_open();
        self.registry.insert(connection.clone());

        let timeout = self.config.socket_timeout();
        tokio::spawn(read_loop(
            connection.clone(),
            reader,
            self.pool.clone(),
            self.config.buffer.size,
            timeout,
        ));
        let writer_state = WriterState {
            connection: connection.clone(),
            outbound: outbound_rx,
            queue: WriteQueue::new(),
        };
        tokio::spawn(write_loop(writer_state, writer, timeout));

        debug!(connection_id = %connection.core.id(), "connection registered");
        if self.cancel.is_cancelled() {
            // lost the race with shutdown, whose close_all may have missed it
            connection.close();
            return Err(AppError::IllegalStateError(
                "connection factory is shut down".to_string(),
            ));
        }
        Ok(connection)
    }
}

/// Accepts with exponential backoff, giving up once the wait would exceed
/// 64 rounds.
async fn accept(listener: &TcpListener) -> AppResult<TcpStream> {
    let mut backoff = 1;
    loop {
        match listener.accept().await {
            Ok((socket, _)) => return Ok(socket),
            Err(err) => {
                if backoff > 64 {
                    return Err(err.into());
                }
                warn!(cause = %err, backoff, "accept failed, retrying");
            }
        }
        time::sleep(Duration::from_millis(backoff * 10)).await;
        backoff *= 2;
    }
}

async fn accept_loop(shared: Arc<FactoryShared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = accept(&listener) => accepted,
        };
        match accepted {
            Ok(stream) => {
                if let Err(err) = shared.register(stream) {
                    warn!(cause = %err, "failed to register accepted connection");
                }
            }
            Err(err) => {
                error!(cause = %err, "acceptor giving up");
                break;
            }
        }
    }
    debug!("acceptor task exited");
}

/// Event-loop client and server factory.
///
/// `connect` and `listen` block the caller on the factory runtime. Called
/// from async code, a listener callback included, they fail with
/// `IllegalStateError` instead.
pub struct MultiplexedConnectionFactory {
    shared: Arc<FactoryShared>,
    handle: runtime::Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl MultiplexedConnectionFactory {
    pub fn new(config: TransportConfig, listener: Arc<dyn MessageListener>) -> AppResult<Self> {
        config.validate()?;
        let codec = config.codec.build()?;
        let pool = BufferPool::new(config.buffer.mode, config.buffer.pool_capacity);
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(config.network.event_loop_threads)
            .thread_name("framewire-event-loop")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(MultiplexedConnectionFactory {
            shared: Arc::new(FactoryShared {
                config,
                codec,
                pool,
                listener,
                registry: Arc::new(ConnectionRegistry::new()),
                cancel: CancellationToken::new(),
            }),
            handle,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(AppError::IllegalStateError(
                "connection factory is shut down".to_string(),
            ));
        }
        if runtime::Handle::try_current().is_ok() {
            return Err(AppError::IllegalStateError(
                "cannot block on the event loop from async code".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConnectionFactory for MultiplexedConnectionFactory {
    #[tracing::instrument(skip(self))]
    fn connect(&self, host: &str, port: u16) -> AppResult<Arc<dyn TcpConnection>> {
        self.ensure_running()?;
        let shared = self.shared.clone();
        let timeout = shared.config.socket_timeout();
        let connection = self.handle.block_on(async move {
            let stream = match time::timeout(timeout, TcpStream::connect((host, port))).await {
                Ok(result) => result.map_err(|err| AppError::from_io(IoOperation::Connect, err))?,
                Err(_) => {
                    return Err(AppError::ConnectTimeout(format!(
                        "{}:{} not reached within {:?}",
                        host, port, timeout
                    )))
                }
            };
            shared.register(stream)
        })?;
        Ok(connection as Arc<dyn TcpConnection>)
    }

    #[tracing::instrument(skip(self))]
    fn listen(&self, port: u16) -> AppResult<SocketAddr> {
        self.ensure_running()?;
        let bind_address = self.shared.config.network.bind_address.as_str();
        let listener = self
            .handle
            .block_on(TcpListener::bind((bind_address, port)))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "multiplexed server listening");
        self.handle
            .spawn(accept_loop(self.shared.clone(), listener));
        Ok(local_addr)
    }

    fn connection(&self, id: &ConnectionId) -> Option<Arc<dyn TcpConnection>> {
        self.shared.registry.get(id)
    }

    fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    fn buffer_pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        // close first so each writer settles its connection when cancelled
        self.shared.registry.close_all();
        self.shared.cancel.cancel();
        // a runtime cannot block on its shutdown from inside async code
        if runtime::Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }
        info!("multiplexed connection factory shut down");
    }
}

impl Drop for MultiplexedConnectionFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
