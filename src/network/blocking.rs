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

//! Thread-per-connection transport over `std::net` sockets.
//!
//! Each connection gets a reader thread that blocks on the socket and feeds
//! the connection's assembler. `send` writes on the calling thread under a
//! per-connection lock, so it returns once the whole frame is in the kernel
//! or the write timeout fired.

use std::io::{ErrorKind, Read, Write};
use std::net::{
    Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::{
    Assembler, BufferMode, BufferPool, ConnectionCore, ConnectionFactory, ConnectionId,
    ConnectionRegistry, ConnectionState, MessageListener, TcpConnection,
};
use crate::codec::FramingCodec;
use crate::{AppError, AppResult, IoOperation, TransportConfig};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct BlockingConnection {
    core: ConnectionCore,
    /// Kept to shut the socket down while the reader is blocked on it.
    socket: TcpStream,
    writer: Mutex<TcpStream>,
}

impl BlockingConnection {
    fn abort(&self, error: AppError) {
        if self.core.fail(error) {
            self.shutdown_socket();
        }
    }

    fn shutdown_socket(&self) {
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            trace!(connection_id = %self.core.id(), cause = %err, "socket shutdown");
        }
    }
}

impl TcpConnection for BlockingConnection {
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

    fn send(&self, payload: &[u8]) -> AppResult<()> {
        let frame = self.core.encode(payload)?;
        let mut writer = self.writer.lock();
        // the connection may have closed while this send waited for the lock
        self.core.ensure_open()?;
        let result = writer.write_all(&frame).and_then(|()| writer.flush());
        drop(writer);

        match result {
            Ok(()) => {
                trace!(connection_id = %self.core.id(), len = frame.len(), "frame written");
                Ok(())
            }
            Err(err) => {
                let error = AppError::from_io(IoOperation::Write, err);
                self.abort(error.clone());
                Err(error)
            }
        }
    }

    fn close(&self) {
        if self.core.begin_close() {
            // a send already past its state check finishes its frame first
            let writer = self.writer.lock();
            self.shutdown_socket();
            drop(writer);
            self.core.finish_close();
        }
    }
}

impl std::fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingConnection")
            .field("core", &self.core)
            .finish()
    }
}

fn read_loop(
    connection: Arc<BlockingConnection>,
    mut reader: TcpStream,
    pool: BufferPool,
    buffer_size: usize,
) {
    let core = &connection.core;
    let mut assembler = Assembler::new(core.codec().clone());
    // a direct buffer lives as long as the connection, heap buffers per read
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

        let outcome = match reader.read(&mut buffer[..]) {
            Ok(0) => core.on_end_of_stream(&mut assembler).map(|()| false),
            Ok(n) => core.on_readable(&mut assembler, &buffer[..n]).map(|()| true),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(true),
            Err(err) => Err(AppError::from_io(IoOperation::Read, err)),
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
    debug!(connection_id = %core.id(), "reader thread exited");
}

struct FactoryShared {
    config: TransportConfig,
    codec: FramingCodec,
    pool: BufferPool,
    listener: Arc<dyn MessageListener>,
    registry: Arc<ConnectionRegistry>,
    is_shutdown: AtomicBool,
}

impl FactoryShared {
    fn register(&self, stream: TcpStream) -> AppResult<Arc<BlockingConnection>> {
        let timeout = Some(self.config.socket_timeout());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let connection = Arc::new(BlockingConnection {
            core: ConnectionCore::new(
                remote_addr,
                self.codec.clone(),
                self.listener.clone(),
                Arc::downgrade(&self.registry),
            ),
            socket: stream,
            writer: Mutex::new(writer),
        });
        connection.core.mark_open();
        self.registry.insert(connection.clone());

        let pool = self.pool.clone();
        let buffer_size = self.config.buffer.size;
        let reader_connection = connection.clone();
        let spawned = thread::Builder::new()
            .name(format!("framewire-reader-{}", remote_addr))
            .spawn(move || read_loop(reader_connection, reader, pool, buffer_size));
        if let Err(err) = spawned {
            let error = AppError::from(err);
            connection.abort(error.clone());
            return Err(error);
        }

        debug!(connection_id = %connection.core.id(), "connection registered");
        if self.is_shutdown.load(Ordering::Acquire) {
            // lost the race with shutdown, whose close_all may have missed it
            connection.close();
            return Err(AppError::IllegalStateError(
                "connection factory is shut down".to_string(),
            ));
        }
        Ok(connection)
    }
}

fn accept_loop(shared: Arc<FactoryShared>, listener: TcpListener) {
    for stream in listener.incoming() {
        if shared.is_shutdown.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(err) = shared.register(stream) {
                    warn!(cause = %err, "failed to register accepted connection");
                }
            }
            Err(err) => {
                error!(cause = %err, "failed to accept");
                thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
    }
    debug!("acceptor thread exited");
}

struct Acceptor {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// Blocking client and server factory: one reader thread per connection,
/// one acceptor thread per listening port.
pub struct BlockingConnectionFactory {
    shared: Arc<FactoryShared>,
    acceptors: Mutex<Vec<Acceptor>>,
}

impl BlockingConnectionFactory {
    pub fn new(config: TransportConfig, listener: Arc<dyn MessageListener>) -> AppResult<Self> {
        config.validate()?;
        let codec = config.codec.build()?;
        let pool = BufferPool::new(config.buffer.mode, config.buffer.pool_capacity);
        Ok(BlockingConnectionFactory {
            shared: Arc::new(FactoryShared {
                config,
                codec,
                pool,
                listener,
                registry: Arc::new(ConnectionRegistry::new()),
                is_shutdown: AtomicBool::new(false),
            }),
            acceptors: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.shared.is_shutdown.load(Ordering::Acquire) {
            return Err(AppError::IllegalStateError(
                "connection factory is shut down".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where to connect to reach a listener bound to `addr`.
fn reachable_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), v4.port())
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), v6.port())
        }
        other => other,
    }
}

impl ConnectionFactory for BlockingConnectionFactory {
    #[tracing::instrument(skip(self))]
    fn connect(&self, host: &str, port: u16) -> AppResult<Arc<dyn TcpConnection>> {
        self.ensure_running()?;
        let timeout = self.shared.config.socket_timeout();
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let connection: Arc<dyn TcpConnection> = self.shared.register(stream)?;
                    return Ok(connection);
                }
                Err(err) => {
                    debug!(%addr, cause = %err, "connect attempt failed");
                    last_error = Some(AppError::from_io(IoOperation::Connect, err));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::InvalidValue(format!("{}:{} resolved to no address", host, port))
        }))
    }

    #[tracing::instrument(skip(self))]
    fn listen(&self, port: u16) -> AppResult<SocketAddr> {
        self.ensure_running()?;
        let bind_address = self.shared.config.network.bind_address.as_str();
        let listener = TcpListener::bind((bind_address, port))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "blocking server listening");

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("framewire-acceptor-{}", local_addr.port()))
            .spawn(move || accept_loop(shared, listener))?;
        self.acceptors.lock().push(Acceptor { local_addr, handle });
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
        if self.shared.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let acceptors = std::mem::take(&mut *self.acceptors.lock());
        for acceptor in acceptors {
            // a throwaway connection wakes the blocked accept
            let wake = reachable_addr(acceptor.local_addr);
            if let Err(err) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
                warn!(%wake, cause = %err, "failed to wake acceptor");
            }
            if acceptor.handle.join().is_err() {
                error!(local_addr = %acceptor.local_addr, "acceptor thread panicked");
            }
        }
        self.shared.registry.close_all();
        info!("blocking connection factory shut down");
    }
}

impl Drop for BlockingConnectionFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachable_addr_replaces_wildcard() {
        let addr: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(reachable_addr(addr), "127.0.0.1:7000".parse().unwrap());
        let addr: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        assert_eq!(reachable_addr(addr), addr);
    }
}
