//! Network Module Implementation
//!
//! Framed TCP connections and the factories that create them.
//!
//! # Architecture
//!
//! Bytes read from a socket go through a per-connection [`Assembler`], which
//! turns an arbitrarily chunked stream into whole payloads and hands each one
//! to the factory's [`MessageListener`]. Outgoing payloads are framed by the
//! connection's codec before they reach the socket.
//!
//! Two I/O models implement [`ConnectionFactory`]:
//! - [`BlockingConnectionFactory`]: a reader thread per connection, sends
//!   write synchronously on the calling thread
//! - [`MultiplexedConnectionFactory`]: a shared tokio event loop, sends are
//!   queued and drained by a writer task
//!
//! # Components
//!
//! - `BufferPool`: read buffers, heap or memory-mapped, bounded by capacity
//! - `ConnectionRegistry`: open connections of one factory
//! - `WriteQueue`: pending frames of a multiplexed connection

pub use assembler::Assembler;
pub use blocking::{BlockingConnection, BlockingConnectionFactory};
pub use buffer_pool::{BufferMode, BufferPool, PooledBuffer};
pub(crate) use connection::ConnectionCore;
pub use connection::{ConnectionId, ConnectionState, TcpConnection};
pub use factory::{new_factory, ConnectionFactory};
pub use listener::{ChannelListener, MessageListener, TransportEvent};
pub use multiplexed::{MultiplexedConnection, MultiplexedConnectionFactory};
pub use registry::ConnectionRegistry;
pub use write_queue::WriteQueue;

mod assembler;
mod blocking;
mod buffer_pool;
mod connection;
mod factory;
mod listener;
mod multiplexed;
mod registry;
mod write_queue;
