pub mod codec;
pub mod network;
mod service;

pub use codec::{FrameError, FramingCodec};
pub use network::{
    new_factory, BufferMode, ChannelListener, ConnectionFactory, ConnectionId, ConnectionState,
    MessageListener, TcpConnection, TransportEvent,
};
pub use service::{
    setup_local_tracing, setup_local_tracing_with, setup_tracing, AppError, AppResult,
    BufferConfig, CodecConfig, CodecKind, IoModel, IoOperation, NetworkConfig, TransportConfig,
};
