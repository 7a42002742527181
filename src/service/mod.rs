pub use app_error::{AppError, AppResult, IoOperation};
pub use config::{
    BufferConfig, CodecConfig, CodecKind, IoModel, NetworkConfig, TransportConfig,
};
pub use tracing_config::{setup_local_tracing, setup_local_tracing_with, setup_tracing};

mod app_error;
mod config;
mod tracing_config;
