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

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::codec::{FramingCodec, HeaderWidth, LengthHeaderCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::network::BufferMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoModel {
    /// One reader thread per connection.
    #[default]
    Blocking,
    /// Readiness-driven event loop shared by all connections.
    Multiplexed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address servers bind to.
    pub bind_address: String,
    /// Connect, read and write timeout.
    pub socket_timeout_ms: u64,
    pub io_model: IoModel,
    pub event_loop_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bind_address: "0.0.0.0".to_string(),
            socket_timeout_ms: 10_000,
            io_model: IoModel::Blocking,
            event_loop_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of each read buffer.
    pub size: usize,
    pub mode: BufferMode,
    /// Total bytes of read buffers a factory may hold at once.
    pub pool_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            size: 2048,
            mode: BufferMode::Heap,
            pool_capacity: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    LengthHeader,
    StxEtx,
    Crlf,
    Delimiter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub kind: CodecKind,
    pub max_frame_size: usize,
    /// Only read for `length_header`.
    pub header_width: HeaderWidth,
    /// Only read for `delimiter`.
    pub delimiter: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            kind: CodecKind::LengthHeader,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_width: HeaderWidth::Four,
            delimiter: "\n".to_string(),
        }
    }
}

impl CodecConfig {
    pub fn of(kind: CodecKind) -> Self {
        CodecConfig {
            kind,
            ..Default::default()
        }
    }

    pub fn build(&self) -> AppResult<FramingCodec> {
        let codec = match self.kind {
            CodecKind::LengthHeader => {
                FramingCodec::LengthHeader(LengthHeaderCodec::new(self.header_width))
            }
            CodecKind::StxEtx => FramingCodec::stx_etx(),
            CodecKind::Crlf => FramingCodec::crlf(),
            CodecKind::Delimiter => {
                FramingCodec::delimiter(Bytes::copy_from_slice(self.delimiter.as_bytes()))?
            }
        };
        codec.with_max_frame_size(self.max_frame_size)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: NetworkConfig,
    pub buffer: BufferConfig,
    pub codec: CodecConfig,
}

impl TransportConfig {
    /// Reads a config file, then applies `FRAMEWIRE__SECTION__KEY` environment
    /// overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("FRAMEWIRE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;
        Ok(transport_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.socket_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "network.socket_timeout_ms must be positive".to_string(),
            ));
        }
        if self.network.event_loop_threads == 0 {
            return Err(AppError::InvalidValue(
                "network.event_loop_threads must be positive".to_string(),
            ));
        }
        if self.buffer.size == 0 {
            return Err(AppError::InvalidValue(
                "buffer.size must be positive".to_string(),
            ));
        }
        if self.buffer.pool_capacity < self.buffer.size {
            return Err(AppError::InvalidValue(format!(
                "buffer.pool_capacity {} is smaller than buffer.size {}",
                self.buffer.pool_capacity, self.buffer.size
            )));
        }
        self.codec.build().map(|_| ())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.network.socket_timeout_ms)
    }

    pub fn with_codec(mut self, kind: CodecKind) -> Self {
        self.codec.kind = kind;
        self
    }

    pub fn with_buffer_mode(mut self, mode: BufferMode) -> Self {
        self.buffer.mode = mode;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.network.socket_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
