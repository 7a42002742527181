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

use std::net::SocketAddr;
use std::sync::Arc;

use super::{
    BlockingConnectionFactory, BufferPool, ConnectionId, MessageListener,
    MultiplexedConnectionFactory, TcpConnection,
};
use crate::{AppResult, IoModel, TransportConfig};

/// Creates and owns framed connections.
///
/// A factory is a client (`connect`), a server (`listen`), or both. Every
/// connection it creates or accepts is registered with it until it closes,
/// and `shutdown` closes whatever is left. Factories share nothing, so two
/// of them in one process are fully independent.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> AppResult<Arc<dyn TcpConnection>>;

    /// Binds `port` (0 picks a free one), accepts in the background and
    /// returns the bound address.
    fn listen(&self, port: u16) -> AppResult<SocketAddr>;

    fn connection(&self, id: &ConnectionId) -> Option<Arc<dyn TcpConnection>>;

    fn connection_ids(&self) -> Vec<ConnectionId>;

    fn buffer_pool(&self) -> &BufferPool;

    /// Stops accepting and closes every connection. Idempotent.
    fn shutdown(&self);
}

/// Builds the factory named by `config.network.io_model`.
pub fn new_factory(
    config: TransportConfig,
    listener: Arc<dyn MessageListener>,
) -> AppResult<Box<dyn ConnectionFactory>> {
    Ok(match config.network.io_model {
        IoModel::Blocking => Box::new(BlockingConnectionFactory::new(config, listener)?),
        IoModel::Multiplexed => Box::new(MultiplexedConnectionFactory::new(config, listener)?),
    })
}
