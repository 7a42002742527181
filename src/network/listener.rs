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

use std::sync::mpsc;

use bytes::Bytes;
use tracing::debug;

use super::ConnectionId;
use crate::AppError;

/// Receives what the transport decodes.
///
/// Callbacks run on the connection's reader (a reader thread, or an event
/// loop thread for multiplexed factories) and must not block for long.
pub trait MessageListener: Send + Sync + 'static {
    /// One fully reassembled payload.
    fn on_message(&self, connection_id: &ConnectionId, payload: Bytes);

    /// The connection failed and is now closed.
    fn on_error(&self, connection_id: &ConnectionId, error: &AppError);

    /// The connection closed without error.
    fn on_closed(&self, _connection_id: &ConnectionId) {}
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ConnectionId, Bytes),
    Error(ConnectionId, AppError),
    Closed(ConnectionId),
}

/// Forwards every callback into a channel.
#[derive(Debug)]
pub struct ChannelListener {
    events: mpsc::Sender<TransportEvent>,
}

impl ChannelListener {
    pub fn new() -> (ChannelListener, mpsc::Receiver<TransportEvent>) {
        let (events, receiver) = mpsc::channel();
        (ChannelListener { events }, receiver)
    }

    fn forward(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("transport event dropped, receiver has gone away");
        }
    }
}

impl MessageListener for ChannelListener {
    fn on_message(&self, connection_id: &ConnectionId, payload: Bytes) {
        self.forward(TransportEvent::Message(connection_id.clone(), payload));
    }

    fn on_error(&self, connection_id: &ConnectionId, error: &AppError) {
        self.forward(TransportEvent::Error(connection_id.clone(), error.clone()));
    }

    fn on_closed(&self, connection_id: &ConnectionId) {
        self.forward(TransportEvent::Closed(connection_id.clone()));
    }
}
