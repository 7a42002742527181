#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use framewire::{
    new_factory, BufferMode, ChannelListener, CodecKind, ConnectionFactory, ConnectionId,
    IoModel, TransportConfig, TransportEvent,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(io_model: IoModel, codec: CodecKind, mode: BufferMode) -> TransportConfig {
    let mut config = TransportConfig::default()
        .with_codec(codec)
        .with_buffer_mode(mode)
        .with_socket_timeout(Duration::from_secs(5));
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.io_model = io_model;
    config.network.event_loop_threads = 2;
    config
}

pub fn factory(config: TransportConfig) -> (Box<dyn ConnectionFactory>, Receiver<TransportEvent>) {
    let (listener, events) = ChannelListener::new();
    let factory = new_factory(config, Arc::new(listener)).unwrap();
    (factory, events)
}

pub fn next_event(events: &Receiver<TransportEvent>) -> TransportEvent {
    events
        .recv_timeout(WAIT)
        .unwrap_or_else(|_| panic!("no transport event within {:?}", WAIT))
}

pub fn next_message(events: &Receiver<TransportEvent>) -> (ConnectionId, Bytes) {
    match next_event(events) {
        TransportEvent::Message(id, payload) => (id, payload),
        other => panic!("expected a message, got {:?}", other),
    }
}

/// Polls `condition` until it holds or `WAIT` runs out.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// The frame `payload` encodes to under each built-in codec.
pub fn wire_bytes(codec: CodecKind, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    match codec {
        CodecKind::LengthHeader => {
            wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            wire.extend_from_slice(payload);
        }
        CodecKind::StxEtx => {
            wire.push(0x02);
            wire.extend_from_slice(payload);
            wire.push(0x03);
        }
        CodecKind::Crlf => {
            wire.extend_from_slice(payload);
            wire.extend_from_slice(b"\r\n");
        }
        CodecKind::Delimiter => {
            wire.extend_from_slice(payload);
            wire.push(b'\n');
        }
    }
    wire
}
