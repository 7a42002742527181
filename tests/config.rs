use std::io::Write;
use std::time::Duration;

use framewire::{AppError, BufferMode, CodecKind, IoModel, TransportConfig};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_file_values_override_defaults() {
    let file = write_config(
        r#"
        [network]
        io_model = "multiplexed"
        event_loop_threads = 4

        [buffer]
        mode = "direct"
        size = 4096

        [codec]
        kind = "delimiter"
        delimiter = "||"
        max_frame_size = 1024
        "#,
    );
    let config = TransportConfig::set_up_config(file.path()).unwrap();

    assert_eq!(config.network.io_model, IoModel::Multiplexed);
    assert_eq!(config.network.event_loop_threads, 4);
    assert_eq!(config.network.bind_address, "0.0.0.0");
    assert_eq!(config.buffer.mode, BufferMode::Direct);
    assert_eq!(config.buffer.size, 4096);
    assert_eq!(config.codec.kind, CodecKind::Delimiter);

    let codec = config.codec.build().unwrap();
    assert_eq!(codec.name(), "delimiter");
    assert_eq!(codec.max_frame_size(), 1024);
    assert_eq!(&codec.encode_to_bytes(b"ab").unwrap()[..], b"ab||");
}

#[test]
fn test_narrow_length_header_from_file() {
    let file = write_config(
        r#"
        [codec]
        kind = "length_header"
        header_width = 2
        "#,
    );
    let config = TransportConfig::set_up_config(file.path()).unwrap();
    let codec = config.codec.build().unwrap();
    assert_eq!(&codec.encode_to_bytes(b"abc").unwrap()[..], b"\x00\x03abc");
    assert_eq!(codec.max_frame_size(), u16::MAX as usize);
}

#[test]
fn test_environment_overrides_file() {
    let file = write_config(
        r#"
        [buffer]
        pool_capacity = 1048576
        "#,
    );
    std::env::set_var("FRAMEWIRE__BUFFER__POOL_CAPACITY", "65536");
    let config = TransportConfig::set_up_config(file.path());
    std::env::remove_var("FRAMEWIRE__BUFFER__POOL_CAPACITY");

    assert_eq!(config.unwrap().buffer.pool_capacity, 65536);
}

#[test]
fn test_invalid_file_rejected() {
    let file = write_config(
        r#"
        [network]
        socket_timeout_ms = 0
        "#,
    );
    assert!(matches!(
        TransportConfig::set_up_config(file.path()),
        Err(AppError::InvalidValue(_))
    ));

    let file = write_config(
        r#"
        [codec]
        header_width = 3
        "#,
    );
    assert!(TransportConfig::set_up_config(file.path()).is_err());

    assert!(matches!(
        TransportConfig::set_up_config("does/not/exist.toml"),
        Err(AppError::ConfigFileError(_))
    ));
}

#[test]
fn test_builder_helpers() {
    let config = TransportConfig::default()
        .with_codec(CodecKind::StxEtx)
        .with_buffer_mode(BufferMode::Direct)
        .with_socket_timeout(Duration::from_millis(250));
    config.validate().unwrap();
    assert_eq!(config.socket_timeout(), Duration::from_millis(250));
    assert_eq!(config.codec.build().unwrap().name(), "stx_etx");
}
