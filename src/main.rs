use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use framewire::{
    new_factory, setup_local_tracing_with, AppError, AppResult, ChannelListener, IoModel,
    TransportConfig, TransportEvent,
};

#[derive(Parser)]
#[command(version, about = "framed TCP transport")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// overrides network.io_model from the config file
    #[arg(short, long, global = true)]
    pub model: Option<Model>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Model {
    Blocking,
    Multiplexed,
}

impl From<Model> for IoModel {
    fn from(model: Model) -> Self {
        match model {
            Model::Blocking => IoModel::Blocking,
            Model::Multiplexed => IoModel::Multiplexed,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// print the effective configuration
    PrintConfig,
    /// echo every received payload back to its sender
    Serve {
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
    },
    /// send one payload and print the reply
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        message: String,
    },
}

fn log_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn load_config(conf: Option<&str>) -> AppResult<TransportConfig> {
    match conf {
        Some(path) => TransportConfig::set_up_config(PathBuf::from(path)),
        None => {
            let default_path = PathBuf::from("conf").join("framewire.toml");
            if default_path.exists() {
                TransportConfig::set_up_config(default_path)
            } else {
                Ok(TransportConfig::default())
            }
        }
    }
}

fn serve(config: TransportConfig, port: u16) -> AppResult<()> {
    let (listener, events) = ChannelListener::new();
    let factory = new_factory(config, Arc::new(listener))?;
    let local_addr = factory.listen(port)?;
    println!("echo server listening on {}", local_addr);

    for event in events {
        match event {
            TransportEvent::Message(id, payload) => match factory.connection(&id) {
                Some(connection) => {
                    if let Err(err) = connection.send(&payload) {
                        warn!(connection_id = %id, cause = %err, "echo failed");
                    }
                }
                None => warn!(connection_id = %id, "message from unknown connection"),
            },
            TransportEvent::Error(id, err) => warn!(connection_id = %id, cause = %err, "connection failed"),
            TransportEvent::Closed(id) => info!(connection_id = %id, "connection closed"),
        }
    }
    factory.shutdown();
    Ok(())
}

fn send(config: TransportConfig, host: &str, port: u16, message: &str) -> AppResult<()> {
    let timeout = config.socket_timeout();
    let (listener, events) = ChannelListener::new();
    let factory = new_factory(config, Arc::new(listener))?;
    let connection = factory.connect(host, port)?;
    connection.send(message.as_bytes())?;

    let reply = match events.recv_timeout(timeout) {
        Ok(TransportEvent::Message(_, payload)) => Ok(payload),
        Ok(TransportEvent::Error(_, err)) => Err(err),
        Ok(TransportEvent::Closed(_)) => Err(AppError::ConnectionClosed(
            "server closed before replying".to_string(),
        )),
        Err(_) => Err(AppError::ReadTimeout(format!(
            "no reply within {:?}",
            timeout
        ))),
    };
    connection.close();
    factory.shutdown();

    let reply = reply?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    setup_local_tracing_with(log_directive(commandline.verbose))?;

    let mut config = load_config(commandline.conf.as_deref())?;
    if let Some(model) = commandline.model {
        config.network.io_model = model.into();
    }
    match commandline.command {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Serve { port } => serve(config, port),
        Command::Send {
            host,
            port,
            message,
        } => send(config, &host, port, &message),
    }
}
