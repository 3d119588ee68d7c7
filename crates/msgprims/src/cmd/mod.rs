use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use msgprims_peer::MessagingManager;

use crate::config::ConfigFile;
use crate::exit::{messaging_error, transport_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod info;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and reply to every message with its own body.
    Echo(EchoArgs),
    /// Send one message to a peer.
    Send(SendArgs),
    /// Accept connections and print received messages.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run a primary handshake against a peer and print what it negotiated.
    Info(InfoArgs),
}

/// Settings shared by every command.
pub struct Context {
    pub format: OutputFormat,
    pub config: ConfigFile,
}

pub fn run(command: Command, ctx: &Context) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, ctx),
        Command::Send(args) => send::run(args, ctx),
        Command::Listen(args) => listen::run(args, ctx),
        Command::Version(args) => version::run(args),
        Command::Info(args) => info::run(args, ctx),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to listen on (host:port).
    pub addr: String,
    /// Also answer as these named receivers (comma-separated).
    #[arg(long = "receiver", value_delimiter = ',')]
    pub receivers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Peer address (host:port).
    pub addr: String,
    /// JSON body.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string body.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read the body from a file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Application message type.
    #[arg(long = "type", value_name = "N")]
    pub message_type: Option<i32>,
    /// Deadline for connecting and for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Do not wait for a reply.
    #[arg(long = "async")]
    pub asynch: bool,
    /// Address the message to a named receiver.
    #[arg(long)]
    pub receiver: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to listen on (host:port).
    pub addr: String,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Advertise these named receivers (comma-separated).
    #[arg(long = "receiver", value_delimiter = ',')]
    pub receivers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Peer address (host:port).
    pub addr: String,
    /// Connect and handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

pub fn resolve_addr(addr: &str) -> CliResult<SocketAddr> {
    msgprims_transport::resolve(addr).map_err(|err| transport_error("invalid address", err))
}

/// Start a messaging system configured from the config file: its metadata
/// is published and its destinations are connected.
pub fn start_manager(ctx: &Context, bind: Option<SocketAddr>) -> CliResult<MessagingManager> {
    let manager = MessagingManager::start(ctx.config.messaging_config(), bind)
        .map_err(|err| messaging_error("start failed", err))?;
    for (key, value) in ctx.config.field_metadata() {
        manager.set_metadata(key, value);
    }
    for destination in &ctx.config.destinations {
        manager.add_destination(resolve_addr(destination)?);
    }
    Ok(manager)
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn resolve_addr_rejects_garbage() {
        let err = resolve_addr("not an address").unwrap_err();
        assert_eq!(err.code, USAGE);
        assert!(resolve_addr("127.0.0.1:7400").is_ok());
    }
}
