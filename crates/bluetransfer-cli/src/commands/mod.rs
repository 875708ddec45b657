//! CLI command definitions and handlers.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod listen;
pub mod send;

/// Load configuration with graceful fallback to defaults.
///
/// A broken config file is reported once and then ignored, so a typo never
/// keeps a transfer from running.
pub fn load_config() -> bluetransfer_core::config::Config {
    match bluetransfer_core::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring configuration file: {}", e);
            bluetransfer_core::config::Config::default()
        }
    }
}

/// Parse `192.168.1.20` or `192.168.1.20:15556`.
///
/// A bare address gets `default_port`.
pub fn parse_peer(peer: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = peer
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' is not an IP address or IP:port", peer))?;
    Ok(SocketAddr::new(ip, default_port))
}

/// BlueTransfer - direct peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "bluetransfer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Wait for incoming files
    Listen(ListenArgs),

    /// Send a file to a listening peer
    Send(SendArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the listen command
#[derive(Parser)]
pub struct ListenArgs {
    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Accept every request without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Port to listen on
    #[arg(short, long, env = "BLUETRANSFER_PORT")]
    pub port: Option<u16>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Receiver address (IP or IP:port)
    pub peer: String,

    /// File to send
    pub file: PathBuf,

    /// Receiver port when PEER has none
    #[arg(short, long, env = "BLUETRANSFER_PORT")]
    pub port: Option<u16>,

    /// Bandwidth limit in bytes per second
    #[arg(short, long)]
    pub limit: Option<u64>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        assert_eq!(
            parse_peer("192.168.1.20", 15556).unwrap(),
            "192.168.1.20:15556".parse().unwrap()
        );
        assert_eq!(
            parse_peer("10.0.0.1:9000", 15556).unwrap(),
            "10.0.0.1:9000".parse().unwrap()
        );
        assert_eq!(
            parse_peer("::1", 15556).unwrap(),
            "[::1]:15556".parse().unwrap()
        );
        assert!(parse_peer("laptop.local", 15556).is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["bluetransfer", "send", "10.0.0.2", "a.txt", "-l", "1000"])
            .unwrap();
        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.peer, "10.0.0.2");
                assert_eq!(args.file, PathBuf::from("a.txt"));
                assert_eq!(args.limit, Some(1000));
            }
            _ => panic!("expected send"),
        }
    }
}
