//! Send command implementation.
//!
//! Offers one file to a listening peer and streams it once accepted.
//! While the transfer runs, `p` + Enter toggles pause and `c` + Enter
//! cancels.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use bluetransfer_core::config::Config;
use bluetransfer_core::file::{format_size, FileMetadata};
use bluetransfer_core::{
    ChannelPresenter, Engine, EngineConfig, PresenterEvent, TransferId, TransferStatus,
};

use super::SendArgs;
use crate::ui;

/// Keyboard command typed while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    TogglePause,
    Cancel,
}

impl Key {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_lowercase().as_str() {
            "p" | "pause" | "r" | "resume" => Some(Self::TogglePause),
            "c" | "cancel" | "q" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let global_config = super::load_config();
    let peer = super::parse_peer(&args.peer, args.port.unwrap_or(global_config.network.port))?;

    let metadata = FileMetadata::from_path(&args.file)
        .await
        .with_context(|| format!("Cannot send {}", args.file.display()))?;

    let config = sender_engine_config(&global_config, args.limit);
    let (presenter, mut events) = ChannelPresenter::new();
    let engine = Engine::new(config, presenter);
    engine.launch().await.context("Failed to start engine")?;

    if !args.quiet {
        println!();
        println!("BlueTransfer v{}", bluetransfer_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Sending '{}' ({}) to {}",
            metadata.file_name,
            format_size(metadata.size),
            peer
        );
        println!("  Waiting for the receiver to accept...");
    }

    let id = match engine.initiate_transfer_to(peer, &args.file).await {
        Ok(id) => id,
        Err(e) => {
            engine.shutdown().await;
            if e.is_recoverable() {
                eprintln!("  This may work if you try again.");
            }
            return Err(anyhow::Error::new(e).context("Transfer request failed"));
        }
    };

    if engine.snapshot(id).await?.status == TransferStatus::Rejected {
        println!("  The receiver declined the transfer.");
        engine.shutdown().await;
        return Ok(());
    }

    if !args.quiet {
        println!("  Accepted. Type p + Enter to pause or resume, c + Enter to cancel.");
        println!();
    }

    let start_time = Instant::now();
    let keys = spawn_key_reader();
    let outcome = drive(&engine, id, &mut events, keys, args.quiet).await;
    engine.shutdown().await;

    match outcome? {
        TransferStatus::Finished => {
            let elapsed = start_time.elapsed();
            println!(
                "  Sent {} in {:.1}s.",
                format_size(metadata.size),
                elapsed.as_secs_f64()
            );
            Ok(())
        }
        status => anyhow::bail!("Transfer {}", status),
    }
}

/// Engine settings for a one-shot send.
///
/// The engine still runs a listener to drive telemetry; it stays on a free
/// loopback port so the sending host takes no offers from the network.
fn sender_engine_config(global_config: &Config, limit: Option<u64>) -> EngineConfig {
    let mut config = global_config.engine_config();
    config.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.port = 0;
    if limit.is_some() {
        config.bandwidth_limit = limit;
    }
    config
}

/// Read keyboard commands from stdin in the background.
fn spawn_key_reader() -> mpsc::UnboundedReceiver<Key> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(key) = Key::parse(&line) {
                if tx.send(key).is_err() {
                    break;
                }
            }
        }
    });
    rx
}

/// Show progress and react to keys until the transfer ends.
async fn drive(
    engine: &Engine,
    id: TransferId,
    events: &mut mpsc::UnboundedReceiver<PresenterEvent>,
    mut keys: mpsc::UnboundedReceiver<Key>,
    quiet: bool,
) -> Result<TransferStatus> {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(engine.snapshot(id).await?.status);
                };
                match event {
                    PresenterEvent::Sync(transfers) => {
                        let Some(snapshot) = transfers.get(&id) else { continue };
                        if !quiet {
                            ui::redraw(&ui::progress_line(snapshot));
                        }
                        if snapshot.status.is_terminal() {
                            if !quiet {
                                println!();
                            }
                            return Ok(snapshot.status);
                        }
                    }
                    PresenterEvent::Exception(e) => {
                        eprintln!();
                        eprintln!("  Error: {}", e);
                        if let Some(hint) = e.suggestion() {
                            eprintln!("  Hint: {}", hint);
                        }
                    }
                    PresenterEvent::IncomingRequest(request) => {
                        tracing::debug!("Declining unexpected offer from {}", request.peer);
                        let _ = engine.reject_transfer(request.id).await;
                    }
                    PresenterEvent::Rejected(_) => {}
                }
            }
            Some(key) = keys.recv() => {
                let result = match key {
                    Key::TogglePause => engine.toggle_pause(id).await.map(|status| {
                        if !quiet {
                            println!();
                            println!("  Transfer {}.", status);
                        }
                    }),
                    Key::Cancel => engine.cancel_transfer(id).await,
                };
                if let Err(e) = result {
                    eprintln!();
                    eprintln!("  {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = engine.cancel_transfer(id).await;
                println!();
                return Ok(TransferStatus::Cancelled);
            }
        }
    }
}
