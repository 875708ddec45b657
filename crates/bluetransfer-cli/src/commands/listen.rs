//! Listen command implementation.
//!
//! Waits for peers to offer files and accepts them into the output
//! directory, asking first unless `--yes` is given.

use std::path::PathBuf;

use anyhow::{Context, Result};

use bluetransfer_core::file::format_size;
use bluetransfer_core::{ChannelPresenter, Engine, PresenterEvent, TransferSnapshot};

use super::ListenArgs;
use crate::ui;

/// Run the listen command.
pub async fn run(args: ListenArgs) -> Result<()> {
    let global_config = super::load_config();

    let output_dir = args
        .output
        .clone()
        .or_else(|| global_config.transfer.default_output.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let mut config = global_config.engine_config();
    if let Some(port) = args.port {
        config.port = port;
    }

    let (presenter, mut events) = ChannelPresenter::new();
    let engine = Engine::new(config, presenter);
    let addr = engine.launch().await.context("Failed to start listener")?;

    if !args.quiet {
        println!();
        println!("BlueTransfer v{}", bluetransfer_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Listening on {}", addr);
        println!("  Saving to {}", output_dir.display());
        println!("  Press Ctrl+C to stop.");
        println!();
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&engine, event, &output_dir, &args).await;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("  Stopping.");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn handle_event(
    engine: &Engine,
    event: PresenterEvent,
    output_dir: &std::path::Path,
    args: &ListenArgs,
) {
    match event {
        PresenterEvent::IncomingRequest(request) => {
            on_request(engine, &request, output_dir, args).await;
        }
        PresenterEvent::Sync(transfers) => {
            if args.quiet {
                return;
            }
            for snapshot in transfers.values() {
                ui::redraw(&ui::progress_line(snapshot));
                if snapshot.status.is_terminal() {
                    println!();
                    println!("  Transfer of '{}' {}.", snapshot.file_name, snapshot.status);
                }
            }
        }
        PresenterEvent::Exception(e) => {
            eprintln!();
            eprintln!("  Error: {}", e);
            if let Some(hint) = e.suggestion() {
                eprintln!("  Hint: {}", hint);
            }
        }
        PresenterEvent::Rejected(_) => {}
    }
}

async fn on_request(
    engine: &Engine,
    request: &TransferSnapshot,
    output_dir: &std::path::Path,
    args: &ListenArgs,
) {
    if !args.quiet {
        println!(
            "  {} offers '{}' ({})",
            request.peer,
            request.file_name,
            format_size(request.file_size)
        );
        println!("  SHA-256: {}", request.hash);
    }

    let accept = if args.yes {
        true
    } else {
        let prompt = format!("Accept '{}'?", request.file_name);
        tokio::task::spawn_blocking(move || ui::confirm(&prompt))
            .await
            .ok()
            .and_then(std::result::Result::ok)
            .unwrap_or(false)
    };

    if accept {
        match engine.accept_transfer(request.id, output_dir).await {
            Ok(path) => {
                if !args.quiet {
                    println!("  Receiving into {}", path.display());
                }
            }
            Err(e) => eprintln!("  Could not accept transfer: {}", e),
        }
    } else {
        match engine.reject_transfer(request.id).await {
            Ok(()) => println!("  Declined '{}'.", request.file_name),
            Err(e) => eprintln!("  Could not decline transfer: {}", e),
        }
    }
}
