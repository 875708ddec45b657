//! Connection listener and per-connection message handler.
//!
//! Every TCP connection carries exactly one transfer. Inbound connections
//! start with a REQUEST that registers the transfer; outbound connections
//! are handed to [`run_handler`] by the engine once the peer accepted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use super::{
    configure_tcp_keepalive, ConnectionWriter, EngineContext, TransferDirection, TransferEntry,
    TransferStatus,
};
use crate::error::{Error, Result};
use crate::protocol::{self, Frame, MessageType, RequestPayload};

/// What the handler does after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Accept connections forever, spawning a handler for each.
pub(crate) async fn run_listener(listener: TcpListener, ctx: Arc<EngineContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::info!("Connection from {}", peer_addr);
                if let Err(e) = configure_tcp_keepalive(&stream) {
                    tracing::warn!("Failed to enable keep-alive for {}: {}", peer_addr, e);
                }
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_incoming(stream, peer_addr, ctx).await;
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                // back off so fd exhaustion does not spin the loop
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Register the transfer announced by the first frame, then drive it.
async fn handle_incoming(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<EngineContext>) {
    let (mut reader, writer) = stream.into_split();
    let connection = Arc::new(ConnectionWriter::new(writer, peer_addr));

    let entry = match register_request(&mut reader, &connection, &ctx).await {
        Ok(entry) => entry,
        Err(e) => {
            connection.close().await;
            if e.is_disconnect() {
                tracing::debug!("{} disconnected before sending a request", peer_addr);
            } else {
                tracing::warn!("Dropping connection from {}: {}", peer_addr, e);
                ctx.presenter.exception_happened(e);
            }
            return;
        }
    };

    tracing::info!(
        "Incoming transfer {} of '{}' ({} bytes) from {}",
        entry.id(),
        entry.file_name(),
        entry.file_size(),
        peer_addr
    );
    ctx.presenter
        .present_incoming_transfer_request(entry.snapshot().await);

    run_handler(reader, entry, ctx).await;
}

async fn register_request(
    reader: &mut OwnedReadHalf,
    connection: &Arc<ConnectionWriter>,
    ctx: &EngineContext,
) -> Result<Arc<TransferEntry>> {
    let frame = protocol::read_frame(reader).await?;
    if frame.message_type() != MessageType::Request {
        return Err(Error::UnexpectedMessage {
            expected: MessageType::Request.to_string(),
            actual: frame.message_type().to_string(),
        });
    }

    let request: RequestPayload = protocol::decode_payload(&frame.payload)?;
    let entry = Arc::new(TransferEntry::new(
        frame.transfer_id(),
        request,
        TransferDirection::Inbound,
        None,
        Arc::clone(connection),
    ));
    ctx.registry.insert(Arc::clone(&entry)).await?;
    Ok(entry)
}

/// Read frames for `entry` until it reaches a terminal status or the
/// connection fails.
pub(crate) async fn run_handler(
    mut reader: OwnedReadHalf,
    entry: Arc<TransferEntry>,
    ctx: Arc<EngineContext>,
) {
    loop {
        let frame = match protocol::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if entry.status().is_terminal() {
                    tracing::debug!("Connection for transfer {} closed", entry.id());
                    entry.connection().close().await;
                } else {
                    let error = if e.is_disconnect() {
                        Error::ConnectionLost(entry.peer())
                    } else {
                        e
                    };
                    ctx.abort(&entry, error).await;
                }
                return;
            }
        };

        if frame.transfer_id() != entry.id() {
            tracing::warn!(
                "Ignoring {} for unknown transfer {} on connection of {}",
                frame.message_type(),
                frame.transfer_id(),
                entry.id()
            );
            continue;
        }

        match handle_frame(&entry, &ctx, frame).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => return,
            Err(e) => {
                ctx.abort(&entry, e).await;
                return;
            }
        }
    }
}

async fn handle_frame(entry: &TransferEntry, ctx: &EngineContext, frame: Frame) -> Result<Flow> {
    let message = frame.message_type();
    let status = entry.status();

    if status.is_terminal() {
        tracing::debug!(
            "Ignoring {} for {} transfer {}",
            message,
            status,
            entry.id()
        );
        return Ok(Flow::Stop);
    }

    match message {
        MessageType::Data => receive_data(entry, ctx, &frame.payload).await,
        MessageType::Cancel | MessageType::Finish => {
            let Some(next) = status.on_message(message) else {
                tracing::debug!("Ignoring {} while {}", message, status);
                return Ok(Flow::Continue);
            };
            if entry.terminate(next).await {
                tracing::info!("Transfer {} {} by peer", entry.id(), next);
            }
            entry.connection().close().await;
            Ok(Flow::Stop)
        }
        MessageType::Pause | MessageType::Resume => {
            match entry.apply_message(message).await {
                Some(next) => tracing::debug!("Transfer {} is now {}", entry.id(), next),
                None => tracing::debug!("Ignoring {} while {}", message, status),
            }
            Ok(Flow::Continue)
        }
        MessageType::Request | MessageType::Accept | MessageType::Reject => {
            tracing::warn!(
                "Ignoring unexpected {} for transfer {} ({})",
                message,
                entry.id(),
                status
            );
            Ok(Flow::Continue)
        }
    }
}

async fn receive_data(entry: &TransferEntry, ctx: &EngineContext, payload: &[u8]) -> Result<Flow> {
    if entry.direction() != TransferDirection::Inbound {
        tracing::warn!("Ignoring DATA sent to our own transfer {}", entry.id());
        return Ok(Flow::Continue);
    }

    let status = entry.status();
    if !status.is_active() {
        tracing::warn!("Ignoring DATA for transfer {} while {}", entry.id(), status);
        return Ok(Flow::Continue);
    }

    let len = payload.len() as u64;
    let received = entry.bytes_transferred().await;
    if received + len > entry.file_size() {
        return Err(Error::ProtocolError(format!(
            "peer sent {} bytes for a {} byte file",
            received + len,
            entry.file_size()
        )));
    }

    if !entry.write_chunk(payload).await? {
        tracing::debug!("Transfer {} closed its file, dropping DATA", entry.id());
        return Ok(Flow::Continue);
    }

    let total = entry.add_bytes(len).await?;
    if total == entry.file_size() {
        if let Err(e) = complete_inbound(entry).await {
            ctx.presenter.exception_happened(e);
        }
        return Ok(Flow::Stop);
    }

    Ok(Flow::Continue)
}

/// Finish an inbound transfer whose last byte has arrived: close the file,
/// mark it finished, tell the sender and hang up.
pub(crate) async fn complete_inbound(entry: &TransferEntry) -> Result<()> {
    if !entry.terminate(TransferStatus::Finished).await {
        return Ok(());
    }
    tracing::info!(
        "Transfer {} finished: received {} bytes",
        entry.id(),
        entry.file_size()
    );

    let sent = entry
        .connection()
        .send(MessageType::Finish, entry.id(), &[])
        .await;
    entry.connection().close().await;
    sent
}
