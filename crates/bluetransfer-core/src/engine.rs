//! Engine facade: the only entry point the presentation layer uses.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::file::{self, FileMetadata};
use crate::presenter::Presenter;
use crate::protocol::{self, MessageType, RequestPayload, TransferId};
use crate::transfer::{
    configure_tcp_keepalive, connection, sender, telemetry, ConnectionWriter, EngineConfig,
    EngineContext, TransferDirection, TransferEntry, TransferRegistry, TransferSnapshot,
    TransferStatus,
};

/// Background tasks started by [`Engine::launch`].
struct Running {
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
    telemetry: JoinHandle<()>,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    running: Mutex<Option<Running>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.listener.abort();
            running.telemetry.abort();
        }
    }
}

/// Peer-to-peer transfer engine.
///
/// Cheap to clone; clones share the same registry and background tasks,
/// which stop when the last clone is dropped or [`shutdown`](Self::shutdown)
/// is called.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.ctx.config)
            .finish_non_exhaustive()
    }
}

enum Decision {
    Accepted,
    Rejected,
}

impl Engine {
    /// Create an engine. Nothing touches the network until [`launch`](Self::launch).
    pub fn new(config: EngineConfig, presenter: impl Presenter) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                ctx: Arc::new(EngineContext {
                    config,
                    registry: TransferRegistry::new(),
                    presenter: Arc::new(presenter),
                }),
                running: Mutex::new(None),
            }),
        }
    }

    /// Engine settings.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    fn registry(&self) -> &TransferRegistry {
        &self.inner.ctx.registry
    }

    /// Bind the listener and start the listener and telemetry loops.
    ///
    /// Returns the bound address as soon as both loops are running.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound or the engine is
    /// already running.
    pub async fn launch(&self) -> Result<SocketAddr> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(Error::Internal("engine already launched".to_string()));
        }

        let config = &self.inner.ctx.config;
        let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for transfers on {}", local_addr);

        let listener = tokio::spawn(connection::run_listener(
            listener,
            Arc::clone(&self.inner.ctx),
        ));
        let telemetry = tokio::spawn(telemetry::run_telemetry(Arc::clone(&self.inner.ctx)));

        *running = Some(Running {
            local_addr,
            listener,
            telemetry,
        });
        Ok(local_addr)
    }

    /// Address the listener is bound to, once launched.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Stop accepting connections and stop telemetry.
    ///
    /// Transfers already in flight keep running.
    pub async fn shutdown(&self) {
        if let Some(running) = self.inner.running.lock().await.take() {
            running.listener.abort();
            running.telemetry.abort();
            tracing::info!("Engine on {} shut down", running.local_addr);
        }
    }

    /// Offer a file to the peer at `peer_ip`, on the configured port.
    ///
    /// See [`initiate_transfer_to`](Self::initiate_transfer_to).
    pub async fn initiate_transfer(
        &self,
        peer_ip: IpAddr,
        path: impl AsRef<Path>,
    ) -> Result<TransferId> {
        let addr = SocketAddr::new(peer_ip, self.config().port);
        self.initiate_transfer_to(addr, path).await
    }

    /// Offer a file to `peer` and wait for the answer.
    ///
    /// The file is hashed before anything is sent. On ACCEPT the sender loop
    /// starts streaming in the background; on REJECT the transfer ends as
    /// rejected. Either way the transfer ID is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the peer cannot be
    /// reached or does not answer within the response timeout. The transfer
    /// is not kept in that case.
    pub async fn initiate_transfer_to(
        &self,
        peer: SocketAddr,
        path: impl AsRef<Path>,
    ) -> Result<TransferId> {
        let path = path.as_ref();
        let config = self.config();
        let metadata = FileMetadata::from_path(path).await?;
        let hash = file::hash_file(path, config.hash_chunk_size).await?;

        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| Error::ConnectFailed {
                addr: peer,
                reason: e.to_string(),
            })?;
        if let Err(e) = configure_tcp_keepalive(&stream) {
            tracing::warn!("Failed to enable keep-alive for {}: {}", peer, e);
        }
        let (mut reader, writer) = stream.into_split();
        let connection = Arc::new(ConnectionWriter::new(writer, peer));

        let id = TransferId::new();
        let request = RequestPayload {
            file_name: metadata.file_name.clone(),
            file_size: metadata.size,
            hash,
        };
        let payload = protocol::encode_payload(&request)?;
        let entry = Arc::new(TransferEntry::new(
            id,
            request,
            TransferDirection::Outbound,
            Some(metadata.path.clone()),
            Arc::clone(&connection),
        ));
        self.registry().insert(Arc::clone(&entry)).await?;

        tracing::info!(
            "Offering '{}' ({}) to {} as transfer {}",
            metadata.file_name,
            file::format_size(metadata.size),
            peer,
            id
        );

        let decision = match self.await_decision(&entry, &mut reader, &payload).await {
            Ok(decision) => decision,
            Err(e) => {
                self.registry().remove(id).await;
                connection.close().await;
                return Err(e);
            }
        };

        match decision {
            Decision::Accepted => self.start_sending(entry, reader, &metadata.path).await?,
            Decision::Rejected => {
                entry
                    .transition(|s| (s == TransferStatus::Requested).then_some(TransferStatus::Rejected))
                    .await
                    .map_err(|status| Error::InvalidState {
                        id,
                        operation: "reject",
                        status,
                    })?;
                connection.close().await;
                tracing::info!("Transfer {} rejected by {}", id, peer);
                self.inner
                    .ctx
                    .presenter
                    .present_rejected_transfer(entry.snapshot().await);
            }
        }

        Ok(id)
    }

    async fn await_decision(
        &self,
        entry: &TransferEntry,
        reader: &mut OwnedReadHalf,
        request: &[u8],
    ) -> Result<Decision> {
        entry
            .connection()
            .send(MessageType::Request, entry.id(), request)
            .await?;

        loop {
            let frame =
                protocol::read_frame_with_timeout(reader, self.config().response_timeout).await?;
            if frame.transfer_id() != entry.id() {
                tracing::warn!(
                    "Ignoring {} for unknown transfer {}",
                    frame.message_type(),
                    frame.transfer_id()
                );
                continue;
            }
            return match frame.message_type() {
                MessageType::Accept => Ok(Decision::Accepted),
                MessageType::Reject => Ok(Decision::Rejected),
                MessageType::Cancel => Err(Error::TransferCancelled),
                other => Err(Error::UnexpectedMessage {
                    expected: "ACCEPT or REJECT".to_string(),
                    actual: other.to_string(),
                }),
            };
        }
    }

    async fn start_sending(
        &self,
        entry: Arc<TransferEntry>,
        reader: OwnedReadHalf,
        path: &Path,
    ) -> Result<()> {
        let ctx = &self.inner.ctx;
        if let Err(e) = open_source(&entry, path).await {
            ctx.cancel_after_failure(&entry, &e).await;
            return Err(e);
        }

        tracing::info!("Transfer {} accepted by {}", entry.id(), entry.peer());
        tokio::spawn(sender::run_sender(Arc::clone(&entry), Arc::clone(ctx)));
        tokio::spawn(connection::run_handler(reader, entry, Arc::clone(ctx)));
        Ok(())
    }

    /// Accept an incoming transfer, saving it into `directory`.
    ///
    /// Returns the destination path. Only the final component of the
    /// announced file name is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown, not an inbound request,
    /// or the destination cannot be created. An existing file is never
    /// replaced: that is [`Error::InvalidPath`] and the transfer is cancelled.
    pub async fn accept_transfer(
        &self,
        id: TransferId,
        directory: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let entry = self.inbound_request(id, "accept").await?;
        let destination = file::destination_path(directory.as_ref(), entry.file_name())
            .ok_or_else(|| Error::InvalidPath(entry.file_name().to_string()))?;

        entry
            .transition(|s| (s == TransferStatus::Requested).then_some(TransferStatus::Accepted))
            .await
            .map_err(|status| Error::InvalidState {
                id,
                operation: "accept",
                status,
            })?;

        let opened = match create_destination(&destination).await {
            Ok(file) => entry.attach_file(file, destination.clone()).await,
            Err(e) => Err(e),
        };
        let accepted = match opened {
            Ok(()) => entry.connection().send(MessageType::Accept, id, &[]).await,
            Err(e) => Err(e),
        };
        if let Err(e) = accepted {
            self.inner.ctx.cancel_after_failure(&entry, &e).await;
            return Err(e);
        }
        tracing::info!(
            "Accepted transfer {}, saving to {}",
            id,
            destination.display()
        );

        if entry.file_size() == 0 {
            connection::complete_inbound(&entry).await?;
        }
        Ok(destination)
    }

    /// Decline an incoming transfer. No file is ever created.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not an inbound request.
    pub async fn reject_transfer(&self, id: TransferId) -> Result<()> {
        let entry = self.inbound_request(id, "reject").await?;
        entry
            .transition(|s| (s == TransferStatus::Requested).then_some(TransferStatus::Rejected))
            .await
            .map_err(|status| Error::InvalidState {
                id,
                operation: "reject",
                status,
            })?;

        let sent = entry.connection().send(MessageType::Reject, id, &[]).await;
        entry.connection().close().await;
        tracing::info!("Rejected transfer {}", id);
        sent
    }

    /// Abort an active transfer on both sides.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not active.
    pub async fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        let entry = self.registry().get(id).await?;
        let status = entry.status();
        if !status.is_active() || !entry.terminate(TransferStatus::Cancelled).await {
            return Err(Error::InvalidState {
                id,
                operation: "cancel",
                status: entry.status(),
            });
        }

        if let Err(e) = entry.connection().send(MessageType::Cancel, id, &[]).await {
            tracing::debug!("Could not send CANCEL for transfer {}: {}", id, e);
        }
        entry.connection().close().await;
        tracing::info!("Cancelled transfer {}", id);
        Ok(())
    }

    /// Pause a running transfer, or resume a paused one.
    ///
    /// Returns the new status.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not active.
    pub async fn toggle_pause(&self, id: TransferId) -> Result<TransferStatus> {
        let entry = self.registry().get(id).await?;
        let next = entry
            .transition(|s| match s {
                TransferStatus::Accepted | TransferStatus::Resumed => Some(TransferStatus::Paused),
                TransferStatus::Paused => Some(TransferStatus::Resumed),
                _ => None,
            })
            .await
            .map_err(|status| Error::InvalidState {
                id,
                operation: "pause or resume",
                status,
            })?;

        let message = if next == TransferStatus::Paused {
            MessageType::Pause
        } else {
            MessageType::Resume
        };
        if let Err(e) = entry.connection().send(message, id, &[]).await {
            self.inner.ctx.cancel_after_failure(&entry, &e).await;
            return Err(e);
        }
        tracing::info!("Transfer {} {}", id, next);
        Ok(next)
    }

    /// Current state of one transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferNotFound`] for unknown IDs.
    pub async fn snapshot(&self, id: TransferId) -> Result<TransferSnapshot> {
        Ok(self.registry().get(id).await?.snapshot().await)
    }

    /// Current state of every transfer, finished ones included.
    pub async fn transfers(&self) -> HashMap<TransferId, TransferSnapshot> {
        self.registry().snapshots().await
    }

    async fn inbound_request(
        &self,
        id: TransferId,
        operation: &'static str,
    ) -> Result<Arc<TransferEntry>> {
        let entry = self.registry().get(id).await?;
        let status = entry.status();
        if entry.direction() != TransferDirection::Inbound || status != TransferStatus::Requested {
            return Err(Error::InvalidState {
                id,
                operation,
                status,
            });
        }
        Ok(entry)
    }
}

/// Create `path` for writing, refusing to replace an existing file.
async fn create_destination(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::InvalidPath(format!("{} already exists", path.display()))
            } else {
                Error::Io(e)
            }
        })
}

/// Attach the source file of an accepted outbound transfer and mark it
/// accepted.
async fn open_source(entry: &TransferEntry, path: &Path) -> Result<TransferStatus> {
    let file = File::open(path).await?;
    entry.attach_file(file, path.to_path_buf()).await?;
    entry
        .transition(|s| (s == TransferStatus::Requested).then_some(TransferStatus::Accepted))
        .await
        .map_err(|status| Error::InvalidState {
            id: entry.id(),
            operation: "start",
            status,
        })
}
