//! Transfer registry: the single source of truth for every transfer.
//!
//! Each [`TransferEntry`] keeps its mutable fields behind one mutex. Status
//! changes are published on a `watch` channel while that mutex is held, so a
//! task waiting for a status can never miss a transition. When a file handle
//! is involved the lock order is always state, then file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex, RwLock};

use super::{TransferDirection, TransferSnapshot, TransferStatus};
use crate::error::{Error, Result};
use crate::protocol::{self, MessageType, RequestPayload, TransferId};

/// Write side of the single TCP connection a transfer lives on.
///
/// Frames are written whole under the lock, so control messages from the
/// facade never interleave with DATA from the sender loop.
#[derive(Debug)]
pub struct ConnectionWriter {
    peer: SocketAddr,
    half: Mutex<Option<OwnedWriteHalf>>,
}

impl ConnectionWriter {
    /// Wrap the write half of a connected stream.
    #[must_use]
    pub fn new(half: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            peer,
            half: Mutex::new(Some(half)),
        }
    }

    /// Remote address of the connection.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] once the connection was closed, or
    /// the underlying write error.
    pub async fn send(
        &self,
        message_type: MessageType,
        transfer_id: TransferId,
        payload: &[u8],
    ) -> Result<()> {
        let mut guard = self.half.lock().await;
        let half = guard.as_mut().ok_or(Error::ConnectionLost(self.peer))?;
        protocol::write_frame(half, message_type, transfer_id, payload).await
    }

    /// Shut down the write side. Later sends fail; repeated calls are no-ops.
    pub async fn close(&self) {
        if let Some(mut half) = self.half.lock().await.take() {
            if let Err(e) = half.shutdown().await {
                tracing::debug!("Shutdown of connection to {} failed: {}", self.peer, e);
            }
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.half.lock().await.is_none()
    }
}

#[derive(Debug)]
struct TransferState {
    status: TransferStatus,
    bytes_transferred: u64,
    speed_bps: u64,
    path: Option<PathBuf>,
    watched: bool,
    last_sampled_bytes: u64,
    last_sampled_at: Instant,
}

/// One file exchange and everything needed to drive it.
#[derive(Debug)]
pub struct TransferEntry {
    id: TransferId,
    peer: SocketAddr,
    file_name: String,
    file_size: u64,
    hash: String,
    direction: TransferDirection,
    requested_at: DateTime<Utc>,
    state: Mutex<TransferState>,
    status_tx: watch::Sender<TransferStatus>,
    file: Mutex<Option<File>>,
    connection: Arc<ConnectionWriter>,
}

impl TransferEntry {
    /// Create a transfer in the `Requested` status.
    ///
    /// `path` is the source file for outbound transfers and `None` for
    /// inbound ones until they are accepted.
    #[must_use]
    pub fn new(
        id: TransferId,
        request: RequestPayload,
        direction: TransferDirection,
        path: Option<PathBuf>,
        connection: Arc<ConnectionWriter>,
    ) -> Self {
        let (status_tx, _) = watch::channel(TransferStatus::Requested);
        Self {
            id,
            peer: connection.peer(),
            file_name: request.file_name,
            file_size: request.file_size,
            hash: request.hash,
            direction,
            requested_at: Utc::now(),
            state: Mutex::new(TransferState {
                status: TransferStatus::Requested,
                bytes_transferred: 0,
                speed_bps: 0,
                path,
                watched: true,
                last_sampled_bytes: 0,
                last_sampled_at: Instant::now(),
            }),
            status_tx,
            file: Mutex::new(None),
            connection,
        }
    }

    /// Transfer ID.
    #[must_use]
    pub const fn id(&self) -> TransferId {
        self.id
    }

    /// Remote peer.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bare file name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Declared size in bytes.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Who offered the file.
    #[must_use]
    pub const fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// The connection this transfer lives on.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionWriter> {
        &self.connection
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status_tx.subscribe()
    }

    /// Bytes sent or received so far.
    pub async fn bytes_transferred(&self) -> u64 {
        self.state.lock().await.bytes_transferred
    }

    /// Record `len` more bytes and return the new total.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if the total would exceed the
    /// declared file size; the counter is left untouched.
    pub async fn add_bytes(&self, len: u64) -> Result<u64> {
        let mut state = self.state.lock().await;
        let total = state.bytes_transferred.saturating_add(len);
        if total > self.file_size {
            return Err(Error::ProtocolError(format!(
                "{total} bytes exceed the declared size of {} bytes",
                self.file_size
            )));
        }
        state.bytes_transferred = total;
        Ok(total)
    }

    /// Apply a received control message to the status.
    ///
    /// Returns the new status, or `None` if the message does not change it.
    /// Terminal transitions go through [`terminate`](Self::terminate).
    pub async fn apply_message(&self, message: MessageType) -> Option<TransferStatus> {
        let mut state = self.state.lock().await;
        let next = state.status.on_message(message)?;
        if next.is_terminal() {
            return None;
        }
        state.status = next;
        self.status_tx.send_replace(next);
        Some(next)
    }

    /// Move to the status chosen by `next` for the current one.
    ///
    /// Returns the new status, or the unchanged current status as the error
    /// when `next` declines the transition. Terminal statuses are final.
    pub async fn transition(
        &self,
        next: impl FnOnce(TransferStatus) -> Option<TransferStatus>,
    ) -> std::result::Result<TransferStatus, TransferStatus> {
        let mut state = self.state.lock().await;
        let current = state.status;
        if current.is_terminal() {
            return Err(current);
        }
        let Some(next) = next(current) else {
            return Err(current);
        };
        state.status = next;
        self.status_tx.send_replace(next);
        Ok(next)
    }

    /// Enter a terminal status, closing the file handle first.
    ///
    /// Returns `false` if the transfer was already terminal.
    pub async fn terminate(&self, status: TransferStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return false;
        }

        if let Err(e) = self.close_file().await {
            tracing::warn!("Failed to close file for transfer {}: {}", self.id, e);
        }

        state.status = status;
        self.status_tx.send_replace(status);
        tracing::debug!("Transfer {} is now {}", self.id, status);
        true
    }

    /// Hand the open file handle to the transfer.
    ///
    /// The handle is dropped again if the transfer already ended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferCancelled`] for terminal transfers and
    /// [`Error::Internal`] if a handle was already attached.
    pub async fn attach_file(&self, file: File, path: PathBuf) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return Err(Error::TransferCancelled);
        }
        let mut slot = self.file.lock().await;
        if slot.is_some() {
            return Err(Error::Internal(format!(
                "file for transfer {} opened twice",
                self.id
            )));
        }
        *slot = Some(file);
        state.path = Some(path);
        Ok(())
    }

    /// Append bytes to the destination file.
    ///
    /// Returns `false` if the handle is already closed.
    pub async fn write_chunk(&self, data: &[u8]) -> Result<bool> {
        let mut slot = self.file.lock().await;
        match slot.as_mut() {
            Some(file) => {
                file.write_all(data).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read the next bytes of the source file into `buf`.
    ///
    /// Returns `None` if the handle is already closed.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut slot = self.file.lock().await;
        match slot.as_mut() {
            Some(file) => Ok(Some(file.read(buf).await?)),
            None => Ok(None),
        }
    }

    async fn close_file(&self) -> Result<()> {
        let Some(mut file) = self.file.lock().await.take() else {
            return Ok(());
        };
        if self.direction == TransferDirection::Inbound {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Copy the current state.
    pub async fn snapshot(&self) -> TransferSnapshot {
        let state = self.state.lock().await;
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &TransferState) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            peer: self.peer,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            hash: self.hash.clone(),
            direction: self.direction,
            status: state.status,
            bytes_transferred: state.bytes_transferred,
            speed_bps: state.speed_bps,
            path: state.path.clone(),
            requested_at: self.requested_at,
        }
    }

    /// Take a telemetry sample.
    ///
    /// Computes throughput from the byte delta since the previous sample.
    /// Terminal transfers are reported once with zero throughput and then
    /// stop being watched. Returns `None` for unwatched transfers.
    pub async fn sample(&self, now: Instant) -> Option<TransferSnapshot> {
        let mut state = self.state.lock().await;
        if !state.watched {
            return None;
        }

        if state.status.is_terminal() {
            state.speed_bps = 0;
            state.watched = false;
        } else {
            let elapsed = now.saturating_duration_since(state.last_sampled_at);
            let delta = state.bytes_transferred - state.last_sampled_bytes;
            if !elapsed.is_zero() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let speed = (delta as f64 / elapsed.as_secs_f64()) as u64;
                state.speed_bps = speed;
            }
        }
        state.last_sampled_bytes = state.bytes_transferred;
        state.last_sampled_at = now;

        Some(self.snapshot_locked(&state))
    }
}

/// All transfers known to one engine.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    entries: RwLock<HashMap<TransferId, Arc<TransferEntry>>>,
}

impl TransferRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if the ID is already taken.
    pub async fn insert(&self, entry: Arc<TransferEntry>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.id()) {
            return Err(Error::ProtocolError(format!(
                "duplicate transfer id {}",
                entry.id()
            )));
        }
        entries.insert(entry.id(), entry);
        Ok(())
    }

    /// Look up a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferNotFound`] for unknown IDs.
    pub async fn get(&self, id: TransferId) -> Result<Arc<TransferEntry>> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::TransferNotFound(id))
    }

    /// Drop a transfer from the registry.
    pub async fn remove(&self, id: TransferId) -> Option<Arc<TransferEntry>> {
        self.entries.write().await.remove(&id)
    }

    /// Snapshot every registered transfer.
    pub async fn snapshots(&self) -> HashMap<TransferId, TransferSnapshot> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut out = HashMap::with_capacity(entries.len());
        for entry in entries {
            out.insert(entry.id(), entry.snapshot().await);
        }
        out
    }

    /// Sample every watched transfer, see [`TransferEntry::sample`].
    pub async fn sample_watched(&self, now: Instant) -> HashMap<TransferId, TransferSnapshot> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut out = HashMap::new();
        for entry in entries {
            if let Some(snapshot) = entry.sample(now).await {
                out.insert(entry.id(), snapshot);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn connection() -> (Arc<ConnectionWriter>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_read, write) = client.into_split();
        (Arc::new(ConnectionWriter::new(write, addr)), server)
    }

    fn request(size: u64) -> RequestPayload {
        RequestPayload {
            file_name: "file.bin".to_string(),
            file_size: size,
            hash: "00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_bytes_never_exceeds_size() {
        let (conn, _server) = connection().await;
        let entry = TransferEntry::new(
            TransferId::new(),
            request(10),
            TransferDirection::Inbound,
            None,
            conn,
        );

        assert_eq!(entry.add_bytes(6).await.expect("add"), 6);
        assert!(entry.add_bytes(5).await.is_err());
        assert_eq!(entry.bytes_transferred().await, 6);
        assert_eq!(entry.add_bytes(4).await.expect("add"), 10);
    }

    #[tokio::test]
    async fn test_terminate_once() {
        let (conn, _server) = connection().await;
        let entry = TransferEntry::new(
            TransferId::new(),
            request(10),
            TransferDirection::Outbound,
            None,
            conn,
        );
        let mut rx = entry.subscribe();

        assert!(entry
            .transition(|s| (s == TransferStatus::Requested).then_some(TransferStatus::Accepted))
            .await
            .is_ok());
        assert!(entry.terminate(TransferStatus::Cancelled).await);
        assert!(!entry.terminate(TransferStatus::Finished).await);
        assert_eq!(entry.status(), TransferStatus::Cancelled);

        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow_and_update(), TransferStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_apply_message_skips_terminal() {
        let (conn, _server) = connection().await;
        let entry = TransferEntry::new(
            TransferId::new(),
            request(10),
            TransferDirection::Inbound,
            None,
            conn,
        );
        entry
            .transition(|_| Some(TransferStatus::Accepted))
            .await
            .expect("accept");

        assert_eq!(
            entry.apply_message(MessageType::Pause).await,
            Some(TransferStatus::Paused)
        );
        assert_eq!(entry.apply_message(MessageType::Pause).await, None);
        assert_eq!(entry.apply_message(MessageType::Cancel).await, None);
        assert_eq!(entry.status(), TransferStatus::Paused);
    }

    #[tokio::test]
    async fn test_telemetry_drops_terminal_after_one_report() {
        let (conn, _server) = connection().await;
        let registry = TransferRegistry::new();
        let entry = Arc::new(TransferEntry::new(
            TransferId::new(),
            request(1000),
            TransferDirection::Outbound,
            None,
            conn,
        ));
        registry.insert(Arc::clone(&entry)).await.expect("insert");
        entry
            .transition(|_| Some(TransferStatus::Accepted))
            .await
            .expect("accept");

        let start = Instant::now();
        entry.add_bytes(500).await.expect("add");
        let first = registry
            .sample_watched(start + Duration::from_secs(1))
            .await;
        let snapshot = first.get(&entry.id()).expect("watched");
        assert!(snapshot.speed_bps > 0);

        entry.terminate(TransferStatus::Finished).await;
        let second = registry
            .sample_watched(start + Duration::from_secs(2))
            .await;
        let snapshot = second.get(&entry.id()).expect("reported once");
        assert_eq!(snapshot.status, TransferStatus::Finished);
        assert_eq!(snapshot.speed_bps, 0);

        let third = registry
            .sample_watched(start + Duration::from_secs(3))
            .await;
        assert!(third.is_empty());

        // still inspectable
        assert_eq!(registry.snapshots().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_ids() {
        let (conn, _server) = connection().await;
        let registry = TransferRegistry::new();
        let id = TransferId::new();
        let entry = Arc::new(TransferEntry::new(
            id,
            request(1),
            TransferDirection::Inbound,
            None,
            Arc::clone(&conn),
        ));
        registry.insert(Arc::clone(&entry)).await.expect("insert");
        assert!(registry.insert(entry).await.is_err());

        let missing = TransferId::new();
        assert!(matches!(
            registry.get(missing).await,
            Err(Error::TransferNotFound(found)) if found == missing
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_sends() {
        let (conn, _server) = connection().await;
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed().await);

        let result = conn.send(MessageType::Pause, TransferId::new(), &[]).await;
        assert!(matches!(result, Err(Error::ConnectionLost(_))));
    }
}
