//! File transfer engine for BlueTransfer.
//!
//! This module owns everything that happens after a file has been offered:
//!
//! - The per-transfer state machine ([`TransferStatus`])
//! - The shared transfer registry ([`TransferRegistry`])
//! - The connection listener and per-connection message handler
//! - The sender loop that streams DATA with cooperative pause/cancel
//! - The telemetry loop that samples throughput
//!
//! ## State Machine
//!
//! ```text
//! REQUESTED ──► ACCEPTED ──► PAUSED ⇄ RESUMED ──► FINISHED | CANCELLED
//!     │
//!     └──────► REJECTED
//! ```

pub mod connection;
pub mod registry;
pub mod sender;
pub mod telemetry;

pub use registry::{ConnectionWriter, TransferEntry, TransferRegistry};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::presenter::Presenter;
use crate::protocol::{MessageType, TransferId};

/// Configure TCP keep-alive on a socket.
///
/// Idle transfers (a paused stream, a request waiting for a human) would
/// otherwise be dropped by NAT boxes and firewalls.
///
/// Configuration:
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
pub(crate) fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// We offered the file
    Outbound,
    /// The peer offered the file
    Inbound,
}

/// Lifecycle status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Offered, waiting for the receiver's decision
    Requested,
    /// Accepted, bytes are flowing
    Accepted,
    /// Stream suspended by either side
    Paused,
    /// Stream continued after a pause
    Resumed,
    /// Every byte arrived
    Finished,
    /// Aborted by either side or by a connection failure
    Cancelled,
    /// Declined by the receiver
    Rejected,
}

impl TransferStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Rejected)
    }

    /// Whether bytes may flow in this status.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Accepted | Self::Paused | Self::Resumed)
    }

    /// Status reached when `message` is received in this status.
    ///
    /// Returns `None` when the message leaves the status unchanged or is not
    /// allowed here. DATA never changes the status; its byte accounting lives
    /// in the message handler.
    #[must_use]
    pub const fn on_message(self, message: MessageType) -> Option<Self> {
        match (self, message) {
            (Self::Requested, MessageType::Accept) => Some(Self::Accepted),
            (Self::Requested, MessageType::Reject) => Some(Self::Rejected),
            (Self::Accepted | Self::Resumed, MessageType::Pause) => Some(Self::Paused),
            (Self::Paused, MessageType::Resume) => Some(Self::Resumed),
            (s, MessageType::Cancel) if s.is_active() => Some(Self::Cancelled),
            (s, MessageType::Finish) if s.is_active() => Some(Self::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Accepted => "accepted",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of a transfer, handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Transfer ID
    pub id: TransferId,
    /// Remote peer
    pub peer: SocketAddr,
    /// Bare file name
    pub file_name: String,
    /// Declared size in bytes
    pub file_size: u64,
    /// Hex content digest announced by the sender
    pub hash: String,
    /// Who offered the file
    pub direction: TransferDirection,
    /// Current status
    pub status: TransferStatus,
    /// Bytes sent or received so far
    pub bytes_transferred: u64,
    /// Most recently sampled throughput
    pub speed_bps: u64,
    /// Source path (outbound) or destination path (inbound, once accepted)
    pub path: Option<PathBuf>,
    /// When the transfer was registered
    pub requested_at: DateTime<Utc>,
}

impl TransferSnapshot {
    /// Get progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.file_size == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.file_size as f64) * 100.0
        }
    }

    /// Estimated time until the last byte, at the current throughput.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        if self.speed_bps == 0 || self.status.is_terminal() {
            return None;
        }
        let remaining = self.file_size.saturating_sub(self.bytes_transferred);
        Some(Duration::from_secs(remaining / self.speed_bps))
    }
}

/// Runtime settings of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the listener binds to
    pub bind_address: IpAddr,
    /// Port to listen on and to dial peers at (0 picks a free port)
    pub port: u16,
    /// Bytes per DATA message
    pub chunk_size: usize,
    /// Read size used while hashing
    pub hash_chunk_size: usize,
    /// Bandwidth limit for outbound streams (bytes per second)
    pub bandwidth_limit: Option<u64>,
    /// Telemetry sampling period
    pub telemetry_interval: Duration,
    /// How long an outbound request waits for ACCEPT/REJECT
    pub response_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::DEFAULT_PORT,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            hash_chunk_size: crate::DEFAULT_HASH_CHUNK_SIZE,
            bandwidth_limit: None,
            telemetry_interval: crate::DEFAULT_TELEMETRY_INTERVAL,
            response_timeout: crate::DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// State shared by the engine's background tasks.
pub(crate) struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) registry: TransferRegistry,
    pub(crate) presenter: std::sync::Arc<dyn Presenter>,
}

impl EngineContext {
    /// Cancel a live transfer after a local failure.
    ///
    /// A best-effort CANCEL is sent unless the connection itself failed.
    /// Returns `false` if the transfer had already ended.
    pub(crate) async fn cancel_after_failure(&self, entry: &TransferEntry, error: &Error) -> bool {
        let cancelled = entry.terminate(TransferStatus::Cancelled).await;
        if cancelled && !error.is_disconnect() {
            if let Err(e) = entry
                .connection()
                .send(MessageType::Cancel, entry.id(), &[])
                .await
            {
                tracing::debug!("Could not notify peer of cancellation: {}", e);
            }
        }
        entry.connection().close().await;
        cancelled
    }

    /// Cancel a live transfer from a background task and report the error.
    ///
    /// Errors on transfers that already ended are only logged.
    pub(crate) async fn abort(&self, entry: &TransferEntry, error: Error) {
        if self.cancel_after_failure(entry, &error).await {
            tracing::warn!("Transfer {} failed: {}", entry.id(), error);
            self.presenter.exception_happened(error);
        } else {
            tracing::debug!(
                "Ignoring error on finished transfer {}: {}",
                entry.id(),
                error
            );
        }
    }
}
