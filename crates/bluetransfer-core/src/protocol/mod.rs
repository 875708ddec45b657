//! Wire protocol implementation.
//!
//! Every message travels over a plain TCP connection as a fixed-size header
//! followed by a payload.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────┬──────────────────────────┬────────────────────┐
//! │    Type    │       Transfer ID        │       Length       │
//! │   1 byte   │        16 bytes          │      4 bytes       │
//! ├────────────┴──────────────────────────┴────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Type: Message type byte
//! - Transfer ID: raw UUID bytes
//! - Length: Payload length in bytes (big-endian)
//!
//! `Request` carries a JSON [`RequestPayload`], `Data` carries raw file
//! bytes and every other message has an empty payload.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 21;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message types in the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Announce a file to the peer
    Request = 1,
    /// Receiver accepts the announced file
    Accept = 2,
    /// Receiver declines the announced file
    Reject = 3,
    /// File bytes
    Data = 4,
    /// Suspend the stream
    Pause = 5,
    /// Continue a paused stream
    Resume = 6,
    /// Abort the transfer
    Cancel = 7,
    /// All bytes received
    Finish = 8,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Request),
            2 => Some(Self::Accept),
            3 => Some(Self::Reject),
            4 => Some(Self::Data),
            5 => Some(Self::Pause),
            6 => Some(Self::Resume),
            7 => Some(Self::Cancel),
            8 => Some(Self::Finish),
            _ => None,
        }
    }

    /// Whether this message carries a JSON or binary payload.
    #[must_use]
    pub const fn has_payload(self) -> bool {
        matches!(self, Self::Request | Self::Data)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Data => "DATA",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Cancel => "CANCEL",
            Self::Finish => "FINISH",
        };
        f.write_str(name)
    }
}

/// Random 128-bit identifier of a single file exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an ID from its 16 wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 wire bytes of this ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Message type
    pub message_type: MessageType,
    /// Transfer this frame belongs to
    pub transfer_id: TransferId,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.message_type as u8;
        buf[1..17].copy_from_slice(self.transfer_id.as_bytes());
        buf[17..21].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let message_type = MessageType::from_byte(buf[0])
            .ok_or_else(|| Error::ProtocolError(format!("unknown message type: {:#x}", buf[0])))?;

        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[1..17]);

        let payload_length = u32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            message_type,
            transfer_id: TransferId::from_bytes(id),
            payload_length,
        })
    }
}

/// A decoded message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Header fields
    pub header: FrameHeader,
    /// Payload bytes (empty for control messages)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Message type of this frame.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Transfer this frame belongs to.
    #[must_use]
    pub const fn transfer_id(&self) -> TransferId {
        self.header.transfer_id
    }
}

/// Transfer request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Bare file name (no directories)
    pub file_name: String,
    /// Declared size in bytes
    pub file_size: u64,
    /// Hex content digest
    pub hash: String,
}

/// Encode a message payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Read a complete frame from a stream.
///
/// Stray payload bytes on control messages are consumed and dropped.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    if !header.message_type.has_payload() && !payload.is_empty() {
        tracing::debug!(
            "Ignoring {} byte payload on {} frame",
            payload.len(),
            header.message_type
        );
        payload.clear();
    }

    Ok(Frame { header, payload })
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails or the payload is too large.
pub async fn write_frame<W>(
    writer: &mut W,
    message_type: MessageType,
    transfer_id: TransferId,
    payload: &[u8],
) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::ProtocolError(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        message_type,
        transfer_id,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a complete frame from a stream with a timeout.
///
/// # Errors
///
/// Returns `Error::Timeout` if the operation exceeds the specified duration.
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame_with_timeout<R>(reader: &mut R, duration: Duration) -> Result<Frame>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    timeout(duration, read_frame(reader))
        .await
        .map_err(|_| Error::Timeout(duration))?
}
