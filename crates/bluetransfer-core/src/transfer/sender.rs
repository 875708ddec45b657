//! Sender loop: streams an accepted outbound transfer as DATA frames.
//!
//! Pause and cancel are cooperative. The loop looks at the transfer status
//! before every chunk; while it is paused the loop parks on the transfer's
//! status channel until something else is published.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{EngineConfig, EngineContext, TransferEntry, TransferStatus};
use crate::error::{Error, Result};
use crate::protocol::MessageType;

/// Spawned once per outbound transfer after the peer accepted it.
pub(crate) async fn run_sender(entry: Arc<TransferEntry>, ctx: Arc<EngineContext>) {
    match stream_file(&entry, &ctx.config).await {
        Ok(()) => tracing::debug!("Sender loop for transfer {} done", entry.id()),
        Err(e) => ctx.abort(&entry, e).await,
    }
}

async fn stream_file(entry: &TransferEntry, config: &EngineConfig) -> Result<()> {
    let id = entry.id();
    let file_size = entry.file_size();
    let mut status_rx = entry.subscribe();
    let mut buffer = vec![0u8; config.chunk_size.max(1)];
    let mut pacer = config.bandwidth_limit.map(Pacer::new);

    loop {
        let status = entry.status();
        if status.is_terminal() {
            tracing::debug!("Transfer {} is {}, stopping sender", id, status);
            return Ok(());
        }

        if status == TransferStatus::Paused {
            tracing::debug!("Transfer {} paused, sender waiting", id);
            if status_rx
                .wait_for(|s| *s != TransferStatus::Paused)
                .await
                .is_err()
            {
                return Ok(());
            }
            if let Some(pacer) = pacer.as_mut() {
                pacer.reset();
            }
            continue;
        }

        let sent = entry.bytes_transferred().await;
        if sent >= file_size {
            tracing::info!("Transfer {}: all {} bytes sent", id, file_size);
            return Ok(());
        }

        let want = usize::try_from(file_size - sent).map_or(buffer.len(), |r| r.min(buffer.len()));
        let Some(read) = entry.read_chunk(&mut buffer[..want]).await? else {
            return Ok(());
        };
        if read == 0 {
            return Err(Error::SourceTruncated {
                file: entry.file_name().to_string(),
                read: sent,
                expected: file_size,
            });
        }

        if let Err(e) = entry
            .connection()
            .send(MessageType::Data, id, &buffer[..read])
            .await
        {
            // the handler owns the verdict on a dropped connection: CANCEL
            // if the peer sent one, ConnectionLost otherwise
            if entry.status().is_terminal() || e.is_disconnect() {
                tracing::debug!("Sender for transfer {} stopped: {}", id, e);
                return Ok(());
            }
            return Err(e);
        }
        entry.add_bytes(read as u64).await?;

        if let Some(pacer) = pacer.as_mut() {
            pacer.throttle(read).await;
        }
    }
}

/// Keeps the average rate since the last reset at or below the limit.
#[derive(Debug)]
struct Pacer {
    limit: u64,
    started: Instant,
    bytes: u64,
}

impl Pacer {
    fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(1),
            started: Instant::now(),
            bytes: 0,
        }
    }

    fn reset(&mut self) {
        self.started = Instant::now();
        self.bytes = 0;
    }

    /// How long to wait after `elapsed` so the rate stays within the limit.
    fn delay(&self, elapsed: Duration) -> Duration {
        let due = Duration::from_secs_f64(self.bytes as f64 / self.limit as f64);
        due.saturating_sub(elapsed)
    }

    async fn throttle(&mut self, len: usize) {
        self.bytes += len as u64;
        let delay = self.delay(self.started.elapsed());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
