//! Telemetry loop: periodic throughput sampling pushed to the UI.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;

use super::{EngineContext, TransferSnapshot};
use crate::protocol::TransferId;

/// Decides which samples are worth pushing.
///
/// Non-empty samples always go out. An empty one goes out once, right after
/// the last watched transfer dropped out, so the UI can clear itself.
#[derive(Debug)]
struct SyncGate {
    idle: bool,
}

impl SyncGate {
    const fn new() -> Self {
        Self { idle: true }
    }

    fn admit(
        &mut self,
        transfers: HashMap<TransferId, TransferSnapshot>,
    ) -> Option<HashMap<TransferId, TransferSnapshot>> {
        if transfers.is_empty() {
            if self.idle {
                return None;
            }
            self.idle = true;
        } else {
            self.idle = false;
        }
        Some(transfers)
    }
}

/// Runs for the lifetime of the engine.
pub(crate) async fn run_telemetry(ctx: Arc<EngineContext>) {
    let mut interval = tokio::time::interval(ctx.config.telemetry_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gate = SyncGate::new();

    loop {
        interval.tick().await;
        let sample = ctx.registry.sample_watched(Instant::now()).await;
        if let Some(transfers) = gate.admit(sample) {
            tracing::trace!("Pushing {} transfers to the UI", transfers.len());
            ctx.presenter.sync_transfers_to_ui(transfers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{TransferDirection, TransferStatus};

    fn sample() -> HashMap<TransferId, TransferSnapshot> {
        let id = TransferId::new();
        let snapshot = TransferSnapshot {
            id,
            peer: "10.0.0.2:15556".parse().expect("addr"),
            file_name: "movie.mkv".to_string(),
            file_size: 10,
            hash: String::new(),
            direction: TransferDirection::Outbound,
            status: TransferStatus::Accepted,
            bytes_transferred: 5,
            speed_bps: 50,
            path: None,
            requested_at: chrono::Utc::now(),
        };
        HashMap::from([(id, snapshot)])
    }

    #[test]
    fn test_gate_skips_empty_while_idle() {
        let mut gate = SyncGate::new();
        assert!(gate.admit(HashMap::new()).is_none());
        assert!(gate.admit(HashMap::new()).is_none());
    }

    #[test]
    fn test_gate_pushes_one_empty_after_activity() {
        let mut gate = SyncGate::new();
        assert_eq!(gate.admit(sample()).map(|m| m.len()), Some(1));

        let cleared = gate.admit(HashMap::new());
        assert!(cleared.is_some_and(|m| m.is_empty()));

        assert!(gate.admit(HashMap::new()).is_none());
        assert!(gate.admit(sample()).is_some());
    }
}
