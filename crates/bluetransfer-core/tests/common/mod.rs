//! Common test utilities for `BlueTransfer` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use bluetransfer_core::{
    ChannelPresenter, Engine, EngineConfig, PresenterEvent, TransferId, TransferSnapshot,
    TransferStatus,
};

/// How long any single wait in a test may take.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1.len(), content2.len(), "File sizes differ");
    assert!(content1 == content2, "File contents differ");
}

/// Engine settings for loopback tests: ephemeral port, fast telemetry.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        telemetry_interval: Duration::from_millis(20),
        response_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    }
}

/// A launched engine plus the events it reported.
pub struct Peer {
    pub engine: Engine,
    pub events: UnboundedReceiver<PresenterEvent>,
    pub addr: SocketAddr,
}

/// Launch an engine on loopback.
pub async fn spawn_peer(config: EngineConfig) -> Peer {
    let (presenter, events) = ChannelPresenter::new();
    let engine = Engine::new(config, presenter);
    let addr = engine.launch().await.expect("Failed to launch engine");
    Peer {
        engine,
        events,
        addr,
    }
}

impl Peer {
    /// Wait for the next incoming request, skipping other events.
    pub async fn next_incoming(&mut self) -> TransferSnapshot {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(PresenterEvent::IncomingRequest(snapshot)) => return snapshot,
                    Some(_) => {}
                    None => panic!("presenter channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for an incoming request")
    }

    /// Collect everything reported so far.
    pub fn drain_events(&mut self) -> Vec<PresenterEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Poll until the transfer reaches `status`.
    pub async fn wait_for_status(&self, id: TransferId, status: TransferStatus) -> TransferSnapshot {
        self.wait_until(id, |s| s.status == status).await
    }

    /// Poll until `done` holds for the transfer.
    pub async fn wait_until(
        &self,
        id: TransferId,
        done: impl Fn(&TransferSnapshot) -> bool,
    ) -> TransferSnapshot {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let snapshot = self.engine.snapshot(id).await.expect("unknown transfer");
            if done(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on transfer {id}, last seen: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Start offering `path` from `sender` to `receiver` in the background.
///
/// The offer blocks until the receiver decides, so it runs in its own task.
pub fn offer(
    sender: &Peer,
    receiver: &Peer,
    path: &Path,
) -> tokio::task::JoinHandle<bluetransfer_core::Result<TransferId>> {
    let engine = sender.engine.clone();
    let target = receiver.addr;
    let path = path.to_path_buf();
    tokio::spawn(async move { engine.initiate_transfer_to(target, path).await })
}
