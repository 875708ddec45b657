//! Tests that drive an engine with a hand-written peer speaking the raw
//! wire protocol, covering misbehaving and disappearing senders.

mod common;

use std::time::Duration;

use tokio::net::TcpStream;

use bluetransfer_core::protocol::{self, MessageType, RequestPayload};
use bluetransfer_core::{Error, PresenterEvent, TransferId, TransferStatus};

use common::{create_temp_dir, spawn_peer, test_config, Peer, WAIT_TIMEOUT};

/// Connect to `receiver`, announce a file and wait until it is accepted.
async fn announce_and_accept(
    receiver: &mut Peer,
    output_dir: &std::path::Path,
    file_size: u64,
) -> (TcpStream, TransferId) {
    let mut stream = TcpStream::connect(receiver.addr).await.expect("connect");
    let id = TransferId::new();
    let request = RequestPayload {
        file_name: "raw.bin".to_string(),
        file_size,
        hash: "deadbeef".to_string(),
    };
    let payload = protocol::encode_payload(&request).expect("encode");
    protocol::write_frame(&mut stream, MessageType::Request, id, &payload)
        .await
        .expect("send request");

    let incoming = receiver.next_incoming().await;
    assert_eq!(incoming.id, id);
    assert_eq!(incoming.hash, "deadbeef");
    receiver
        .engine
        .accept_transfer(id, output_dir)
        .await
        .expect("accept");

    let frame = protocol::read_frame_with_timeout(&mut stream, WAIT_TIMEOUT)
        .await
        .expect("read accept");
    assert_eq!(frame.message_type(), MessageType::Accept);
    assert_eq!(frame.transfer_id(), id);

    (stream, id)
}

async fn next_exception(peer: &mut Peer) -> Error {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            match peer.events.recv().await {
                Some(PresenterEvent::Exception(e)) => return e,
                Some(_) => {}
                None => panic!("presenter channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an exception")
}

/// Test that a sender that goes away mid-stream cancels the transfer.
#[tokio::test]
async fn test_disconnect_cancels_transfer() {
    let temp_dir = create_temp_dir();
    let mut receiver = spawn_peer(test_config()).await;

    let (mut stream, id) = announce_and_accept(&mut receiver, temp_dir.path(), 1000).await;
    protocol::write_frame(&mut stream, MessageType::Data, id, &[1u8; 400])
        .await
        .expect("send data");
    receiver.wait_until(id, |s| s.bytes_transferred == 400).await;
    drop(stream);

    let snapshot = receiver.wait_for_status(id, TransferStatus::Cancelled).await;
    assert_eq!(snapshot.bytes_transferred, 400);

    let error = next_exception(&mut receiver).await;
    assert!(matches!(error, Error::ConnectionLost(_)), "got {error:?}");

    let written = std::fs::read(temp_dir.path().join("raw.bin")).expect("read destination");
    assert_eq!(written, vec![1u8; 400]);
}

/// Test that DATA beyond the declared size is a protocol violation.
#[tokio::test]
async fn test_oversized_data_cancels_transfer() {
    let temp_dir = create_temp_dir();
    let mut receiver = spawn_peer(test_config()).await;

    let (mut stream, id) = announce_and_accept(&mut receiver, temp_dir.path(), 10).await;
    protocol::write_frame(&mut stream, MessageType::Data, id, &[0u8; 11])
        .await
        .expect("send data");

    let frame = protocol::read_frame_with_timeout(&mut stream, WAIT_TIMEOUT)
        .await
        .expect("read cancel");
    assert_eq!(frame.message_type(), MessageType::Cancel);

    let snapshot = receiver.wait_for_status(id, TransferStatus::Cancelled).await;
    assert_eq!(snapshot.bytes_transferred, 0);

    let error = next_exception(&mut receiver).await;
    assert!(matches!(error, Error::ProtocolError(_)), "got {error:?}");
}

/// Test that frames for other transfer IDs are ignored and DATA keeps
/// flowing while paused.
#[tokio::test]
async fn test_foreign_ids_ignored_and_paused_data_kept() {
    let temp_dir = create_temp_dir();
    let mut receiver = spawn_peer(test_config()).await;

    let (mut stream, id) = announce_and_accept(&mut receiver, temp_dir.path(), 8).await;

    protocol::write_frame(&mut stream, MessageType::Cancel, TransferId::new(), &[])
        .await
        .expect("send foreign cancel");
    protocol::write_frame(&mut stream, MessageType::Pause, id, &[])
        .await
        .expect("send pause");
    receiver.wait_for_status(id, TransferStatus::Paused).await;

    // chunks in flight when the pause landed still count
    protocol::write_frame(&mut stream, MessageType::Data, id, b"abcd")
        .await
        .expect("send data");
    receiver.wait_until(id, |s| s.bytes_transferred == 4).await;

    protocol::write_frame(&mut stream, MessageType::Resume, id, &[])
        .await
        .expect("send resume");
    receiver.wait_for_status(id, TransferStatus::Resumed).await;

    protocol::write_frame(&mut stream, MessageType::Data, id, b"efgh")
        .await
        .expect("send data");

    let frame = protocol::read_frame_with_timeout(&mut stream, WAIT_TIMEOUT)
        .await
        .expect("read finish");
    assert_eq!(frame.message_type(), MessageType::Finish);
    assert_eq!(frame.transfer_id(), id);

    receiver.wait_for_status(id, TransferStatus::Finished).await;
    let written = std::fs::read(temp_dir.path().join("raw.bin")).expect("read destination");
    assert_eq!(written, b"abcdefgh");
}

/// Test that a connection not opening with REQUEST registers nothing.
#[tokio::test]
async fn test_connection_without_request_is_dropped() {
    let receiver = spawn_peer(test_config()).await;

    let mut stream = TcpStream::connect(receiver.addr).await.expect("connect");
    protocol::write_frame(&mut stream, MessageType::Data, TransferId::new(), b"junk")
        .await
        .expect("send data");

    let result = protocol::read_frame_with_timeout(&mut stream, WAIT_TIMEOUT).await;
    assert!(result.is_err(), "receiver hangs up");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(receiver.engine.transfers().await.is_empty());
}

/// Test that an unknown message type byte ends the handler with an error.
#[tokio::test]
async fn test_unknown_message_type_is_reported() {
    let temp_dir = create_temp_dir();
    let mut receiver = spawn_peer(test_config()).await;

    let (mut stream, id) = announce_and_accept(&mut receiver, temp_dir.path(), 100).await;

    use tokio::io::AsyncWriteExt;
    let mut bogus = [0u8; protocol::HEADER_SIZE];
    bogus[0] = 0x7f;
    bogus[1..17].copy_from_slice(id.as_bytes());
    stream.write_all(&bogus).await.expect("write bogus header");

    receiver.wait_for_status(id, TransferStatus::Cancelled).await;
    let error = next_exception(&mut receiver).await;
    assert!(matches!(error, Error::ProtocolError(_)), "got {error:?}");
}
