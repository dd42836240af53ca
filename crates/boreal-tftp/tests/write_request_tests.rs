//! Write-request (WRQ) transfers: the raw lockstep exchange and the client
//! upload API, including 512-aligned and empty payloads.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use boreal_tftp::{BLOCK_SIZE, BoundServer, Packet, TftpServer};
use common::*;
use tokio::sync::Mutex;

type Uploads = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// A server that stores every upload in memory.
async fn upload_server(config: boreal_tftp::TftpConfig) -> (BoundServer, Uploads) {
    let uploads: Uploads = Arc::new(Mutex::new(HashMap::new()));
    let sink = uploads.clone();
    let bound = TftpServer::new(config)
        .on_write(move |request| {
            let sink = sink.clone();
            async move {
                let data = request.read_all().await?;
                sink.lock().await.insert(request.filename.clone(), data.to_vec());
                Ok(())
            }
        })
        .bind()
        .await
        .expect("bind server");
    spawn_server(&bound);
    (bound, uploads)
}

async fn stored(uploads: &Uploads, filename: &str) -> Vec<u8> {
    for _ in 0..50 {
        if let Some(data) = uploads.lock().await.get(filename) {
            return data.clone();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("upload '{filename}' never arrived");
}

#[tokio::test]
async fn stores_upload_via_raw_exchange() {
    let (bound, uploads) = upload_server(test_config()).await;
    let server_addr = bound.local_addr().unwrap();

    let client = raw_socket().await;
    send_packet(&client, &Packet::wrq("file"), server_addr).await;

    // ACK(0) comes from the per-transfer port, not the listener.
    let (ack0, transfer_addr) = recv_packet(&client).await;
    assert_eq!(ack0, Packet::ack(0));
    assert_ne!(transfer_addr, server_addr);

    send_packet(&client, &Packet::data(1, vec![b'a'; BLOCK_SIZE]), transfer_addr).await;
    let (ack1, _) = recv_packet(&client).await;
    assert_eq!(ack1, Packet::ack(1));

    send_packet(&client, &Packet::data(2, vec![b'a'; 488]), transfer_addr).await;
    let (ack2, _) = recv_packet(&client).await;
    assert_eq!(ack2, Packet::ack(2));

    assert_eq!(stored(&uploads, "file").await, vec![b'a'; 1000]);
}

#[tokio::test]
async fn uploads_through_the_client_api() {
    let (bound, uploads) = upload_server(test_config()).await;
    let port = bound.local_addr().unwrap().port();

    let payload = Bytes::from(vec![b'z'; 1000]);
    let url = format!("tftp://127.0.0.1:{port}/upload.bin");
    let sent = boreal_tftp::client::write_with(&url, payload.clone(), Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(sent, 1000);
    assert_eq!(stored(&uploads, "upload.bin").await, payload);
}

#[tokio::test]
async fn uploads_512_aligned_payload() {
    let (bound, uploads) = upload_server(test_config()).await;
    let port = bound.local_addr().unwrap().port();

    let payload = Bytes::from(vec![b'q'; 2 * BLOCK_SIZE]);
    let url = format!("tftp://127.0.0.1:{port}/aligned.bin");
    let sent = boreal_tftp::client::write_with(&url, payload.clone(), Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(sent, 2 * BLOCK_SIZE as u64);
    assert_eq!(stored(&uploads, "aligned.bin").await, payload);
}

#[tokio::test]
async fn uploads_empty_payload() {
    let (bound, uploads) = upload_server(test_config()).await;
    let port = bound.local_addr().unwrap().port();

    let url = format!("tftp://127.0.0.1:{port}/empty");
    let sent = boreal_tftp::client::write_with(&url, Bytes::new(), Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(sent, 0);
    assert_eq!(stored(&uploads, "empty").await, Vec::<u8>::new());
}

#[tokio::test]
async fn duplicate_data_is_not_stored_twice() {
    let (bound, uploads) = upload_server(test_config()).await;
    let server_addr = bound.local_addr().unwrap();

    let client = raw_socket().await;
    send_packet(&client, &Packet::wrq("once"), server_addr).await;
    let (_, transfer_addr) = recv_packet(&client).await;

    let block = Packet::data(1, vec![b'b'; BLOCK_SIZE]);
    send_packet(&client, &block, transfer_addr).await;
    let (ack1, _) = recv_packet(&client).await;
    assert_eq!(ack1, Packet::ack(1));

    // Pretend the ACK was lost and retransmit the same block.
    send_packet(&client, &block, transfer_addr).await;

    send_packet(&client, &Packet::data(2, &b"end"[..]), transfer_addr).await;
    let mut saw_final_ack = false;
    for _ in 0..3 {
        let (packet, _) = recv_packet(&client).await;
        if packet == Packet::ack(2) {
            saw_final_ack = true;
            break;
        }
        // Re-sent ACK(1) for the duplicate is fine; anything else is not.
        assert_eq!(packet, Packet::ack(1));
    }
    assert!(saw_final_ack);

    let mut expected = vec![b'b'; BLOCK_SIZE];
    expected.extend_from_slice(b"end");
    assert_eq!(stored(&uploads, "once").await, expected);
}
