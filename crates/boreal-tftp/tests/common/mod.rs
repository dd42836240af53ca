//! Shared fixtures for the integration tests: a listener on an ephemeral
//! loopback port with a fast retransmission clock, and raw-socket helpers
//! for scripting one side of an exchange datagram by datagram.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use boreal_tftp::config::TftpConfig;
use boreal_tftp::{BoundServer, MAX_PACKET_SIZE, Packet};
use tokio::net::UdpSocket;

pub const FAST_RETRANSMIT_SECS: f64 = 0.2;

pub fn test_config() -> TftpConfig {
    let mut config = TftpConfig::default();
    config.bind_addr = "127.0.0.1:0".parse().expect("loopback addr");
    config.retransmit_interval_secs = FAST_RETRANSMIT_SECS;
    config.logging.audit_enabled = false;
    config
}

/// Run the bound listener on a background task.
pub fn spawn_server(bound: &BoundServer) {
    let runner = bound.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
}

pub async fn raw_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind raw socket")
}

pub async fn send_packet(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
    socket
        .send_to(&packet.to_bytes().expect("encode packet"), addr)
        .await
        .expect("send packet");
}

/// Receive and parse the next datagram, failing the test after 5 seconds.
pub async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; MAX_PACKET_SIZE + 4];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .expect("recv failed");
    (Packet::from_bytes(&buf[..len]).expect("parse packet"), from)
}

/// Receive the next datagram if one arrives within `window`.
pub async fn recv_packet_within(
    socket: &UdpSocket,
    window: Duration,
) -> Option<(Packet, SocketAddr)> {
    let mut buf = [0u8; MAX_PACKET_SIZE + 4];
    match tokio::time::timeout(window, socket.recv_from(&mut buf)).await {
        Ok(received) => {
            let (len, from) = received.expect("recv failed");
            Some((Packet::from_bytes(&buf[..len]).expect("parse packet"), from))
        }
        Err(_) => None,
    }
}
