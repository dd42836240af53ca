//! Outbound data engine: the sending half of a transfer (server RRQ
//! responses and client WRQ uploads).
//!
//! Strictly stop-and-wait per RFC 1350: one DATA block is outstanding at a
//! time and is retransmitted every `retransmit_interval` until the matching
//! ACK arrives. The engine never gives up on its own; the overall deadline
//! belongs to the caller.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::packet::{Opcode, Packet};
use crate::{BLOCK_SIZE, MAX_PACKET_SIZE};

pub struct DataSender {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    block_no: AtomicU16,
    busy: AtomicBool,
    output_size: AtomicU64,
    retransmit_interval: Duration,
}

impl DataSender {
    /// Server-side sender: the client TID is already known from the request.
    pub fn new_server(socket: UdpSocket, peer: SocketAddr, retransmit_interval: Duration) -> Self {
        Self {
            socket,
            peer: Mutex::new(Some(peer)),
            block_no: AtomicU16::new(0),
            busy: AtomicBool::new(false),
            output_size: AtomicU64::new(0),
            retransmit_interval,
        }
    }

    /// Client-side sender: the peer TID is learned from the server's ACK of
    /// the write request (RFC 1350 §4).
    pub fn new_client(socket: UdpSocket, retransmit_interval: Duration) -> Self {
        Self {
            socket,
            peer: Mutex::new(None),
            block_no: AtomicU16::new(0),
            busy: AtomicBool::new(false),
            output_size: AtomicU64::new(0),
            retransmit_interval,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Total payload bytes acknowledged so far.
    pub fn output_size(&self) -> u64 {
        self.output_size.load(Ordering::Relaxed)
    }

    fn peer(&self) -> Option<SocketAddr> {
        *self
            .peer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_peer(&self, addr: SocketAddr) {
        *self
            .peer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(addr);
    }

    /// Send `WRQ filename octet` to the server's well-known port and wait
    /// for `ACK(0)` on this socket, latching the sender's TID as the peer.
    pub async fn start(&self, filename: &str, server: SocketAddr) -> Result<()> {
        let request = Packet::wrq(filename).to_bytes()?;
        debug!(%server, filename, "sending write request");
        self.exchange(&request, server, 0).await
    }

    /// Transmit one block of at most 512 bytes and wait for its ACK. A block
    /// shorter than 512 bytes ends the transfer; the socket closes when the
    /// sender is dropped.
    pub async fn write(&self, chunk: &[u8]) -> Result<()> {
        if chunk.len() > BLOCK_SIZE {
            return Err(TftpError::IllegalState(format!(
                "block of {} bytes exceeds the {BLOCK_SIZE} byte limit",
                chunk.len()
            )));
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(TftpError::BusyWriter);
        }
        let result = self.send_block(chunk).await;
        self.busy.store(false, Ordering::Release);
        result
    }

    async fn send_block(&self, chunk: &[u8]) -> Result<()> {
        let peer = self.peer().ok_or_else(|| {
            TftpError::IllegalState("write before the peer transfer id is known".into())
        })?;

        // 1 -> 2 -> ... -> 65535 -> 0; long transfers wrap rather than stall.
        let block_no = self.block_no.load(Ordering::Relaxed).wrapping_add(1);
        self.block_no.store(block_no, Ordering::Relaxed);

        let packet = Packet::data(block_no, Bytes::copy_from_slice(chunk)).to_bytes()?;
        self.exchange(&packet, peer, block_no).await?;
        self.output_size
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send `packet` to `dest`, resend it every `retransmit_interval`, and
    /// return once `ACK(await_block)` arrives from the peer. An ERROR packet
    /// fails the exchange; datagrams from foreign TIDs are ignored.
    async fn exchange(&self, packet: &Bytes, dest: SocketAddr, await_block: u16) -> Result<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE + 4];

        self.socket.send_to(packet, dest).await?;
        let resend = sleep(self.retransmit_interval);
        tokio::pin!(resend);

        loop {
            tokio::select! {
                _ = &mut resend => {
                    debug!(block = await_block, "retransmitting unacknowledged packet");
                    self.socket.send_to(packet, dest).await?;
                    resend.as_mut().reset(Instant::now() + self.retransmit_interval);
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    if let Some(peer) = self.peer()
                        && from != peer
                    {
                        debug!(%from, "ignoring datagram from foreign transfer id");
                        continue;
                    }
                    let reply = match Packet::from_bytes(&buf[..len]) {
                        Ok(reply) => reply,
                        Err(err) => {
                            debug!(%from, %err, "ignoring malformed datagram");
                            continue;
                        }
                    };
                    match reply {
                        Packet::Ack { block_no } if block_no == await_block => {
                            if self.peer().is_none() {
                                debug!(%from, "peer transfer id latched");
                                self.set_peer(from);
                            }
                            return Ok(());
                        }
                        Packet::Ack { block_no } => {
                            debug!(block_no, expected = await_block, "ignoring stale ACK");
                        }
                        Packet::Error { code, message } => {
                            warn!(%from, ?code, message, "peer aborted the transfer");
                            return Err(TftpError::RemotePeer(message));
                        }
                        other => {
                            debug!(opcode = ?opcode_of(&other), "ignoring unexpected packet");
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_block_no(&self, block_no: u16) {
        self.block_no.store(block_no, Ordering::Relaxed);
    }
}

fn opcode_of(packet: &Packet) -> Opcode {
    match packet {
        Packet::Request { opcode, .. } => *opcode,
        Packet::Data { .. } => Opcode::Data,
        Packet::Ack { .. } => Opcode::Ack,
        Packet::Error { .. } => Opcode::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::packet::ErrorCode;

    const FAST: Duration = Duration::from_millis(100);

    async fn socket_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (a, b)
    }

    async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; MAX_PACKET_SIZE + 4];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a packet")
            .unwrap();
        (Packet::from_bytes(&buf[..len]).unwrap(), from)
    }

    #[tokio::test]
    async fn write_completes_on_matching_ack() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);

        let writer = tokio::spawn(async move {
            sender.write(b"hello").await.unwrap();
            sender.output_size()
        });

        let (packet, from) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::data(1, &b"hello"[..]));
        peer.send_to(&Packet::ack(1).to_bytes().unwrap(), from)
            .await
            .unwrap();

        assert_eq!(writer.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn block_counter_wraps_to_zero() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);
        sender.set_block_no(65535);

        let writer = tokio::spawn(async move { sender.write(b"wrap").await });

        let (packet, from) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::data(0, &b"wrap"[..]));
        peer.send_to(&Packet::ack(0).to_bytes().unwrap(), from)
            .await
            .unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retransmits_until_acknowledged() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);

        let writer = tokio::spawn(async move { sender.write(b"again").await });

        let (first, _) = recv_packet(&peer).await;
        let (second, from) = recv_packet(&peer).await;
        assert_eq!(first, second);

        peer.send_to(&Packet::ack(1).to_bytes().unwrap(), from)
            .await
            .unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_ack_does_not_complete_the_write() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);

        let writer = tokio::spawn(async move { sender.write(b"block").await });

        let (_, from) = recv_packet(&peer).await;
        peer.send_to(&Packet::ack(7).to_bytes().unwrap(), from)
            .await
            .unwrap();

        // The stale ACK is ignored; the engine keeps retransmitting.
        let (retransmit, _) = recv_packet(&peer).await;
        assert_eq!(retransmit, Packet::data(1, &b"block"[..]));

        peer.send_to(&Packet::ack(1).to_bytes().unwrap(), from)
            .await
            .unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn foreign_tid_acks_are_ignored() {
        let (engine_socket, peer) = socket_pair().await;
        let engine_addr = engine_socket.local_addr().unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);

        let writer = tokio::spawn(async move { sender.write(b"pinned").await });
        let (_, from) = recv_packet(&peer).await;

        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        intruder
            .send_to(&Packet::ack(1).to_bytes().unwrap(), engine_addr)
            .await
            .unwrap();

        // Still unacknowledged from the real peer, so the block comes again.
        let (retransmit, _) = recv_packet(&peer).await;
        assert_eq!(retransmit, Packet::data(1, &b"pinned"[..]));

        peer.send_to(&Packet::ack(1).to_bytes().unwrap(), from)
            .await
            .unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_error_fails_the_write() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);

        let writer = tokio::spawn(async move { sender.write(b"doomed").await });

        let (_, from) = recv_packet(&peer).await;
        peer.send_to(
            &Packet::error(ErrorCode::DiskFull, "Disk full")
                .to_bytes()
                .unwrap(),
            from,
        )
        .await
        .unwrap();

        assert!(matches!(
            writer.await.unwrap(),
            Err(TftpError::RemotePeer(message)) if message == "Disk full"
        ));
    }

    #[tokio::test]
    async fn concurrent_write_is_rejected() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = Arc::new(DataSender::new_server(engine_socket, peer_addr, FAST));

        let first = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.write(&[b'a'; BLOCK_SIZE]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            sender.write(b"second").await,
            Err(TftpError::BusyWriter)
        ));

        let (_, from) = recv_packet(&peer).await;
        peer.send_to(&Packet::ack(1).to_bytes().unwrap(), from)
            .await
            .unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_block_is_rejected() {
        let (engine_socket, peer) = socket_pair().await;
        let peer_addr = peer.local_addr().unwrap();
        let sender = DataSender::new_server(engine_socket, peer_addr, FAST);
        assert!(matches!(
            sender.write(&[0u8; BLOCK_SIZE + 1]).await,
            Err(TftpError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn start_latches_peer_from_ack_zero() {
        let (engine_socket, listener) = socket_pair().await;
        let listener_addr = listener.local_addr().unwrap();
        let sender = Arc::new(DataSender::new_client(engine_socket, FAST));

        let handshake = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.start("upload.bin", listener_addr).await })
        };

        let (request, client_addr) = recv_packet(&listener).await;
        assert_eq!(request, Packet::wrq("upload.bin"));

        // The ACK arrives from a fresh ephemeral socket, the transfer TID.
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        transfer
            .send_to(&Packet::ack(0).to_bytes().unwrap(), client_addr)
            .await
            .unwrap();
        handshake.await.unwrap().unwrap();

        // Subsequent blocks go to the latched TID, not the well-known port.
        let writer = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.write(b"payload").await })
        };
        let (packet, from) = recv_packet(&transfer).await;
        assert_eq!(packet, Packet::data(1, &b"payload"[..]));
        transfer
            .send_to(&Packet::ack(1).to_bytes().unwrap(), from)
            .await
            .unwrap();
        writer.await.unwrap().unwrap();
    }
}
