//! Inbound data engine: the receiving half of a transfer (server WRQ
//! reception and client RRQ downloads).
//!
//! The engine owns its socket and a [`StreamReader`] producer handle. It
//! keeps one "current" packet armed for retransmission: the initial `ACK(0)`
//! (server side) or the read request itself (client side), later the ACK of
//! the most recently accepted block. The timer resends that packet every
//! `retransmit_interval` until the next expected DATA supersedes it, which
//! also covers duplicate DATA from a sender whose ACK was lost.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::packet::Packet;
use crate::stream::StreamReader;
use crate::{BLOCK_SIZE, MAX_PACKET_SIZE};

pub struct DataReceiver {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    dest: SocketAddr,
    expected_block: u16,
    current: Bytes,
    retransmit_interval: Duration,
    stream: StreamReader,
}

impl DataReceiver {
    /// Server-side receiver: the client TID is known, the first packet out
    /// is `ACK(0)`.
    pub fn new_server(
        socket: UdpSocket,
        peer: SocketAddr,
        retransmit_interval: Duration,
    ) -> Result<(Self, StreamReader)> {
        let stream = StreamReader::new();
        let receiver = Self {
            socket,
            peer: Some(peer),
            dest: peer,
            expected_block: 1,
            current: Packet::ack(0).to_bytes()?,
            retransmit_interval,
            stream: stream.clone(),
        };
        Ok((receiver, stream))
    }

    /// Client-side receiver: sends `request` to the server's well-known port
    /// and latches the peer TID from the first datagram that comes back
    /// (RFC 1350 §4).
    pub fn new_client(
        socket: UdpSocket,
        server: SocketAddr,
        request: Bytes,
        retransmit_interval: Duration,
    ) -> (Self, StreamReader) {
        let stream = StreamReader::new();
        let receiver = Self {
            socket,
            peer: None,
            dest: server,
            expected_block: 1,
            current: request,
            retransmit_interval,
            stream: stream.clone(),
        };
        (receiver, stream)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Drive the transfer on a background task. The task ends when the last
    /// block has been acknowledged, the peer aborts, or the socket fails.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let stream = self.stream.clone();
        if let Err(err) = self.drive().await {
            warn!(%err, "inbound transfer failed");
            if !stream.is_eof() {
                // A socket failure mid-transfer surfaces as a closed
                // transport; anything else keeps its own kind.
                stream.set_exception(match err {
                    TftpError::Io(_) => TftpError::TransportClosed,
                    other => other,
                });
            }
        }
        // The socket drops here. There is no dally on the final ACK: a
        // sender that loses it will retransmit into a closed port and has to
        // rely on its own deadline.
    }

    async fn drive(&mut self) -> Result<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE + 4];

        self.socket.send_to(&self.current, self.dest).await?;
        let resend = sleep(self.retransmit_interval);
        tokio::pin!(resend);

        loop {
            tokio::select! {
                _ = &mut resend => {
                    debug!(expected = self.expected_block, "retransmitting current packet");
                    self.socket.send_to(&self.current, self.dest).await?;
                    resend.as_mut().reset(Instant::now() + self.retransmit_interval);
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    match self.peer {
                        Some(peer) if from != peer => {
                            debug!(%from, "ignoring datagram from foreign transfer id");
                            continue;
                        }
                        Some(_) => {}
                        None => {
                            debug!(%from, "peer transfer id latched");
                            self.peer = Some(from);
                            self.dest = from;
                        }
                    }

                    let packet = match Packet::from_bytes(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(err) => {
                            debug!(%from, %err, "ignoring malformed datagram");
                            continue;
                        }
                    };
                    match packet {
                        Packet::Data { block_no, payload } if block_no == self.expected_block => {
                            let last = payload.len() < BLOCK_SIZE;
                            let ack = Packet::ack(block_no).to_bytes()?;
                            self.socket.send_to(&ack, self.dest).await?;

                            if last {
                                // Final ACK goes out exactly once.
                                self.stream.feed_data(payload)?;
                                self.stream.feed_eof();
                                return Ok(());
                            }

                            self.current = ack;
                            self.expected_block = self.expected_block.wrapping_add(1);
                            resend.as_mut().reset(Instant::now() + self.retransmit_interval);
                            self.stream.feed_data(payload)?;
                        }
                        Packet::Data { block_no, .. } => {
                            // Duplicate or out-of-window block; the timer
                            // keeps re-sending the last ACK.
                            debug!(block_no, expected = self.expected_block, "ignoring out-of-turn DATA");
                        }
                        Packet::Error { code, message } => {
                            warn!(%from, ?code, message, "peer aborted the transfer");
                            self.stream.set_exception(TftpError::RemotePeer(message));
                            return Ok(());
                        }
                        other => {
                            debug!(?other, "ignoring unexpected packet");
                        }
                    }
                }
            }
        }
    }
}
