//! Client conveniences for `tftp://host[:port]/filename` resources.
//!
//! `read` resolves the URL, sends the read request from a fresh ephemeral
//! socket, and hands back the byte stream while the inbound engine drives
//! acknowledgements in the background. `write` performs the WRQ handshake
//! and pushes the payload through an outbound engine in lockstep.
//!
//! Neither imposes an overall deadline; wrap the calls in
//! `tokio::time::timeout` to bound a transfer.

use std::cmp;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::lookup_host;
use tracing::debug;

use crate::error::{Result, TftpError};
use crate::inbound::DataReceiver;
use crate::outbound::DataSender;
use crate::packet::Packet;
use crate::server::bind_ephemeral;
use crate::stream::StreamReader;
use crate::{BLOCK_SIZE, DEFAULT_PORT, DEFAULT_RETRANSMIT_INTERVAL};

/// A parsed `tftp://` resource locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpUrl {
    pub host: String,
    pub port: u16,
    pub filename: String,
}

impl TftpUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("tftp://")
            .ok_or_else(|| TftpError::Other(anyhow!("unsupported URL scheme in '{url}'")))?;
        let (authority, filename) = rest
            .split_once('/')
            .ok_or_else(|| TftpError::Other(anyhow!("missing filename in '{url}'")))?;
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| TftpError::Other(anyhow!("invalid port in '{url}'")))?,
            ),
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(TftpError::Other(anyhow!("missing host in '{url}'")));
        }
        if filename.is_empty() {
            return Err(TftpError::Other(anyhow!("missing filename in '{url}'")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            filename: filename.to_string(),
        })
    }

    pub async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = lookup_host((self.host.as_str(), self.port)).await?;
        addrs
            .next()
            .ok_or_else(|| TftpError::Other(anyhow!("could not resolve host '{}'", self.host)))
    }
}

/// Start reading a remote resource; the returned stream yields the payload
/// and surfaces server errors as [`TftpError::RemotePeer`].
pub async fn read(url: &str) -> Result<StreamReader> {
    read_with(url, DEFAULT_RETRANSMIT_INTERVAL).await
}

pub async fn read_with(url: &str, retransmit_interval: Duration) -> Result<StreamReader> {
    let url = TftpUrl::parse(url)?;
    let server = url.resolve().await?;
    let socket = bind_ephemeral(server).await?;
    let request = Packet::rrq(url.filename.as_str()).to_bytes()?;
    let (receiver, stream) = DataReceiver::new_client(socket, server, request, retransmit_interval);
    receiver.spawn();
    debug!(%server, filename = %url.filename, "read request dispatched");
    Ok(stream)
}

/// Read the whole remote resource into memory.
pub async fn read_to_end(url: &str) -> Result<Vec<u8>> {
    let stream = read(url).await?;
    let mut payload = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

/// Write `data` to a remote resource; resolves to the number of bytes the
/// server acknowledged.
pub async fn write(url: &str, data: Bytes) -> Result<u64> {
    write_with(url, data, DEFAULT_RETRANSMIT_INTERVAL).await
}

pub async fn write_with(url: &str, data: Bytes, retransmit_interval: Duration) -> Result<u64> {
    let url = TftpUrl::parse(url)?;
    let server = url.resolve().await?;
    let socket = bind_ephemeral(server).await?;
    let sender = DataSender::new_client(socket, retransmit_interval);
    sender.start(&url.filename, server).await?;

    let mut remaining = data;
    loop {
        let chunk = remaining.split_to(cmp::min(BLOCK_SIZE, remaining.len()));
        sender.write(&chunk).await?;
        // A short block (possibly empty) terminates the transfer.
        if chunk.len() < BLOCK_SIZE {
            break;
        }
    }
    debug!(%server, filename = %url.filename, bytes = sender.output_size(), "write complete");
    Ok(sender.output_size())
}
