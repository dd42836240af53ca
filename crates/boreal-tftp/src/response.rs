//! Response adapters: how read handlers put bytes on the wire.
//!
//! Every adapter drives an outbound engine bound to a fresh ephemeral socket
//! for the requesting client. `StreamResponse` is the manual interface;
//! `BytesResponse` and `FileResponse` are the common preloaded cases.

use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::BLOCK_SIZE;
use crate::error::{Result, TftpError};
use crate::outbound::DataSender;
use crate::server::{Request, bind_ephemeral};

/// Hand-driven response: the handler calls `prepare`, then `write` as data
/// becomes available. Whole 512-byte blocks are flushed as they fill; the
/// trailing partial block goes out on `write_eof`. A total that is an exact
/// multiple of 512 ends with an explicit empty DATA block so the receiver
/// still sees a short block.
pub struct StreamResponse {
    writer: Option<DataSender>,
    buffer: BytesMut,
    eof_sent: bool,
    length: u64,
}

impl Default for StreamResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamResponse {
    pub fn new() -> Self {
        Self {
            writer: None,
            buffer: BytesMut::new(),
            eof_sent: false,
            length: 0,
        }
    }

    fn preloaded(data: Bytes) -> Self {
        Self {
            writer: None,
            buffer: BytesMut::from(data.as_ref()),
            eof_sent: false,
            length: 0,
        }
    }

    /// Bind the transfer socket and outbound engine. Idempotent.
    pub async fn prepare(&mut self, request: &Request) -> Result<()> {
        if self.eof_sent || self.writer.is_some() {
            return Ok(());
        }
        let socket = bind_ephemeral(request.remote).await?;
        debug!(local = ?socket.local_addr(), remote = %request.remote, "outbound transfer socket bound");
        self.writer = Some(DataSender::new_server(
            socket,
            request.remote,
            request.retransmit_interval,
        ));
        Ok(())
    }

    /// Buffer `data`, flushing every full block through the engine.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.eof_sent {
            return Err(TftpError::IllegalState("write after write_eof".into()));
        }
        let Some(writer) = &self.writer else {
            return Err(TftpError::IllegalState("write before prepare".into()));
        };
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= BLOCK_SIZE {
            let chunk = self.buffer.split_to(BLOCK_SIZE);
            writer.write(&chunk).await?;
        }
        Ok(())
    }

    /// Flush the remaining buffer (the short final block, possibly empty)
    /// and close the transfer socket.
    pub async fn write_eof(&mut self) -> Result<()> {
        if self.eof_sent {
            return Ok(());
        }
        let Some(writer) = &self.writer else {
            return Err(TftpError::IllegalState("write_eof before prepare".into()));
        };
        while self.buffer.len() >= BLOCK_SIZE {
            let chunk = self.buffer.split_to(BLOCK_SIZE);
            writer.write(&chunk).await?;
        }
        writer.write(&self.buffer).await?;
        self.buffer.clear();
        self.length = writer.output_size();
        self.eof_sent = true;
        self.writer = None;
        Ok(())
    }

    /// Total payload bytes acknowledged by the client.
    pub fn length(&self) -> u64 {
        self.length
    }
}

/// In-memory response body (the last block may be empty to terminate a
/// 512-aligned payload).
pub struct BytesResponse {
    inner: StreamResponse,
}

impl BytesResponse {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            inner: StreamResponse::preloaded(data.into()),
        }
    }
}

/// Response streamed from a file on disk; a missing path surfaces as
/// `FileNotFound` and reaches the client as the matching wire error.
pub struct FileResponse {
    inner: StreamResponse,
    path: PathBuf,
}

impl FileResponse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: StreamResponse::new(),
            path: path.into(),
        }
    }

    async fn prepare(&mut self, request: &Request) -> Result<()> {
        if self.inner.eof_sent {
            return Ok(());
        }
        self.inner.prepare(request).await?;
        let Some(writer) = &self.inner.writer else {
            return Err(TftpError::IllegalState("transfer socket not bound".into()));
        };

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TftpError::FileNotFound(self.path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut chunk = [0u8; BLOCK_SIZE];
        loop {
            let len = read_full(&mut file, &mut chunk).await?;
            writer.write(&chunk[..len]).await?;
            if len < BLOCK_SIZE {
                break;
            }
        }

        self.inner.length = writer.output_size();
        self.inner.eof_sent = true;
        self.inner.writer = None;
        Ok(())
    }
}

/// Fill `buf` from the file, stopping early only at end of file.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// What a read handler returns; the listener prepares it and flushes EOF.
pub enum Response {
    Bytes(BytesResponse),
    File(FileResponse),
    Stream(StreamResponse),
}

impl Response {
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Response::Bytes(BytesResponse::new(data))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Response::File(FileResponse::new(path))
    }

    pub async fn prepare(&mut self, request: &Request) -> Result<()> {
        match self {
            Response::Bytes(response) => response.inner.prepare(request).await,
            Response::File(response) => response.prepare(request).await,
            Response::Stream(response) => response.prepare(request).await,
        }
    }

    pub async fn write_eof(&mut self) -> Result<()> {
        match self {
            Response::Bytes(response) => response.inner.write_eof().await,
            Response::File(response) => response.inner.write_eof().await,
            Response::Stream(response) => response.write_eof().await,
        }
    }

    /// Bytes acknowledged by the client, for the access log.
    pub fn length(&self) -> u64 {
        match self {
            Response::Bytes(response) => response.inner.length(),
            Response::File(response) => response.inner.length(),
            Response::Stream(response) => response.length(),
        }
    }
}

impl From<BytesResponse> for Response {
    fn from(response: BytesResponse) -> Self {
        Response::Bytes(response)
    }
}

impl From<FileResponse> for Response {
    fn from(response: FileResponse) -> Self {
        Response::File(response)
    }
}

impl From<StreamResponse> for Response {
    fn from(response: StreamResponse) -> Self {
        Response::Stream(response)
    }
}
