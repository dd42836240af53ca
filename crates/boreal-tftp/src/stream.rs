//! Single-producer/single-consumer byte stream backing inbound transfers.
//!
//! The inbound engine feeds chunks and EOF (or a terminal error) from its
//! socket task; the handler or client consumes them. At most one task may be
//! suspended in `read*` and one in `wait_eof` at any moment.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::{Result, TftpError};

#[derive(Debug, Default)]
struct Inner {
    buffer: VecDeque<Bytes>,
    size: usize,
    total_bytes: u64,
    eof: bool,
    exception: Option<TftpError>,
    read_waiting: bool,
    eof_waiting: bool,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    data_ready: Notify,
    eof_ready: Notify,
}

/// Ordered queue of received chunks with EOF and error signalling.
#[derive(Debug, Clone)]
pub struct StreamReader {
    shared: Arc<Shared>,
}

impl Default for StreamReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReader {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                data_ready: Notify::new(),
                eof_ready: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a chunk from the producer. Empty chunks are discarded.
    pub fn feed_data(&self, data: Bytes) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.eof {
                return Err(TftpError::IllegalState("feed_data after feed_eof".into()));
            }
            if data.is_empty() {
                return Ok(());
            }
            inner.size += data.len();
            inner.total_bytes += data.len() as u64;
            inner.buffer.push_back(data);
        }
        self.shared.data_ready.notify_one();
        Ok(())
    }

    /// Mark the end of the stream and wake any pending waiters.
    pub fn feed_eof(&self) {
        self.lock().eof = true;
        self.shared.data_ready.notify_one();
        self.shared.eof_ready.notify_one();
    }

    /// Attach a terminal error; every subsequent read reports it.
    pub fn set_exception(&self, err: TftpError) {
        self.lock().exception = Some(err);
        self.shared.data_ready.notify_one();
        self.shared.eof_ready.notify_one();
    }

    pub fn exception(&self) -> Option<TftpError> {
        self.lock().exception.clone()
    }

    /// The producer has signalled EOF (buffered chunks may remain).
    pub fn is_eof(&self) -> bool {
        self.lock().eof
    }

    /// EOF has been signalled and the buffer is fully drained.
    pub fn at_eof(&self) -> bool {
        let inner = self.lock();
        inner.eof && inner.buffer.is_empty()
    }

    /// Total bytes ever fed into the stream.
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Suspend until the producer signals EOF or a terminal error.
    pub async fn wait_eof(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if let Some(err) = &inner.exception {
                return Err(err.clone());
            }
            if inner.eof {
                return Ok(());
            }
            if inner.eof_waiting {
                return Err(TftpError::IllegalState(
                    "wait_eof called while another task is already waiting".into(),
                ));
            }
            inner.eof_waiting = true;
        }
        let _guard = WaitGuard {
            shared: &self.shared,
            eof: true,
        };
        loop {
            self.shared.eof_ready.notified().await;
            let inner = self.lock();
            if let Some(err) = &inner.exception {
                return Err(err.clone());
            }
            if inner.eof {
                return Ok(());
            }
        }
    }

    /// Drain up to `n` bytes, suspending while the buffer is empty before
    /// EOF. The head chunk is split when it is larger than `n`. Returns an
    /// empty buffer once the stream is drained at EOF.
    pub async fn read(&self, n: usize) -> Result<Bytes> {
        self.read_limited(Some(n)).await
    }

    /// Drain everything currently buffered, suspending first if necessary.
    pub async fn read_any(&self) -> Result<Bytes> {
        self.read_limited(None).await
    }

    /// Async-iteration stand-in: `Some(chunk)` until drained at EOF.
    pub async fn next_chunk(&self) -> Result<Option<Bytes>> {
        let chunk = self.read_any().await?;
        if chunk.is_empty() { Ok(None) } else { Ok(Some(chunk)) }
    }

    async fn read_limited(&self, limit: Option<usize>) -> Result<Bytes> {
        {
            let mut inner = self.lock();
            if let Some(err) = &inner.exception {
                return Err(err.clone());
            }
            if !inner.buffer.is_empty() || inner.eof {
                return Ok(drain(&mut inner, limit));
            }
            if inner.read_waiting {
                return Err(TftpError::IllegalState(
                    "read called while another task is already waiting for data".into(),
                ));
            }
            inner.read_waiting = true;
        }
        let _guard = WaitGuard {
            shared: &self.shared,
            eof: false,
        };
        loop {
            self.shared.data_ready.notified().await;
            let mut inner = self.lock();
            if let Some(err) = &inner.exception {
                return Err(err.clone());
            }
            if !inner.buffer.is_empty() || inner.eof {
                return Ok(drain(&mut inner, limit));
            }
        }
    }
}

fn drain(inner: &mut Inner, limit: Option<usize>) -> Bytes {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut remaining = limit.unwrap_or(usize::MAX);

    while remaining > 0 {
        let Some(front) = inner.buffer.front_mut() else {
            break;
        };
        if front.len() > remaining {
            chunks.push(front.split_to(remaining));
            remaining = 0;
        } else {
            remaining -= front.len();
            if let Some(chunk) = inner.buffer.pop_front() {
                chunks.push(chunk);
            }
        }
    }

    let drained: usize = chunks.iter().map(Bytes::len).sum();
    inner.size -= drained;

    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.remove(0),
        _ => {
            let mut joined = BytesMut::with_capacity(drained);
            for chunk in &chunks {
                joined.extend_from_slice(chunk);
            }
            joined.freeze()
        }
    }
}

struct WaitGuard<'a> {
    shared: &'a Shared,
    eof: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.eof {
            inner.eof_waiting = false;
        } else {
            inner.read_waiting = false;
        }
    }
}
