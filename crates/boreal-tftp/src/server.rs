//! Primary listener: accepts requests on the well-known port, validates
//! opcode and mode, and dispatches each transfer onto its own task with its
//! own ephemeral socket (RFC 1350 §4: a fresh TID per transfer).
//!
//! The listener socket itself only ever carries the opening request from a
//! client and server-originated ERROR packets; all DATA/ACK traffic flows on
//! the per-transfer sockets.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AccessLog, AuditLogger};
use crate::config::{SocketConfig, TftpConfig};
use crate::error::{Result, TftpError};
use crate::inbound::DataReceiver;
use crate::packet::{ErrorCode, Mode, Opcode, Packet};
use crate::response::Response;
use crate::stream::StreamReader;

/// Transfer direction requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Rrq,
    Wrq,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Rrq => "RRQ",
            Method::Wrq => "WRQ",
        }
    }
}

/// An accepted request, handed to the user's read or write handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub filename: String,
    pub remote: SocketAddr,
    pub method: Method,
    /// RFC 2347 options from the wire; parsed but not negotiated.
    pub options: HashMap<String, String>,
    pub(crate) retransmit_interval: Duration,
    pub(crate) stream: Option<StreamReader>,
}

impl Request {
    /// The byte stream of an inbound (WRQ) transfer. The engine behind it is
    /// already running and has acknowledged block 0.
    pub fn accept(&self) -> Result<StreamReader> {
        match (&self.stream, self.method) {
            (Some(stream), _) => Ok(stream.clone()),
            (None, Method::Rrq) => Err(TftpError::IllegalState(
                "accept called on a read request".into(),
            )),
            (None, Method::Wrq) => Err(TftpError::IllegalState(
                "no inbound transfer bound to this request".into(),
            )),
        }
    }

    /// Drain the whole inbound transfer into one buffer.
    pub async fn read_all(&self) -> Result<Bytes> {
        let stream = self.accept()?;
        let mut payload = BytesMut::new();
        while let Some(chunk) = stream.next_chunk().await? {
            payload.extend_from_slice(&chunk);
        }
        Ok(payload.freeze())
    }
}

type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type ReadHandler = Arc<dyn Fn(Request) -> HandlerFuture<Response> + Send + Sync>;
type WriteHandler = Arc<dyn Fn(Request) -> HandlerFuture<()> + Send + Sync>;

/// Listener factory. Register handlers, then [`bind`](TftpServer::bind).
pub struct TftpServer {
    config: TftpConfig,
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
    access_log: Option<Arc<dyn AccessLog>>,
}

impl TftpServer {
    pub fn new(config: TftpConfig) -> Self {
        let access_log: Option<Arc<dyn AccessLog>> = config
            .logging
            .audit_enabled
            .then(|| Arc::new(AuditLogger) as Arc<dyn AccessLog>);
        Self {
            config,
            read: None,
            write: None,
            access_log,
        }
    }

    /// Handler invoked for each read request; it returns the [`Response`]
    /// that will be streamed back to the client.
    pub fn on_read<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.read = Some(Arc::new(move |request| Box::pin(handler(request))));
        self
    }

    /// Handler invoked for each write request; it consumes the inbound
    /// stream via [`Request::accept`].
    pub fn on_write<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.write = Some(Arc::new(move |request| Box::pin(handler(request))));
        self
    }

    /// Replace the per-transfer access log collaborator.
    pub fn with_access_log(mut self, log: Arc<dyn AccessLog>) -> Self {
        self.access_log = Some(log);
        self
    }

    /// Bind the listener socket and return the running server handle.
    pub async fn bind(self) -> Result<BoundServer> {
        let socket = bind_listener(self.config.bind_addr, &self.config.socket)?;
        info!("TFTP server listening on {}", socket.local_addr()?);
        Ok(BoundServer {
            socket: Arc::new(socket),
            state: Arc::new(ServerState {
                read: self.read,
                write: self.write,
                access_log: self.access_log,
                audit_enabled: self.config.logging.audit_enabled,
                retransmit_interval: self.config.retransmit_interval(),
            }),
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        })
    }
}

struct ServerState {
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
    access_log: Option<Arc<dyn AccessLog>>,
    audit_enabled: bool,
    retransmit_interval: Duration,
}

/// A listener bound to its socket, ready to serve.
#[derive(Clone)]
pub struct BoundServer {
    socket: Arc<UdpSocket>,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve requests until [`shutdown`](BoundServer::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        // Requests are small; anything oversized still parses to a reject.
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("listener loop stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => self.dispatch(&buf[..len], addr).await,
                        Err(err) => error!(%err, "error receiving on listener socket"),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, datagram: &[u8], addr: SocketAddr) {
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%addr, %err, "rejecting malformed datagram");
                if self.state.audit_enabled {
                    AuditLogger::protocol_violation(&addr.to_string(), "malformed packet");
                }
                send_wire_error(&self.socket, addr, ErrorCode::NotDefined, "invalid packet").await;
                return;
            }
        };
        let Packet::Request {
            opcode,
            filename,
            mode,
            options,
        } = packet
        else {
            warn!(%addr, "rejecting non-request opcode on the listener port");
            if self.state.audit_enabled {
                AuditLogger::protocol_violation(&addr.to_string(), "non-request opcode");
            }
            send_wire_error(&self.socket, addr, ErrorCode::NotDefined, "invalid opcode").await;
            return;
        };
        if mode != Mode::Octet {
            let err = TftpError::BadMode(mode.as_str().to_string());
            warn!(%addr, %err, "rejecting request");
            if self.state.audit_enabled {
                AuditLogger::protocol_violation(&addr.to_string(), "unsupported transfer mode");
            }
            send_wire_error(&self.socket, addr, ErrorCode::NotDefined, "OCTET mode only").await;
            return;
        }

        let request = Request {
            filename,
            remote: addr,
            method: match opcode {
                Opcode::Rrq => Method::Rrq,
                _ => Method::Wrq,
            },
            options,
            retransmit_interval: self.state.retransmit_interval,
            stream: None,
        };

        let state = self.state.clone();
        let listener = self.socket.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap transfers that already finished.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match request.method {
                Method::Rrq => serve_read(state, listener, request).await,
                Method::Wrq => serve_write(state, listener, request).await,
            }
        });
    }

    /// Stop accepting requests and drain in-flight transfers, cancelling
    /// whatever is still running once the grace period expires.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace period expired, cancelling in-flight transfers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("TFTP server stopped");
    }
}

async fn serve_read(state: Arc<ServerState>, listener: Arc<UdpSocket>, request: Request) {
    let started = Instant::now();
    let correlation = Uuid::new_v4().to_string();
    if state.audit_enabled {
        AuditLogger::request_received(&request, &correlation);
    }

    let Some(handler) = state.read.clone() else {
        warn!(remote = %request.remote, "read request but no read handler is registered");
        if state.audit_enabled {
            AuditLogger::request_denied(&request, "no read handler registered", &correlation);
        }
        send_wire_error(
            &listener,
            request.remote,
            ErrorCode::AccessViolation,
            "Permission denied",
        )
        .await;
        return;
    };

    debug!(remote = %request.remote, filename = %request.filename, "dispatching read request");
    let mut response = match handler(request.clone()).await {
        Ok(response) => response,
        Err(err) => {
            error!(%err, filename = %request.filename, "read handler failed");
            reply_handler_error(&state, &listener, &request, &err, &correlation).await;
            return;
        }
    };

    match response.prepare(&request).await {
        Ok(()) => {}
        Err(err) => {
            error!(%err, filename = %request.filename, "read transfer failed");
            reply_handler_error(&state, &listener, &request, &err, &correlation).await;
            return;
        }
    }
    if let Err(err) = response.write_eof().await {
        error!(%err, filename = %request.filename, "read transfer failed");
        if state.audit_enabled {
            AuditLogger::transfer_failed(&request, &err, &correlation);
        }
        return;
    }

    if let Some(log) = &state.access_log {
        log.log_transfer(&request, Some(&response), started.elapsed());
    }
}

async fn serve_write(state: Arc<ServerState>, listener: Arc<UdpSocket>, mut request: Request) {
    let started = Instant::now();
    let correlation = Uuid::new_v4().to_string();
    if state.audit_enabled {
        AuditLogger::request_received(&request, &correlation);
    }

    let Some(handler) = state.write.clone() else {
        warn!(remote = %request.remote, "write request but no write handler is registered");
        if state.audit_enabled {
            AuditLogger::request_denied(&request, "no write handler registered", &correlation);
        }
        send_wire_error(
            &listener,
            request.remote,
            ErrorCode::AccessViolation,
            "Permission denied",
        )
        .await;
        return;
    };

    // Bind the inbound engine before the handler runs; it acknowledges
    // block 0 and starts collecting DATA while the handler gets going.
    let engine = match bind_ephemeral(request.remote).await {
        Ok(socket) => DataReceiver::new_server(socket, request.remote, request.retransmit_interval),
        Err(err) => {
            error!(%err, "failed to bind a transfer socket");
            reply_handler_error(&state, &listener, &request, &err, &correlation).await;
            return;
        }
    };
    let _engine = match engine {
        Ok((receiver, stream)) => {
            request.stream = Some(stream);
            EngineGuard(receiver.spawn())
        }
        Err(err) => {
            error!(%err, "failed to start the inbound engine");
            reply_handler_error(&state, &listener, &request, &err, &correlation).await;
            return;
        }
    };

    debug!(remote = %request.remote, filename = %request.filename, "dispatching write request");
    let outcome = handler(request.clone()).await;

    match outcome {
        Ok(()) => {
            if let Some(log) = &state.access_log {
                log.log_transfer(&request, None, started.elapsed());
            }
        }
        Err(err) => {
            error!(%err, filename = %request.filename, "write handler failed");
            reply_handler_error(&state, &listener, &request, &err, &correlation).await;
        }
    }
}

/// Stops the inbound engine (closing its socket) when the dispatch task
/// finishes or is cancelled.
struct EngineGuard(tokio::task::JoinHandle<()>);

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Translate a handler failure into the wire error taxonomy.
async fn reply_handler_error(
    state: &ServerState,
    listener: &UdpSocket,
    request: &Request,
    err: &TftpError,
    correlation: &str,
) {
    if state.audit_enabled {
        AuditLogger::transfer_failed(request, err, correlation);
    }
    let (code, message) = match err {
        TftpError::FileNotFound(_) => (ErrorCode::FileNotFound, "File not found".to_string()),
        TftpError::AccessViolation => (ErrorCode::AccessViolation, "Permission denied".to_string()),
        other => (ErrorCode::NotDefined, last_display_line(other)),
    };
    send_wire_error(listener, request.remote, code, &message).await;
}

fn last_display_line(err: &TftpError) -> String {
    err.to_string()
        .lines()
        .last()
        .unwrap_or("internal error")
        .to_string()
}

pub(crate) async fn send_wire_error(
    socket: &UdpSocket,
    addr: SocketAddr,
    code: ErrorCode,
    message: &str,
) {
    // Fall back to the code's stock message if the diagnostic is not
    // representable as ASCII.
    let packet = Packet::error(code, message)
        .to_bytes()
        .or_else(|_| Packet::error(code, code.message()).to_bytes());
    match packet {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, addr).await {
                warn!(%err, %addr, "failed to send ERROR packet");
            } else {
                debug!(%addr, ?code, message, "sent ERROR packet");
            }
        }
        Err(err) => warn!(%err, "failed to encode ERROR packet"),
    }
}

/// Bind a fresh ephemeral socket in the same address family as the peer.
pub(crate) async fn bind_ephemeral(remote: SocketAddr) -> Result<UdpSocket> {
    let unspecified: IpAddr = if remote.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    Ok(UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?)
}

/// Build the listener socket with address reuse and sized buffers, then hand
/// it to tokio.
fn bind_listener(bind_addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if config.reuse_address {
        socket.set_reuse_address(true)?;
        debug!("enabled SO_REUSEADDR on the listener socket");
    }

    // Buffer sizing is best-effort; the kernel may clamp it.
    if let Err(err) = socket.set_recv_buffer_size(config.recv_buffer_kb * 1024) {
        warn!(%err, "failed to set SO_RCVBUF to {} KB", config.recv_buffer_kb);
    }
    if let Err(err) = socket.set_send_buffer_size(config.send_buffer_kb * 1024) {
        warn!(%err, "failed to set SO_SNDBUF to {} KB", config.send_buffer_kb);
    }

    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
