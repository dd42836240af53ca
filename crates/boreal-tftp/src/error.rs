use thiserror::Error;

/// Result type alias for TFTP operations
pub type Result<T> = std::result::Result<T, TftpError>;

/// TFTP error types
#[derive(Error, Debug)]
pub enum TftpError {
    /// Malformed wire bytes
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Unsupported transfer mode on an incoming request
    #[error("unsupported transfer mode: {0}")]
    BadMode(String),

    /// The peer sent a TFTP ERROR packet
    #[error("remote peer error: {0}")]
    RemotePeer(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Permission denied
    #[error("permission denied")]
    AccessViolation,

    /// A write was issued while another write is still outstanding
    #[error("another write is still outstanding")]
    BusyWriter,

    /// Local API misuse
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The UDP socket went away underneath a transfer
    #[error("transport closed")]
    TransportClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

// A terminal stream exception is handed back on every subsequent read, so the
// error must be duplicable. Io and Other only survive as their messages.
impl Clone for TftpError {
    fn clone(&self) -> Self {
        match self {
            TftpError::InvalidPacket(msg) => TftpError::InvalidPacket(msg.clone()),
            TftpError::BadMode(mode) => TftpError::BadMode(mode.clone()),
            TftpError::RemotePeer(msg) => TftpError::RemotePeer(msg.clone()),
            TftpError::FileNotFound(path) => TftpError::FileNotFound(path.clone()),
            TftpError::AccessViolation => TftpError::AccessViolation,
            TftpError::BusyWriter => TftpError::BusyWriter,
            TftpError::IllegalState(msg) => TftpError::IllegalState(msg.clone()),
            TftpError::TransportClosed => TftpError::TransportClosed,
            TftpError::Io(err) => {
                TftpError::Io(std::io::Error::new(err.kind(), err.to_string()))
            }
            TftpError::Other(err) => TftpError::Other(anyhow::anyhow!("{err}")),
        }
    }
}
