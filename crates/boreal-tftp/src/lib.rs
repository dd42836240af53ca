//! Asynchronous TFTP (RFC 1350) protocol engine: a listener that dispatches
//! read/write requests to user handlers, per-transfer send and receive
//! engines with retransmission, and client conveniences for `tftp://` URLs.
//!
//! Only binary (`octet`) transfers are supported; `netascii` and `mail`
//! requests are rejected at dispatch. RFC 2347 options are parsed off the
//! wire and surfaced on [`Request`], but the block size is fixed at 512.

use std::time::Duration;

pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod packet;
pub mod response;
pub mod server;
pub mod stream;

// Re-export commonly used types
pub use audit::{AccessLog, AuditLogger};
pub use config::TftpConfig;
pub use error::{Result, TftpError};
pub use packet::{ErrorCode, Mode, Opcode, Packet};
pub use response::{BytesResponse, FileResponse, Response, StreamResponse};
pub use server::{BoundServer, Method, Request, TftpServer};
pub use stream::StreamReader;

// RFC 1350 - The TFTP Protocol (Revision 2)
/// Fixed data block size; a DATA payload shorter than this ends the transfer.
pub const BLOCK_SIZE: usize = 512;
/// Block size plus the 4 byte opcode/block header.
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;
/// Well-known TFTP server port.
pub const DEFAULT_PORT: u16 = 69;
/// Seconds between resends of the current unacknowledged packet.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(2);
/// How long shutdown waits for in-flight transfers before cancelling them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
