//! Wire codec for the five RFC 1350 packet kinds.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::BLOCK_SIZE;
use crate::error::{Result, TftpError};

/// TFTP opcodes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request
    Wrq = 2,   // Write request
    Data = 3,  // Data
    Ack = 4,   // Acknowledgment
    Error = 5, // Error
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Opcode::Rrq | Opcode::Wrq)
    }
}

/// Transfer modes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 8-bit ASCII with network line endings; not served, rejected at dispatch
    Netascii,
    /// Binary transfer without conversion
    Octet,
    /// Obsolete; parsed off the wire but never transmitted
    Mail,
}

impl Mode {
    /// Case-insensitive match against the three RFC 1350 mode names.
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(Mode::Netascii),
            "octet" => Ok(Mode::Octet),
            "mail" => Ok(Mode::Mail),
            _ => Err(TftpError::InvalidPacket(format!(
                "unknown transfer mode '{s}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        }
    }
}

/// TFTP error codes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    /// Default human-readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Request {
        opcode: Opcode,
        filename: String,
        mode: Mode,
        options: HashMap<String, String>,
    },
    Data {
        block_no: u16,
        payload: Bytes,
    },
    Ack {
        block_no: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Packet {
    pub fn rrq(filename: impl Into<String>) -> Self {
        Packet::Request {
            opcode: Opcode::Rrq,
            filename: filename.into(),
            mode: Mode::Octet,
            options: HashMap::new(),
        }
    }

    pub fn wrq(filename: impl Into<String>) -> Self {
        Packet::Request {
            opcode: Opcode::Wrq,
            filename: filename.into(),
            mode: Mode::Octet,
            options: HashMap::new(),
        }
    }

    pub fn data(block_no: u16, payload: impl Into<Bytes>) -> Self {
        Packet::Data {
            block_no,
            payload: payload.into(),
        }
    }

    pub fn ack(block_no: u16) -> Self {
        Packet::Ack { block_no }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Packet::Request { .. })
    }

    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TftpError::InvalidPacket("packet too short".into()));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match Opcode::from_u16(opcode) {
            Some(op @ (Opcode::Rrq | Opcode::Wrq)) => parse_request(op, &buf[2..]),
            Some(Opcode::Data) => parse_data(&buf[2..]),
            Some(Opcode::Ack) => parse_ack(&buf[2..]),
            Some(Opcode::Error) => parse_error(&buf[2..]),
            None => Err(TftpError::InvalidPacket(format!(
                "unknown opcode {opcode}"
            ))),
        }
    }

    /// Serialize the packet for transmission.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Packet::Request {
                opcode,
                filename,
                mode,
                options,
            } => {
                if !opcode.is_request() {
                    return Err(TftpError::InvalidPacket(
                        "request packet with non-request opcode".into(),
                    ));
                }
                if *mode == Mode::Mail {
                    return Err(TftpError::InvalidPacket(
                        "MAIL mode is never transmitted".into(),
                    ));
                }
                ensure_ascii(filename, "filename")?;
                let mut buf = BytesMut::with_capacity(4 + filename.len() + mode.as_str().len());
                buf.put_u16(*opcode as u16);
                buf.put_slice(filename.as_bytes());
                buf.put_u8(0);
                buf.put_slice(mode.as_str().as_bytes());
                buf.put_u8(0);
                for (name, value) in options {
                    ensure_ascii(name, "option name")?;
                    ensure_ascii(value, "option value")?;
                    buf.put_slice(name.as_bytes());
                    buf.put_u8(0);
                    buf.put_slice(value.as_bytes());
                    buf.put_u8(0);
                }
                Ok(buf.freeze())
            }
            Packet::Data { block_no, payload } => {
                if payload.len() > BLOCK_SIZE {
                    return Err(TftpError::InvalidPacket(format!(
                        "DATA payload of {} bytes exceeds the {} byte block size",
                        payload.len(),
                        BLOCK_SIZE
                    )));
                }
                let mut buf = BytesMut::with_capacity(4 + payload.len());
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block_no);
                buf.put_slice(payload);
                Ok(buf.freeze())
            }
            Packet::Ack { block_no } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block_no);
                Ok(buf.freeze())
            }
            Packet::Error { code, message } => {
                ensure_ascii(message, "error message")?;
                let mut buf = BytesMut::with_capacity(5 + message.len());
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code as u16);
                buf.put_slice(message.as_bytes());
                buf.put_u8(0);
                Ok(buf.freeze())
            }
        }
    }
}

fn ensure_ascii(s: &str, what: &str) -> Result<()> {
    if s.is_ascii() {
        Ok(())
    } else {
        Err(TftpError::InvalidPacket(format!("non-ASCII {what}")))
    }
}

fn ascii_field(bytes: &[u8], what: &str) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(TftpError::InvalidPacket(format!("non-ASCII {what}")));
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Parse RRQ / WRQ: `filename\0mode\0` followed by optional `name\0value\0`
/// pairs. An odd trailing field is silently dropped.
fn parse_request(opcode: Opcode, payload: &[u8]) -> Result<Packet> {
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();

    // The final NUL terminator leaves a trailing remainder field, so a
    // well-formed request splits into at least three parts.
    if fields.len() < 3 {
        return Err(TftpError::InvalidPacket(
            "request is missing filename or mode".into(),
        ));
    }

    let filename = ascii_field(fields[0], "filename")?;
    let mode = Mode::from_str(&ascii_field(fields[1], "mode")?)?;

    let mut options = HashMap::new();
    let extensions = &fields[2..fields.len() - 1];
    for pair in extensions.chunks_exact(2) {
        let name = ascii_field(pair[0], "option name")?.to_ascii_lowercase();
        let value = ascii_field(pair[1], "option value")?;
        options.insert(name, value);
    }

    Ok(Packet::Request {
        opcode,
        filename,
        mode,
        options,
    })
}

/// Parse DATA: 2-byte block number, then 0..512 bytes of payload.
fn parse_data(payload: &[u8]) -> Result<Packet> {
    if payload.len() < 2 {
        return Err(TftpError::InvalidPacket("DATA packet too short".into()));
    }
    let block_no = u16::from_be_bytes([payload[0], payload[1]]);
    let data = &payload[2..];
    if data.len() > BLOCK_SIZE {
        return Err(TftpError::InvalidPacket(format!(
            "DATA payload of {} bytes exceeds the {} byte block size",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(Packet::Data {
        block_no,
        payload: Bytes::copy_from_slice(data),
    })
}

/// Parse ACK: 2-byte block number; trailing bytes are ignored.
fn parse_ack(payload: &[u8]) -> Result<Packet> {
    if payload.len() < 2 {
        return Err(TftpError::InvalidPacket("ACK packet too short".into()));
    }
    let block_no = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(Packet::Ack { block_no })
}

/// Parse ERROR: 2-byte code, then a NUL-terminated ASCII message.
fn parse_error(payload: &[u8]) -> Result<Packet> {
    if payload.len() < 2 {
        return Err(TftpError::InvalidPacket("ERROR packet too short".into()));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let code = ErrorCode::from_u16(code)
        .ok_or_else(|| TftpError::InvalidPacket(format!("unknown error code {code}")))?;

    let rest = &payload[2..];
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::InvalidPacket("unterminated error message".into()))?;
    let message = ascii_field(&rest[..end], "error message")?;

    Ok(Packet::Error { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_rrq() {
        let packet = Packet::rrq("hello.txt");
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0, 1]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn round_trip_wrq() {
        let packet = Packet::wrq("upload.bin");
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0, 2]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn round_trip_data() {
        let packet = Packet::data(42, &b"abc"[..]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0, 3, 0, 42]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn round_trip_empty_data() {
        let packet = Packet::data(7, Bytes::new());
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn round_trip_ack() {
        let packet = Packet::ack(65535);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0, 4, 255, 255]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn round_trip_error() {
        let packet = Packet::error(ErrorCode::FileNotFound, "File not found");
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0, 5, 0, 1]);
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn parses_request_options() {
        let parsed = Packet::from_bytes(b"\x00\x01firmware.bin\x00octet\x00blksize\x008192\x00")
            .unwrap();
        match parsed {
            Packet::Request {
                filename, options, ..
            } => {
                assert_eq!(filename, "firmware.bin");
                assert_eq!(options.get("blksize").map(String::as_str), Some("8192"));
            }
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn drops_odd_trailing_option_field() {
        let parsed =
            Packet::from_bytes(b"\x00\x01f\x00octet\x00blksize\x001432\x00orphan\x00").unwrap();
        match parsed {
            Packet::Request { options, .. } => {
                assert_eq!(options.len(), 1);
                assert!(!options.contains_key("orphan"));
            }
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn mode_match_is_case_insensitive() {
        let parsed = Packet::from_bytes(b"\x00\x01f\x00OcTeT\x00").unwrap();
        match parsed {
            Packet::Request { mode, .. } => assert_eq!(mode, Mode::Octet),
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn mail_mode_parses_but_never_encodes() {
        let parsed = Packet::from_bytes(b"\x00\x02f\x00mail\x00").unwrap();
        match &parsed {
            Packet::Request { mode, .. } => assert_eq!(*mode, Mode::Mail),
            other => panic!("expected WRQ, got {other:?}"),
        }
        assert!(parsed.to_bytes().is_err());
    }

    #[test]
    fn rejects_request_missing_mode() {
        assert!(Packet::from_bytes(b"\x00\x01filename-only").is_err());
        assert!(Packet::from_bytes(b"\x00\x01filename\x00octet").is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(Packet::from_bytes(&[0, 9, 0, 0]).is_err());
        assert!(Packet::from_bytes(&[0]).is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(Packet::from_bytes(b"\x00\x01f\x00binary\x00").is_err());
    }

    #[test]
    fn rejects_unknown_error_code() {
        assert!(Packet::from_bytes(b"\x00\x05\x00\x2aboom\x00").is_err());
    }

    #[test]
    fn rejects_unterminated_error_message() {
        assert!(Packet::from_bytes(b"\x00\x05\x00\x01boom").is_err());
    }

    #[test]
    fn rejects_oversized_data_payload() {
        let mut raw = vec![0, 3, 0, 1];
        raw.extend(std::iter::repeat_n(b'a', BLOCK_SIZE + 1));
        assert!(Packet::from_bytes(&raw).is_err());

        let packet = Packet::data(1, vec![b'a'; BLOCK_SIZE + 1]);
        assert!(packet.to_bytes().is_err());
    }

    #[test]
    fn ignores_trailing_bytes_after_ack() {
        let parsed = Packet::from_bytes(&[0, 4, 0, 3, 9, 9]).unwrap();
        assert_eq!(parsed, Packet::ack(3));
    }

    #[test]
    fn rejects_non_ascii_filename_on_encode() {
        assert!(Packet::rrq("fichier-\u{e9}").to_bytes().is_err());
    }

    #[test]
    fn rejects_non_ascii_filename_on_parse() {
        assert!(Packet::from_bytes(b"\x00\x01f\xc3\xa9\x00octet\x00").is_err());
    }
}
