//! Structured audit logging for transfer activity.
//!
//! Events are serialized to JSON and emitted through `tracing`, so they ride
//! whatever subscriber the host application installed (console, file, SIEM
//! pipeline). The per-transfer hook is the [`AccessLog`] trait, injected into
//! the listener rather than configured globally; [`AuditLogger`] is the
//! default implementation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Level, event};

use crate::error::TftpError;
use crate::response::Response;
use crate::server::Request;

/// Per-transfer log collaborator invoked by the listener when a transfer
/// finishes. `response` is present for read transfers and carries the number
/// of bytes the client acknowledged.
pub trait AccessLog: Send + Sync {
    fn log_transfer(&self, request: &Request, response: Option<&Response>, duration: Duration);
}

/// Audit event catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Server startup event
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    /// Server shutdown event
    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    /// Read or write request received
    RequestReceived {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        method: String,
        filename: String,
    },

    /// Request refused before a transfer started
    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        method: String,
        filename: String,
        reason: String,
    },

    /// Transfer completed successfully
    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        method: String,
        filename: String,
        bytes_transferred: u64,
        duration_ms: u64,
        /// Transfer throughput in bytes per second
        throughput_bps: u64,
    },

    /// Transfer failed
    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        method: String,
        filename: String,
        error: String,
    },

    /// Malformed or unexpected traffic on the listener port
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },
}

/// Common fields present in all audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// Hostname or system identifier
    pub hostname: String,
    /// Service name
    pub service: String,
    /// Severity level (info, warn, error)
    pub severity: String,
    /// Correlation ID tying the events of one transfer together
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "boreal-tftp".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: &str) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(correlation_id.to_string());
        fields
    }
}

impl AuditEvent {
    /// Emit this event as structured JSON through `tracing`.
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"failed to serialize audit event: {self:?}\"}}")
        });
        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::RequestReceived { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common,
        }
    }
}

/// Audit logger for TFTP operations
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: &str, root_dir: &str) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn request_received(request: &Request, correlation_id: &str) {
        AuditEvent::RequestReceived {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: request.remote.to_string(),
            method: request.method.as_str().to_string(),
            filename: request.filename.clone(),
        }
        .log();
    }

    pub fn request_denied(request: &Request, reason: &str, correlation_id: &str) {
        AuditEvent::RequestDenied {
            common: CommonFields::with_correlation("warn", correlation_id),
            client_addr: request.remote.to_string(),
            method: request.method.as_str().to_string(),
            filename: request.filename.clone(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_failed(request: &Request, error: &TftpError, correlation_id: &str) {
        AuditEvent::TransferFailed {
            common: CommonFields::with_correlation("error", correlation_id),
            client_addr: request.remote.to_string(),
            method: request.method.as_str().to_string(),
            filename: request.filename.clone(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn protocol_violation(client_addr: &str, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }
}

impl AccessLog for AuditLogger {
    fn log_transfer(&self, request: &Request, response: Option<&Response>, duration: Duration) {
        let bytes = response.map(Response::length).unwrap_or(0);
        let duration_ms = duration.as_millis() as u64;
        let throughput_bps = if duration_ms > 0 {
            (bytes * 1000) / duration_ms
        } else {
            0
        };
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: request.remote.to_string(),
            method: request.method.as_str().to_string(),
            filename: request.filename.clone(),
            bytes_transferred: bytes,
            duration_ms,
            throughput_bps,
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_flattened_common_fields() {
        let event = AuditEvent::RequestDenied {
            common: CommonFields::with_correlation("warn", "abc-123"),
            client_addr: "192.0.2.1:2001".into(),
            method: "RRQ".into(),
            filename: "secret".into(),
            reason: "no read handler registered".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "request_denied");
        assert_eq!(json["severity"], "warn");
        assert_eq!(json["correlation_id"], "abc-123");
        assert_eq!(json["service"], "boreal-tftp");
    }

    #[test]
    fn correlation_id_is_omitted_when_absent() {
        let event = AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: "signal".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("correlation_id").is_none());
    }
}
