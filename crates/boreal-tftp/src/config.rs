//! TOML configuration for the server binary and the listener library.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TftpError};
use crate::{DEFAULT_PORT, DEFAULT_RETRANSMIT_INTERVAL, DEFAULT_SHUTDOWN_GRACE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Seconds between resends of the current unacknowledged packet.
    pub retransmit_interval_secs: f64,
    /// Seconds shutdown waits for in-flight transfers before cancelling.
    pub shutdown_grace_secs: f64,
    /// Maximum file size in bytes that can be served or stored.
    /// Set to 0 for unlimited (not recommended).
    pub max_file_size_bytes: u64,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
    pub socket: SocketConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/boreal/tftp"),
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            retransmit_interval_secs: DEFAULT_RETRANSMIT_INTERVAL.as_secs_f64(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs_f64(),
            max_file_size_bytes: 104_857_600, // 100 MB default
            write: WriteConfig::default(),
            logging: LoggingConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl TftpConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retransmit_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }
}

/// Write operation policy. Writes are disabled by default; when enabled,
/// only filenames matching one of the glob patterns are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Enable write operations
    pub enabled: bool,

    /// Allow overwriting existing files
    pub allow_overwrite: bool,

    /// Glob patterns of writable paths relative to `root_dir`,
    /// e.g. ["*.txt", "configs/*.cfg", "firmware/device-*.bin"]
    pub allowed_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log destination; stderr when unset
    pub file: Option<PathBuf>,
    /// Emit structured JSON audit events for transfer activity
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

/// Listener socket tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Receive buffer size in KB (SO_RCVBUF)
    pub recv_buffer_kb: usize,

    /// Send buffer size in KB (SO_SNDBUF)
    pub send_buffer_kb: usize,

    /// Enable SO_REUSEADDR for faster restarts
    pub reuse_address: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_kb: 2048, // 2 MB
            send_buffer_kb: 2048, // 2 MB
            reuse_address: true,
        }
    }
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents).map_err(|e| {
        TftpError::Other(anyhow::anyhow!(
            "invalid config file {}: {e}",
            path.display()
        ))
    })?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Other(anyhow::anyhow!("failed to serialize config: {e}")))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate the configuration for correctness. With `validate_bind` the
/// listener address is also probed with a throwaway socket.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !(config.retransmit_interval_secs.is_finite() && config.retransmit_interval_secs > 0.0) {
        return Err(TftpError::IllegalState(
            "retransmit_interval_secs must be a positive number".into(),
        ));
    }

    if !(config.shutdown_grace_secs.is_finite() && config.shutdown_grace_secs >= 0.0) {
        return Err(TftpError::IllegalState(
            "shutdown_grace_secs must be a non-negative number".into(),
        ));
    }

    if !config.root_dir.is_absolute() {
        return Err(TftpError::IllegalState(
            "root_dir must be an absolute path".into(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::IllegalState(
                    "root_dir must be a directory".into(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::IllegalState(
                "root_dir does not exist; create it or adjust config".into(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::IllegalState(format!(
            "root_dir is not readable: {e}"
        )));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::IllegalState(
            "bind_addr port must be non-zero".into(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::IllegalState(format!(
            "bind_addr is not available: {e}"
        )));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::IllegalState("logging.file must include a parent directory".into())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::IllegalState(
                        "logging.file parent must be a directory".into(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::IllegalState(format!(
                    "logging.file parent error: {e}"
                )));
            }
        }
    }

    validate_write_config(&config.write)?;
    Ok(())
}

pub fn validate_write_config(config: &WriteConfig) -> Result<()> {
    if config.enabled && config.allowed_patterns.is_empty() {
        return Err(TftpError::IllegalState(
            "write operations enabled but no allowed_patterns specified; \
             add patterns to allowed_patterns or disable writes"
                .into(),
        ));
    }

    for pattern in &config.allowed_patterns {
        if pattern.trim().is_empty() {
            return Err(TftpError::IllegalState(
                "allowed_patterns cannot contain empty patterns".into(),
            ));
        }

        if pattern == "*" || pattern == "**" || pattern == "**/*" {
            return Err(TftpError::IllegalState(format!(
                "write pattern '{pattern}' is too permissive; use specific patterns \
                 like '*.txt' or 'subdir/*.cfg'"
            )));
        }

        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(TftpError::IllegalState(format!(
                "invalid write pattern '{pattern}': {e}"
            )));
        }
    }

    Ok(())
}
