//! Standalone TFTP server serving files out of a root directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use boreal_tftp::config::{LogFormat, WriteConfig, load_config, validate_config, write_config};
use boreal_tftp::{
    AuditLogger, Request, Response, Result, StreamReader, TftpConfig, TftpError, TftpServer,
};

#[derive(Parser, Debug)]
#[command(name = "boreal-tftp-server", about = "Standalone TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/boreal/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Seconds between resends of the current unacknowledged packet
    #[arg(long)]
    retransmit_interval_secs: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(interval) = cli.retransmit_interval_secs {
        config.retransmit_interval_secs = interval;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let _log_guard = init_logging(&config)?;

    if config.logging.audit_enabled {
        AuditLogger::server_started(
            &config.bind_addr.to_string(),
            &config.root_dir.display().to_string(),
        );
    }

    let read_root = config.root_dir.clone();
    let write_root = config.root_dir.clone();
    let write_config = config.write.clone();
    let max_file_size = config.max_file_size_bytes;
    let grace = config.shutdown_grace();

    let server = TftpServer::new(config)
        .on_read(move |request| {
            let root = read_root.clone();
            async move {
                let path = validate_and_resolve_path(&root, &request.filename)?;
                Ok(Response::file(path))
            }
        })
        .on_write(move |request| {
            let root = write_root.clone();
            let policy = write_config.clone();
            async move { handle_write(&root, &policy, max_file_size, request).await }
        });

    let bound = server.bind().await?;
    let runner = bound.clone();

    tokio::select! {
        result = runner.run() => result.context("listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            AuditLogger::server_shutdown("signal");
            bound.shutdown(grace).await;
        }
    }

    Ok(())
}

/// Install the tracing subscriber; the returned guard must outlive `main`
/// when logging to a file.
fn init_logging(config: &TftpConfig) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::new(config.logging.level.clone());

    if let Some(ref log_file) = config.logging.file {
        let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .context("logging.file must include a file name")?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
        }
        Ok(Some(guard))
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
        Ok(None)
    }
}

/// Resolve `filename` under `root_dir`, refusing traversal outside it.
/// Symlinks are rejected outright to keep resolution honest.
fn validate_and_resolve_path(root_dir: &Path, filename: &str) -> Result<PathBuf> {
    let filename = filename.replace('\\', "/");
    if filename.contains("..") {
        return Err(TftpError::AccessViolation);
    }

    let file_path = root_dir.join(filename.trim_start_matches('/'));

    match std::fs::symlink_metadata(&file_path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(TftpError::AccessViolation);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Missing files fail later, at open, with FileNotFound.
        }
        Err(_) => return Err(TftpError::AccessViolation),
    }

    let canonical_root = root_dir
        .canonicalize()
        .map_err(|_| TftpError::AccessViolation)?;

    // The boundary check runs even when the file does not exist yet.
    if let Ok(canonical_file) = file_path.canonicalize() {
        if !canonical_file.starts_with(&canonical_root) {
            return Err(TftpError::AccessViolation);
        }
    } else if let Some(parent) = file_path.parent()
        && let Ok(canonical_parent) = parent.canonicalize()
        && !canonical_parent.starts_with(&canonical_root)
    {
        return Err(TftpError::AccessViolation);
    }

    Ok(file_path)
}

/// Is this resolved path covered by one of the configured write patterns?
fn is_write_allowed(file_path: &Path, root_dir: &Path, policy: &WriteConfig) -> bool {
    let Ok(relative_path) = file_path.strip_prefix(root_dir) else {
        return false;
    };
    let Some(path_str) = relative_path.to_str() else {
        return false;
    };

    policy.allowed_patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|glob| glob.matches(path_str))
            .unwrap_or(false)
    })
}

async fn handle_write(
    root: &Path,
    policy: &WriteConfig,
    max_file_size: u64,
    request: Request,
) -> Result<()> {
    if !policy.enabled {
        warn!(remote = %request.remote, "write request refused: writes are disabled");
        return Err(TftpError::AccessViolation);
    }

    let path = validate_and_resolve_path(root, &request.filename)?;

    if !is_write_allowed(&path, root, policy) {
        warn!(remote = %request.remote, filename = %request.filename,
              "write request refused: not in allowed_patterns");
        return Err(TftpError::AccessViolation);
    }

    if path.exists() && !policy.allow_overwrite {
        warn!(remote = %request.remote, filename = %request.filename,
              "write request refused: file exists and overwrite is disabled");
        return Err(TftpError::Other(anyhow::anyhow!("file already exists")));
    }

    let stream = request.accept()?;
    let data = collect_upload(&stream, max_file_size).await?;
    write_file_safely(&path, &data).await?;
    info!(filename = %request.filename, bytes = data.len(), "file stored");
    Ok(())
}

async fn collect_upload(stream: &StreamReader, max_file_size: u64) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        if max_file_size > 0 && (data.len() + chunk.len()) as u64 > max_file_size {
            return Err(TftpError::Other(anyhow::anyhow!(
                "upload exceeds the {max_file_size} byte limit"
            )));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// Write to a temporary sibling first, then rename into place so a partial
/// upload never replaces an existing file.
async fn write_file_safely(file_path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = file_path.with_extension("tftp-tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&temp_path, file_path).await?;
    Ok(())
}
