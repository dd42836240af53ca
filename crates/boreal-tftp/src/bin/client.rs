//! Command-line TFTP client for `tftp://` resources.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::time::timeout;
use tracing::info;

use boreal_tftp::client;

#[derive(Parser, Debug)]
#[command(name = "boreal-tftp-client")]
#[command(about = "TFTP client", long_about = None)]
struct Cli {
    /// Remote resource (tftp://host[:port]/filename)
    #[arg(long)]
    url: String,

    /// Download the remote resource
    #[arg(long, conflicts_with = "put")]
    get: bool,

    /// Upload the given local file to the remote resource
    #[arg(long, conflicts_with = "get")]
    put: Option<PathBuf>,

    /// Local destination for --get (defaults to the remote filename)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Seconds between resends of the current unacknowledged packet
    #[arg(long, default_value_t = 2.0)]
    retransmit_interval_secs: f64,

    /// Overall transfer deadline in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let interval = Duration::from_secs_f64(cli.retransmit_interval_secs);
    let deadline = Duration::from_secs(cli.timeout_secs);

    if let Some(local_file) = cli.put {
        let data = tokio::fs::read(&local_file)
            .await
            .with_context(|| format!("failed to read {}", local_file.display()))?;
        info!("uploading {} to {}", local_file.display(), cli.url);
        let sent = timeout(deadline, client::write_with(&cli.url, data.into(), interval))
            .await
            .context("transfer deadline exceeded")??;
        info!("upload complete: {sent} bytes");
    } else if cli.get {
        let url = client::TftpUrl::parse(&cli.url)?;
        let output = cli.output.unwrap_or_else(|| {
            // Drop any directory components from the remote name.
            PathBuf::from(
                url.filename
                    .rsplit('/')
                    .next()
                    .unwrap_or(url.filename.as_str()),
            )
        });

        info!("downloading {} to {}", cli.url, output.display());
        let data = timeout(deadline, async {
            let stream = client::read_with(&cli.url, interval).await?;
            let mut payload = Vec::new();
            while let Some(chunk) = stream.next_chunk().await? {
                payload.extend_from_slice(&chunk);
            }
            Ok::<_, boreal_tftp::TftpError>(payload)
        })
        .await
        .context("transfer deadline exceeded")??;

        tokio::fs::write(&output, &data)
            .await
            .with_context(|| format!("failed to write {}", output.display()))?;
        info!("download complete: {} bytes", data.len());
    } else {
        anyhow::bail!("must specify either --get or --put");
    }

    Ok(())
}
