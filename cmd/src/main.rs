use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use promagg::AggregateStore;
use tracing_subscriber::EnvFilter;

mod api;
mod http;

/// Accepts pushed Prometheus metrics from short-lived jobs, aggregates
/// them, and exposes the merged result for scraping.
#[derive(Debug, Parser)]
struct Cli {
    /// Address and port to listen on.
    #[arg(long, default_value = "0.0.0.0:80")]
    listen: SocketAddr,

    /// The 'Access-Control-Allow-Origin' value returned on push responses.
    #[arg(long, default_value = "*")]
    cors: String,

    /// HTTP path prefix under which pushed metrics are accepted.
    #[arg(long, default_value = "/metrics")]
    push_path: String,

    /// Keep state per pushing job (push to <push-path>/job/<name>) and
    /// overwrite on re-push instead of summing.
    #[arg(long)]
    by_job: bool,

    /// Seconds after which a silent job's gauge families are pruned.
    #[arg(long, default_value_t = 90)]
    job_prune_seconds: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let store = AggregateStore::new(cli.by_job, Duration::from_secs(cli.job_prune_seconds));
    http::serve(cli, store).await
}
