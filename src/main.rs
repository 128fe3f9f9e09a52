use clap::Parser;
use tracing_subscriber::EnvFilter;

use fastdfs_storage::config::{Cli, StorageConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match StorageConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %cli.config.display(), %err, "failed to load config file, using defaults");
            StorageConfig::default()
        }
    };

    let self_id = cli.id.clone().unwrap_or_else(|| config.bind_addr.clone());

    if let Err(err) = fastdfs_storage::serve_forever(config, self_id).await {
        tracing::error!(%err, "storage node exited with a fatal error");
        std::process::exit(1);
    }
}
