use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use kubegate_cache::{ClusterDetails, ClusterDetailsConfig};

mod config;

use config::Config;

/// Kubegate - keeps credentials and API schemas of Kubernetes clusters warm
#[derive(Parser, Debug)]
#[command(name = "kubegate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "kubegate.toml")]
    config: PathBuf,

    /// Seconds between cluster status reports
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    let base_dir = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();

    let mut clusters: Vec<Arc<ClusterDetails>> = Vec::new();
    for entry in &config.clusters {
        let cluster = match entry.to_cluster(&base_dir) {
            Ok(cluster) => cluster,
            Err(e) => {
                error!(cluster = %entry.name, error = %format!("{:#}", e), "skipping cluster");
                continue;
            }
        };

        let cfg = ClusterDetailsConfig::new(cluster)
            .with_resource_matchers(config.resource_matchers.clone())
            .with_refresh(config.refresh_settings())
            .with_renewal(config.renewal_settings());

        match ClusterDetails::new(cfg).await {
            Ok(details) => {
                info!(
                    cluster = %details.name(),
                    offline = details.is_offline(),
                    version = ?details.cluster_version(),
                    "cluster registered"
                );
                clusters.push(Arc::new(details));
            }
            Err(e) => error!(cluster = %entry.name, error = %e, "failed to register cluster"),
        }
    }

    if clusters.is_empty() {
        anyhow::bail!("No cluster could be registered from {}", args.config.display());
    }

    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => report(&clusters),
        }
    }

    info!("shutting down");
    for details in &clusters {
        details.close().await;
    }
    Ok(())
}

fn report(clusters: &[Arc<ClusterDetails>]) {
    for details in clusters {
        match details.get_cluster_supported_resources() {
            Ok((codecs, rbac)) => info!(
                cluster = %details.name(),
                version = ?details.cluster_version(),
                kinds = codecs.len(),
                rbac_resources = rbac.len(),
                labels = ?details.labels(),
                "cluster online"
            ),
            Err(e) => warn!(cluster = %details.name(), error = %e, "cluster unavailable"),
        }
    }
}
