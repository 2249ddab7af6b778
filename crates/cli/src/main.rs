//! ditto: keeps secrets and config maps replicated across namespaces,
//! driven entirely by annotations on the objects themselves.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};

use ditto_kubehub::ControllerOptions;

#[derive(Parser, Debug)]
#[command(
    name = "ditto",
    version,
    about = "Annotation-driven secret and config map replication"
)]
struct Cli {
    /// Treat every source as replication-allowed unless it explicitly
    /// disallows it
    #[arg(long = "allow-all", action = ArgAction::SetTrue)]
    allow_all: bool,

    /// Full resync period in seconds
    #[arg(long = "resync-secs", default_value_t = 1800)]
    resync_secs: u64,

    /// Prefix of the annotation vocabulary
    #[arg(long = "annotations-prefix", default_value = ditto_core::DEFAULT_PREFIX)]
    annotations_prefix: String,

    /// Do not replicate secrets
    #[arg(long = "skip-secrets", action = ArgAction::SetTrue)]
    skip_secrets: bool,

    /// Do not replicate config maps
    #[arg(long = "skip-config-maps", action = ArgAction::SetTrue)]
    skip_config_maps: bool,
}

fn init_tracing() {
    let env = std::env::var("DITTO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DITTO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DITTO_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let options = ControllerOptions {
        allow_all: cli.allow_all,
        resync: Duration::from_secs(cli.resync_secs.max(1)),
        prefix: cli.annotations_prefix.clone(),
    };

    let client = ditto_kubehub::get_kube_client().await?;
    let mut handles = Vec::new();
    if !cli.skip_secrets {
        handles.push(ditto_kubehub::spawn_secret_replicator(client.clone(), options.clone()).await?);
    }
    if !cli.skip_config_maps {
        handles
            .push(ditto_kubehub::spawn_config_map_replicator(client.clone(), options.clone()).await?);
    }
    if handles.is_empty() {
        warn!("both kinds are skipped; nothing to replicate");
        return Ok(());
    }

    for handle in &mut handles {
        handle.wait_synced().await;
    }
    info!(allow_all = cli.allow_all, "initial sync complete");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in handles {
        if let Err(err) = handle.stop().await {
            error!(error = %err, "controller task failed");
        }
    }
    Ok(())
}
