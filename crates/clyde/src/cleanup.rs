//! Cleanup subcommands used during node decommissioning: restore the
//! containerd configuration and let the rollout tool wait for that to
//! finish across the cluster.

use clap::Args;
use clyde_api::{ClydeError, ClydeResult};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Address to run the readiness probe on.
    #[arg(long, env = "ADDR", required = true)]
    addr: SocketAddr,
    /// Directory where mirror configuration is written.
    #[arg(
        long,
        env = "CONTAINERD_REGISTRY_CONFIG_PATH",
        default_value = "/etc/containerd/certs.d"
    )]
    containerd_registry_config_path: std::path::PathBuf,
}

/// Remove the managed mirror configuration, then serve a readiness
/// probe so the rollout tool can observe completion. Runs until
/// terminated.
pub async fn run(args: CleanupArgs) -> ClydeResult<()> {
    super::configuration::remove_mirror_configuration(
        &args.containerd_registry_config_path,
    )?;

    let app = axum::Router::new().route(
        "/healthz",
        axum::routing::get(|| async { axum::http::StatusCode::OK }),
    );
    let listener =
        tokio::net::TcpListener::bind(args.addr).await.map_err(|e| {
            ClydeError::init_src(
                format!("could not bind probe address {}", args.addr),
                e,
            )
        })?;
    tracing::info!(addr = %args.addr, "cleanup complete, serving readiness probe");
    axum::serve(listener, app)
        .await
        .map_err(|e| ClydeError::other_src("probe server", e))
}

#[derive(Debug, Args)]
pub struct CleanupWaitArgs {
    /// Endpoint to probe cleanup jobs from.
    #[arg(long, env = "PROBE_ENDPOINT", required = true)]
    probe_endpoint: String,
    /// Amount of consecutive successful probes to consider cleanup done.
    #[arg(long, env = "THRESHOLD", default_value_t = 3)]
    threshold: u32,
    /// Time between probes.
    #[arg(long, env = "PERIOD", default_value_t = 2, value_name = "SECONDS")]
    period_secs: u64,
}

/// Poll the probe endpoint until it answers OK `threshold` times in a
/// row.
pub async fn wait(args: CleanupWaitArgs) -> ClydeResult<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| ClydeError::init_src("could not build http client", e))?;

    let mut successes = 0u32;
    let mut ticker =
        tokio::time::interval(Duration::from_secs(args.period_secs.max(1)));
    while successes < args.threshold {
        ticker.tick().await;
        match client.get(&args.probe_endpoint).send().await {
            Ok(response) if response.status().is_success() => {
                successes += 1;
                tracing::debug!(successes, "cleanup probe succeeded");
            }
            Ok(response) => {
                successes = 0;
                tracing::debug!(status = %response.status(), "cleanup probe not ready");
            }
            Err(err) => {
                successes = 0;
                tracing::debug!("cleanup probe failed: {err}");
            }
        }
    }
    tracing::info!("cleanup confirmed done");
    Ok(())
}
