//! The `registry` subcommand: assemble and run the full node.

use clap::Args;
use clyde_api::*;
use clyde_registry::{HfConfig, OciConfig, PipConfig, Registry, RegistryConfig};
use clyde_router::{
    DnsBootstrapper, DynBootstrapper, HttpBootstrapper, P2pRouter,
    P2pRouterConfig, StaticBootstrapper,
};
use clyde_state::TrackerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const BASIC_AUTH_DIR: &str = "/etc/secrets/basic-auth";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Args)]
pub struct RegistryArgs {
    /// Kind of bootstrapper to use (static, dns, http).
    #[arg(long, env = "BOOTSTRAP_KIND", default_value = "static")]
    bootstrap_kind: String,
    /// Domain to use when bootstrapping using DNS SRV records.
    #[arg(long, env = "DNS_BOOTSTRAP_DOMAIN")]
    dns_bootstrap_domain: Option<String>,
    /// Address to serve for HTTP bootstrap.
    #[arg(long, env = "HTTP_BOOTSTRAP_ADDR")]
    http_bootstrap_addr: Option<SocketAddr>,
    /// Peer to HTTP bootstrap with.
    #[arg(long, env = "HTTP_BOOTSTRAP_PEER")]
    http_bootstrap_peer: Option<String>,
    /// Static list of peers to bootstrap with.
    #[arg(long, env = "STATIC_BOOTSTRAP_PEERS", value_delimiter = ',')]
    static_bootstrap_peers: Vec<String>,

    /// Directory where clyde persists data.
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/clyde")]
    data_dir: PathBuf,
    /// Endpoint of the containerd service.
    #[arg(
        long,
        env = "CONTAINERD_SOCK",
        default_value = "/run/containerd/containerd.sock"
    )]
    containerd_sock: PathBuf,
    /// Containerd namespace to fetch images from.
    #[arg(long, env = "CONTAINERD_NAMESPACE", default_value = "k8s.io")]
    containerd_namespace: String,
    /// Path to the containerd content store.
    #[arg(
        long,
        env = "CONTAINERD_CONTENT_PATH",
        default_value = "/var/lib/containerd/io.containerd.content.v1.content"
    )]
    containerd_content_path: PathBuf,

    /// Address to serve the image registry on.
    #[arg(long, env = "REGISTRY_ADDR", default_value = "0.0.0.0:5000")]
    registry_addr: SocketAddr,
    /// Address to serve the router on.
    #[arg(long, env = "ROUTER_ADDR", default_value = "0.0.0.0:5001")]
    router_addr: SocketAddr,
    /// Address to serve metrics on.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Max duration in milliseconds spent finding a mirror.
    #[arg(
        long,
        env = "MIRROR_RESOLVE_TIMEOUT",
        default_value_t = 20,
        value_name = "MILLIS"
    )]
    mirror_resolve_timeout_ms: u64,
    /// Max amount of mirrors to attempt.
    #[arg(long, env = "MIRROR_RESOLVE_RETRIES", default_value_t = 3)]
    mirror_resolve_retries: usize,
    /// When true latest tags will be resolved to digests.
    #[arg(
        long,
        env = "RESOLVE_LATEST_TAG",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    resolve_latest_tag: bool,
    /// Images the tracker gossips and prefetches automatically.
    #[arg(long, env = "INCLUDE_IMAGES", value_delimiter = ',')]
    include_images: Vec<String>,

    /// Enable the pip proxy endpoint.
    #[arg(
        long,
        env = "ENABLE_PIP_PROXY",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    enable_pip_proxy: bool,
    /// Path to the pip cache files.
    #[arg(long, env = "PIP_CACHE_DIR", default_value = "/data/cache/pip/wheel")]
    pip_cache_dir: PathBuf,
    /// Upstream index to use when a package is not found in the cluster.
    #[arg(
        long,
        env = "PIP_FALLBACK_INDEX",
        default_value = "https://pypi.org/simple"
    )]
    pip_fallback_index: String,

    /// Enable the Hugging Face proxy endpoint.
    #[arg(
        long,
        env = "ENABLE_HF_PROXY",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    enable_hf_proxy: bool,
    /// Directory to cache Hugging Face models in.
    #[arg(long, env = "HF_HUB_CACHE", default_value = "/data/cache/hf/model")]
    hf_cache_dir: PathBuf,
    /// Model hub base URL.
    #[arg(long, env = "HF_BASE_URL", default_value = "https://huggingface.co")]
    hf_base_url: String,
}

fn bootstrapper(args: &RegistryArgs) -> ClydeResult<DynBootstrapper> {
    match args.bootstrap_kind.as_str() {
        "dns" => {
            let domain = args.dns_bootstrap_domain.clone().ok_or_else(|| {
                ClydeError::init("dns bootstrap requires --dns-bootstrap-domain")
            })?;
            Ok(Arc::new(DnsBootstrapper::new(domain, 10)))
        }
        "http" => {
            let addr = args.http_bootstrap_addr.ok_or_else(|| {
                ClydeError::init("http bootstrap requires --http-bootstrap-addr")
            })?;
            let peer = args.http_bootstrap_peer.clone().ok_or_else(|| {
                ClydeError::init("http bootstrap requires --http-bootstrap-peer")
            })?;
            Ok(Arc::new(HttpBootstrapper::new(addr, peer)))
        }
        "static" => Ok(Arc::new(StaticBootstrapper::from_strings(
            &args.static_bootstrap_peers,
        )?)),
        other => Err(ClydeError::init(format!(
            "unknown bootstrap kind {other}"
        ))),
    }
}

/// Read optional basic auth credentials from the conventional secret
/// mount. Missing files mean no auth; unreadable files are fatal.
pub(crate) fn load_basic_auth() -> ClydeResult<Option<(String, String)>> {
    let read = |name: &str| -> ClydeResult<Option<String>> {
        match std::fs::read_to_string(
            std::path::Path::new(BASIC_AUTH_DIR).join(name),
        ) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ClydeError::init_src(
                format!("could not read basic auth {name}"),
                err,
            )),
        }
    };
    match (read("username")?, read("password")?) {
        (Some(username), Some(password)) => Ok(Some((username, password))),
        _ => Ok(None),
    }
}

pub async fn run(args: RegistryArgs) -> ClydeResult<()> {
    let basic_auth = load_basic_auth()?;

    // The runtime-native containerd adapter is an external collaborator;
    // the in-process store fronts for it behind the same contract.
    let store: DynContentStore = Arc::new(clyde_store::MemStore::new());
    store.verify().await?;
    tracing::info!(
        sock = %args.containerd_sock.display(),
        namespace = args.containerd_namespace,
        content_path = %args.containerd_content_path.display(),
        "content store configured"
    );

    let router = Arc::new(
        P2pRouter::new(
            P2pRouterConfig {
                router_addr: args.router_addr,
                registry_port: args.registry_addr.port(),
                data_dir: Some(args.data_dir.clone()),
            },
            bootstrapper(&args)?,
        )
        .await?,
    );
    let dyn_router: DynRouter = router.clone();

    // Background work: DHT membership plus the state tracker.
    let mut background: tokio::task::JoinSet<ClydeResult<()>> =
        tokio::task::JoinSet::new();
    {
        let router = router.clone();
        background.spawn(async move { router.run().await });
    }
    {
        let store = store.clone();
        let router = dyn_router.clone();
        let config = TrackerConfig {
            resolve_latest_tag: args.resolve_latest_tag,
            include_images: args.include_images.clone(),
            content_path: args.containerd_content_path.clone(),
            pip_cache_dir: args
                .enable_pip_proxy
                .then(|| args.pip_cache_dir.clone()),
            hf_cache_dir: args
                .enable_hf_proxy
                .then(|| args.hf_cache_dir.clone()),
        };
        background.spawn(async move {
            clyde_state::track(store, router, config).await
        });
    }

    let registry = Registry::new(
        store,
        dyn_router,
        RegistryConfig {
            oci: OciConfig {
                resolve_retries: args.mirror_resolve_retries,
                resolve_timeout: Duration::from_millis(
                    args.mirror_resolve_timeout_ms,
                ),
                resolve_latest_tag: args.resolve_latest_tag,
            },
            pip: args.enable_pip_proxy.then(|| {
                let mut pip = PipConfig::new(&args.pip_cache_dir);
                pip.fallback_index = args.pip_fallback_index.clone();
                pip
            }),
            hf: args.enable_hf_proxy.then(|| {
                let mut hf = HfConfig::new(&args.hf_cache_dir);
                hf.base_url = args.hf_base_url.clone();
                hf
            }),
            basic_auth,
        },
    )?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut servers: tokio::task::JoinSet<ClydeResult<()>> =
        tokio::task::JoinSet::new();

    let registry_listener = tokio::net::TcpListener::bind(args.registry_addr)
        .await
        .map_err(|e| {
            ClydeError::init_src(
                format!(
                    "could not bind registry address {}",
                    args.registry_addr
                ),
                e,
            )
        })?;
    {
        let mut shutdown = shutdown_rx.clone();
        servers.spawn(async move {
            registry
                .serve(registry_listener, async move {
                    let _ = shutdown.changed().await;
                })
                .await
        });
    }

    let metrics_listener = tokio::net::TcpListener::bind(args.metrics_addr)
        .await
        .map_err(|e| {
            ClydeError::init_src(
                format!("could not bind metrics address {}", args.metrics_addr),
                e,
            )
        })?;
    {
        let mut shutdown = shutdown_rx.clone();
        servers.spawn(async move {
            let app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(|| async {
                    clyde_metrics::metrics().gather()
                }),
            );
            axum::serve(metrics_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
                .map_err(|e| ClydeError::other_src("metrics server", e))
        });
    }

    tracing::info!(
        registry = %args.registry_addr,
        router = %args.router_addr,
        "running clyde"
    );

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
            None
        }
        result = servers.join_next() => Some(result),
        result = background.join_next() => Some(result),
    };
    if let Some(result) = early_exit {
        let _ = shutdown_tx.send(true);
        return match result {
            Some(Ok(Err(err))) => Err(err),
            Some(Err(err)) => {
                Err(ClydeError::other(format!("task panicked: {err}")))
            }
            _ => Err(ClydeError::other("task exited unexpectedly")),
        };
    }

    // Listeners stop accepting and drain in-flight requests; the router
    // keeps answering peer requests during the drain and its DHT host
    // goes down last when it is dropped.
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while servers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("drain timeout reached, aborting in-flight requests");
        servers.abort_all();
    }
    background.abort_all();
    drop(router);
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(
        tokio::signal::unix::SignalKind::terminate(),
    ) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!("could not install SIGTERM handler: {err}");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
