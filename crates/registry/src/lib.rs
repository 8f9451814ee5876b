#![deny(missing_docs)]
//! The clyde front listener.
//!
//! One axum server routes the three artifact planes plus the health
//! probe:
//!
//! - `/v2/` and below: OCI distribution subset, optionally gated by
//!   basic auth
//! - `/simple/` and `/packages/`: PEP 503 wheel proxy
//! - `/huggingface/`: model-hub proxy
//! - `/healthz`: router readiness
//!
//! All three artifact handlers share the two-tier mirror resolution in
//! [mirror]: local cache, then peers discovered through the router,
//! then the upstream origin.

use axum::routing::get;
use clyde_api::*;
use std::sync::Arc;
use std::time::Duration;

mod serve;
pub(crate) use serve::*;

pub mod mirror;

mod oci;
mod pip;
mod hf;

/// Configuration for the container plane.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Cap on peer candidates tried per mirror request.
    pub resolve_retries: usize,
    /// Bound on peer resolution; the container path sits on the image
    /// pull hot path, so this is tight.
    pub resolve_timeout: Duration,
    /// When false, requests for the mutable `latest` tag skip peer
    /// resolution entirely.
    pub resolve_latest_tag: bool,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            resolve_retries: 3,
            resolve_timeout: Duration::from_millis(20),
            resolve_latest_tag: true,
        }
    }
}

/// Configuration for the wheel plane.
#[derive(Debug, Clone)]
pub struct PipConfig {
    /// Directory holding cached wheels and index pages.
    pub cache_dir: std::path::PathBuf,
    /// Upstream simple index used when no peer can serve a package.
    pub fallback_index: String,
    /// Cap on peer candidates tried per request.
    pub resolve_retries: usize,
    /// Bound on peer resolution.
    pub resolve_timeout: Duration,
}

impl PipConfig {
    /// Defaults for a given cache directory.
    pub fn new(cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fallback_index: "https://pypi.org/simple".to_string(),
            resolve_retries: 3,
            resolve_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the model plane.
#[derive(Debug, Clone)]
pub struct HfConfig {
    /// Hub cache directory in the conventional layout
    /// (`models--<org>--<model>/…`).
    pub cache_dir: std::path::PathBuf,
    /// Model hub base URL.
    pub base_url: String,
    /// Cap on peer candidates tried per request.
    pub resolve_retries: usize,
    /// Bound on peer resolution.
    pub resolve_timeout: Duration,
}

impl HfConfig {
    /// Defaults for a given cache directory.
    pub fn new(cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            base_url: "https://huggingface.co".to_string(),
            resolve_retries: 3,
            resolve_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for [Registry].
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Container plane settings.
    pub oci: OciConfig,
    /// Wheel plane settings, absent when the pip proxy is disabled.
    pub pip: Option<PipConfig>,
    /// Model plane settings, absent when the model proxy is disabled.
    pub hf: Option<HfConfig>,
    /// Basic auth credentials gating `/v2/…` when set.
    pub basic_auth: Option<(String, String)>,
}

pub(crate) struct Inner {
    pub(crate) store: DynContentStore,
    pub(crate) router: DynRouter,
    pub(crate) config: RegistryConfig,
    /// Client for peer requests and plain upstream fetches.
    pub(crate) client: reqwest::Client,
    /// Upstream client that follows redirects internally (model GETs).
    pub(crate) redirecting_client: reqwest::Client,
    /// Upstream client that surfaces redirects to the caller
    /// (model HEADs, so consumers chase signed CDN URLs themselves).
    pub(crate) plain_client: reqwest::Client,
}

/// Shared state behind every front-listener handler.
#[derive(Clone)]
pub struct AppState(pub(crate) Arc<Inner>);

/// The front listener.
pub struct Registry {
    state: AppState,
}

impl Registry {
    /// Construct the front listener over a content store and router.
    pub fn new(
        store: DynContentStore,
        router: DynRouter,
        config: RegistryConfig,
    ) -> ClydeResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ClydeError::init_src("could not build http client", e))?;
        let redirecting_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| ClydeError::init_src("could not build http client", e))?;
        let plain_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClydeError::init_src("could not build http client", e))?;
        Ok(Self {
            state: AppState(Arc::new(Inner {
                store,
                router,
                config,
                client,
                redirecting_client,
                plain_client,
            })),
        })
    }

    /// Build the axum router for this listener. URL prefixes dispatch
    /// to the artifact planes; everything else is 404.
    pub fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/healthz", get(ready_handler))
            .fallback(dispatch)
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown future resolves, then stop accepting
    /// and drain in-flight requests.
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> ClydeResult<()> {
        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ClydeError::other_src("registry server", e))
    }
}

async fn dispatch(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: axum::extract::Request,
) -> axum::response::Response {
    use axum::extract::State;
    use axum::http::{Method, StatusCode};

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let path = req.uri().path();
    if path == "/v2" || path.starts_with("/v2/") {
        return oci::handler(State(state), req).await;
    }
    if state.0.config.pip.is_some()
        && (path == "/simple"
            || path.starts_with("/simple/")
            || path.starts_with("/packages/"))
    {
        return pip::handler(State(state), req).await;
    }
    if state.0.config.hf.is_some() && path.starts_with("/huggingface/") {
        return hf::handler(State(state), req).await;
    }
    status_response(StatusCode::NOT_FOUND)
}

async fn ready_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::http::StatusCode {
    match state.0.router.ready().await {
        Ok(true) => axum::http::StatusCode::OK,
        Ok(false) => {
            tracing::debug!("router not ready");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(err) => {
            tracing::warn!("could not determine router readiness: {err}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
