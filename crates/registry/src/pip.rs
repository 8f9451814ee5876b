//! The wheel plane: PEP 503 simple index plus artifact downloads.
//!
//! Index pages are rewritten so their absolute origin URLs point back at
//! this proxy; that rewrite is the one body transformation the system
//! permits. Artifacts stream to the client while being teed into the
//! flat wheel cache.

use crate::{clean_path, mirror, status_response, AppState, PipConfig};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use clyde_api::*;

const PYPI_FILES: &str = "https://files.pythonhosted.org/packages/";

pub(crate) async fn handler(
    State(state): State<AppState>,
    req: Request,
) -> Response {
    let config = state
        .0
        .config
        .pip
        .clone()
        .expect("pip routes only mounted when configured");

    let clean = clean_path(req.uri().path());
    tracing::debug!(path = %clean, method = %req.method(), "incoming pip request");

    // The root index is a static marker; installers never scrape it.
    if clean == "/simple" {
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("clyde pip simple index"))
            .expect("static response");
    }

    let is_artifact = clean.starts_with("/packages/");
    let is_index = clean.starts_with("/simple/") && !is_artifact;

    let name = clean
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string();
    if name.is_empty() || name == "simple" || name == "packages" {
        tracing::debug!(path = %clean, "missing package name or file");
        return status_response(StatusCode::BAD_REQUEST);
    }

    let trimmed = clean
        .trim_start_matches(if is_index { "/simple/" } else { "/packages/" })
        .to_string();
    let key = pip_key(&name);

    let cache_file = if is_index {
        config.cache_dir.join(format!("{name}.html"))
    } else {
        config.cache_dir.join(&name)
    };
    if tokio::fs::try_exists(&cache_file).await.unwrap_or(false) {
        tracing::debug!(file = %cache_file.display(), "serving from local cache");
        return crate::serve_file(&cache_file, req.method()).await;
    }

    // A mirrored request is answered strictly locally; peer resolution
    // here could chain into a cycle across nodes.
    if mirror::is_mirrored(req.headers()) {
        return status_response(StatusCode::NOT_FOUND);
    }

    let peer_request = mirror::PeerRequest::from_request(&req);
    if let Some((peer, response)) = mirror::try_peers(
        &state.0.router,
        &state.0.client,
        &key,
        config.resolve_retries,
        config.resolve_timeout,
        &peer_request,
    )
    .await
    {
        tracing::debug!(name, %peer, "serving pip resource from peer");
        return peer_response(&state, response, cache_file, key, req.method());
    }

    tracing::debug!(name, "falling back to upstream index");
    serve_from_fallback(&state, &config, req, name, is_index, trimmed, key)
        .await
}

/// Stream a peer body to the client, teeing it into the cache on GET.
fn peer_response(
    state: &AppState,
    response: reqwest::Response,
    cache_file: std::path::PathBuf,
    key: String,
    method: &Method,
) -> Response {
    let mut builder = Response::builder().status(response.status().as_u16());
    if let Some(headers) = builder.headers_mut() {
        crate::copy_headers(headers, response.headers(), &[]);
    }
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        crate::tee_to_cache(
            response.bytes_stream(),
            cache_file,
            key,
            state.0.router.clone(),
        )
    };
    builder.body(body).expect("peer response")
}

#[allow(clippy::too_many_arguments)]
async fn serve_from_fallback(
    state: &AppState,
    config: &PipConfig,
    req: Request,
    name: String,
    is_index: bool,
    trimmed: String,
    key: String,
) -> Response {
    let upstream_url = if is_index {
        format!(
            "{}/{}/",
            config.fallback_index.trim_end_matches('/'),
            trimmed.trim_end_matches('/')
        )
    } else {
        format!("{PYPI_FILES}{trimmed}")
    };

    let response = state
        .0
        .redirecting_client
        .request(req.method().clone(), &upstream_url)
        .header(header::USER_AGENT, "Clyde-PipProxy/1.0")
        .timeout(config.resolve_timeout)
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = upstream_url, "failed to fetch from upstream: {err}");
            if is_index {
                // A stale local index beats no index at all.
                if let Some(resp) =
                    local_index(&config.cache_dir, &name).await
                {
                    return resp;
                }
            }
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    if is_index {
        return index_response(state, config, response, &name, req.method())
            .await;
    }

    // Redirects may have renamed the artifact; cache under the name the
    // origin finally served.
    let final_name = response
        .url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or(&name)
        .to_string();

    let mut builder = Response::builder().status(response.status().as_u16());
    if let Some(headers) = builder.headers_mut() {
        crate::copy_headers(headers, response.headers(), &["content-length"]);
    }

    let cacheable = response.status() == reqwest::StatusCode::OK
        && req.method() == Method::GET
        && (final_name.ends_with(".whl") || final_name.ends_with(".tar.gz"));
    let body = if req.method() == Method::HEAD {
        Body::empty()
    } else if cacheable {
        crate::tee_to_cache(
            response.bytes_stream(),
            config.cache_dir.join(&final_name),
            pip_key(&final_name),
            state.0.router.clone(),
        )
    } else {
        Body::from_stream(response.bytes_stream())
    };
    builder.body(body).expect("fallback response")
}

/// Serve an upstream index page: rewrite origin URLs to local proxy
/// paths, persist the rewritten page, and advertise it.
async fn index_response(
    state: &AppState,
    config: &PipConfig,
    response: reqwest::Response,
    name: &str,
    method: &Method,
) -> Response {
    let status = response.status();
    let mut builder = Response::builder().status(status.as_u16());
    if let Some(headers) = builder.headers_mut() {
        crate::copy_headers(headers, response.headers(), &["content-length"]);
    }
    if method == Method::HEAD {
        return builder.body(Body::empty()).expect("index response");
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!("failed to read index body: {err}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let rewritten = body
        .replace(PYPI_FILES, "/packages/")
        .replace("https://pypi.org/simple/", "/simple/");

    if status == reqwest::StatusCode::OK {
        let cache_file = config.cache_dir.join(format!("{name}.html"));
        match write_index(&cache_file, rewritten.as_bytes()).await {
            Ok(()) => {
                let router = state.0.router.clone();
                let key = pip_key(name);
                tokio::task::spawn(async move {
                    if let Err(err) = router.advertise(vec![key.clone()]).await
                    {
                        tracing::warn!(key, "failed to advertise cached index: {err}");
                    }
                });
            }
            Err(err) => {
                tracing::warn!(file = %cache_file.display(), "failed to cache rewritten index: {err}");
            }
        }
    }

    builder.body(Body::from(rewritten)).expect("index response")
}

async fn write_index(
    path: &std::path::Path,
    data: &[u8],
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

/// Build a minimal PEP 503 page from cached wheels when the upstream
/// index is unreachable.
async fn local_index(
    cache_dir: &std::path::Path,
    package: &str,
) -> Option<Response> {
    let mut entries = tokio::fs::read_dir(cache_dir).await.ok()?;
    let prefix = format!("{}-", package.to_lowercase());
    let mut links = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let lower = file_name.to_lowercase();
        if lower.starts_with(&prefix)
            && (lower.ends_with(".whl") || lower.ends_with(".tar.gz"))
        {
            links.push(format!(r#"<a href="{file_name}">{file_name}</a>"#));
        }
    }
    if links.is_empty() {
        return None;
    }
    tracing::debug!(package, count = links.len(), "serving locally built index");
    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from(links.join("\n")))
            .expect("local index response"),
    )
}
