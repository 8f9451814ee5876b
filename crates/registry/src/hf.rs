//! The model plane: model-hub proxy under `/huggingface/`.
//!
//! Model files resolve through the hub cache layout: `refs/<ref>` maps
//! the mutable ref to a commit sha, `snapshots/<sha>/<path>` holds the
//! file. Only `/resolve/` file requests take the peer path; hub API
//! metadata and LFS blobs go straight upstream.

use crate::{clean_path, mirror, status_response, AppState, HfConfig};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use clyde_api::*;
use std::path::PathBuf;

/// High-fan-out, low-size metadata files that would thrash DHT lookups
/// without bandwidth savings. Always fetched upstream.
const SMALL_FILE_EXCLUSIONS: &[&str] = &[
    "model.safetensors.index.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "generation_config.json",
];

struct Classified {
    is_resolve: bool,
    is_blob: bool,
}

fn classify(clean: &str) -> Option<Classified> {
    let is_resolve = clean.contains("/resolve/");
    let is_blob = clean.contains("/blobs/") || clean.contains("/cdn-lfs");
    let is_api = clean.contains("/api/") || clean.contains("/resolve-cache/");
    if !is_resolve && !is_blob && !is_api {
        return None;
    }
    Some(Classified {
        is_resolve,
        is_blob,
    })
}

pub(crate) async fn handler(
    State(state): State<AppState>,
    req: Request,
) -> Response {
    let config = state
        .0
        .config
        .hf
        .clone()
        .expect("hf routes only mounted when configured");

    let clean = clean_path(req.uri().path());
    tracing::debug!(path = clean, method = %req.method(), "incoming huggingface request");

    let Some(class) = classify(&clean) else {
        tracing::debug!(path = clean, "unsupported huggingface request");
        return status_response(StatusCode::BAD_REQUEST);
    };
    let key = model_key(&clean);

    let parts: Vec<String> = clean
        .trim_start_matches("/huggingface/")
        .split('/')
        .map(str::to_string)
        .collect();

    // Local cache lookup; on a miss the computed path becomes the cache
    // target for whatever source ends up serving the bytes.
    let mut cache_target: Option<PathBuf> = None;
    let mut filename = String::new();
    if class.is_resolve && parts.len() >= 5 && parts[2] == "resolve" {
        let model_dir = config
            .cache_dir
            .join(format!("models--{}--{}", parts[0], parts[1]));
        let reference = &parts[3];
        filename = parts[4..].join("/");
        let ref_file = model_dir.join("refs").join(reference);
        match tokio::fs::read_to_string(&ref_file).await {
            Ok(sha) => {
                let snapshot = model_dir
                    .join("snapshots")
                    .join(sha.trim())
                    .join(&filename);
                if tokio::fs::try_exists(&snapshot).await.unwrap_or(false) {
                    tracing::debug!(file = %snapshot.display(), "serving model file from local snapshot");
                    return crate::serve_file(&snapshot, req.method()).await;
                }
                cache_target = Some(snapshot);
            }
            Err(_) => {
                tracing::debug!(ref_file = %ref_file.display(), "no local ref for model");
            }
        }
    } else if class.is_blob && parts.len() >= 3 {
        let model_dir = config
            .cache_dir
            .join(format!("models--{}--{}", parts[0], parts[1]));
        if let Some(last) = parts.last() {
            let blob_file = model_dir.join("blobs").join(last);
            if tokio::fs::try_exists(&blob_file).await.unwrap_or(false) {
                return crate::serve_file(&blob_file, req.method()).await;
            }
        }
    }

    // Mirrored requests are answered strictly locally.
    if mirror::is_mirrored(req.headers()) {
        return status_response(StatusCode::NOT_FOUND);
    }

    let peer_eligible = class.is_resolve
        && cache_target.is_some()
        && req.method() == Method::GET
        && !SMALL_FILE_EXCLUSIONS.contains(&filename.as_str());
    if peer_eligible {
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
            tracing::debug!(key, %peer, "serving model file from peer");
            return peer_response(
                &state,
                response,
                cache_target.expect("peer eligibility requires a target"),
                key,
            );
        }
    }

    tracing::debug!(path = clean, "falling back to upstream hub");
    serve_from_fallback(&state, &config, req, &clean, cache_target, key)
        .await
}

/// Stream a peer body to the client while teeing it into the snapshot
/// path. Length and encoding headers are dropped so the teed stream
/// cannot disagree with them; the content type defaults to an octet
/// stream.
fn peer_response(
    state: &AppState,
    response: reqwest::Response,
    cache_target: PathBuf,
    key: String,
) -> Response {
    let mut builder = Response::builder().status(response.status().as_u16());
    if let Some(headers) = builder.headers_mut() {
        crate::copy_headers(
            headers,
            response.headers(),
            &["content-length", "content-encoding"],
        );
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }
    }
    let body = crate::tee_to_cache(
        response.bytes_stream(),
        cache_target,
        key,
        state.0.router.clone(),
    );
    builder.body(body).expect("peer response")
}

async fn serve_from_fallback(
    state: &AppState,
    config: &HfConfig,
    req: Request,
    clean: &str,
    cache_target: Option<PathBuf>,
    key: String,
) -> Response {
    let path_for_upstream = clean
        .strip_prefix("/huggingface")
        .unwrap_or(clean)
        .to_string();
    let upstream_url = format!(
        "{}{}",
        config.base_url.trim_end_matches('/'),
        path_for_upstream
    );

    // HEAD responses surface hub redirects to the client so it can
    // chase the signed CDN URL itself; GETs follow them internally and
    // come back with the actual bytes.
    let client = if req.method() == Method::HEAD {
        &state.0.plain_client
    } else {
        &state.0.redirecting_client
    };

    let mut headers = axum::http::HeaderMap::new();
    crate::copy_headers(
        &mut headers,
        req.headers(),
        &["host", MIRRORED_HEADER],
    );
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Clyde-HFProxy/1.0"),
        );
    }
    if req.method() == Method::HEAD {
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );
    }

    let response = match client
        .request(req.method().clone(), &upstream_url)
        .headers(headers)
        .timeout(config.resolve_timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = upstream_url, "failed to fetch from upstream: {err}");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let status = response.status();
    let mut builder = Response::builder().status(status.as_u16());
    if let Some(out_headers) = builder.headers_mut() {
        let skip: &[&str] = if req.method() == Method::HEAD {
            &[]
        } else {
            &["content-length", "content-encoding"]
        };
        crate::copy_headers(out_headers, response.headers(), skip);
    }

    if req.method() == Method::HEAD {
        // Redirect statuses pass through here as well, Location header
        // and all.
        return builder.body(Body::empty()).expect("fallback response");
    }

    if status == reqwest::StatusCode::NOT_FOUND {
        tracing::warn!(url = upstream_url, "upstream returned 404 not found");
    }

    let cacheable =
        status == reqwest::StatusCode::OK && cache_target.is_some();
    let body = if cacheable {
        crate::tee_to_cache(
            response.bytes_stream(),
            cache_target.expect("checked above"),
            key,
            state.0.router.clone(),
        )
    } else {
        Body::from_stream(response.bytes_stream())
    };
    builder.body(body).expect("fallback response")
}
