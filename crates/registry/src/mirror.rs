//! The shared mirror resolution path.
//!
//! All three artifact planes run the same protocol for a cache miss:
//! resolve peer candidates through the router under a bounded timeout,
//! then try each candidate in arrival order until one answers 200 or
//! 206. The peer request carries the mirror sentinel so a peer that is
//! itself missing the content cannot re-enter peer resolution and form
//! a cycle.

use axum::http::{HeaderMap, Method};
use clyde_api::{DynRouter, MIRRORED_HEADER};
use std::net::SocketAddr;
use std::time::Duration;

/// The original request, reduced to what gets replayed against a peer.
pub struct PeerRequest {
    /// GET or HEAD, preserved from the client request.
    pub method: Method,
    /// Path plus query, forwarded verbatim.
    pub path_and_query: String,
    /// Client headers, replayed minus hop-by-hop fields.
    pub headers: HeaderMap,
}

impl PeerRequest {
    /// Capture the parts of an inbound request that a peer attempt
    /// replays.
    pub fn from_request(req: &axum::extract::Request) -> Self {
        Self {
            method: req.method().clone(),
            path_and_query: req
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| req.uri().path().to_string()),
            headers: req.headers().clone(),
        }
    }
}

/// True when the request carries the mirror sentinel and therefore must
/// be answered strictly from local state.
pub fn is_mirrored(headers: &HeaderMap) -> bool {
    headers
        .get(MIRRORED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Resolve peers for `key` and try them sequentially. Returns the first
/// acceptable peer response, or `None` once the resolve stream closes,
/// the timeout bounds the wait, or every candidate failed.
///
/// The timeout bounds only the resolution wait; an in-flight transfer
/// from a peer that already answered is never cut short by it.
pub async fn try_peers(
    router: &DynRouter,
    client: &reqwest::Client,
    key: &str,
    retries: usize,
    timeout: Duration,
    request: &PeerRequest,
) -> Option<(SocketAddr, reqwest::Response)> {
    let mut peers = match router.resolve(key, retries).await {
        Ok(peers) => peers,
        Err(err) => {
            tracing::warn!(key, "could not resolve mirrors: {err}");
            return None;
        }
    };

    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempts = 0usize;
    loop {
        let peer =
            match tokio::time::timeout_at(deadline, peers.recv()).await {
                Err(_) => {
                    tracing::debug!(key, attempts, "mirror resolution timed out");
                    return None;
                }
                Ok(None) => {
                    if attempts > 0 {
                        tracing::debug!(
                            key,
                            attempts,
                            "all mirror attempts exhausted"
                        );
                    }
                    return None;
                }
                Ok(Some(peer)) => peer,
            };

        attempts += 1;
        match forward_request(client, request, peer).await {
            Ok(response) => {
                tracing::debug!(key, %peer, attempts, "mirrored request successful");
                return Some((peer, response));
            }
            Err(err) => {
                tracing::warn!(key, %peer, attempts, "request to mirror failed: {err}");
            }
        }
    }
}

/// Replay the request against one peer's front listener. Accepts only
/// 200 and 206; anything else is an error so the caller moves on to the
/// next candidate.
async fn forward_request(
    client: &reqwest::Client,
    request: &PeerRequest,
    peer: SocketAddr,
) -> Result<reqwest::Response, clyde_api::ClydeError> {
    use clyde_api::ClydeError;

    let url = format!("http://{peer}{}", request.path_and_query);
    let mut headers = HeaderMap::new();
    crate::copy_headers(&mut headers, &request.headers, &["host"]);
    headers.insert(
        MIRRORED_HEADER,
        axum::http::HeaderValue::from_static("true"),
    );

    let response = client
        .request(request.method.clone(), &url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| ClydeError::transport_src(format!("peer {peer}"), e))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK
        && status != reqwest::StatusCode::PARTIAL_CONTENT
    {
        return Err(ClydeError::transport(format!(
            "expected mirror to respond with 200 or 206 but received {status}"
        )));
    }
    Ok(response)
}
