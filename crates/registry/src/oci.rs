//! The container plane: OCI distribution endpoints under `/v2/`.
//!
//! Requests without the mirror sentinel are treated as mirror requests
//! and resolved through peers; requests carrying the sentinel are
//! served strictly from the local content store. The runtime's own
//! store performs persistence, so this plane never writes to disk.

use crate::{mirror, status_response, AppState};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use clyde_api::*;

pub(crate) async fn handler(
    State(state): State<AppState>,
    req: Request,
) -> Response {
    if let Some((username, password)) = &state.0.config.basic_auth {
        if !check_basic_auth(req.headers(), username, password) {
            tracing::debug!("invalid basic authentication");
            return status_response(StatusCode::UNAUTHORIZED);
        }
    }

    // Quickly confirm v2 support for the bare endpoint.
    let path = req.uri().path().trim_end_matches('/');
    if path == "/v2" {
        return status_response(StatusCode::OK);
    }

    let dist = match DistributionPath::parse(
        req.uri().path(),
        req.uri().query(),
    ) {
        Ok(dist) => dist,
        Err(err) => {
            tracing::debug!(
                "could not parse path according to OCI distribution spec: {err}"
            );
            return status_response(StatusCode::NOT_FOUND);
        }
    };

    if !mirror::is_mirrored(req.headers()) {
        let peer_request = mirror::PeerRequest::from_request(&req);
        let local = match &dist.digest {
            Some(digest) => state.0.store.size(digest).await.is_ok(),
            None => state.0.store.resolve(&dist.key()).await.is_ok(),
        };
        if !local {
            return handle_mirror(&state, &peer_request, &dist).await;
        }
    }

    let method = req.method().clone();
    match dist.kind {
        DistributionKind::Manifest => {
            handle_manifest(&state, &method, dist).await
        }
        DistributionKind::Blob => {
            let range = req.headers().get(header::RANGE).cloned();
            handle_blob(&state, &method, range.as_ref(), dist).await
        }
    }
}

async fn handle_mirror(
    state: &AppState,
    peer_request: &mirror::PeerRequest,
    dist: &DistributionPath,
) -> Response {
    let config = &state.0.config.oci;
    if !config.resolve_latest_tag && dist.is_latest_tag() {
        tracing::debug!(image = dist.key(), "skipping mirror for latest tag");
        clyde_metrics::metrics()
            .mirror_requests_total
            .with_label_values(&[dist.registry.as_str(), "miss"])
            .inc();
        return status_response(StatusCode::NOT_FOUND);
    }

    let found = mirror::try_peers(
        &state.0.router,
        &state.0.client,
        &dist.key(),
        config.resolve_retries,
        config.resolve_timeout,
        &peer_request,
    )
    .await;

    let Some((_, response)) = found else {
        tracing::debug!(key = dist.key(), "mirror could not be found");
        clyde_metrics::metrics()
            .mirror_requests_total
            .with_label_values(&[dist.registry.as_str(), "miss"])
            .inc();
        return status_response(StatusCode::NOT_FOUND);
    };

    clyde_metrics::metrics()
        .mirror_requests_total
        .with_label_values(&[dist.registry.as_str(), "hit"])
        .inc();

    // Stream the peer body through untouched.
    let mut builder = Response::builder().status(response.status().as_u16());
    if let Some(headers) = builder.headers_mut() {
        crate::copy_headers(headers, response.headers(), &[]);
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .expect("mirror response")
}

async fn handle_manifest(
    state: &AppState,
    method: &Method,
    mut dist: DistributionPath,
) -> Response {
    if dist.digest.is_none() {
        match state.0.store.resolve(&dist.key()).await {
            Ok(digest) => dist.digest = Some(digest),
            Err(err) => {
                tracing::debug!(
                    reference = dist.key(),
                    "could not get digest for image: {err}"
                );
                return status_response(StatusCode::NOT_FOUND);
            }
        }
    }
    let digest = dist.digest.expect("digest resolved above");

    let (data, media_type) = match state.0.store.get_manifest(&digest).await
    {
        Ok(found) => found,
        Err(err) => {
            tracing::debug!(%digest, "could not get manifest content: {err}");
            return status_response(StatusCode::NOT_FOUND);
        }
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header("Docker-Content-Digest", digest.to_string());
    if method == Method::HEAD {
        return builder.body(Body::empty()).expect("manifest response");
    }
    builder.body(Body::from(data)).expect("manifest response")
}

async fn handle_blob(
    state: &AppState,
    method: &Method,
    range: Option<&HeaderValue>,
    dist: DistributionPath,
) -> Response {
    let digest = dist.digest.expect("blob paths always carry a digest");
    let size = match state.0.store.size(&digest).await {
        Ok(size) => size,
        Err(err) => {
            tracing::debug!(%digest, "could not determine size of blob: {err}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let base = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("Docker-Content-Digest", digest.to_string());

    if method == Method::HEAD {
        return base
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .body(Body::empty())
            .expect("blob response");
    }

    let data = match state.0.store.get_blob(&digest).await {
        Ok(data) => data,
        Err(err) => {
            tracing::debug!(%digest, "could not get reader for blob: {err}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match parse_range(range, size) {
        RangeSpec::None => base
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .body(Body::from(data))
            .expect("blob response"),
        RangeSpec::Satisfiable { start, end } => {
            let slice =
                data.slice(start as usize..(end + 1) as usize);
            base.status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, slice.len())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{size}"),
                )
                .body(Body::from(slice))
                .expect("blob response")
        }
        RangeSpec::Unsatisfiable => base
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .body(Body::empty())
            .expect("blob response"),
    }
}

enum RangeSpec {
    None,
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a single-range `Range: bytes=a-b` header against a known
/// length. Multi-range requests are served whole, which clients accept.
fn parse_range(value: Option<&HeaderValue>, len: u64) -> RangeSpec {
    let Some(raw) = value.and_then(|v| v.to_str().ok()) else {
        return RangeSpec::None;
    };
    let Some(spec) = raw.strip_prefix("bytes=") else {
        return RangeSpec::None;
    };
    if spec.contains(',') {
        return RangeSpec::None;
    }
    let Some((start_s, end_s)) = spec.split_once('-') else {
        return RangeSpec::None;
    };

    if start_s.is_empty() {
        // Suffix range: the final N bytes.
        let Ok(suffix) = end_s.parse::<u64>() else {
            return RangeSpec::None;
        };
        if suffix == 0 || len == 0 {
            return RangeSpec::Unsatisfiable;
        }
        let start = len.saturating_sub(suffix);
        return RangeSpec::Satisfiable {
            start,
            end: len - 1,
        };
    }

    let Ok(start) = start_s.parse::<u64>() else {
        return RangeSpec::None;
    };
    if start >= len {
        return RangeSpec::Unsatisfiable;
    }
    let end = if end_s.is_empty() {
        len - 1
    } else {
        match end_s.parse::<u64>() {
            Ok(end) => end.min(len - 1),
            Err(_) => return RangeSpec::None,
        }
    };
    if end < start {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Satisfiable { start, end }
}

fn check_basic_auth(
    headers: &axum::http::HeaderMap,
    username: &str,
    password: &str,
) -> bool {
    use base64::prelude::*;
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64_STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    user == username && pass == password
}

#[cfg(test)]
mod test {
    use super::*;

    fn range(v: &str, len: u64) -> RangeSpec {
        parse_range(Some(&HeaderValue::from_str(v).unwrap()), len)
    }

    #[test]
    fn range_absent() {
        assert!(matches!(parse_range(None, 10), RangeSpec::None));
    }

    #[test]
    fn range_bounded() {
        assert!(matches!(
            range("bytes=2-4", 10),
            RangeSpec::Satisfiable { start: 2, end: 4 }
        ));
    }

    #[test]
    fn range_open_ended() {
        assert!(matches!(
            range("bytes=5-", 10),
            RangeSpec::Satisfiable { start: 5, end: 9 }
        ));
    }

    #[test]
    fn range_suffix() {
        assert!(matches!(
            range("bytes=-3", 10),
            RangeSpec::Satisfiable { start: 7, end: 9 }
        ));
    }

    #[test]
    fn range_clamps_end() {
        assert!(matches!(
            range("bytes=0-100", 10),
            RangeSpec::Satisfiable { start: 0, end: 9 }
        ));
    }

    #[test]
    fn range_unsatisfiable() {
        assert!(matches!(range("bytes=10-", 10), RangeSpec::Unsatisfiable));
        assert!(matches!(range("bytes=4-2", 10), RangeSpec::Unsatisfiable));
    }

    #[test]
    fn basic_auth_accepts_valid() {
        use base64::prelude::*;
        let mut headers = axum::http::HeaderMap::new();
        let encoded = BASE64_STANDARD.encode("user:pass");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert!(check_basic_auth(&headers, "user", "pass"));
        assert!(!check_basic_auth(&headers, "user", "wrong"));
    }

    #[test]
    fn basic_auth_rejects_missing() {
        let headers = axum::http::HeaderMap::new();
        assert!(!check_basic_auth(&headers, "user", "pass"));
    }
}
