//! Shared response plumbing: local file serving and the streaming
//! tee that caches upstream or peer bodies while the client reads them.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use clyde_api::DynRouter;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Normalise a request path: collapse empty and dot segments, resolve
/// parent references, drop the trailing slash.
pub(crate) fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    out
}

pub(crate) fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}

pub(crate) fn content_type_for(path: &Path) -> HeaderValue {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => HeaderValue::from_static("text/html; charset=utf-8"),
        Some("json") => HeaderValue::from_static("application/json"),
        _ => HeaderValue::from_static("application/octet-stream"),
    }
}

/// Serve a cache file from disk. The body is streamed; HEAD requests
/// get headers only.
pub(crate) async fn serve_file(path: &Path, method: &Method) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(path = %path.display(), "could not open cache file: {err}");
            return status_response(StatusCode::NOT_FOUND);
        }
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(err) => {
            tracing::warn!(path = %path.display(), "could not stat cache file: {err}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::CONTENT_LENGTH, len);
    if method == Method::HEAD {
        return builder.body(Body::empty()).expect("file response");
    }
    let stream = tokio_util::io::ReaderStream::new(file);
    builder.body(Body::from_stream(stream)).expect("file response")
}

/// Copy headers between maps, dropping any named in `skip`
/// (case-insensitive).
pub(crate) fn copy_headers(
    dst: &mut HeaderMap,
    src: &HeaderMap,
    skip: &[&str],
) {
    for (name, value) in src {
        if skip.iter().any(|s| name.as_str().eq_ignore_ascii_case(s)) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Wrap an upstream byte stream into a response body while teeing every
/// chunk into `cache_path` (written as `.tmp`, renamed on success).
/// After a complete write the key is advertised fire-and-forget; the
/// advertisement must outlive the triggering request, so it runs on its
/// own task.
///
/// A failure on either side discards the temp file, so an interrupted
/// download is never served later.
pub(crate) fn tee_to_cache<S, E>(
    stream: S,
    cache_path: PathBuf,
    key: String,
    router: DynRouter,
) -> Body
where
    S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::task::spawn(async move {
        if let Err(err) = tee_task(stream, &cache_path, tx).await {
            tracing::warn!(
                path = %cache_path.display(),
                "could not cache streamed artifact: {err}"
            );
            let _ = tokio::fs::remove_file(tmp_path(&cache_path)).await;
            return;
        }
        if let Err(err) = router.advertise(vec![key.clone()]).await {
            tracing::warn!(key, "could not advertise cached artifact: {err}");
        } else {
            tracing::debug!(key, "advertised cached artifact");
        }
    });

    let body_stream =
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
    Body::from_stream(body_stream)
}

async fn tee_task<S, E>(
    stream: S,
    cache_path: &Path,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> std::io::Result<()>
where
    S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    use futures::StreamExt;

    if let Some(parent) = cache_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(cache_path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut stream = std::pin::pin!(stream);

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx
                    .send(Err(std::io::Error::other(err.to_string())))
                    .await;
                return Err(std::io::Error::other(err.to_string()));
            }
        };
        file.write_all(&chunk).await?;
        if tx.send(Ok(chunk)).await.is_err() {
            // Client went away; an incomplete cache file must not
            // survive either.
            return Err(std::io::Error::other("client disconnected"));
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, cache_path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_path_normalises() {
        assert_eq!("/simple", clean_path("/simple/"));
        assert_eq!("/simple/pkg", clean_path("/simple//pkg/"));
        assert_eq!("/packages/a/b", clean_path("/packages/./a/b"));
        assert_eq!("/packages/b", clean_path("/packages/a/../b"));
        assert_eq!("/", clean_path("/"));
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            PathBuf::from("/cache/pkg.whl.tmp"),
            tmp_path(Path::new("/cache/pkg.whl"))
        );
    }

    #[test]
    fn content_types() {
        assert_eq!(
            "text/html; charset=utf-8",
            content_type_for(Path::new("numpy.html"))
        );
        assert_eq!(
            "application/octet-stream",
            content_type_for(Path::new("model.safetensors"))
        );
    }
}
