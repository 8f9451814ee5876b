//! Cache walkers for the wheel and model planes. Each produces the
//! routable keys of everything on disk, for the per-cycle
//! re-advertisement.

use clyde_api::*;
use std::path::{Path, PathBuf};

/// Model file extensions worth advertising; everything else in a
/// snapshot is bookkeeping.
const HF_EXTENSIONS: &[&str] =
    &[".bin", ".json", ".msgpack", ".onnx", ".safetensors", ".md"];

/// Advertise every wheel, sdist, and index page in the wheel cache and
/// set the package gauge.
pub async fn sync_pip(
    router: &DynRouter,
    cache_dir: &Path,
) -> ClydeResult<usize> {
    let metrics = clyde_metrics::metrics();
    metrics.advertised_pip_packages.reset();

    let keys = walk_pip_dir(cache_dir)?;
    if keys.is_empty() {
        metrics
            .advertised_pip_packages
            .with_label_values(&["pip-cache"])
            .set(0.0);
        return Ok(0);
    }

    let count = keys.len();
    router.advertise(keys).await.map_err(|err| {
        ClydeError::other_src("could not advertise pip keys", err)
    })?;
    metrics
        .advertised_pip_packages
        .with_label_values(&["pip-cache"])
        .set(count as f64);
    Ok(count)
}

/// Advertise every model snapshot file in the hub cache and set the
/// model gauge.
pub async fn sync_hf(
    router: &DynRouter,
    cache_dir: &Path,
) -> ClydeResult<usize> {
    let metrics = clyde_metrics::metrics();
    metrics.advertised_hf_models.reset();

    let keys = walk_hf_cache_dir(cache_dir)?;
    if keys.is_empty() {
        metrics
            .advertised_hf_models
            .with_label_values(&["hf-cache"])
            .set(0.0);
        return Ok(0);
    }

    let count = keys.len();
    router.advertise(keys).await.map_err(|err| {
        ClydeError::other_src("could not advertise hf keys", err)
    })?;
    metrics
        .advertised_hf_models
        .with_label_values(&["hf-cache"])
        .set(count as f64);
    Ok(count)
}

/// Collect `pip:` keys for cached wheels, sdists, and index pages.
pub fn walk_pip_dir(cache_dir: &Path) -> ClydeResult<Vec<String>> {
    let mut keys = Vec::new();
    for path in walk_files(cache_dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = name.to_lowercase();
        if lower.ends_with(".whl")
            || lower.ends_with(".tar.gz")
            || lower.ends_with(".html")
        {
            keys.push(pip_key(name));
        }
    }
    Ok(keys)
}

/// Collect `hf:` keys for snapshot files in the hub cache layout:
/// `models--<org>--<model>/snapshots/<sha>/<path>` becomes
/// `hf:/huggingface/<org>/<model>/resolve/<sha>/<path>`.
pub fn walk_hf_cache_dir(cache_dir: &Path) -> ClydeResult<Vec<String>> {
    let mut keys = Vec::new();
    for path in walk_files(cache_dir)? {
        let Ok(rel) = path.strip_prefix(cache_dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if !rel.contains("/snapshots/") {
            continue;
        }
        let lower = rel.to_lowercase();
        if !HF_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            continue;
        }

        let Some((model_dir, rest)) = rel.split_once('/') else {
            continue;
        };
        let Some(model_path) = model_dir.strip_prefix("models--") else {
            continue;
        };
        let model_path = model_path.replace("--", "/");
        let rest = rest.replacen("snapshots/", "resolve/", 1);
        keys.push(model_key(&format!("/huggingface/{model_path}/{rest}")));
    }
    Ok(keys)
}

/// Depth-first file listing. A missing root is an empty cache, not an
/// error.
fn walk_files(root: &Path) -> ClydeResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                continue
            }
            Err(err) => {
                return Err(ClydeError::other_src(
                    format!("could not read {}", dir.display()),
                    err,
                ))
            }
        };
        for entry in entries {
            let entry = entry.map_err(|e| {
                ClydeError::other_src("could not walk cache dir", e)
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pip_walk_filters_and_lowercases() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("Numpy-1.26.4-cp311-none-any.whl"),
            b"w",
        )
        .unwrap();
        std::fs::write(tmp.path().join("numpy.html"), b"i").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        let mut keys = walk_pip_dir(tmp.path()).unwrap();
        keys.sort();
        assert_eq!(
            vec![
                "pip:numpy-1.26.4-cp311-none-any.whl".to_string(),
                "pip:numpy.html".to_string(),
            ],
            keys
        );
    }

    #[test]
    fn pip_walk_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let keys = walk_pip_dir(&tmp.path().join("nope")).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn hf_walk_maps_snapshots_to_resolve_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let snap = tmp
            .path()
            .join("models--qwen--qwen3-4b/snapshots/abc123");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("model.safetensors"), b"m").unwrap();
        std::fs::write(snap.join("tokenizer.json"), b"t").unwrap();
        std::fs::write(snap.join("weights.bin.lock"), b"x").unwrap();
        // Files outside snapshots are skipped.
        let refs = tmp.path().join("models--qwen--qwen3-4b/refs");
        std::fs::create_dir_all(&refs).unwrap();
        std::fs::write(refs.join("main"), b"abc123").unwrap();

        let mut keys = walk_hf_cache_dir(tmp.path()).unwrap();
        keys.sort();
        assert_eq!(
            vec![
                "hf:/huggingface/qwen/qwen3-4b/resolve/abc123/model.safetensors"
                    .to_string(),
                "hf:/huggingface/qwen/qwen3-4b/resolve/abc123/tokenizer.json"
                    .to_string(),
            ],
            keys
        );
    }

    #[test]
    fn hf_walk_handles_nested_snapshot_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let snap = tmp
            .path()
            .join("models--org--model/snapshots/abc/nested/dir");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("part.bin"), b"m").unwrap();

        let keys = walk_hf_cache_dir(tmp.path()).unwrap();
        assert_eq!(
            vec![
                "hf:/huggingface/org/model/resolve/abc/nested/dir/part.bin"
                    .to_string()
            ],
            keys
        );
    }
}
