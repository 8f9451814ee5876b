//! Configuration subcommands: containerd mirror config, pip client
//! config, and model cache preparation.

use clap::Args;
use clyde_api::{ClydeError, ClydeResult};
use std::path::{Path, PathBuf};

/// First line of every hosts.toml this tool writes; cleanup removes
/// only files carrying it.
pub(crate) const MANAGED_MARKER: &str = "# managed by clyde";

#[derive(Debug, Args)]
pub struct ConfigurationArgs {
    /// Directory where mirror configuration is written.
    #[arg(
        long,
        env = "CONTAINERD_REGISTRY_CONFIG_PATH",
        default_value = "/etc/containerd/certs.d"
    )]
    containerd_registry_config_path: PathBuf,
    /// Registries that are configured to be mirrored; when empty all
    /// registries are mirrored.
    #[arg(long, env = "MIRRORED_REGISTRIES", value_delimiter = ',')]
    mirrored_registries: Vec<url::Url>,
    /// Registries that are configured to act as mirrors.
    #[arg(long, env = "MIRROR_TARGETS", value_delimiter = ',', required = true)]
    mirror_targets: Vec<url::Url>,
    /// When true mirrors will be used to resolve tags to digests.
    #[arg(
        long,
        env = "RESOLVE_TAGS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    resolve_tags: bool,
    /// When true existing mirror configuration is kept after the
    /// written configuration.
    #[arg(
        long,
        env = "PREPEND_EXISTING",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    prepend_existing: bool,
}

pub async fn run(args: ConfigurationArgs) -> ClydeResult<()> {
    let basic_auth = super::registry_cmd::load_basic_auth()?;
    add_mirror_configuration(
        &args.containerd_registry_config_path,
        &args.mirrored_registries,
        &args.mirror_targets,
        args.resolve_tags,
        args.prepend_existing,
        basic_auth.as_ref(),
    )
}

/// Write one `hosts.toml` per mirrored registry (or a single wildcard
/// entry when no registries are named) pointing containerd at the
/// mirror targets.
pub fn add_mirror_configuration(
    config_path: &Path,
    mirrored_registries: &[url::Url],
    mirror_targets: &[url::Url],
    resolve_tags: bool,
    prepend_existing: bool,
    basic_auth: Option<&(String, String)>,
) -> ClydeResult<()> {
    let capabilities = if resolve_tags {
        r#"["pull", "resolve"]"#
    } else {
        r#"["pull"]"#
    };

    let mut entries: Vec<(String, Option<&url::Url>)> = Vec::new();
    if mirrored_registries.is_empty() {
        entries.push(("_default".to_string(), None));
    } else {
        for registry in mirrored_registries {
            let host = registry.host_str().ok_or_else(|| {
                ClydeError::init(format!(
                    "mirrored registry {registry} has no host"
                ))
            })?;
            entries.push((host.to_string(), Some(registry)));
        }
    }

    for (host_dir, registry) in entries {
        let dir = config_path.join(&host_dir);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ClydeError::init_src(
                format!("could not create {}", dir.display()),
                e,
            )
        })?;

        let mut content = format!("{MANAGED_MARKER}\n");
        if let Some(registry) = registry {
            content.push_str(&format!(
                "server = \"{}\"\n\n",
                registry.as_str().trim_end_matches('/')
            ));
        }
        for target in mirror_targets {
            content.push_str(&format!(
                "[host.\"{}\"]\ncapabilities = {capabilities}\n",
                target.as_str().trim_end_matches('/')
            ));
            if let Some((username, password)) = basic_auth {
                use base64::prelude::*;
                let token =
                    BASE64_STANDARD.encode(format!("{username}:{password}"));
                content.push_str(&format!(
                    "[host.\"{}\".header]\nAuthorization = \"Basic {token}\"\n",
                    target.as_str().trim_end_matches('/')
                ));
            }
            content.push('\n');
        }

        let hosts_file = dir.join("hosts.toml");
        if prepend_existing {
            if let Ok(existing) = std::fs::read_to_string(&hosts_file) {
                if !existing.starts_with(MANAGED_MARKER) {
                    content.push_str(&existing);
                }
            }
        }
        std::fs::write(&hosts_file, content).map_err(|e| {
            ClydeError::init_src(
                format!("could not write {}", hosts_file.display()),
                e,
            )
        })?;
        tracing::info!(path = %hosts_file.display(), "mirror configuration written");
    }
    Ok(())
}

/// Remove every managed `hosts.toml` under the config path, restoring
/// containerd to its unmirrored state.
pub fn remove_mirror_configuration(config_path: &Path) -> ClydeResult<()> {
    let entries = match std::fs::read_dir(config_path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(())
        }
        Err(err) => {
            return Err(ClydeError::other_src(
                format!("could not read {}", config_path.display()),
                err,
            ))
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| {
            ClydeError::other_src("could not walk config path", e)
        })?;
        let hosts_file = entry.path().join("hosts.toml");
        let Ok(content) = std::fs::read_to_string(&hosts_file) else {
            continue;
        };
        if !content.starts_with(MANAGED_MARKER) {
            continue;
        }
        std::fs::remove_file(&hosts_file).map_err(|e| {
            ClydeError::other_src(
                format!("could not remove {}", hosts_file.display()),
                e,
            )
        })?;
        let _ = std::fs::remove_dir(entry.path());
        tracing::info!(path = %hosts_file.display(), "mirror configuration removed");
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct PipConfigurationArgs {
    /// Path to the pip configuration directory.
    #[arg(long, env = "PIP_CONFIG_PATH", default_value = "/etc")]
    pip_config_path: PathBuf,
    /// Base URL of the Python package index.
    #[arg(
        long,
        env = "PIP_INDEX_URL",
        default_value = "https://pypi.org/simple"
    )]
    index_url: String,
    /// Hosts that pip will treat as trusted.
    #[arg(long, env = "PIP_TRUSTED_HOST")]
    trusted_host: Option<String>,
    /// Default timeout in seconds for pip operations.
    #[arg(long, env = "PIP_TIMEOUT", default_value_t = 15)]
    timeout: u32,
    /// Proxy server URL.
    #[arg(long, env = "PIP_PROXY")]
    proxy: Option<String>,
}

pub async fn run_pip(args: PipConfigurationArgs) -> ClydeResult<()> {
    let mut conf = String::from("[global]\n");
    if !args.index_url.is_empty() {
        conf.push_str(&format!("index-url = {}\n", args.index_url));
    }
    if let Some(trusted_host) = &args.trusted_host {
        conf.push_str(&format!("trusted-host = {trusted_host}\n"));
    }
    if args.timeout > 0 {
        conf.push_str(&format!("timeout = {}\n", args.timeout));
    }
    if let Some(proxy) = &args.proxy {
        conf.push_str(&format!("proxy = {proxy}\n"));
    }

    std::fs::create_dir_all(&args.pip_config_path).map_err(|e| {
        ClydeError::init_src(
            format!(
                "failed to create pip config directory {}",
                args.pip_config_path.display()
            ),
            e,
        )
    })?;
    let path = args.pip_config_path.join("pip.conf");
    std::fs::write(&path, conf).map_err(|e| {
        ClydeError::init_src("failed to write pip config", e)
    })?;
    tracing::info!(path = %path.display(), "pip configuration written");
    Ok(())
}

#[derive(Debug, Args)]
pub struct HfConfigurationArgs {
    /// Directory to cache Hugging Face models in.
    #[arg(long, env = "HF_HUB_CACHE", default_value = "/data/cache/hf/model")]
    hf_cache_dir: PathBuf,
}

pub async fn run_hf(args: HfConfigurationArgs) -> ClydeResult<()> {
    std::fs::create_dir_all(&args.hf_cache_dir).map_err(|e| {
        ClydeError::init_src(
            format!(
                "failed to create Hugging Face cache directory {}",
                args.hf_cache_dir.display()
            ),
            e,
        )
    })?;
    tracing::info!(path = %args.hf_cache_dir.display(), "Hugging Face configuration applied");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn url(s: &str) -> url::Url {
        s.parse().unwrap()
    }

    #[test]
    fn mirror_configuration_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        add_mirror_configuration(
            tmp.path(),
            &[url("https://docker.io")],
            &[url("http://127.0.0.1:5000")],
            true,
            false,
            None,
        )
        .unwrap();

        let written = std::fs::read_to_string(
            tmp.path().join("docker.io/hosts.toml"),
        )
        .unwrap();
        assert!(written.starts_with(MANAGED_MARKER));
        assert!(written.contains("server = \"https://docker.io\""));
        assert!(written.contains("[host.\"http://127.0.0.1:5000\"]"));
        assert!(written.contains(r#"capabilities = ["pull", "resolve"]"#));

        remove_mirror_configuration(tmp.path()).unwrap();
        assert!(!tmp.path().join("docker.io/hosts.toml").exists());
    }

    #[test]
    fn wildcard_entry_when_no_registries_named() {
        let tmp = tempfile::tempdir().unwrap();
        add_mirror_configuration(
            tmp.path(),
            &[],
            &[url("http://127.0.0.1:5000")],
            false,
            false,
            None,
        )
        .unwrap();

        let written = std::fs::read_to_string(
            tmp.path().join("_default/hosts.toml"),
        )
        .unwrap();
        assert!(!written.contains("server ="));
        assert!(written.contains(r#"capabilities = ["pull"]"#));
    }

    #[test]
    fn cleanup_leaves_unmanaged_files() {
        let tmp = tempfile::tempdir().unwrap();
        let foreign = tmp.path().join("quay.io");
        std::fs::create_dir_all(&foreign).unwrap();
        std::fs::write(foreign.join("hosts.toml"), "server = \"x\"\n")
            .unwrap();

        remove_mirror_configuration(tmp.path()).unwrap();
        assert!(foreign.join("hosts.toml").exists());
    }

    #[test]
    fn prepend_keeps_existing_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docker.io");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("hosts.toml"),
            "[host.\"http://other:5000\"]\n",
        )
        .unwrap();

        add_mirror_configuration(
            tmp.path(),
            &[url("https://docker.io")],
            &[url("http://127.0.0.1:5000")],
            true,
            true,
            None,
        )
        .unwrap();

        let written =
            std::fs::read_to_string(dir.join("hosts.toml")).unwrap();
        let ours = written.find("http://127.0.0.1:5000").unwrap();
        let existing = written.find("http://other:5000").unwrap();
        assert!(ours < existing);
    }
}
