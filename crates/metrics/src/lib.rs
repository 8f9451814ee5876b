#![deny(missing_docs)]
//! Prometheus metric families exported by clyde, all under the `clyde`
//! namespace.

use prometheus::{
    histogram_opts, opts, GaugeVec, HistogramVec, IntCounterVec, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

const NAMESPACE: &str = "clyde";

/// The clyde metric families.
pub struct Metrics {
    registry: Registry,

    /// Total number of mirror requests, labelled by origin registry and
    /// cache hit/miss.
    pub mirror_requests_total: IntCounterVec,
    /// The duration for the router to resolve a peer.
    pub resolve_duration_seconds: HistogramVec,
    /// Number of images advertised to be available.
    pub advertised_images: GaugeVec,
    /// Number of image tags advertised to be available.
    pub advertised_image_tags: GaugeVec,
    /// Number of image digests advertised to be available.
    pub advertised_image_digests: GaugeVec,
    /// Number of keys advertised to be available.
    pub advertised_keys: GaugeVec,
    /// Number of wheel packages advertised to be available.
    pub advertised_pip_packages: GaugeVec,
    /// Number of model files advertised to be available.
    pub advertised_hf_models: GaugeVec,
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(opts!(name, help).namespace(NAMESPACE), labels)
        .expect("invalid counter definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(opts!(name, help).namespace(NAMESPACE), labels)
        .expect("invalid gauge definition")
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();
        let out = Self {
            mirror_requests_total: counter_vec(
                "mirror_requests_total",
                "Total number of mirror requests.",
                &["registry", "cache"],
            ),
            resolve_duration_seconds: HistogramVec::new(
                histogram_opts!(
                    "resolve_duration_seconds",
                    "The duration for router to resolve a peer."
                )
                .namespace(NAMESPACE),
                &["router"],
            )
            .expect("invalid histogram definition"),
            advertised_images: gauge_vec(
                "advertised_images",
                "Number of images advertised to be available.",
                &["registry"],
            ),
            advertised_image_tags: gauge_vec(
                "advertised_image_tags",
                "Number of image tags advertised to be available.",
                &["registry"],
            ),
            advertised_image_digests: gauge_vec(
                "advertised_image_digests",
                "Number of image digests advertised to be available.",
                &["registry"],
            ),
            advertised_keys: gauge_vec(
                "advertised_keys",
                "Number of keys advertised to be available.",
                &["registry"],
            ),
            advertised_pip_packages: gauge_vec(
                "advertised_pip_packages",
                "Number of pip packages advertised to be available.",
                &["source"],
            ),
            advertised_hf_models: gauge_vec(
                "advertised_hf_models",
                "Number of Hugging Face models advertised to be available.",
                &["source"],
            ),
            registry,
        };

        out.registry
            .register(Box::new(out.mirror_requests_total.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.resolve_duration_seconds.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.advertised_images.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.advertised_image_tags.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.advertised_image_digests.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.advertised_keys.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.advertised_pip_packages.clone()))
            .expect("metric registration");
        out.registry
            .register(Box::new(out.advertised_hf_models.clone()))
            .expect("metric registration");
        out
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

/// The process-wide metric families.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn families_register_and_render() {
        let m = metrics();
        m.mirror_requests_total
            .with_label_values(&["docker.io", "hit"])
            .inc();
        m.advertised_images.with_label_values(&["docker.io"]).set(3.0);
        let text = m.gather();
        assert!(text.contains("clyde_mirror_requests_total"));
        assert!(text.contains("clyde_advertised_images"));
    }
}
