//! Prometheus metrics for the registry and loader.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges owned by one [`crate::service::ModelService`].
pub struct ServiceMetrics {
    registry: Registry,
    pub live_contexts: IntGauge,
    pub contexts_created: IntCounter,
    pub contexts_released: IntCounter,
    pub load_attempts: IntCounterVec,
    pub create_failures: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let live_contexts = IntGauge::new("model_host_live_contexts", "Contexts currently registered")?;
        let contexts_created =
            IntCounter::new("model_host_contexts_created_total", "Contexts created")?;
        let contexts_released =
            IntCounter::new("model_host_contexts_released_total", "Contexts released")?;
        let load_attempts = IntCounterVec::new(
            Opts::new("model_host_load_attempts_total", "Tier load attempts by outcome"),
            &["outcome"],
        )?;
        let create_failures = IntCounterVec::new(
            Opts::new("model_host_create_failures_total", "Failed context creations by kind"),
            &["kind"],
        )?;

        registry.register(Box::new(live_contexts.clone()))?;
        registry.register(Box::new(contexts_created.clone()))?;
        registry.register(Box::new(contexts_released.clone()))?;
        registry.register(Box::new(load_attempts.clone()))?;
        registry.register(Box::new(create_failures.clone()))?;

        Ok(Self {
            registry,
            live_contexts,
            contexts_created,
            contexts_released,
            load_attempts,
            create_failures,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.contexts_created.inc();
        metrics.load_attempts.with_label_values(&["soft_failure"]).inc();

        let text = metrics.render();
        assert!(text.contains("model_host_contexts_created_total 1"));
        assert!(text.contains("model_host_load_attempts_total{outcome=\"soft_failure\"} 1"));
    }
}
