use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Sink for gateway measurements
pub trait Observability: Send + Sync + 'static {
    fn record_dispatch(&self, plugin_id: &str, duration: Duration, success: bool);
    fn record_rejection(&self, plugin_id: &str, reason: &str);
    fn record_trace(&self, plugin_id: &str, trace_id: &str, operation: &str, duration: Duration);
    fn set_loaded_plugins(&self, count: usize);
    fn set_circuit_open(&self, plugin_id: &str, open: bool);
    /// Forget per-plugin series (on unload).
    fn remove_plugin(&self, plugin_id: &str);
    /// Text exposition of everything recorded
    fn render(&self) -> String;
}

pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub request_errors_total: IntCounterVec,
    pub rejections_total: IntCounterVec,
    pub dispatch_duration: HistogramVec,

    pub loaded_plugins: IntGauge,
    pub circuit_open: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "plugin_gateway_requests_total",
                "Requests dispatched to plugins",
            ),
            &["plugin"],
        )
        .expect("metric creation failed");
        let request_errors_total = IntCounterVec::new(
            Opts::new(
                "plugin_gateway_request_errors_total",
                "Dispatches that failed or timed out",
            ),
            &["plugin"],
        )
        .expect("metric creation failed");
        let rejections_total = IntCounterVec::new(
            Opts::new(
                "plugin_gateway_rejections_total",
                "Requests rejected before reaching a plugin",
            ),
            &["reason"],
        )
        .expect("metric creation failed");
        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "plugin_gateway_dispatch_duration_seconds",
                "Plugin dispatch duration in seconds",
            ),
            &["plugin"],
        )
        .expect("metric creation failed");

        let loaded_plugins =
            IntGauge::new("plugin_gateway_loaded_plugins", "Number of loaded plugins")
                .expect("metric creation failed");
        let circuit_open = IntGaugeVec::new(
            Opts::new(
                "plugin_gateway_circuit_open",
                "1 while the plugin's circuit breaker is open",
            ),
            &["plugin"],
        )
        .expect("metric creation failed");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(request_errors_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(rejections_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(loaded_plugins.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(circuit_open.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            requests_total,
            request_errors_total,
            rejections_total,
            dispatch_duration,
            loaded_plugins,
            circuit_open,
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl Observability for Metrics {
    fn record_dispatch(&self, plugin_id: &str, duration: Duration, success: bool) {
        self.requests_total.with_label_values(&[plugin_id]).inc();
        if !success {
            self.request_errors_total.with_label_values(&[plugin_id]).inc();
        }
        self.dispatch_duration
            .with_label_values(&[plugin_id])
            .observe(duration.as_secs_f64());
    }

    fn record_rejection(&self, plugin_id: &str, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
        tracing::debug!(plugin_id = %plugin_id, reason, "Request rejected");
    }

    fn record_trace(&self, plugin_id: &str, trace_id: &str, operation: &str, duration: Duration) {
        tracing::trace!(
            plugin_id = %plugin_id,
            trace_id,
            operation,
            duration_ms = duration.as_millis() as u64,
            "span finished"
        );
    }

    fn set_loaded_plugins(&self, count: usize) {
        self.loaded_plugins.set(count as i64);
    }

    fn set_circuit_open(&self, plugin_id: &str, open: bool) {
        self.circuit_open
            .with_label_values(&[plugin_id])
            .set(i64::from(open));
    }

    fn remove_plugin(&self, plugin_id: &str) {
        let _ = self.requests_total.remove_label_values(&[plugin_id]);
        let _ = self.request_errors_total.remove_label_values(&[plugin_id]);
        let _ = self.dispatch_duration.remove_label_values(&[plugin_id]);
        let _ = self.circuit_open.remove_label_values(&[plugin_id]);
    }

    fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = Metrics::new();
        metrics.record_dispatch("echo", Duration::from_millis(5), true);
        metrics.record_dispatch("echo", Duration::from_millis(5), false);
        metrics.record_rejection("echo", "rate_limited");
        metrics.set_loaded_plugins(1);
        metrics.set_circuit_open("echo", true);

        assert_eq!(metrics.requests_total.with_label_values(&["echo"]).get(), 2);
        assert_eq!(
            metrics.request_errors_total.with_label_values(&["echo"]).get(),
            1
        );

        let text = metrics.render();
        assert!(text.contains("plugin_gateway_requests_total{plugin=\"echo\"} 2"));
        assert!(text.contains("plugin_gateway_rejections_total{reason=\"rate_limited\"} 1"));
        assert!(text.contains("plugin_gateway_loaded_plugins 1"));
    }

    #[test]
    fn test_remove_plugin_drops_series() {
        let metrics = Metrics::new();
        metrics.record_dispatch("gone", Duration::from_millis(1), true);
        metrics.remove_plugin("gone");
        assert!(!metrics.render().contains("plugin=\"gone\""));
    }
}
