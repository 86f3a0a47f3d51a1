//! Resilience and telemetry shared by every plugin call
//!
//! The mesh bundles the per-plugin circuit breaker, the plugin-scoped rate
//! limiter, instance selection and metrics so the gateway holds one handle.

use crate::config::Config;
use crate::ratelimit::PluginRateLimiter;
use std::sync::Arc;

pub mod circuit_breaker;
pub mod load_balancer;
pub mod observability;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStatus, CircuitState};
pub use load_balancer::{LoadBalancer, LoadBalancerError, RoundRobinBalancer};
pub use observability::{Metrics, Observability};

pub struct ServiceMesh {
    circuit_breaker: CircuitBreaker,
    rate_limiter: PluginRateLimiter,
    load_balancer: Arc<dyn LoadBalancer>,
    observability: Arc<dyn Observability>,
}

impl ServiceMesh {
    pub fn new(config: &Config) -> Self {
        Self::with_components(
            config,
            Arc::new(RoundRobinBalancer::new()),
            Arc::new(Metrics::new()),
        )
    }

    pub fn with_components(
        config: &Config,
        load_balancer: Arc<dyn LoadBalancer>,
        observability: Arc<dyn Observability>,
    ) -> Self {
        Self {
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            rate_limiter: PluginRateLimiter::new(&config.rate_limiting),
            load_balancer,
            observability,
        }
    }

    pub async fn start(&self) {
        tracing::debug!("Service mesh started");
    }

    pub async fn stop(&self) {
        self.observability.set_loaded_plugins(0);
        tracing::debug!("Service mesh stopped");
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn rate_limiter(&self) -> &PluginRateLimiter {
        &self.rate_limiter
    }

    pub fn load_balancer(&self) -> &dyn LoadBalancer {
        self.load_balancer.as_ref()
    }

    pub fn observability(&self) -> &dyn Observability {
        self.observability.as_ref()
    }

    /// Drop every piece of per-plugin state.
    pub fn forget_plugin(&self, plugin_id: &str) {
        self.circuit_breaker.reset(plugin_id);
        self.rate_limiter.reset(plugin_id);
        for instance in self.load_balancer.get_instances(plugin_id) {
            let _ = self.load_balancer.unregister_instance(plugin_id, &instance);
        }
        self.observability.remove_plugin(plugin_id);
    }
}
