use super::{PluginGateway, PluginInstance};
use crate::plugin::PluginStatus;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What one monitoring pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub checked: usize,
    pub unhealthy: usize,
    pub removed: Vec<String>,
    pub expired_windows: usize,
}

pub(super) async fn run(gateway: Arc<PluginGateway>, shutdown: CancellationToken) {
    let period = gateway.config().monitoring.interval();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; the first cycle waits one full period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Plugin monitor stopping due to shutdown");
                break;
            }
            _ = ticker.tick() => {
                let report = gateway.run_monitor_cycle(Utc::now(), Instant::now()).await;
                if report.unhealthy > 0 || !report.removed.is_empty() {
                    tracing::info!(
                        checked = report.checked,
                        unhealthy = report.unhealthy,
                        removed = report.removed.len(),
                        "Monitor cycle finished"
                    );
                } else {
                    tracing::trace!(checked = report.checked, "Monitor cycle finished");
                }
            }
        }
    }
}

impl PluginGateway {
    /// One pass of the background monitor: health-check stale plugins, unload
    /// plugins that stayed failed past the retention period, sweep expired
    /// rate-limit state.
    pub async fn run_monitor_cycle(&self, now: DateTime<Utc>, clock: Instant) -> MonitorReport {
        let mut report = self.perform_health_checks(now).await;
        report.removed = self.cleanup_failed(now).await;
        report.expired_windows = self.mesh().rate_limiter().sweep_expired(clock);
        self.request_guard().sweep_expired(clock);
        report
    }

    async fn perform_health_checks(&self, now: DateTime<Utc>) -> MonitorReport {
        let due: Vec<Arc<PluginInstance>> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status() != PluginStatus::Stopped && i.health_is_stale(now))
            .cloned()
            .collect();

        let results = join_all(due.iter().map(|instance| self.check_health(instance))).await;
        MonitorReport {
            checked: results.len(),
            unhealthy: results.iter().filter(|s| !s.is_healthy()).count(),
            ..Default::default()
        }
    }

    async fn cleanup_failed(&self, now: DateTime<Utc>) -> Vec<String> {
        let retention = chrono::Duration::from_std(self.config().monitoring.failed_retention())
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let expired: Vec<String> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status() == PluginStatus::Failed && now - i.last_seen() > retention)
            .map(|i| i.id().to_string())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for plugin_id in expired {
            tracing::warn!(plugin_id = %plugin_id, "Unloading plugin that stayed failed past retention");
            match self.unload_plugin(&plugin_id).await {
                Ok(()) => removed.push(plugin_id),
                // Lost a race with an explicit unload.
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::error!(plugin_id = %plugin_id, error = %e, "Failed to unload failed plugin"),
            }
        }
        removed
    }
}
