//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use planar_routing::PlannerConfig;

use crate::retry::RetryPolicy;

/// Tunables for the whole actor layer.
///
/// Defaults are production-shaped; tests usually drop `time_scale` to
/// zero and shrink the tick interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for quick request/response asks (snapshots, control).
    pub ask_timeout: Duration,
    /// Deadline for blocking resource requests (movers, devices,
    /// station access). Contended resources can take a while.
    pub resource_timeout: Duration,
    /// Deadline for a single transport.
    pub transport_timeout: Duration,
    /// Deadline for device load/unload operations.
    pub device_timeout: Duration,
    /// Plate autonomy tick.
    pub tick_interval: Duration,
    /// Minimum spacing of `mover.position_changed` events per mover.
    pub position_publish_interval: Duration,
    /// Cadence of `device.processing_progress` events.
    pub progress_interval: Duration,
    /// Simulated duration of a device load/unload motion.
    pub device_motion_time: Duration,
    /// Bounded per-plate history length.
    pub history_limit: usize,
    /// Event bus history ring size.
    pub event_history: usize,
    /// Per-subscription event channel capacity.
    pub event_channel_capacity: usize,
    /// Scale factor applied to simulated waits (0 disables them).
    pub time_scale: f64,
    pub retry: RetryPolicy,
    pub planner: PlannerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ask_timeout: Duration::from_secs(30),
            resource_timeout: Duration::from_secs(300),
            transport_timeout: Duration::from_secs(120),
            device_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_millis(50),
            position_publish_interval: Duration::from_millis(100),
            progress_interval: Duration::from_secs(1),
            device_motion_time: Duration::from_millis(200),
            history_limit: 50,
            event_history: 100,
            event_channel_capacity: 256,
            time_scale: 1.0,
            retry: RetryPolicy::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Configuration suited to fast tests: no simulated waits, tight
    /// tick loop.
    pub fn for_tests() -> Self {
        Self::default()
            .with_time_scale(0.05)
            .with_tick_interval(Duration::from_millis(10))
            .with_ask_timeout(Duration::from_secs(5))
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    pub fn with_resource_timeout(mut self, timeout: Duration) -> Self {
        self.resource_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Scale a simulated wait by `time_scale`.
    pub fn scaled(&self, duration: Duration) -> Duration {
        Duration::from_secs_f64(duration.as_secs_f64() * self.time_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_shaped() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.event_history, 100);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.position_publish_interval, Duration::from_millis(100));
    }

    #[test]
    fn time_scale_shrinks_waits() {
        let config = OrchestratorConfig::default().with_time_scale(0.5);
        assert_eq!(
            config.scaled(Duration::from_secs(2)),
            Duration::from_secs(1)
        );

        let frozen = OrchestratorConfig::default().with_time_scale(0.0);
        assert_eq!(frozen.scaled(Duration::from_secs(2)), Duration::ZERO);
    }
}
