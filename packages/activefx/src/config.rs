//! Configuration for domains and the liveness monitor.
//!
//! Policy-light structs with sensible defaults and `with_*` builders.
//! Everything here is serde-friendly so deployments can load tuning from
//! their own config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bounded-queue capacity for a domain's event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Fraction of the watchdog period at which liveness probes are injected.
///
/// Probing faster than the reporting window means a healthy loop always
/// reports at least once per window.
pub const DEFAULT_PROBE_RATIO: f64 = 0.75;

/// Tuning for a single FSM domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Capacity of the bounded event queue. Enqueue never blocks: when the
    /// queue is full the newest event is dropped with a warning.
    pub queue_capacity: usize,
    /// Probe interval as a fraction of the watchdog period.
    pub probe_ratio: f64,
}

impl DomainConfig {
    /// Set the event queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the probe interval ratio.
    pub fn with_probe_ratio(mut self, ratio: f64) -> Self {
        self.probe_ratio = ratio;
        self
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            probe_ratio: DEFAULT_PROBE_RATIO,
        }
    }
}

/// Tuning for [`LivenessMonitor`](crate::watchdog::LivenessMonitor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// How often the monitor sweeps registered components for missed
    /// deadlines. Should be well below the smallest registered period.
    pub sweep_interval: Duration,
}

impl LivenessConfig {
    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(100),
        }
    }
}
