//! Liveness watchdog: the trait domains report to, and a concrete monitor.
//!
//! A domain started with a watchdog injects a synthetic probe into its own
//! event queue and reports [`HealthStatus::Healthy`] when the dispatch loop
//! processes it. A loop that is stalled — blocked in a guard/action, or
//! starved behind a saturated queue — stops reporting, and the monitor fires
//! the component's stall callback within one additional period.
//!
//! The monitor observes *processing*, not mere thread aliveness: a live task
//! stuck inside one callback is exactly what this catches.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LivenessConfig;

/// Opaque handle identifying a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchKey(Uuid);

impl WatchKey {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health reported by a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The component processed its probe in time.
    Healthy,
    /// The component is alive but impaired; logged, still counts as a report.
    Degraded,
}

/// Diagnostic handed to a stall callback.
///
/// Carries a structured snapshot rather than a thread stack: the callback
/// owns any escalation (dump, restart, page).
#[derive(Debug, Clone)]
pub struct StallReport {
    /// Name the component registered under.
    pub component: String,
    /// The reporting period the component committed to.
    pub period: Duration,
    /// How long ago the last report arrived.
    pub elapsed: Duration,
    /// Timestamp of the last report.
    pub last_report: DateTime<Utc>,
}

/// Callback invoked when a component misses its reporting window.
pub type StallHandler = Arc<dyn Fn(StallReport) + Send + Sync>;

/// The liveness contract between a monitor and its components.
pub trait Watchdog: Send + Sync + 'static {
    /// Register a component expected to report within every `period`.
    /// `on_stall` fires when a window is missed.
    fn register_component(
        &self,
        name: &str,
        period: Duration,
        on_stall: StallHandler,
    ) -> WatchKey;

    /// Report the component's health. Any report re-arms the stall window.
    fn report_status(&self, key: WatchKey, status: HealthStatus);

    /// Remove a component. Unknown keys are ignored.
    fn deregister_component(&self, key: WatchKey);
}

struct ComponentWatch {
    name: String,
    period: Duration,
    on_stall: StallHandler,
    state: Mutex<WatchState>,
}

struct WatchState {
    last_report: DateTime<Utc>,
    /// Set when a stall fired; cleared by the next report so one stall
    /// produces one callback.
    stalled: bool,
}

/// A [`Watchdog`] that sweeps registered components on a timer.
///
/// Must be started inside a tokio runtime; the sweep task ends when the
/// monitor is dropped.
///
/// # Example
///
/// ```ignore
/// let monitor = LivenessMonitor::start(LivenessConfig::default());
/// let handle = domain.start_with_watchdog(
///     monitor.clone(),
///     Duration::from_secs(1),
///     Arc::new(|report| tracing::error!(?report, "dispatch loop stalled")),
/// )?;
/// ```
pub struct LivenessMonitor {
    components: DashMap<WatchKey, Arc<ComponentWatch>>,
}

impl LivenessMonitor {
    /// Start a monitor and its sweep task.
    pub fn start(config: LivenessConfig) -> Arc<Self> {
        let monitor = Arc::new(Self {
            components: DashMap::new(),
        });

        let weak = Arc::downgrade(&monitor);
        let sweep_interval = config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.sweep(Utc::now());
            }
            debug!("liveness monitor sweep task ended");
        });

        monitor
    }

    /// Number of registered components.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    fn sweep(&self, now: DateTime<Utc>) {
        // Collect first, fire after: stall callbacks are user code and must
        // not run while map entries are held.
        let mut fired = Vec::new();
        for entry in self.components.iter() {
            let watch = entry.value();
            let mut state = match watch.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let elapsed = (now - state.last_report).to_std().unwrap_or_default();
            if state.stalled || elapsed <= watch.period {
                continue;
            }
            state.stalled = true;
            fired.push((
                watch.on_stall.clone(),
                StallReport {
                    component: watch.name.clone(),
                    period: watch.period,
                    elapsed,
                    last_report: state.last_report,
                },
            ));
        }

        for (on_stall, report) in fired {
            warn!(
                component = %report.component,
                elapsed_ms = report.elapsed.as_millis() as u64,
                period_ms = report.period.as_millis() as u64,
                "component missed its liveness window"
            );
            on_stall(report);
        }
    }
}

impl Watchdog for LivenessMonitor {
    fn register_component(
        &self,
        name: &str,
        period: Duration,
        on_stall: StallHandler,
    ) -> WatchKey {
        let key = WatchKey::new();
        self.components.insert(
            key,
            Arc::new(ComponentWatch {
                name: name.to_string(),
                period,
                on_stall,
                state: Mutex::new(WatchState {
                    last_report: Utc::now(),
                    stalled: false,
                }),
            }),
        );
        info!(component = name, period_ms = period.as_millis() as u64, "component registered with watchdog");
        key
    }

    fn report_status(&self, key: WatchKey, status: HealthStatus) {
        let Some(watch) = self.components.get(&key) else {
            debug!(%key, "status report for unknown component ignored");
            return;
        };
        if status == HealthStatus::Degraded {
            warn!(component = %watch.name, "component reported degraded");
        }
        let mut state = match watch.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.last_report = Utc::now();
        state.stalled = false;
    }

    fn deregister_component(&self, key: WatchKey) {
        if let Some((_, watch)) = self.components.remove(&key) {
            info!(component = %watch.name, "component deregistered from watchdog");
        }
    }
}

impl fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("components", &self.components.len())
            .finish()
    }
}
