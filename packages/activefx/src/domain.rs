//! FSM domain: registration, the single dispatch task, and its handle.
//!
//! A domain owns the state and transition tables for one family of contexts
//! and serializes every transition through a single dispatch task:
//!
//! ```text
//! client threads ──dispatch()──► bounded queue ──► dispatch task ──► Transition::execute
//! reactor thread ──dispatch()──►      │                                   │
//!                                     │            completion handlers ◄──┘
//! watchdog probe ──every 0.75×period──┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut domain = FsmDomain::new("connections");
//! domain.add_state(State::new(CLOSED, "CLOSED"), true);
//! domain.add_state(State::new(OPENING, "OPENING"), false);
//! domain.add_transition(OPEN, CLOSED, OPENING, None, Some(open_action));
//!
//! let handle = domain.start()?;
//! handle.dispatch(FsmEvent::new(conn, OPEN, payload))?;
//! // ...
//! handle.stop();
//! ```
//!
//! # Delivery contract
//!
//! Enqueue is non-blocking and at-most-once. When the bounded queue is full
//! the newest event is dropped: a warning is logged and the producer gets
//! `Err(QueueFull)`. Callers must not assume delivery.
//!
//! # Non-reentrancy
//!
//! Guards, actions, and state hooks run on the dispatch task. They may
//! enqueue further events (`dispatch`), but must never call `dispatch_sync`
//! into their own domain: the queue is the only safe re-entry point.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::DomainConfig;
use crate::core::{EventId, FsmContext, FsmEvent, StateId};
use crate::error::ActivefxError;
use crate::state::State;
use crate::table::TransitionTable;
use crate::transition::{Action, Guard, Transition, TransitionOutcome};
use crate::watchdog::{HealthStatus, StallHandler, WatchKey, Watchdog};

// =============================================================================
// Lifecycle
// =============================================================================

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Engine lifecycle of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainLifecycle {
    /// Registration phase; no dispatch task yet.
    NotStarted,
    /// Dispatch task draining the queue.
    Running,
    /// Stop requested; queue being cleared.
    Stopping,
    /// Dispatch task exited.
    Stopped,
}

impl DomainLifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            NOT_STARTED => Self::NotStarted,
            RUNNING => Self::Running,
            STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

// =============================================================================
// Registration phase
// =============================================================================

/// A domain under construction: states and transitions are registered here,
/// then [`start`](FsmDomain::start) consumes the domain and spawns the
/// dispatch task.
///
/// Consuming `start` makes a second start — and registration concurrent with
/// dispatch — unrepresentable.
pub struct FsmDomain<C: FsmContext> {
    name: String,
    config: DomainConfig,
    states: HashMap<StateId, State<C>>,
    table: TransitionTable<C>,
    initial: Option<StateId>,
}

impl<C: FsmContext> FsmDomain<C> {
    /// Create an empty domain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: DomainConfig::default(),
            states: HashMap::new(),
            table: TransitionTable::new(),
            initial: None,
        }
    }

    /// Replace the domain configuration.
    pub fn with_config(mut self, config: DomainConfig) -> Self {
        self.config = config;
        self
    }

    /// The domain's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a state.
    ///
    /// Duplicate ids are a configuration error: the first registration wins
    /// and the duplicate is dropped with a warning. The first `initial=true`
    /// call fixes the initial state; later ones are ignored with a warning.
    pub fn add_state(&mut self, state: State<C>, initial: bool) {
        let id = state.id();
        if self.states.contains_key(&id) {
            warn!(
                domain = %self.name,
                state = %id,
                name = state.name(),
                "duplicate state registration ignored"
            );
            return;
        }
        self.states.insert(id, state);

        if initial {
            match self.initial {
                None => self.initial = Some(id),
                Some(existing) => warn!(
                    domain = %self.name,
                    state = %id,
                    initial = %existing,
                    "initial state already fixed; flag ignored"
                ),
            }
        }
    }

    /// Register a transition rule.
    ///
    /// Both endpoints must already be registered states; otherwise the rule
    /// is dropped with a warning. A duplicate `(from, event)` overwrites the
    /// earlier rule (the table logs the collision).
    pub fn add_transition(
        &mut self,
        event: EventId,
        from: StateId,
        to: StateId,
        guard: Option<Guard<C>>,
        action: Option<Action<C>>,
    ) {
        if !self.states.contains_key(&from) || !self.states.contains_key(&to) {
            warn!(
                domain = %self.name,
                %event,
                %from,
                %to,
                "transition references unregistered state; dropped"
            );
            return;
        }
        self.table
            .insert(Transition::new(event, from, to, guard, action));
    }

    /// Number of registered transitions.
    pub fn transition_count(&self) -> usize {
        self.table.len()
    }

    /// Start the dispatch task. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<DomainHandle<C>, ActivefxError> {
        self.start_inner(None)
    }

    /// Start the dispatch task with watchdog supervision.
    ///
    /// The domain registers itself with `watchdog` under `period` and injects
    /// a synthetic probe into its own queue every `probe_ratio × period`
    /// (default 0.75). Processing the probe reports liveness, so a dispatch
    /// loop stuck inside a callback — not merely a dead task — trips the
    /// watchdog. `on_stall` is handed to the watchdog as the failure
    /// response.
    pub fn start_with_watchdog(
        self,
        watchdog: Arc<dyn Watchdog>,
        period: Duration,
        on_stall: StallHandler,
    ) -> Result<DomainHandle<C>, ActivefxError> {
        self.start_inner(Some((watchdog, period, on_stall)))
    }

    fn start_inner(
        self,
        watchdog: Option<(Arc<dyn Watchdog>, Duration, StallHandler)>,
    ) -> Result<DomainHandle<C>, ActivefxError> {
        let initial = self.initial.ok_or_else(|| ActivefxError::NoInitialState {
            domain: self.name.clone(),
        })?;

        let core = Arc::new(DomainCore {
            name: self.name,
            states: self.states,
            table: self.table,
            initial,
            capacity: self.config.queue_capacity,
            lifecycle: AtomicU8::new(RUNNING),
        });

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let wiring = watchdog.map(|(watchdog, period, on_stall)| {
            let key = watchdog.register_component(&core.name, period, on_stall);
            Arc::new(WatchdogWiring {
                watchdog,
                key,
                period,
            })
        });

        if let Some(wiring) = &wiring {
            spawn_probe_task(
                core.clone(),
                tx.clone(),
                shutdown_rx.clone(),
                wiring.period.mul_f64(self.config.probe_ratio),
            );
        }

        tokio::spawn(dispatch_loop(
            core.clone(),
            rx,
            shutdown_rx,
            wiring.clone(),
        ));

        Ok(DomainHandle {
            core,
            tx,
            shutdown: Arc::new(shutdown_tx),
            wiring,
        })
    }
}

impl<C: FsmContext> std::fmt::Debug for FsmDomain<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmDomain")
            .field("name", &self.name)
            .field("states", &self.states.len())
            .field("transitions", &self.table.len())
            .field("initial", &self.initial)
            .finish()
    }
}

// =============================================================================
// Running domain
// =============================================================================

struct WatchdogWiring {
    watchdog: Arc<dyn Watchdog>,
    key: WatchKey,
    period: Duration,
}

enum QueueItem<C: FsmContext> {
    Event(FsmEvent<C>),
    Probe,
}

pub(crate) struct DomainCore<C: FsmContext> {
    name: String,
    states: HashMap<StateId, State<C>>,
    table: TransitionTable<C>,
    initial: StateId,
    capacity: usize,
    lifecycle: AtomicU8,
}

impl<C: FsmContext> DomainCore<C> {
    /// Look up and execute the transition for `(current_state, event)`.
    ///
    /// An unmatched event is normal and non-fatal (a completion racing a
    /// close, for instance): it is logged and the state left unchanged.
    /// Panics from guards/actions/hooks are caught here so one misbehaving
    /// callback cannot kill the dispatch loop.
    fn handle_event(&self, event: &FsmEvent<C>) -> TransitionOutcome {
        let current = event.target().current_state();
        let Some(transition) = self.table.lookup(current, event.id()) else {
            warn!(
                domain = %self.name,
                state = %current,
                event = %event.id(),
                target = event.target().label(),
                "no transition for event in current state; ignored"
            );
            return TransitionOutcome::NotMatched;
        };

        let (Some(from), Some(to)) = (
            self.states.get(&transition.from()),
            self.states.get(&transition.to()),
        ) else {
            // Registration validates endpoints, so this is unreachable in
            // practice; degrade to a no-op rather than poison the loop.
            error!(
                domain = %self.name,
                event = %event.id(),
                "transition endpoint missing from state table"
            );
            return TransitionOutcome::NotMatched;
        };

        let result = catch_unwind(AssertUnwindSafe(|| transition.execute(from, to, event)));
        match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!(
                    domain = %self.name,
                    event = %event.id(),
                    target = event.target().label(),
                    panic = %msg,
                    "callback panicked during transition; loop continues"
                );
                TransitionOutcome::Faulted
            }
        }
    }

    fn lifecycle(&self) -> DomainLifecycle {
        DomainLifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }
}

/// Handle to a running domain: the only way to feed it events or stop it.
///
/// Cheap to clone; every clone addresses the same dispatch task.
pub struct DomainHandle<C: FsmContext> {
    core: Arc<DomainCore<C>>,
    tx: mpsc::Sender<QueueItem<C>>,
    shutdown: Arc<watch::Sender<bool>>,
    wiring: Option<Arc<WatchdogWiring>>,
}

impl<C: FsmContext> Clone for DomainHandle<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
            wiring: self.wiring.clone(),
        }
    }
}

impl<C: FsmContext> DomainHandle<C> {
    /// The domain's name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current engine lifecycle.
    pub fn lifecycle(&self) -> DomainLifecycle {
        self.core.lifecycle()
    }

    /// The state new contexts for this domain start in.
    pub fn initial_state(&self) -> StateId {
        self.core.initial
    }

    /// Events currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.core.capacity - self.tx.capacity()
    }

    /// Enqueue an event for the dispatch task (non-blocking, at-most-once).
    ///
    /// Returns `Err(QueueFull)` when the bounded queue is saturated — the
    /// event has been dropped — and `Err(NotRunning)` after `stop`.
    pub fn dispatch(&self, event: FsmEvent<C>) -> Result<(), ActivefxError> {
        if self.core.lifecycle() != DomainLifecycle::Running {
            return Err(ActivefxError::NotRunning {
                domain: self.core.name.clone(),
            });
        }
        match self.tx.try_send(QueueItem::Event(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                if let QueueItem::Event(event) = item {
                    warn!(
                        domain = %self.core.name,
                        event = %event.id(),
                        target = event.target().label(),
                        capacity = self.core.capacity,
                        "event queue full; event dropped"
                    );
                }
                Err(ActivefxError::QueueFull {
                    domain: self.core.name.clone(),
                    capacity: self.core.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(ActivefxError::NotRunning {
                domain: self.core.name.clone(),
            }),
        }
    }

    /// Run an event synchronously on the caller's thread.
    ///
    /// For same-thread, pre-I/O requests where the caller needs the outcome
    /// before continuing. Must never be called from inside a guard/action of
    /// this same domain (see the module docs on non-reentrancy).
    pub fn dispatch_sync(&self, event: FsmEvent<C>) -> TransitionOutcome {
        self.core.handle_event(&event)
    }

    /// Request an asynchronous stop. Never blocks, including when called
    /// from inside a dispatch callback.
    ///
    /// A helper task deregisters the watchdog and signals the dispatch loop,
    /// which clears whatever is left in the queue and exits. Idempotent.
    /// Like `start`, must be called inside the tokio runtime.
    pub fn stop(&self) {
        if self
            .core
            .lifecycle
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(domain = %self.core.name, "stop already in progress");
            return;
        }

        info!(domain = %self.core.name, "stop requested");
        let wiring = self.wiring.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Some(wiring) = wiring {
                wiring.watchdog.deregister_component(wiring.key);
            }
            let _ = shutdown.send(true);
        });
    }
}

impl<C: FsmContext> std::fmt::Debug for DomainHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainHandle")
            .field("name", &self.core.name)
            .field("lifecycle", &self.core.lifecycle())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn dispatch_loop<C: FsmContext>(
    core: Arc<DomainCore<C>>,
    mut rx: mpsc::Receiver<QueueItem<C>>,
    mut shutdown: watch::Receiver<bool>,
    wiring: Option<Arc<WatchdogWiring>>,
) {
    info!(
        domain = %core.name,
        states = core.states.len(),
        transitions = core.table.len(),
        "dispatch loop starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(QueueItem::Event(event)) => {
                    core.handle_event(&event);
                }
                Some(QueueItem::Probe) => {
                    if let Some(wiring) = &wiring {
                        wiring.watchdog.report_status(wiring.key, HealthStatus::Healthy);
                    }
                }
                // All senders dropped: nothing can ever arrive again.
                None => break,
            }
        }
    }

    // Stop clears the queue: remaining events are discarded, not replayed.
    rx.close();
    let mut discarded = 0usize;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(domain = %core.name, discarded, "queue cleared on stop");
    }

    core.lifecycle.store(STOPPED, Ordering::Release);
    info!(domain = %core.name, "dispatch loop stopped");
}

fn spawn_probe_task<C: FsmContext>(
    core: Arc<DomainCore<C>>,
    tx: mpsc::Sender<QueueItem<C>>,
    mut shutdown: watch::Receiver<bool>,
    probe_interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(probe_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if tx.try_send(QueueItem::Probe).is_err() {
                        // A saturated queue also starves liveness, which is
                        // exactly the signal the watchdog should see.
                        warn!(domain = %core.name, "liveness probe dropped; queue saturated or closed");
                    }
                }
            }
        }
        debug!(domain = %core.name, "probe task ended");
    });
}
