//! # activefx
//!
//! A finite-state-machine dispatch engine and its application to a
//! non-blocking, reactor-driven socket connection lifecycle.
//!
//! ## Core Concepts
//!
//! The engine separates three things:
//! - a **domain** owns the state/transition tables and one dispatch task
//!   that serializes every transition for its contexts;
//! - a **context** is an entity with a current state (a [`Connection`], or
//!   anything implementing [`FsmContext`]);
//! - **events** target a context and are matched against the table as
//!   `(current_state, event) → transition`, with optional guard and action.
//!
//! ## Architecture
//!
//! ```text
//! client thread                     dispatch task                reactor thread
//!      │                                 │                            │
//!      │ read(buf, handler)              │                            │
//!      ├──► READ event ──► queue ──► guard stages buf ──► register    │
//!      │                                 │              READ interest │
//!      │                                 │                            │ on_read():
//!      │                                 │                            │ channel.read()
//!      │                                 │     READ_COMPLETE ◄────────┤ enqueue
//!      │                                 │ ◄── queue                  │
//!      │        handler.read_completed(buf) ◄─┘                       │
//! ```
//!
//! A single request spans two threads: the dispatch task decides to start
//! and registers interest; the reactor performs the syscall when the channel
//! is ready and raises the completion event back into the queue.
//!
//! ## Key Invariants
//!
//! 1. **One dispatch task per domain** — transitions on a context never
//!    interleave; the state field needs no lock.
//! 2. **Bounded, non-blocking queue** — at-most-once delivery; overflow
//!    drops the newest event with a warning and `Err(QueueFull)`.
//! 3. **Guards may stage, failures stage nothing** — a rejected guard
//!    leaves the connection untouched.
//! 4. **Failures don't close** — `_FAILURE` events notify the client and
//!    release reactor interest; only `close()` tears down.
//! 5. **Callbacks are non-blocking** — a blocked callback stalls the whole
//!    domain, which the watchdog is wired to detect.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use activefx::{connection_domain, Connection, LivenessMonitor, LivenessConfig};
//!
//! // 1. Build and start the lifecycle domain (one per process is typical).
//! let monitor = LivenessMonitor::start(LivenessConfig::default());
//! let handle = connection_domain("connections").start_with_watchdog(
//!     monitor,
//!     Duration::from_secs(1),
//!     std::sync::Arc::new(|report| tracing::error!(?report, "dispatch stalled")),
//! )?;
//!
//! // 2. Create a connection against your reactor and open a channel.
//! let conn = Connection::new(handle.clone(), reactor);
//! conn.open(channel, handler)?;     // completes via handler.open_completed()
//!
//! // 3. Issue I/O; completions arrive on the dispatch task.
//! conn.read(BytesMut::with_capacity(4096), handler.clone())?;
//! conn.write(BytesMut::from(&b"hello"[..]), handler.clone())?;
//! conn.close()?;                     // the only way to abort pending I/O
//! ```
//!
//! ## What This Is Not
//!
//! activefx is **not**:
//! - a selector/epoll multiplexer — the [`Reactor`] is an external
//!   collaborator this crate only registers interest with;
//! - a TLS implementation — [`Channel::process_handshake`] is a seam, not
//!   an engine;
//! - a delivery guarantee — the queue is explicitly best-effort.

// Core modules
mod config;
mod connection;
mod core;
mod domain;
mod error;
mod handler;
mod lifecycle;
mod reactor;
mod registry;
mod state;
mod table;
mod transition;
mod transport;
mod watchdog;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{EventId, FsmContext, FsmEvent, StateId};

// Re-export configuration
pub use config::{DomainConfig, LivenessConfig, DEFAULT_PROBE_RATIO, DEFAULT_QUEUE_CAPACITY};

// Re-export error types
pub use error::ActivefxError;

// Re-export FSM primitives
pub use state::{State, StateHook};
pub use table::TransitionTable;
pub use transition::{Action, Guard, Transition, TransitionOutcome};

// Re-export the dispatch engine
pub use domain::{DomainHandle, DomainLifecycle, FsmDomain};
pub use registry::{DomainControl, DomainRegistry};

// Re-export watchdog types
pub use watchdog::{
    HealthStatus, LivenessMonitor, StallHandler, StallReport, WatchKey, Watchdog,
};

// Re-export collaborator seams
pub use handler::ConnectionHandler;
pub use reactor::{Interest, Reactor, ReactorHandler};
pub use transport::{Channel, SharedChannel};

// Re-export the connection layer
pub use connection::Connection;
pub use lifecycle::{connection_domain, ConnEvent, ConnPayload, ConnState, IoSlot};
