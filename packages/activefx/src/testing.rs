//! Testing utilities: recording fakes for contexts, reactors, channels, and
//! client handlers.
//!
//! Only available with the `testing` feature (or inside this crate's own
//! tests):
//!
//! ```toml
//! [dev-dependencies]
//! activefx = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use activefx::testing::{LoopbackChannel, MockReactor, RecordingHandler};
//!
//! let handle = connection_domain("test").start()?;
//! let reactor = MockReactor::new();
//! let conn = Connection::new(handle, reactor.clone());
//!
//! conn.connect(LoopbackChannel::new(), RecordingHandler::new())?;
//! conn.wait_for_state(ConnState::Idle, Duration::from_secs(1)).await;
//! reactor.fire_read(); // play the reactor thread
//! ```

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;

use crate::core::{FsmContext, StateId};
use crate::handler::ConnectionHandler;
use crate::reactor::{Interest, Reactor, ReactorHandler};
use crate::transport::Channel;

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// TestContext
// =============================================================================

/// Minimal context for exercising the generic engine: a state cell and an
/// append-only trace of hook/action invocations.
pub struct TestContext {
    label: String,
    state: AtomicU16,
    trace: Mutex<Vec<String>>,
}

impl TestContext {
    /// Create a context in `initial`.
    pub fn new(label: impl Into<String>, initial: StateId) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            state: AtomicU16::new(initial.0),
            trace: Mutex::new(Vec::new()),
        })
    }

    /// Append a marker to the trace.
    pub fn record(&self, marker: impl Into<String>) {
        lock_or_recover(&self.trace).push(marker.into());
    }

    /// Snapshot of the trace so far.
    pub fn trace(&self) -> Vec<String> {
        lock_or_recover(&self.trace).clone()
    }

    /// Poll until the trace holds at least `n` markers.
    pub async fn wait_for_trace_len(&self, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while lock_or_recover(&self.trace).len() < n {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "trace never reached {} markers: {:?}",
                    n,
                    self.trace()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the context reaches `target`.
    pub async fn wait_for_state(&self, target: StateId, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.current_state() != target {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "context never reached {} (currently {})",
                    target,
                    self.current_state()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl FsmContext for TestContext {
    type Payload = ();

    fn current_state(&self) -> StateId {
        StateId(self.state.load(Ordering::Acquire))
    }

    fn set_current_state(&self, state: StateId) {
        self.state.store(state.0, Ordering::Release);
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// =============================================================================
// RecordingHandler
// =============================================================================

/// One recorded client callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerCall {
    /// `open_completed` fired.
    OpenCompleted,
    /// `open_failed` fired with this cause.
    OpenFailed(String),
    /// `read_completed` fired with these bytes.
    ReadCompleted(Vec<u8>),
    /// `read_failed` fired.
    ReadFailed,
    /// `write_completed` fired.
    WriteCompleted,
    /// `write_failed` fired.
    WriteFailed,
    /// `closed` fired.
    Closed,
    /// `accept_completed` fired.
    AcceptCompleted,
}

impl HandlerCall {
    /// Stable name for counting and waiting.
    pub fn name(&self) -> &'static str {
        match self {
            HandlerCall::OpenCompleted => "open_completed",
            HandlerCall::OpenFailed(_) => "open_failed",
            HandlerCall::ReadCompleted(_) => "read_completed",
            HandlerCall::ReadFailed => "read_failed",
            HandlerCall::WriteCompleted => "write_completed",
            HandlerCall::WriteFailed => "write_failed",
            HandlerCall::Closed => "closed",
            HandlerCall::AcceptCompleted => "accept_completed",
        }
    }
}

/// A [`ConnectionHandler`] that records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<HandlerCall>>,
}

impl RecordingHandler {
    /// Create a fresh recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, call: HandlerCall) {
        lock_or_recover(&self.calls).push(call);
    }

    /// Snapshot of all recorded calls, in order.
    pub fn calls(&self) -> Vec<HandlerCall> {
        lock_or_recover(&self.calls).clone()
    }

    /// How many times the named callback fired.
    pub fn count(&self, name: &str) -> usize {
        lock_or_recover(&self.calls)
            .iter()
            .filter(|call| call.name() == name)
            .count()
    }

    /// All bytes delivered through `read_completed`, concatenated.
    pub fn read_data(&self) -> Vec<u8> {
        lock_or_recover(&self.calls)
            .iter()
            .filter_map(|call| match call {
                HandlerCall::ReadCompleted(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// The cause of the most recent `open_failed`, or empty.
    pub fn last_failure_cause(&self) -> String {
        lock_or_recover(&self.calls)
            .iter()
            .rev()
            .find_map(|call| match call {
                HandlerCall::OpenFailed(cause) => Some(cause.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Poll until the named callback has fired at least `n` times.
    pub async fn wait_for(&self, name: &str, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count(name) < n {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "'{}' never reached {} calls; saw {:?}",
                    name,
                    n,
                    self.calls()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl ConnectionHandler for RecordingHandler {
    fn open_completed(&self) {
        self.push(HandlerCall::OpenCompleted);
    }

    fn open_failed(&self, cause: &str) {
        self.push(HandlerCall::OpenFailed(cause.to_string()));
    }

    fn read_completed(&self, buffer: BytesMut) {
        self.push(HandlerCall::ReadCompleted(buffer.to_vec()));
    }

    fn read_failed(&self) {
        self.push(HandlerCall::ReadFailed);
    }

    fn write_completed(&self) {
        self.push(HandlerCall::WriteCompleted);
    }

    fn write_failed(&self) {
        self.push(HandlerCall::WriteFailed);
    }

    fn closed(&self) {
        self.push(HandlerCall::Closed);
    }

    fn accept_completed(&self, _channel: Arc<dyn Channel>) {
        self.push(HandlerCall::AcceptCompleted);
    }
}

// =============================================================================
// MockReactor
// =============================================================================

/// A [`Reactor`] that records registrations and lets tests play the reactor
/// thread by firing readiness callbacks.
#[derive(Default)]
pub struct MockReactor {
    registrations: Mutex<Vec<(Arc<dyn ReactorHandler>, Interest)>>,
}

fn same_handler(a: &Arc<dyn ReactorHandler>, b: &Arc<dyn ReactorHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl MockReactor {
    /// Create an empty reactor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The interest currently registered for `handler`.
    pub fn interest_of<H: ReactorHandler>(&self, handler: &Arc<H>) -> Interest {
        let handler: Arc<dyn ReactorHandler> = handler.clone();
        lock_or_recover(&self.registrations)
            .iter()
            .find(|(registered, _)| same_handler(registered, &handler))
            .map(|(_, interest)| *interest)
            .unwrap_or(Interest::NONE)
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.registrations).is_empty()
    }

    /// Poll until `handler` holds at least `interest`. Registration happens
    /// in transition actions, strictly after the state change — waiting on
    /// the state alone is not enough before firing readiness.
    pub async fn wait_for_interest<H: ReactorHandler>(
        &self,
        handler: &Arc<H>,
        interest: Interest,
        timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.interest_of(handler).contains(interest) {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "interest {:?} never registered (currently {:?})",
                    interest,
                    self.interest_of(handler)
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn handlers_with(&self, interest: Interest) -> Vec<Arc<dyn ReactorHandler>> {
        lock_or_recover(&self.registrations)
            .iter()
            .filter(|(_, registered)| registered.contains(interest))
            .map(|(handler, _)| handler.clone())
            .collect()
    }

    /// Deliver read readiness to every handler with READ interest.
    pub fn fire_read(&self) {
        for handler in self.handlers_with(Interest::READ) {
            handler.on_read();
        }
    }

    /// Deliver write readiness to every handler with WRITE interest.
    pub fn fire_write(&self) {
        for handler in self.handlers_with(Interest::WRITE) {
            handler.on_write();
        }
    }

    /// Deliver connect readiness to every handler with CONNECT interest.
    pub fn fire_connect(&self) {
        for handler in self.handlers_with(Interest::CONNECT) {
            handler.on_connect();
        }
    }

    /// Deliver an accepted channel to every handler with ACCEPT interest.
    pub fn fire_accept(&self, channel: Arc<dyn Channel>) {
        for handler in self.handlers_with(Interest::ACCEPT) {
            handler.on_accept(channel.clone());
        }
    }
}

impl Reactor for MockReactor {
    fn register_handler(&self, handler: &Arc<dyn ReactorHandler>, interest: Interest) {
        let mut registrations = lock_or_recover(&self.registrations);
        match registrations
            .iter_mut()
            .find(|(registered, _)| same_handler(registered, handler))
        {
            Some((_, existing)) => *existing |= interest,
            None => registrations.push((handler.clone(), interest)),
        }
    }

    fn deregister_handler(&self, handler: &Arc<dyn ReactorHandler>, interest: Interest) {
        let mut registrations = lock_or_recover(&self.registrations);
        if let Some(position) = registrations
            .iter()
            .position(|(registered, _)| same_handler(registered, handler))
        {
            let remaining = registrations[position].1.remove(interest);
            if remaining.is_empty() {
                registrations.remove(position);
            } else {
                registrations[position].1 = remaining;
            }
        }
    }

    fn remove_handler(&self, handler: &Arc<dyn ReactorHandler>) {
        lock_or_recover(&self.registrations)
            .retain(|(registered, _)| !same_handler(registered, handler));
    }
}

// =============================================================================
// LoopbackChannel
// =============================================================================

#[derive(Default)]
struct LoopbackInner {
    incoming: BytesMut,
    written: BytesMut,
    write_limit: Option<usize>,
    handshake_rounds: u16,
    connect_error: Option<String>,
    connect_pending: bool,
    read_error: Option<String>,
    write_error: Option<String>,
    peer_closed: bool,
    shutdown: bool,
}

/// An in-memory [`Channel`] with scriptable behavior.
///
/// Defaults to the happy path: connects immediately, a one-round handshake,
/// reads whatever was pushed, accepts writes whole.
#[derive(Default)]
pub struct LoopbackChannel {
    inner: Mutex<LoopbackInner>,
}

impl LoopbackChannel {
    /// Create a happy-path channel.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue bytes for the next reads.
    pub fn push_incoming(&self, data: &[u8]) {
        lock_or_recover(&self.inner).incoming.extend_from_slice(data);
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        lock_or_recover(&self.inner).written.to_vec()
    }

    /// Accept at most `n` bytes per write (forces short writes).
    pub fn set_write_limit(&self, n: usize) {
        lock_or_recover(&self.inner).write_limit = Some(n);
    }

    /// Require `rounds` handshake rounds before the session is ready.
    pub fn set_handshake_rounds(&self, rounds: u16) {
        lock_or_recover(&self.inner).handshake_rounds = rounds;
    }

    /// Make `finish_connect` fail with `cause`.
    pub fn fail_connect(&self, cause: &str) {
        lock_or_recover(&self.inner).connect_error = Some(cause.to_string());
    }

    /// Keep `finish_connect` pending until cleared.
    pub fn set_connect_pending(&self, pending: bool) {
        lock_or_recover(&self.inner).connect_pending = pending;
    }

    /// Make reads fail with `cause`.
    pub fn fail_reads(&self, cause: &str) {
        lock_or_recover(&self.inner).read_error = Some(cause.to_string());
    }

    /// Make writes fail with `cause`.
    pub fn fail_writes(&self, cause: &str) {
        lock_or_recover(&self.inner).write_error = Some(cause.to_string());
    }

    /// Simulate the peer closing its end: reads drain, then return 0.
    pub fn close_peer(&self) {
        lock_or_recover(&self.inner).peer_closed = true;
    }

    /// True once `shutdown` was called.
    pub fn is_shutdown(&self) -> bool {
        lock_or_recover(&self.inner).shutdown
    }
}

impl Channel for LoopbackChannel {
    fn read(&self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut inner = lock_or_recover(&self.inner);
        if let Some(cause) = &inner.read_error {
            return Err(io::Error::other(cause.clone()));
        }
        if inner.shutdown {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if inner.incoming.is_empty() {
            return if inner.peer_closed {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }
        let room = buf.capacity().saturating_sub(buf.len());
        let n = inner.incoming.len().min(room.max(1));
        let chunk = inner.incoming.split_to(n);
        buf.extend_from_slice(&chunk);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = lock_or_recover(&self.inner);
        if let Some(cause) = &inner.write_error {
            return Err(io::Error::other(cause.clone()));
        }
        if inner.shutdown {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let n = buf.len().min(inner.write_limit.unwrap_or(usize::MAX));
        inner.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn finish_connect(&self) -> io::Result<bool> {
        let inner = lock_or_recover(&self.inner);
        if let Some(cause) = &inner.connect_error {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, cause.clone()));
        }
        Ok(!inner.connect_pending)
    }

    fn process_handshake(&self) -> io::Result<bool> {
        let mut inner = lock_or_recover(&self.inner);
        if inner.handshake_rounds > 0 {
            inner.handshake_rounds -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn shutdown(&self) {
        lock_or_recover(&self.inner).shutdown = true;
    }
}
