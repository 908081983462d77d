//! The connection context: one logical socket connection driven by the
//! lifecycle domain.
//!
//! A connection is created per attempt and discarded after it returns to
//! CLOSED. Three threads touch it:
//!
//! - **client threads** call the public API, which only enqueues events;
//! - the **dispatch task** runs guards/actions and invokes completion
//!   handlers;
//! - the **reactor thread** delivers readiness callbacks, performs the
//!   non-blocking syscall, and enqueues the completion/failure event.
//!
//! The current state needs no lock (only the dispatch task transitions it;
//! an atomic covers the cross-thread reads). The staging area — channel,
//! handlers, pending buffers — is touched by both the dispatch task (guards,
//! actions) and the reactor thread (`on_read`/`on_write`), so it lives under
//! one connection-level mutex. The staged buffer belongs to the connection
//! from guard-staging until the completion callback hands it back.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{FsmContext, FsmEvent, StateId};
use crate::domain::DomainHandle;
use crate::error::ActivefxError;
use crate::handler::ConnectionHandler;
use crate::lifecycle::{ConnEvent, ConnPayload, ConnState, IoSlot};
use crate::reactor::{Interest, Reactor, ReactorHandler};
use crate::transport::Channel;

struct PendingIo {
    buffer: BytesMut,
    handler: Arc<dyn ConnectionHandler>,
}

#[derive(Default)]
struct Staging {
    channel: Option<Arc<dyn Channel>>,
    open_handler: Option<Arc<dyn ConnectionHandler>>,
    pending_read: Option<PendingIo>,
    pending_write: Option<PendingIo>,
    interest: Interest,
    teardown_started: bool,
}

/// One logical connection, bound to a lifecycle domain and a reactor.
pub struct Connection {
    id: Uuid,
    label: String,
    state: AtomicU16,
    domain: DomainHandle<Connection>,
    reactor: Arc<dyn Reactor>,
    me: Weak<Connection>,
    staging: Mutex<Staging>,
}

impl Connection {
    /// Create a connection in the domain's initial state.
    pub fn new(domain: DomainHandle<Connection>, reactor: Arc<dyn Reactor>) -> Arc<Connection> {
        let id = Uuid::new_v4();
        let initial = domain.initial_state();
        Arc::new_cyclic(|me| Connection {
            id,
            label: format!("conn-{}", &id.to_string()[..8]),
            state: AtomicU16::new(initial.0),
            domain,
            reactor,
            me: me.clone(),
            staging: Mutex::new(Staging::default()),
        })
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        ConnState::from_id(self.current_state()).unwrap_or(ConnState::Closed)
    }

    /// True while a read or write is staged.
    pub fn has_staged_io(&self) -> bool {
        let staging = self.staging();
        staging.pending_read.is_some() || staging.pending_write.is_some()
    }

    // =========================================================================
    // Public operations (asynchronous: enqueue and return)
    // =========================================================================

    /// Actively open `channel`: registers connect interest and completes via
    /// `handler.open_completed` / `open_failed`.
    pub fn open(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ActivefxError> {
        self.dispatch(ConnEvent::Open, ConnPayload::Open { channel, handler })
    }

    /// Adopt an already-connected channel (typically just accepted).
    pub fn connect(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ActivefxError> {
        self.dispatch(ConnEvent::Connect, ConnPayload::Open { channel, handler })
    }

    /// Start a read into `buffer`; completion hands the filled buffer to
    /// `handler.read_completed`.
    pub fn read(
        self: &Arc<Self>,
        buffer: BytesMut,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ActivefxError> {
        self.dispatch(
            ConnEvent::Read,
            ConnPayload::Io {
                slot: IoSlot::new(buffer),
                handler,
            },
        )
    }

    /// Start writing `buffer`; `handler.write_completed` fires once it is
    /// fully flushed.
    pub fn write(
        self: &Arc<Self>,
        buffer: BytesMut,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ActivefxError> {
        self.dispatch(
            ConnEvent::Write,
            ConnPayload::Io {
                slot: IoSlot::new(buffer),
                handler,
            },
        )
    }

    /// Close the connection. The only way to abort pending I/O: a close
    /// while reads/writes are in flight routes through their failure
    /// callbacks first.
    pub fn close(self: &Arc<Self>) -> Result<(), ActivefxError> {
        self.dispatch(ConnEvent::Close, ConnPayload::None)
    }

    fn dispatch(
        self: &Arc<Self>,
        event: ConnEvent,
        payload: ConnPayload,
    ) -> Result<(), ActivefxError> {
        self.domain
            .dispatch(FsmEvent::new(self.clone(), event.id(), payload))
    }

    // =========================================================================
    // Guards (dispatch task)
    // =========================================================================

    /// Validate and stage a read request. The staged buffer must have room
    /// to read into.
    pub(crate) fn read_guard(&self, event: &FsmEvent<Connection>) -> bool {
        let ConnPayload::Io { slot, handler } = event.payload() else {
            warn!(conn = %self.label, "read request without an I/O payload rejected");
            return false;
        };
        let Some(buffer) = slot.take_if(|b| b.capacity() > 0) else {
            return false;
        };
        self.staging().pending_read = Some(PendingIo {
            buffer,
            handler: handler.clone(),
        });
        true
    }

    /// Validate and stage a write request. The staged buffer must carry
    /// bytes to send.
    pub(crate) fn write_guard(&self, event: &FsmEvent<Connection>) -> bool {
        let ConnPayload::Io { slot, handler } = event.payload() else {
            warn!(conn = %self.label, "write request without an I/O payload rejected");
            return false;
        };
        let Some(buffer) = slot.take_if(|b| !b.is_empty()) else {
            return false;
        };
        self.staging().pending_write = Some(PendingIo {
            buffer,
            handler: handler.clone(),
        });
        true
    }

    // =========================================================================
    // Actions (dispatch task)
    // =========================================================================

    pub(crate) fn initiate_open(&self, event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let ConnPayload::Open { channel, handler } = event.payload() else {
            anyhow::bail!("open without a channel payload");
        };
        {
            let mut staging = self.staging();
            staging.channel = Some(channel.clone());
            staging.open_handler = Some(handler.clone());
        }
        self.register_interest(Interest::CONNECT);
        Ok(())
    }

    pub(crate) fn initiate_connect(&self, event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let ConnPayload::Open { channel, handler } = event.payload() else {
            anyhow::bail!("connect without a channel payload");
        };
        {
            let mut staging = self.staging();
            staging.channel = Some(channel.clone());
            staging.open_handler = Some(handler.clone());
        }
        // Already connected: no reactor interest needed before the first
        // read/write. Completion goes through the queue like any other.
        self.enqueue(ConnEvent::OpenComplete, ConnPayload::None);
        Ok(())
    }

    pub(crate) fn handle_handshake(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let Some(channel) = self.staging().channel.clone() else {
            anyhow::bail!("handshake without a staged channel");
        };
        match channel.process_handshake() {
            Ok(true) => self.enqueue(ConnEvent::OpenComplete, ConnPayload::None),
            Ok(false) => self.register_interest(Interest::CONNECT),
            Err(err) => self.enqueue(
                ConnEvent::OpenFailure,
                ConnPayload::Failure {
                    cause: err.to_string(),
                },
            ),
        }
        Ok(())
    }

    pub(crate) fn abort_handshake(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        self.deregister_interest(Interest::CONNECT);
        Ok(())
    }

    pub(crate) fn open_complete(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        if let Some(handler) = self.staging().open_handler.clone() {
            handler.open_completed();
        }
        Ok(())
    }

    pub(crate) fn open_failed(&self, event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let cause = match event.payload() {
            ConnPayload::Failure { cause } => cause.as_str(),
            _ => "open failed",
        };
        warn!(conn = %self.label, cause, "open failed");
        if let Some(handler) = self.staging().open_handler.clone() {
            handler.open_failed(cause);
        }
        Ok(())
    }

    pub(crate) fn initiate_read(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        self.register_interest(Interest::READ);
        Ok(())
    }

    pub(crate) fn initiate_write(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        self.register_interest(Interest::WRITE);
        Ok(())
    }

    pub(crate) fn read_complete(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let pending = self.staging().pending_read.take();
        self.deregister_interest(Interest::READ);
        match pending {
            Some(PendingIo { buffer, handler }) => handler.read_completed(buffer),
            None => debug!(conn = %self.label, "read completion without a staged read"),
        }
        Ok(())
    }

    pub(crate) fn write_complete(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let pending = self.staging().pending_write.take();
        self.deregister_interest(Interest::WRITE);
        match pending {
            Some(PendingIo { handler, .. }) => handler.write_completed(),
            None => debug!(conn = %self.label, "write completion without a staged write"),
        }
        Ok(())
    }

    pub(crate) fn read_failed(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let pending = self.staging().pending_read.take();
        self.deregister_interest(Interest::READ);
        if let Some(PendingIo { handler, .. }) = pending {
            handler.read_failed();
        }
        Ok(())
    }

    pub(crate) fn write_failed(&self, _event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        let pending = self.staging().pending_write.take();
        self.deregister_interest(Interest::WRITE);
        if let Some(PendingIo { handler, .. }) = pending {
            handler.write_failed();
        }
        Ok(())
    }

    pub(crate) fn read_write_failed(&self, event: &FsmEvent<Connection>) -> anyhow::Result<()> {
        self.read_failed(event)?;
        self.write_failed(event)?;
        Ok(())
    }

    /// CLOSING entry: deregister everything, shut the channel down, and
    /// signal teardown completion through the queue. Idempotent so the
    /// CLOSING self-loop on a redundant `close()` stays a no-op.
    pub(crate) fn begin_teardown(&self) {
        let channel = {
            let mut staging = self.staging();
            if staging.teardown_started {
                return;
            }
            staging.teardown_started = true;
            staging.channel.clone()
        };

        self.remove_from_reactor();
        if let Some(channel) = channel {
            channel.shutdown();
        }
        self.enqueue(ConnEvent::CloseComplete, ConnPayload::None);
    }

    /// CLOSED entry: drop whatever is left and notify `closed()` if a
    /// handler was ever attached. A CLOSED self-loop on a never-opened
    /// connection finds nothing to do.
    pub(crate) fn finalize_close(&self) {
        let (handler, read, write) = {
            let mut staging = self.staging();
            let handler = staging.open_handler.take();
            let read = staging.pending_read.take();
            let write = staging.pending_write.take();
            staging.channel = None;
            staging.interest = Interest::NONE;
            staging.teardown_started = false;
            (handler, read, write)
        };
        if let Some(PendingIo { handler, .. }) = read {
            handler.read_failed();
        }
        if let Some(PendingIo { handler, .. }) = write {
            handler.write_failed();
        }
        if let Some(handler) = handler {
            handler.closed();
        }
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn staging(&self) -> MutexGuard<'_, Staging> {
        match self.staging.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn as_handler(&self) -> Option<Arc<dyn ReactorHandler>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn ReactorHandler>)
    }

    fn register_interest(&self, ops: Interest) {
        if let Some(handler) = self.as_handler() {
            self.reactor.register_handler(&handler, ops);
            self.staging().interest |= ops;
        }
    }

    fn deregister_interest(&self, ops: Interest) {
        if let Some(handler) = self.as_handler() {
            self.reactor.deregister_handler(&handler, ops);
            let mut staging = self.staging();
            staging.interest = staging.interest.remove(ops);
        }
    }

    fn remove_from_reactor(&self) {
        if let Some(handler) = self.as_handler() {
            self.reactor.remove_handler(&handler);
            self.staging().interest = Interest::NONE;
        }
    }

    /// Enqueue an internally-raised event. Delivery is best-effort: a
    /// saturated or stopped domain drops it with a warning.
    fn enqueue(&self, event: ConnEvent, payload: ConnPayload) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if let Err(err) = self.domain.dispatch(FsmEvent::new(me, event.id(), payload)) {
            warn!(conn = %self.label, event = ?event, error = %err, "internal event dropped");
        }
    }
}

impl FsmContext for Connection {
    type Payload = ConnPayload;

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
// Reactor callbacks (reactor thread)
// =============================================================================

impl ReactorHandler for Connection {
    fn on_read(&self) {
        let outcome = {
            let mut staging = self.staging();
            let Some(channel) = staging.channel.clone() else {
                return;
            };
            let Some(pending) = staging.pending_read.as_mut() else {
                // Spurious readiness after a completed/aborted read.
                return;
            };
            match channel.read(&mut pending.buffer) {
                Ok(0) => Some((
                    ConnEvent::ReadFailure,
                    ConnPayload::Failure {
                        cause: "closed by peer".to_string(),
                    },
                )),
                Ok(n) => {
                    debug!(conn = %self.label, bytes = n, "read ready");
                    Some((ConnEvent::ReadComplete, ConnPayload::None))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                Err(err) => Some((
                    ConnEvent::ReadFailure,
                    ConnPayload::Failure {
                        cause: err.to_string(),
                    },
                )),
            }
        };
        if let Some((event, payload)) = outcome {
            self.enqueue(event, payload);
        }
    }

    fn on_write(&self) {
        let outcome = {
            let mut staging = self.staging();
            let Some(channel) = staging.channel.clone() else {
                return;
            };
            let Some(pending) = staging.pending_write.as_mut() else {
                return;
            };
            match channel.write(&pending.buffer) {
                Ok(n) => {
                    pending.buffer.advance(n);
                    if pending.buffer.is_empty() {
                        Some((ConnEvent::WriteComplete, ConnPayload::None))
                    } else {
                        // Short write: keep WRITE interest, wait for the
                        // next readiness.
                        debug!(conn = %self.label, remaining = pending.buffer.len(), "short write");
                        None
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                Err(err) => Some((
                    ConnEvent::WriteFailure,
                    ConnPayload::Failure {
                        cause: err.to_string(),
                    },
                )),
            }
        };
        if let Some((event, payload)) = outcome {
            self.enqueue(event, payload);
        }
    }

    fn on_connect(&self) {
        let Some(channel) = self.staging().channel.clone() else {
            return;
        };
        match channel.finish_connect() {
            Ok(true) => {
                self.deregister_interest(Interest::CONNECT);
                self.enqueue(ConnEvent::Handshake, ConnPayload::None);
            }
            Ok(false) => {}
            Err(err) => self.enqueue(
                ConnEvent::OpenFailure,
                ConnPayload::Failure {
                    cause: err.to_string(),
                },
            ),
        }
    }

    fn on_accept(&self, channel: Arc<dyn Channel>) {
        if let Some(handler) = self.staging().open_handler.clone() {
            handler.accept_completed(channel);
        }
    }

    fn on_disconnect(&self) {
        self.enqueue(ConnEvent::Close, ConnPayload::None);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Connection {
    /// Poll until the connection reaches `target` or `timeout` elapses.
    pub async fn wait_for_state(&self, target: ConnState, timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state() == target {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "connection did not reach {:?} (currently {:?})",
                    target,
                    self.state()
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
