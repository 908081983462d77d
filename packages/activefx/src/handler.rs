//! Client-facing completion callbacks.

use std::sync::Arc;

use bytes::BytesMut;

use crate::transport::Channel;

/// Callbacks a client supplies when opening a connection or requesting I/O.
///
/// All methods are invoked from the domain's dispatch task during the
/// matching completion/failure transition and must be non-blocking: hand the
/// result off and return. Blocking here stalls every connection on the
/// domain (and trips the watchdog, if one is wired).
///
/// A failed read/write does **not** close the connection; after `read_failed`
/// or `write_failed` the client decides whether to retry or call `close()`.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The connection finished opening and is ready for I/O.
    fn open_completed(&self);

    /// Opening failed. `cause` is a short human-readable reason.
    fn open_failed(&self, cause: &str);

    /// A read finished; `buffer` holds the received bytes.
    fn read_completed(&self, buffer: BytesMut);

    /// The pending read failed or was aborted by `close()`.
    fn read_failed(&self);

    /// The pending write was fully flushed.
    fn write_completed(&self);

    /// The pending write failed or was aborted by `close()`.
    fn write_failed(&self);

    /// The connection finished closing; the context is dead after this.
    fn closed(&self);

    /// An inbound connection was accepted on a listening channel. Only
    /// meaningful for acceptor connections, hence the default no-op.
    fn accept_completed(&self, channel: Arc<dyn Channel>) {
        let _ = channel;
    }
}
