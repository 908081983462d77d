//! The non-blocking channel a connection drives.
//!
//! A `Channel` is the socket handle the external reactor multiplexes. All
//! operations follow non-blocking semantics: they either make partial
//! progress, return `WouldBlock`, or fail. The connection layer never loops
//! on a channel — the reactor says when to try again.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;

/// Non-blocking socket operations, shared across the dispatch task and the
/// reactor thread (implementations use interior mutability).
pub trait Channel: Send + Sync + 'static {
    /// Read available bytes into `buf`.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed the
    /// stream. `WouldBlock` means nothing is available yet.
    fn read(&self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write as many of `buf`'s bytes as the socket accepts.
    ///
    /// Returns the number of bytes taken; short writes are normal.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Finish an in-progress outbound connect.
    ///
    /// `Ok(true)` when the connection is established, `Ok(false)` when still
    /// pending (keep CONNECT interest registered).
    fn finish_connect(&self) -> io::Result<bool>;

    /// Drive one step of the post-connect handshake, if the transport has
    /// one. `Ok(true)` when the session is ready for traffic, `Ok(false)`
    /// when more rounds are needed. Plain TCP returns `Ok(true)`.
    fn process_handshake(&self) -> io::Result<bool>;

    /// Tear the channel down. Idempotent; further operations fail.
    fn shutdown(&self);
}

/// Convenience alias for the shared trait object.
pub type SharedChannel = Arc<dyn Channel>;
