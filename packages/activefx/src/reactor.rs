//! Reactor interface: readiness registration and callbacks.
//!
//! The reactor (a selector/epoll loop) is an external collaborator. This
//! crate only consumes it: actions register *interest* in readiness, and the
//! reactor later invokes the handler's callbacks on its own thread when the
//! underlying channel can make progress. Callbacks perform the non-blocking
//! call and feed the resulting completion/failure event back into the
//! owning domain's queue — a single request therefore spans the dispatch
//! task and the reactor thread.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::transport::Channel;

/// Readiness operations a handler can subscribe to.
///
/// A small bitset; combine with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No operations.
    pub const NONE: Interest = Interest(0);
    /// Channel readable.
    pub const READ: Interest = Interest(1 << 0);
    /// Channel writable.
    pub const WRITE: Interest = Interest(1 << 1);
    /// Outbound connect finishing.
    pub const CONNECT: Interest = Interest(1 << 2);
    /// Inbound connections pending.
    pub const ACCEPT: Interest = Interest(1 << 3);

    /// True if every op in `other` is present in `self`.
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// `self` without the ops in `other`.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// True if no ops are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for Interest {
    fn default() -> Self {
        Interest::NONE
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Interest::READ) {
            parts.push("READ");
        }
        if self.contains(Interest::WRITE) {
            parts.push("WRITE");
        }
        if self.contains(Interest::CONNECT) {
            parts.push("CONNECT");
        }
        if self.contains(Interest::ACCEPT) {
            parts.push("ACCEPT");
        }
        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// Callbacks the reactor delivers on its own thread.
///
/// Implementations must be non-blocking: do the non-blocking call, enqueue
/// the outcome, return.
pub trait ReactorHandler: Send + Sync + 'static {
    /// The channel has readable data.
    fn on_read(&self);

    /// The channel can accept writes.
    fn on_write(&self);

    /// An outbound connect is ready to finish.
    fn on_connect(&self);

    /// An inbound connection was accepted.
    fn on_accept(&self, channel: Arc<dyn Channel>);

    /// The peer disconnected.
    fn on_disconnect(&self);
}

/// Registration surface of the external reactor.
///
/// Handler identity is pointer identity: implementations match handlers with
/// `Arc::ptr_eq`. Registering ops for an already-registered handler extends
/// its interest set; deregistering shrinks it.
pub trait Reactor: Send + Sync + 'static {
    /// Add `interest` for `handler`.
    fn register_handler(&self, handler: &Arc<dyn ReactorHandler>, interest: Interest);

    /// Remove `interest` for `handler`, keeping any other ops.
    fn deregister_handler(&self, handler: &Arc<dyn ReactorHandler>, interest: Interest);

    /// Drop the handler entirely, regardless of remaining interest.
    fn remove_handler(&self, handler: &Arc<dyn ReactorHandler>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bit_ops() {
        let rw = Interest::READ | Interest::WRITE;
        assert!(rw.contains(Interest::READ));
        assert!(rw.contains(Interest::WRITE));
        assert!(!rw.contains(Interest::CONNECT));

        let r = rw.remove(Interest::WRITE);
        assert!(r.contains(Interest::READ));
        assert!(!r.contains(Interest::WRITE));

        assert!(Interest::NONE.is_empty());
        assert!(!r.is_empty());
    }

    #[test]
    fn test_interest_debug_lists_flags() {
        let debug = format!("{:?}", Interest::READ | Interest::CONNECT);
        assert_eq!(debug, "READ|CONNECT");
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
    }
}
