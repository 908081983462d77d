//! Core ids, the context trait, and the event envelope.
//!
//! # Overview
//!
//! The engine separates **where** (a context owning a current state),
//! **what happened** (an event targeting that context), and **how to react**
//! (a transition table owned by the domain). Contexts are shared handles:
//! the dispatch task reads and writes their state, client threads create
//! events against them.

use std::fmt;
use std::sync::Arc;

/// Identifier of a state within one domain. Small and dense by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u16);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Identifier of an event trigger within one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u16);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// An entity participating in exactly one domain's transitions.
///
/// The domain's single dispatch task serializes all transitions for a given
/// context, so `current_state` never changes concurrently with a transition
/// in flight. Interior mutability (an atomic is enough) keeps the accessors
/// `&self`.
///
/// `Payload` is the data events carry for this context type: buffers and
/// completion handlers for connections, `()` for plain test contexts.
pub trait FsmContext: Send + Sync + 'static {
    /// Event payload type for this context.
    type Payload: Send + Sync + 'static;

    /// The context's current state.
    fn current_state(&self) -> StateId;

    /// Replace the context's current state. Called by the engine during a
    /// transition; not intended for direct use.
    fn set_current_state(&self, state: StateId);

    /// Short label for log lines.
    fn label(&self) -> &str;
}

/// An event: a trigger raised against one context, with a payload.
///
/// Events are created per request and never reused. They are moved through
/// the domain queue and dropped after the transition executes.
pub struct FsmEvent<C: FsmContext> {
    target: Arc<C>,
    id: EventId,
    payload: C::Payload,
}

impl<C: FsmContext> FsmEvent<C> {
    /// Create an event targeting `target`.
    pub fn new(target: Arc<C>, id: EventId, payload: C::Payload) -> Self {
        Self {
            target,
            id,
            payload,
        }
    }

    /// The context this event is aimed at.
    pub fn target(&self) -> &Arc<C> {
        &self.target
    }

    /// The trigger id.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// The payload carried by this event.
    pub fn payload(&self) -> &C::Payload {
        &self.payload
    }
}

impl<C: FsmContext> fmt::Debug for FsmEvent<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsmEvent")
            .field("id", &self.id)
            .field("target", &self.target.label())
            .finish_non_exhaustive()
    }
}
