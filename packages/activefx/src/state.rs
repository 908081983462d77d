//! States with optional entry/exit hooks.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::core::{FsmContext, FsmEvent, StateId};

/// Callback invoked when a transition enters or leaves a state.
///
/// Hooks run on the domain's dispatch task and must not block. Returning an
/// error stops the remaining steps of the in-flight transition; the error is
/// logged at the dispatch boundary.
pub type StateHook<C> = Arc<dyn Fn(&C, &FsmEvent<C>) -> Result<()> + Send + Sync>;

/// A stable state: an id, a display name, and optional entry/exit hooks.
pub struct State<C: FsmContext> {
    id: StateId,
    name: &'static str,
    entry: Option<StateHook<C>>,
    exit: Option<StateHook<C>>,
}

impl<C: FsmContext> State<C> {
    /// Create a state with no hooks.
    pub fn new(id: StateId, name: &'static str) -> Self {
        Self {
            id,
            name,
            entry: None,
            exit: None,
        }
    }

    /// Attach an entry hook, invoked after a transition sets this state.
    pub fn on_entry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C, &FsmEvent<C>) -> Result<()> + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(hook));
        self
    }

    /// Attach an exit hook, invoked before a transition leaves this state.
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C, &FsmEvent<C>) -> Result<()> + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(hook));
        self
    }

    /// The state's id.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// The state's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the entry hook, if any.
    pub(crate) fn enter(&self, ctx: &C, event: &FsmEvent<C>) -> Result<()> {
        match &self.entry {
            Some(hook) => hook(ctx, event),
            None => Ok(()),
        }
    }

    /// Run the exit hook, if any.
    pub(crate) fn leave(&self, ctx: &C, event: &FsmEvent<C>) -> Result<()> {
        match &self.exit {
            Some(hook) => hook(ctx, event),
            None => Ok(()),
        }
    }
}

// Manual Debug: hooks are opaque closures.
impl<C: FsmContext> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_entry", &self.entry.is_some())
            .field("has_exit", &self.exit.is_some())
            .finish()
    }
}
