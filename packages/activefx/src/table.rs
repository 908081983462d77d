//! Two-level transition lookup: state id → (event id → transition).

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::core::{EventId, FsmContext, StateId};
use crate::transition::Transition;

/// O(1) lookup table of transition rules.
///
/// Growable, keyed by small dense ids. At most one rule per
/// `(from, event)`: a second registration overwrites the first with a
/// warning — overlapping rules are a configuration smell, not a feature.
pub struct TransitionTable<C: FsmContext> {
    by_state: HashMap<StateId, HashMap<EventId, Transition<C>>>,
    len: usize,
}

impl<C: FsmContext> TransitionTable<C> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            by_state: HashMap::new(),
            len: 0,
        }
    }

    /// Register a rule. Returns `true` if it replaced an existing rule.
    pub fn insert(&mut self, transition: Transition<C>) -> bool {
        let slot = self
            .by_state
            .entry(transition.from())
            .or_default()
            .insert(transition.event(), transition);
        match slot {
            Some(previous) => {
                warn!(
                    from = %previous.from(),
                    event = %previous.event(),
                    old_to = %previous.to(),
                    "duplicate transition registration; previous rule overwritten"
                );
                true
            }
            None => {
                self.len += 1;
                false
            }
        }
    }

    /// Look up the rule for `(state, event)`.
    pub fn lookup(&self, state: StateId, event: EventId) -> Option<&Transition<C>> {
        self.by_state.get(&state)?.get(&event)
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over all registered rules.
    pub fn iter(&self) -> impl Iterator<Item = &Transition<C>> {
        self.by_state.values().flat_map(|m| m.values())
    }
}

impl<C: FsmContext> Default for TransitionTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: FsmContext> fmt::Debug for TransitionTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTable")
            .field("states", &self.by_state.len())
            .field("transitions", &self.len)
            .finish()
    }
}
