//! Transitions: one `(from, event)` rule with a fixed execution algorithm.
//!
//! # Execution order
//!
//! 1. Evaluate the guard. No guard means pass. A failing guard logs, leaves
//!    the context untouched, and nothing else runs.
//! 2. Run the `from` state's exit hook.
//! 3. Set the context's current state to `to`.
//! 4. Run the transition action, if any.
//! 5. Run the `to` state's entry hook.
//!
//! Each step runs at most once, in that order. The domain's single dispatch
//! task guarantees transitions on one context never interleave.
//!
//! A hook or action that returns `Err` stops the remaining steps; the error
//! is logged and the outcome is [`TransitionOutcome::Faulted`]. If the state
//! was already set by step 3, it stays set — the transition is partially
//! applied. Callers that need stronger guarantees must keep their actions
//! infallible.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error};

use crate::core::{EventId, FsmContext, FsmEvent, StateId};
use crate::state::State;

/// Predicate evaluated before a transition executes.
///
/// Guards may stage data from the event into the context as a side effect;
/// a failing guard must leave the context untouched.
pub type Guard<C> = Arc<dyn Fn(&C, &FsmEvent<C>) -> bool + Send + Sync>;

/// Callback run between the exit and entry hooks of a transition.
pub type Action<C> = Arc<dyn Fn(&C, &FsmEvent<C>) -> Result<()> + Send + Sync>;

/// What happened when a transition (or an event lookup) was driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Guard passed (or absent) and all steps ran.
    Executed,
    /// The guard returned false; state unchanged, nothing invoked.
    GuardRejected,
    /// No transition matched `(current_state, event)`; state unchanged.
    NotMatched,
    /// A hook or action failed or panicked; the transition may be partially
    /// applied.
    Faulted,
}

/// One `(from, event) → to` rule with optional guard and action.
pub struct Transition<C: FsmContext> {
    from: StateId,
    event: EventId,
    to: StateId,
    guard: Option<Guard<C>>,
    action: Option<Action<C>>,
}

impl<C: FsmContext> Transition<C> {
    /// Create a transition rule.
    pub fn new(
        event: EventId,
        from: StateId,
        to: StateId,
        guard: Option<Guard<C>>,
        action: Option<Action<C>>,
    ) -> Self {
        Self {
            from,
            event,
            to,
            guard,
            action,
        }
    }

    /// The source state.
    pub fn from(&self) -> StateId {
        self.from
    }

    /// The trigger this rule matches.
    pub fn event(&self) -> EventId {
        self.event
    }

    /// The target state.
    pub fn to(&self) -> StateId {
        self.to
    }

    /// Drive the transition for `event`.
    ///
    /// `from_state` and `to_state` must be the registered states for
    /// `self.from()` / `self.to()`; the domain resolves them before calling.
    pub(crate) fn execute(
        &self,
        from_state: &State<C>,
        to_state: &State<C>,
        event: &FsmEvent<C>,
    ) -> TransitionOutcome {
        let ctx = event.target();

        if let Some(guard) = &self.guard {
            if !guard(ctx, event) {
                debug!(
                    event = %self.event,
                    from = from_state.name(),
                    target = ctx.label(),
                    "guard rejected transition"
                );
                return TransitionOutcome::GuardRejected;
            }
        }

        if let Err(err) = from_state.leave(ctx, event) {
            error!(
                event = %self.event,
                state = from_state.name(),
                target = ctx.label(),
                error = %err,
                "exit hook failed; transition abandoned"
            );
            return TransitionOutcome::Faulted;
        }

        ctx.set_current_state(self.to);

        if let Some(action) = &self.action {
            if let Err(err) = action(ctx, event) {
                error!(
                    event = %self.event,
                    from = from_state.name(),
                    to = to_state.name(),
                    target = ctx.label(),
                    error = %err,
                    "transition action failed; entry hook skipped"
                );
                return TransitionOutcome::Faulted;
            }
        }

        if let Err(err) = to_state.enter(ctx, event) {
            error!(
                event = %self.event,
                state = to_state.name(),
                target = ctx.label(),
                error = %err,
                "entry hook failed"
            );
            return TransitionOutcome::Faulted;
        }

        TransitionOutcome::Executed
    }
}

impl<C: FsmContext> fmt::Debug for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("event", &self.event)
            .field("to", &self.to)
            .field("has_guard", &self.guard.is_some())
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;
    use std::sync::Arc;

    const FROM: StateId = StateId(0);
    const TO: StateId = StateId(1);
    const EV: EventId = EventId(0);

    fn states() -> (State<TestContext>, State<TestContext>) {
        let from = State::new(FROM, "FROM").on_exit(|ctx: &TestContext, _| {
            ctx.record("exit:FROM");
            Ok(())
        });
        let to = State::new(TO, "TO").on_entry(|ctx: &TestContext, _| {
            ctx.record("entry:TO");
            Ok(())
        });
        (from, to)
    }

    #[test]
    fn test_execute_runs_exit_action_entry_in_order() {
        let (from, to) = states();
        let transition = Transition::new(
            EV,
            FROM,
            TO,
            None,
            Some(Arc::new(|ctx: &TestContext, _: &FsmEvent<TestContext>| {
                ctx.record("action");
                Ok(())
            }) as Action<TestContext>),
        );

        let ctx = TestContext::new("c", FROM);
        let event = FsmEvent::new(ctx.clone(), EV, ());

        let outcome = transition.execute(&from, &to, &event);

        assert_eq!(outcome, TransitionOutcome::Executed);
        assert_eq!(ctx.current_state(), TO);
        assert_eq!(ctx.trace(), vec!["exit:FROM", "action", "entry:TO"]);
    }

    #[test]
    fn test_guard_rejection_leaves_everything_untouched() {
        let (from, to) = states();
        let transition = Transition::new(
            EV,
            FROM,
            TO,
            Some(Arc::new(|_: &TestContext, _: &FsmEvent<TestContext>| false) as Guard<TestContext>),
            Some(Arc::new(|ctx: &TestContext, _: &FsmEvent<TestContext>| {
                ctx.record("action");
                Ok(())
            }) as Action<TestContext>),
        );

        let ctx = TestContext::new("c", FROM);
        let event = FsmEvent::new(ctx.clone(), EV, ());

        let outcome = transition.execute(&from, &to, &event);

        assert_eq!(outcome, TransitionOutcome::GuardRejected);
        assert_eq!(ctx.current_state(), FROM);
        assert!(ctx.trace().is_empty());
    }

    #[test]
    fn test_missing_guard_passes() {
        let (from, to) = states();
        let transition = Transition::new(EV, FROM, TO, None, None);

        let ctx = TestContext::new("c", FROM);
        let event = FsmEvent::new(ctx.clone(), EV, ());

        assert_eq!(
            transition.execute(&from, &to, &event),
            TransitionOutcome::Executed
        );
        assert_eq!(ctx.current_state(), TO);
    }

    #[test]
    fn test_failing_exit_hook_abandons_transition() {
        let from: State<TestContext> =
            State::new(FROM, "FROM").on_exit(|_, _| Err(anyhow::anyhow!("exit refused")));
        let (_, to) = states();
        let transition = Transition::new(
            EV,
            FROM,
            TO,
            None,
            Some(Arc::new(|ctx: &TestContext, _: &FsmEvent<TestContext>| {
                ctx.record("action");
                Ok(())
            }) as Action<TestContext>),
        );

        let ctx = TestContext::new("c", FROM);
        let event = FsmEvent::new(ctx.clone(), EV, ());

        let outcome = transition.execute(&from, &to, &event);

        // Exit failed before the state change: nothing applied.
        assert_eq!(outcome, TransitionOutcome::Faulted);
        assert_eq!(ctx.current_state(), FROM);
        assert!(ctx.trace().is_empty());
    }

    #[test]
    fn test_failing_action_keeps_new_state_and_skips_entry() {
        let (from, to) = states();
        let transition = Transition::new(
            EV,
            FROM,
            TO,
            None,
            Some(Arc::new(|_: &TestContext, _: &FsmEvent<TestContext>| {
                Err(anyhow::anyhow!("action failed"))
            }) as Action<TestContext>),
        );

        let ctx = TestContext::new("c", FROM);
        let event = FsmEvent::new(ctx.clone(), EV, ());

        let outcome = transition.execute(&from, &to, &event);

        // The state change already happened; the transition stays partially
        // applied and the entry hook is skipped.
        assert_eq!(outcome, TransitionOutcome::Faulted);
        assert_eq!(ctx.current_state(), TO);
        assert_eq!(ctx.trace(), vec!["exit:FROM"]);
    }

    #[test]
    fn test_self_loop_runs_exit_and_entry() {
        let state: State<TestContext> = State::new(FROM, "LOOP")
            .on_entry(|ctx: &TestContext, _| {
                ctx.record("entry:LOOP");
                Ok(())
            })
            .on_exit(|ctx: &TestContext, _| {
                ctx.record("exit:LOOP");
                Ok(())
            });
        let transition = Transition::new(EV, FROM, FROM, None, None);

        let ctx = TestContext::new("c", FROM);
        let event = FsmEvent::new(ctx.clone(), EV, ());

        assert_eq!(
            transition.execute(&state, &state, &event),
            TransitionOutcome::Executed
        );
        assert_eq!(ctx.current_state(), FROM);
        assert_eq!(ctx.trace(), vec!["exit:LOOP", "entry:LOOP"]);
    }
}
