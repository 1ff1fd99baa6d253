//! Named-state dispatcher shared by every nested flow in the runtime.
//!
//! A machine maps state names to plain functions over an explicit context
//! object. Each function returns the next [`Step`]. Machines nest: a state
//! function may build and run another machine over a sub-context before
//! returning.
//!
//! ```
//! use operant::machine::{Outcome, StateMachine, Step};
//! use operant::error::Error;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum S { Start, Next }
//!
//! fn start(log: &mut Vec<&'static str>) -> Result<Step<S>, Error> {
//!     log.push("start");
//!     Ok(Step::Goto(S::Next))
//! }
//! fn next(log: &mut Vec<&'static str>) -> Result<Step<S>, Error> {
//!     log.push("next");
//!     Ok(Step::Done)
//! }
//!
//! let mut log = Vec::new();
//! let outcome = StateMachine::new(S::Start)
//!     .state(S::Start, start)
//!     .state(S::Next, next)
//!     .run(&mut log)
//!     .unwrap();
//! assert_eq!(outcome, Outcome::Completed);
//! assert_eq!(log, ["start", "next"]);
//! ```

use std::fmt::Debug;
use std::hash::Hash;

use hashbrown::HashMap;
use tracing::debug;

use crate::error::UsageError;

/// Deliberate non-local exits. These travel as values, never as faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// End the current session; the life-cycle runtime continues with Idle.
    EndSession,
    /// Stop the whole runtime after running the end-of-experiment hook.
    EndExperiment,
}

/// What a state function asks the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<S> {
    Goto(S),
    /// Terminal sentinel: the machine completes normally.
    Done,
    /// Leave the machine immediately, handing the signal to the caller.
    Exit(Signal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Signalled(Signal),
}

pub type StateFn<S, C, E> = fn(&mut C) -> Result<Step<S>, E>;

/// Receives ownership of a fault. `Ok(())` moves the machine to its error
/// state; `Err(fault)` re-raises.
pub type ErrorFn<C, E> = fn(&mut C, E) -> Result<(), E>;

pub struct StateMachine<S, C, E> {
    start: S,
    states: HashMap<S, StateFn<S, C, E>>,
    on_error: Option<(S, ErrorFn<C, E>)>,
}

impl<S, C, E> StateMachine<S, C, E>
where
    S: Copy + Eq + Hash + Debug,
    E: From<UsageError>,
{
    pub fn new(start: S) -> Self {
        Self {
            start,
            states: HashMap::new(),
            on_error: None,
        }
    }

    pub fn state(mut self, name: S, f: StateFn<S, C, E>) -> Self {
        self.states.insert(name, f);
        self
    }

    /// Route faults through `callback`, then continue in `error_state`.
    pub fn on_error(mut self, error_state: S, callback: ErrorFn<C, E>) -> Self {
        self.on_error = Some((error_state, callback));
        self
    }

    pub fn run(&self, ctx: &mut C) -> Result<Outcome, E> {
        let mut current = self.start;
        loop {
            let f = self
                .states
                .get(&current)
                .ok_or_else(|| UsageError::UnknownState(format!("{current:?}")))?;

            match f(ctx) {
                Ok(Step::Goto(next)) => {
                    debug!(from = ?current, to = ?next, "state transition");
                    current = next;
                }
                Ok(Step::Done) => return Ok(Outcome::Completed),
                Ok(Step::Exit(signal)) => return Ok(Outcome::Signalled(signal)),
                Err(fault) => match self.on_error {
                    // A failing error state must not loop on itself.
                    Some((error_state, _)) if error_state == current => return Err(fault),
                    Some((error_state, callback)) => {
                        callback(ctx, fault)?;
                        current = error_state;
                    }
                    None => return Err(fault),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, InterfaceError};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        A,
        B,
        Fail,
        Recover,
        Nested,
        Missing,
    }

    #[derive(Default)]
    struct Ctx {
        visited: Vec<Phase>,
        faults: usize,
        rethrow: bool,
    }

    fn a(c: &mut Ctx) -> Result<Step<Phase>, Error> {
        c.visited.push(Phase::A);
        Ok(Step::Goto(Phase::B))
    }

    fn b(c: &mut Ctx) -> Result<Step<Phase>, Error> {
        c.visited.push(Phase::B);
        Ok(Step::Done)
    }

    fn fail(c: &mut Ctx) -> Result<Step<Phase>, Error> {
        c.visited.push(Phase::Fail);
        Err(InterfaceError::communication("test", "boom").into())
    }

    fn recover(c: &mut Ctx) -> Result<Step<Phase>, Error> {
        c.visited.push(Phase::Recover);
        Ok(Step::Exit(Signal::EndSession))
    }

    fn count_fault(c: &mut Ctx, e: Error) -> Result<(), Error> {
        c.faults += 1;
        if c.rethrow {
            Err(e)
        } else {
            Ok(())
        }
    }

    fn nested(c: &mut Ctx) -> Result<Step<Phase>, Error> {
        c.visited.push(Phase::Nested);
        let inner = StateMachine::new(Phase::A).state(Phase::A, a).state(Phase::B, b);
        inner.run(c)?;
        Ok(Step::Done)
    }

    #[test]
    fn runs_until_terminal_sentinel() {
        let mut ctx = Ctx::default();
        let m = StateMachine::new(Phase::A).state(Phase::A, a).state(Phase::B, b);
        assert_eq!(m.run(&mut ctx).unwrap(), Outcome::Completed);
        assert_eq!(ctx.visited, vec![Phase::A, Phase::B]);
    }

    #[test]
    fn fault_without_callback_is_reraised() {
        let mut ctx = Ctx::default();
        let m = StateMachine::new(Phase::Fail).state(Phase::Fail, fail);
        assert!(matches!(m.run(&mut ctx), Err(Error::Interface(_))));
    }

    #[test]
    fn callback_moves_to_error_state() {
        let mut ctx = Ctx::default();
        let m = StateMachine::new(Phase::Fail)
            .state(Phase::Fail, fail)
            .state(Phase::Recover, recover)
            .on_error(Phase::Recover, count_fault);
        assert_eq!(
            m.run(&mut ctx).unwrap(),
            Outcome::Signalled(Signal::EndSession)
        );
        assert_eq!(ctx.faults, 1);
        assert_eq!(ctx.visited, vec![Phase::Fail, Phase::Recover]);
    }

    #[test]
    fn callback_may_reraise() {
        let mut ctx = Ctx {
            rethrow: true,
            ..Ctx::default()
        };
        let m = StateMachine::new(Phase::Fail)
            .state(Phase::Fail, fail)
            .state(Phase::Recover, recover)
            .on_error(Phase::Recover, count_fault);
        assert!(m.run(&mut ctx).is_err());
        assert_eq!(ctx.visited, vec![Phase::Fail]);
    }

    #[test]
    fn failing_error_state_is_reraised() {
        let mut ctx = Ctx::default();
        let m = StateMachine::new(Phase::Fail)
            .state(Phase::Fail, fail)
            .on_error(Phase::Fail, count_fault);
        assert!(m.run(&mut ctx).is_err());
        assert_eq!(ctx.faults, 1);
        assert_eq!(ctx.visited, vec![Phase::Fail, Phase::Fail]);
    }

    #[test]
    fn machines_nest() {
        let mut ctx = Ctx::default();
        let m = StateMachine::new(Phase::Nested).state(Phase::Nested, nested);
        m.run(&mut ctx).unwrap();
        assert_eq!(ctx.visited, vec![Phase::Nested, Phase::A, Phase::B]);
    }

    #[test]
    fn unknown_state_is_a_usage_fault() {
        let mut ctx = Ctx::default();
        let m: StateMachine<Phase, Ctx, Error> = StateMachine::new(Phase::Missing);
        assert!(matches!(
            m.run(&mut ctx),
            Err(Error::Usage(UsageError::UnknownState(_)))
        ));
    }
}
