//! Application-facing side of the engine: the pure transition function and
//! the named actions a transition may ask for.

mod actions;
mod types;

pub use actions::{Action, ActionTable, FnAction, RegisteredAction};
pub use types::{
    ActionInvocation, Effects, FsmValue, RetryInterval, RetryOptions, Timer, Transition,
};

use crate::Result;
use std::sync::Arc;

/// A finite state machine supplied by the application.
///
/// `transition` must be pure: the durable path may replay it after a crash
/// and expects the same result for the same `(state, input)`.
pub trait Machine: Send + Sync + 'static {
    type State: FsmValue;
    type Input: FsmValue;
    type Output: FsmValue;

    fn initial_state(&self) -> Self::State;

    fn transition(
        &self,
        state: &Self::State,
        input: &Self::Input,
    ) -> Result<Transition<Self::State, Self::Input, Self::Output>>;

    fn actions(&self) -> ActionTable<Self::Input> {
        ActionTable::new()
    }
}

/// A machine together with its resolved action table.
pub struct FsmDefinition<M: Machine> {
    machine: M,
    actions: Arc<ActionTable<M::Input>>,
}

impl<M: Machine> FsmDefinition<M> {
    pub fn new(machine: M) -> Self {
        let actions = Arc::new(machine.actions());
        Self { machine, actions }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn actions(&self) -> Arc<ActionTable<M::Input>> {
        Arc::clone(&self.actions)
    }

    pub fn initial_state(&self) -> M::State {
        self.machine.initial_state()
    }
}
