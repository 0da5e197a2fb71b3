use crate::{Error, fsm::ActionInvocation};
use std::{fmt::Debug, sync::Arc};
use tracing::{error, warn};

/// What observers see after every committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate<S, I> {
    pub input: I,
    pub old_state: S,
    pub new_state: S,
}

pub type UpdateListener<S, I> = Arc<dyn Fn(&StateUpdate<S, I>) + Send + Sync>;

pub type OutputListener<O> = Arc<dyn Fn(&O) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ExecuteResult<S, I, O> {
    Success {
        state: S,
        output: Option<O>,
    },
    /// The transition function failed; `state` is the unchanged prior state.
    Failure {
        error: Error,
        state: S,
        input: I,
    },
}

impl<S, I, O> ExecuteResult<S, I, O> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn state(&self) -> &S {
        match self {
            Self::Success { state, .. } | Self::Failure { state, .. } => state,
        }
    }

    pub fn output(&self) -> Option<&O> {
        match self {
            Self::Success { output, .. } => output.as_ref(),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }
}

/// Explicitly injected sink for failures the engine does not propagate.
pub trait ErrorReporter<S, I>: Send + Sync {
    fn execution_error(&self, state: &S, input: &I, error: &Error);

    fn invocation_error(&self, invocation: &ActionInvocation, error: &Error) {
        let _ = (invocation, error);
    }
}

/// Default reporter: logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl<S: Debug, I: Debug> ErrorReporter<S, I> for TracingReporter {
    fn execution_error(&self, state: &S, input: &I, error: &Error) {
        error!(
            "❌ Error while executing state machine: state={:?} input={:?} error={}",
            state, input, error
        );
    }

    fn invocation_error(&self, invocation: &ActionInvocation, error: &Error) {
        warn!(
            action_id = %invocation.action_id,
            argument = ?invocation.argument,
            "Error while running action: {}",
            error
        );
    }
}
