//! Turning a transition's effects into execution.
//!
//! The executor calls [`EffectsScheduler::schedule`] after every transition.
//! Completed effects come back through the [`Dispatch`] handle the scheduler
//! was bound to, which closes the loop without recursion.

mod durable;
mod records;
mod volatile;

pub use durable::{DEFAULT_ACTION_TIMEOUT_MS, DurableScheduler, RetryPolicy, SchedulerSettings};
pub use records::{Effect, EffectRecord, EffectRecords, TIMER_ID};
pub use volatile::VolatileScheduler;

use crate::{
    Error, Result,
    fsm::{ActionInvocation, Effects},
};
use async_trait::async_trait;
use std::sync::Weak;

/// Re-entry point into an executor, as seen from a scheduler.
#[async_trait]
pub trait Dispatch<I>: Send + Sync {
    /// Feeds the result of a completed effect back as a new input.
    async fn dispatch(&self, input: I);

    /// An action failed, was unknown, or ran out of attempts.
    fn invocation_failed(&self, invocation: &ActionInvocation, error: &Error);
}

#[async_trait]
pub trait EffectsScheduler<I>: Send + Sync {
    /// Second phase of construction: attach the executor completions feed.
    fn bind(&self, executor: Weak<dyn Dispatch<I>>);

    /// Commits one transition's effects. Called after every transition,
    /// including ones without effects, so a stale timer can be cleared.
    async fn schedule(&self, effects: Effects<I>) -> Result<()>;

    /// Handles an elapsed wake-up and returns the input of a timer that
    /// fired, for the executor to apply under its own lock.
    ///
    /// The timer stays outstanding until the executor has applied that
    /// input, so a failed apply gets it delivered again.
    async fn wake(&self) -> Result<Option<I>> {
        Ok(None)
    }

    /// The fired timer's input was rejected by the transition function. It
    /// still counts as delivered.
    async fn confirm_timer(&self) -> Result<()> {
        Ok(())
    }
}

/// Bound executor handle shared by both schedulers.
pub(crate) struct ExecutorLink<I> {
    executor: std::sync::OnceLock<Weak<dyn Dispatch<I>>>,
}

impl<I: Send + 'static> ExecutorLink<I> {
    pub(crate) fn new() -> Self {
        Self {
            executor: std::sync::OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, executor: Weak<dyn Dispatch<I>>) {
        if self.executor.set(executor).is_err() {
            tracing::warn!("Scheduler already bound to an executor, ignoring rebind");
        }
    }

    pub(crate) fn get(&self) -> Option<std::sync::Arc<dyn Dispatch<I>>> {
        self.executor.get().and_then(Weak::upgrade)
    }

    pub(crate) async fn dispatch(&self, input: I) {
        match self.get() {
            Some(executor) => executor.dispatch(input).await,
            None => tracing::warn!("No live executor bound, dropping effect result"),
        }
    }

    pub(crate) fn invocation_failed(&self, invocation: &ActionInvocation, error: &Error) {
        match self.get() {
            Some(executor) => executor.invocation_failed(invocation, error),
            None => tracing::warn!(
                action_id = %invocation.action_id,
                "Invocation failed with no live executor: {}",
                error
            ),
        }
    }
}
