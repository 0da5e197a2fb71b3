//! Drives one FSM instance: applies transitions, notifies observers, hands
//! effects to a scheduler and accepts their outcomes back as new inputs.

mod types;

pub use types::{
    ErrorReporter, ExecuteResult, OutputListener, StateUpdate, TracingReporter, UpdateListener,
};

use crate::{
    Error, Result,
    alarm::AlarmHandler,
    fsm::{ActionInvocation, FsmDefinition, Machine},
    scheduler::{Dispatch, EffectsScheduler},
    storage::StateSlot,
};
use async_trait::async_trait;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type Outcome<M> =
    ExecuteResult<<M as Machine>::State, <M as Machine>::Input, <M as Machine>::Output>;

pub struct ExecutorOptions<M: Machine> {
    /// Starting state; the machine's initial state when absent.
    pub state: Option<M::State>,
    pub update_listener: Option<UpdateListener<M::State, M::Input>>,
    pub output_listener: Option<OutputListener<M::Output>>,
    pub error_reporter: Option<Arc<dyn ErrorReporter<M::State, M::Input>>>,
    /// When set, every new state is persisted before it is committed.
    pub state_slot: Option<StateSlot>,
}

impl<M: Machine> Default for ExecutorOptions<M> {
    fn default() -> Self {
        Self {
            state: None,
            update_listener: None,
            output_listener: None,
            error_reporter: None,
            state_slot: None,
        }
    }
}

impl<M: Machine> ExecutorOptions<M> {
    pub fn with_state(mut self, state: Option<M::State>) -> Self {
        self.state = state;
        self
    }

    pub fn on_update(
        mut self,
        listener: impl Fn(&StateUpdate<M::State, M::Input>) + Send + Sync + 'static,
    ) -> Self {
        self.update_listener = Some(Arc::new(listener));
        self
    }

    pub fn on_output(mut self, listener: impl Fn(&M::Output) + Send + Sync + 'static) -> Self {
        self.output_listener = Some(Arc::new(listener));
        self
    }

    pub fn with_error_reporter(
        mut self,
        reporter: Arc<dyn ErrorReporter<M::State, M::Input>>,
    ) -> Self {
        self.error_reporter = Some(reporter);
        self
    }

    pub fn persist_to(mut self, slot: StateSlot) -> Self {
        self.state_slot = Some(slot);
        self
    }
}

struct Inner<M: Machine> {
    definition: Arc<FsmDefinition<M>>,
    scheduler: Arc<dyn EffectsScheduler<M::Input>>,
    // The instance lock: every transition, re-entry and wake-up goes through it.
    state: Mutex<M::State>,
    update_listener: Option<UpdateListener<M::State, M::Input>>,
    output_listener: Option<OutputListener<M::Output>>,
    reporter: Arc<dyn ErrorReporter<M::State, M::Input>>,
    state_slot: Option<StateSlot>,
}

/// Cheaply clonable handle to one running FSM instance.
pub struct Executor<M: Machine> {
    inner: Arc<Inner<M>>,
}

impl<M: Machine> Clone for Executor<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Machine> Executor<M> {
    /// Builds the executor and binds `scheduler` to it.
    pub fn new(
        definition: Arc<FsmDefinition<M>>,
        scheduler: Arc<dyn EffectsScheduler<M::Input>>,
        options: ExecutorOptions<M>,
    ) -> Self {
        let state = options
            .state
            .unwrap_or_else(|| definition.initial_state());
        let reporter: Arc<dyn ErrorReporter<M::State, M::Input>> = match options.error_reporter {
            Some(reporter) => reporter,
            None => Arc::new(TracingReporter),
        };

        let inner = Arc::new(Inner {
            definition,
            scheduler,
            state: Mutex::new(state),
            update_listener: options.update_listener,
            output_listener: options.output_listener,
            reporter,
            state_slot: options.state_slot,
        });

        inner
            .scheduler
            .bind(Arc::downgrade(&inner) as Weak<dyn Dispatch<M::Input>>);

        Self { inner }
    }

    pub fn definition(&self) -> &FsmDefinition<M> {
        &self.inner.definition
    }

    pub async fn state(&self) -> M::State {
        self.inner.state.lock().await.clone()
    }

    /// Applies one input.
    ///
    /// A failing transition function is not an `Err`: it yields
    /// [`ExecuteResult::Failure`] with the state untouched. `Err` means the
    /// new state or its effects could not be persisted.
    pub async fn execute(&self, input: M::Input) -> Result<Outcome<M>> {
        let mut state = self.inner.state.lock().await;
        self.inner.apply(&mut state, input).await
    }

    /// Runs the scheduler's wake-up handling under the instance lock and
    /// applies a fired timer's input.
    pub async fn wake(&self) -> Result<()> {
        self.inner.wake().await
    }

    /// Start-up reconciliation: restarts everything outstanding, fires or
    /// retries what elapsed while the process was down, and re-arms the alarm.
    pub async fn recover(&self) -> Result<()> {
        info!("🔁 Recovering outstanding effects");
        self.inner.wake().await
    }

    pub fn alarm_handler(&self) -> Weak<dyn AlarmHandler> {
        Arc::downgrade(&self.inner) as Weak<dyn AlarmHandler>
    }
}

impl<M: Machine> Inner<M> {
    async fn apply(&self, state: &mut M::State, input: M::Input) -> Result<Outcome<M>> {
        let old_state = state.clone();
        debug!("🔄 Executing input {:?} in state {:?}", input, old_state);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.definition.machine().transition(&old_state, &input)
        }))
        .unwrap_or_else(|payload| {
            Err(Error::transition(format!(
                "transition panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        let transition = match outcome {
            Ok(transition) => transition,
            Err(error) => {
                self.reporter.execution_error(&old_state, &input, &error);
                return Ok(ExecuteResult::Failure {
                    error,
                    state: old_state,
                    input,
                });
            }
        };

        let (new_state, output, effects) = transition.into_parts();

        if let Some(slot) = &self.state_slot {
            slot.save(&new_state).await?;
        }
        *state = new_state.clone();

        info!(
            "🎯 State transition: {:?} -> {:?} (input: {:?})",
            old_state, new_state, input
        );

        self.notify_update(&StateUpdate {
            input,
            old_state,
            new_state: new_state.clone(),
        });
        if let Some(output) = &output {
            self.notify_output(output);
        }

        self.scheduler.schedule(effects).await?;

        Ok(ExecuteResult::Success {
            state: new_state,
            output,
        })
    }

    async fn wake(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(input) = self.scheduler.wake().await? else {
            return Ok(());
        };
        // On success the transition's own effects have replaced the timer.
        if !self.apply(&mut state, input).await?.is_success() {
            self.scheduler.confirm_timer().await?;
        }
        Ok(())
    }

    fn notify_update(&self, update: &StateUpdate<M::State, M::Input>) {
        if let Some(listener) = &self.update_listener {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                warn!("Update listener panicked, continuing with scheduling");
            }
        }
    }

    fn notify_output(&self, output: &M::Output) {
        if let Some(listener) = &self.output_listener {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(output))).is_err() {
                warn!("Output listener panicked, continuing with scheduling");
            }
        }
    }
}

#[async_trait]
impl<M: Machine> Dispatch<M::Input> for Inner<M> {
    async fn dispatch(&self, input: M::Input) {
        let mut state = self.state.lock().await;
        match self.apply(&mut state, input).await {
            Ok(_) => {}
            Err(e) if e.is_storage() => error!("Failed to persist effect result: {}", e),
            Err(e) => warn!("Failed to apply effect result: {}", e),
        }
    }

    fn invocation_failed(&self, invocation: &ActionInvocation, error: &Error) {
        self.reporter.invocation_error(invocation, error);
    }
}

#[async_trait]
impl<M: Machine> AlarmHandler for Inner<M> {
    async fn on_alarm(&self) {
        if let Err(e) = self.wake().await {
            error!("Wake-up handling failed: {}", e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
