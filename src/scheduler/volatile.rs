use super::{Dispatch, EffectsScheduler, ExecutorLink};
use crate::{
    Error, Result,
    fsm::{ActionTable, Effects, FsmValue},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct Tasks {
    timer: Option<(u64, JoinHandle<()>)>,
    invocations: HashMap<u64, (String, JoinHandle<()>)>,
    next_id: u64,
}

impl Tasks {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

struct Shared<I> {
    actions: Arc<ActionTable<I>>,
    executor: ExecutorLink<I>,
    tasks: Mutex<Tasks>,
}

impl<I> Shared<I> {
    fn tasks(&self) -> Result<MutexGuard<'_, Tasks>> {
        self.tasks
            .lock()
            .map_err(|e| Error::internal(format!("Mutex lock failed: {e}")))
    }
}

/// In-process, best-effort scheduler.
///
/// Nothing is persisted and nothing is retried: the timer is a tokio sleep
/// and each invocation runs exactly once. Meant for development and tests.
pub struct VolatileScheduler<I> {
    shared: Arc<Shared<I>>,
}

impl<I: FsmValue> VolatileScheduler<I> {
    pub fn new(actions: Arc<ActionTable<I>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                actions,
                executor: ExecutorLink::new(),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Number of invocations that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.shared
            .tasks()
            .map(|tasks| tasks.invocations.len())
            .unwrap_or(0)
    }

    pub fn has_timer(&self) -> bool {
        self.shared
            .tasks()
            .map(|tasks| tasks.timer.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl<I: FsmValue> EffectsScheduler<I> for VolatileScheduler<I> {
    fn bind(&self, executor: Weak<dyn Dispatch<I>>) {
        self.shared.executor.bind(executor);
    }

    async fn schedule(&self, effects: Effects<I>) -> Result<()> {
        let mut tasks = self.shared.tasks()?;

        if let Some((_, previous)) = tasks.timer.take() {
            previous.abort();
            debug!("Cleared pending timer");
        }

        if let Some(timer) = effects.timer {
            let timer_id = tasks.next_id();
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timer.delay_ms)).await;
                // Leave the slot before re-entering, or the next schedule()
                // would abort this very task mid-dispatch.
                let is_current = match shared.tasks() {
                    Ok(mut tasks) => {
                        if tasks.timer.as_ref().is_some_and(|(id, _)| *id == timer_id) {
                            tasks.timer = None;
                            true
                        } else {
                            false
                        }
                    }
                    Err(_) => false,
                };
                if is_current {
                    debug!("⏰ Timer fired");
                    shared.executor.dispatch(timer.input).await;
                }
            });
            tasks.timer = Some((timer_id, handle));
        }

        for action_id in &effects.cancellations {
            let cancelled: Vec<u64> = tasks
                .invocations
                .iter()
                .filter(|(_, (id, _))| id == action_id)
                .map(|(task_id, _)| *task_id)
                .collect();
            for task_id in cancelled {
                if let Some((_, handle)) = tasks.invocations.remove(&task_id) {
                    handle.abort();
                    debug!(%action_id, "🛑 Aborted in-flight invocation");
                }
            }
        }

        for invocation in effects.invocations {
            let Some(registered) = self.shared.actions.get(&invocation.action_id) else {
                let error = Error::ActionNotFound {
                    action_id: invocation.action_id.clone(),
                };
                warn!("❌ {}", error);
                self.shared.executor.invocation_failed(&invocation, &error);
                continue;
            };

            let action = registered.action();
            let task_id = tasks.next_id();
            let action_id = invocation.action_id.clone();
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(async move {
                let outcome = action.invoke(invocation.argument.clone()).await;
                let is_current = shared
                    .tasks()
                    .map(|mut tasks| tasks.invocations.remove(&task_id).is_some())
                    .unwrap_or(false);
                if !is_current {
                    return;
                }
                match outcome {
                    Ok(Some(input)) => shared.executor.dispatch(input).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(action_id = %invocation.action_id, "Invocation failed: {}", e);
                        shared.executor.invocation_failed(&invocation, &e);
                    }
                }
            });
            tasks.invocations.insert(task_id, (action_id, handle));
        }

        Ok(())
    }
}

impl<I> Drop for VolatileScheduler<I> {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.shared.tasks() {
            if let Some((_, timer)) = tasks.timer.take() {
                timer.abort();
            }
            for (_, (_, handle)) in tasks.invocations.drain() {
                handle.abort();
            }
        }
    }
}
