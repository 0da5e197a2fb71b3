//! Persisted FSM instances addressed by id.

use crate::{
    Result,
    alarm::{Clock, TokioAlarm, WakeAlarm},
    executor::{ExecuteResult, Executor, ExecutorOptions},
    fsm::{FsmDefinition, Machine},
    scheduler::{DurableScheduler, EffectsScheduler, SchedulerSettings},
    storage::{KvStore, ScopedStore, StateSlot},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;

/// One FSM instance wired to durable storage: executor, durable scheduler
/// and wake-up alarm.
pub struct DurableInstance<M: Machine> {
    id: String,
    executor: Executor<M>,
    scheduler: Arc<DurableScheduler<M::Input>>,
    _alarm: Arc<TokioAlarm>,
}

impl<M: Machine> DurableInstance<M> {
    /// Restores the instance from `store` and runs start-up recovery before
    /// returning, so outstanding effects are already restarted.
    pub async fn open(
        id: impl Into<String>,
        definition: Arc<FsmDefinition<M>>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let id = id.into();
        let slot = StateSlot::new(Arc::clone(&store));
        let state = slot.load::<M::State>().await?;
        let restored = state.is_some();

        let alarm = Arc::new(TokioAlarm::new(Arc::clone(&clock)));
        let scheduler = Arc::new(
            DurableScheduler::open(
                store,
                Arc::clone(&alarm) as Arc<dyn WakeAlarm>,
                definition.actions(),
                clock,
                settings,
            )
            .await?,
        );

        let executor = Executor::new(
            definition,
            Arc::clone(&scheduler) as Arc<dyn EffectsScheduler<M::Input>>,
            ExecutorOptions::default().with_state(state).persist_to(slot),
        );
        alarm.bind(executor.alarm_handler());
        executor.recover().await?;

        info!(instance = %id, restored, "📦 Instance ready");

        Ok(Self {
            id,
            executor,
            scheduler,
            _alarm: alarm,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executor(&self) -> &Executor<M> {
        &self.executor
    }

    pub fn scheduler(&self) -> &DurableScheduler<M::Input> {
        &self.scheduler
    }

    pub async fn state(&self) -> M::State {
        self.executor.state().await
    }

    pub async fn execute(
        &self,
        input: M::Input,
    ) -> Result<ExecuteResult<M::State, M::Input, M::Output>> {
        self.executor.execute(input).await
    }
}

/// Lazily opened instances of one machine over a shared store, each under
/// its own `fsm::<id>::` key prefix.
pub struct InstanceRegistry<M: Machine> {
    definition: Arc<FsmDefinition<M>>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    instances: Mutex<HashMap<String, Arc<DurableInstance<M>>>>,
}

impl<M: Machine> InstanceRegistry<M> {
    pub fn new(
        definition: Arc<FsmDefinition<M>>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            definition,
            store,
            clock,
            settings,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_open(&self, id: &str) -> Result<Arc<DurableInstance<M>>> {
        // Held across open so the same id is never opened twice.
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get(id) {
            return Ok(Arc::clone(instance));
        }

        let store: Arc<dyn KvStore> = Arc::new(ScopedStore::new(
            Arc::clone(&self.store),
            format!("fsm::{id}::"),
        ));
        let instance = Arc::new(
            DurableInstance::open(
                id,
                Arc::clone(&self.definition),
                store,
                Arc::clone(&self.clock),
                self.settings.clone(),
            )
            .await?,
        );
        instances.insert(id.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.lock().await.is_empty()
    }
}
