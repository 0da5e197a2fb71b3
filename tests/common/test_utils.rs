use super::mocks::{ManualAlarm, ManualClock, RecordingReporter};
use fsm_exec::{
    Result,
    alarm::{Clock, EpochMs},
    config::Config,
    executor::{Executor, ExecutorOptions, StateUpdate},
    fsm::{FsmDefinition, Machine},
    scheduler::{DurableScheduler, SchedulerSettings},
    storage::{KvStore, StateSlot},
};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::TempDir;
use tokio::fs;

pub const START: EpochMs = 1_000_000;

/// Polls `check` every 10ms and panics if it never holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Gives spawned tasks a chance to run to their next await point.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// One executor over a [`DurableScheduler`], with a manual alarm and clock.
pub struct DurableHarness<M: Machine> {
    pub executor: Executor<M>,
    pub scheduler: Arc<DurableScheduler<M::Input>>,
    pub alarm: Arc<ManualAlarm>,
    pub reporter: Arc<RecordingReporter>,
    pub outputs: Arc<Mutex<Vec<M::Output>>>,
    pub updates: Arc<Mutex<Vec<StateUpdate<M::State, M::Input>>>>,
}

impl<M: Machine> DurableHarness<M> {
    pub fn outputs(&self) -> Vec<M::Output> {
        self.outputs.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<StateUpdate<M::State, M::Input>> {
        self.updates.lock().unwrap().clone()
    }
}

/// Opens (or reopens, after a simulated crash) an instance over `store` and
/// runs start-up recovery.
pub async fn open_durable<M: Machine>(
    machine: M,
    store: Arc<dyn KvStore>,
    clock: Arc<ManualClock>,
    settings: SchedulerSettings,
) -> Result<DurableHarness<M>> {
    let definition = Arc::new(FsmDefinition::new(machine));
    let slot = StateSlot::new(Arc::clone(&store));
    let state = slot.load::<M::State>().await?;

    let alarm = Arc::new(ManualAlarm::default());
    let scheduler = Arc::new(
        DurableScheduler::open(
            store,
            alarm.clone(),
            definition.actions(),
            clock as Arc<dyn Clock>,
            settings,
        )
        .await?,
    );

    let reporter = Arc::new(RecordingReporter::default());
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let updates = Arc::new(Mutex::new(Vec::new()));
    let output_sink = Arc::clone(&outputs);
    let update_sink = Arc::clone(&updates);

    let executor = Executor::new(
        definition,
        scheduler.clone(),
        ExecutorOptions::default()
            .with_state(state)
            .persist_to(slot)
            .with_error_reporter(reporter.clone())
            .on_output(move |output: &M::Output| output_sink.lock().unwrap().push(output.clone()))
            .on_update(move |update: &StateUpdate<M::State, M::Input>| {
                update_sink.lock().unwrap().push(update.clone())
            }),
    );
    executor.recover().await?;

    Ok(DurableHarness {
        executor,
        scheduler,
        alarm,
        reporter,
        outputs,
        updates,
    })
}

pub fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub async fn create_test_config_file(dir: &TempDir, content: &str) -> Result<String> {
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, content).await?;
    Ok(config_path.to_string_lossy().to_string())
}

pub async fn load_test_config(content: &str) -> Result<Config> {
    let dir = create_temp_dir();
    let path = create_test_config_file(&dir, content).await?;
    fsm_exec::config::load_from(path).await
}
