use fsm_exec::{
    Error,
    executor::{Executor, ExecutorOptions},
    fsm::{ActionTable, FsmDefinition, Machine},
    machines::{
        Command, Counter, Microwave, MicrowaveInput, MicrowaveOutput, Mode, TRIPLE_DELAY_MS,
    },
    scheduler::VolatileScheduler,
};
use pretty_assertions::assert_eq;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

mod common;
use common::{FailingAction, GatedAction, Scripted, RecordingReporter, settle};

struct Volatile<M: Machine> {
    executor: Executor<M>,
    scheduler: Arc<VolatileScheduler<M::Input>>,
    outputs: Arc<Mutex<Vec<M::Output>>>,
    reporter: Arc<RecordingReporter>,
}

fn volatile<M: Machine>(machine: M) -> Volatile<M> {
    let definition = Arc::new(FsmDefinition::new(machine));
    let scheduler = Arc::new(VolatileScheduler::new(definition.actions()));
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let reporter = Arc::new(RecordingReporter::default());
    let sink = outputs.clone();
    let executor = Executor::new(
        definition,
        scheduler.clone(),
        ExecutorOptions::default()
            .with_error_reporter(reporter.clone())
            .on_output(move |output: &M::Output| sink.lock().unwrap().push(output.clone())),
    );
    Volatile {
        executor,
        scheduler,
        outputs,
        reporter,
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_counter_reenters_with_action_result() {
    let fsm = volatile(Counter);

    let result = fsm.executor.execute("4".to_string()).await.unwrap();
    assert_eq!(result.state(), &4);
    assert_eq!(result.output(), Some(&"4.00".to_string()));
    assert_eq!(fsm.scheduler.in_flight(), 1);

    sleep_ms(TRIPLE_DELAY_MS + 100).await;

    assert_eq!(fsm.executor.state().await, 12);
    assert_eq!(fsm.scheduler.in_flight(), 0);
    assert_eq!(
        *fsm.outputs.lock().unwrap(),
        vec!["4.00".to_string(), "12.00".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_microwave_runs_to_chime() {
    let fsm = volatile(Microwave);

    fsm.executor.execute(MicrowaveInput::up(30)).await.unwrap();
    let started = fsm.executor.execute(Command::Start.into()).await.unwrap();
    assert_eq!(started.state().mode, Mode::Running);
    assert!(fsm.scheduler.has_timer());

    sleep_ms(30_500).await;

    let state = fsm.executor.state().await;
    assert_eq!(state.mode, Mode::Stopped);
    assert_eq!(state.timer, 0);
    assert_eq!(*fsm.outputs.lock().unwrap(), vec![MicrowaveOutput::Chime]);
    assert!(!fsm.scheduler.has_timer());
}

#[tokio::test(start_paused = true)]
async fn test_stop_clears_the_tick_timer() {
    let fsm = volatile(Microwave);

    fsm.executor.execute(MicrowaveInput::up(30)).await.unwrap();
    fsm.executor.execute(Command::Start.into()).await.unwrap();
    sleep_ms(2_500).await;
    assert_eq!(fsm.executor.state().await.timer, 28);

    let paused = fsm.executor.execute(Command::Stop.into()).await.unwrap();
    assert_eq!(paused.state().mode, Mode::Paused);
    assert!(!fsm.scheduler.has_timer());

    sleep_ms(5_000).await;
    assert_eq!(fsm.executor.state().await.timer, 28);
}

#[tokio::test(start_paused = true)]
async fn test_new_timer_replaces_pending_one() {
    let fsm = volatile(Scripted::new());

    fsm.executor.execute("timer:100:first".to_string()).await.unwrap();
    fsm.executor.execute("timer:500:second".to_string()).await.unwrap();
    sleep_ms(1_000).await;

    let applied = fsm.executor.state().await;
    assert_eq!(applied.last().map(String::as_str), Some("second"));
    assert!(!applied.contains(&"first".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_in_flight_invocation() {
    let gate = GatedAction::replying("done");
    let fsm = volatile(Scripted::with_actions(
        ActionTable::new().with("slow", gate.clone()),
    ));

    fsm.executor.execute("invoke:slow".to_string()).await.unwrap();
    assert_eq!(fsm.scheduler.in_flight(), 1);
    settle().await;
    assert_eq!(gate.started(), 1);

    fsm.executor.execute("cancel:slow".to_string()).await.unwrap();
    assert_eq!(fsm.scheduler.in_flight(), 0);

    gate.release(1);
    settle().await;
    assert_eq!(gate.finished(), 0);
    assert_eq!(fsm.executor.state().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_action_is_reported() {
    let fsm = volatile(Scripted::new());

    fsm.executor.execute("invoke:missing".to_string()).await.unwrap();

    assert_eq!(fsm.scheduler.in_flight(), 0);
    let errors = fsm.reporter.invocation_errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].1, Error::ActionNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_action_runs_once() {
    let flaky = FailingAction::default();
    let fsm = volatile(Scripted::with_actions(
        ActionTable::new().with("flaky", flaky.clone()),
    ));

    fsm.executor.execute("invoke:flaky:10".to_string()).await.unwrap();
    sleep_ms(120_000).await;

    assert_eq!(flaky.calls(), 1);
    assert_eq!(fsm.scheduler.in_flight(), 0);
    assert_eq!(fsm.reporter.invocation_errors().len(), 1);
}
