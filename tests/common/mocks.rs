use async_trait::async_trait;
use fsm_exec::{
    Error, Result,
    alarm::{Clock, EpochMs, WakeAlarm},
    executor::ErrorReporter,
    fsm::{Action, ActionInvocation, ActionTable, Effects, Machine, RetryOptions, Transition},
    scheduler::{Dispatch, EffectsScheduler},
    storage::{KvStore, MemoryStore},
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    },
};
use tokio::sync::Semaphore;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: EpochMs) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> EpochMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Clock pinned to tokio's (pausable) time.
pub struct TokioClock {
    origin: tokio::time::Instant,
    base: EpochMs,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base: 1_700_000_000_000,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> EpochMs {
        self.base + self.origin.elapsed().as_millis() as EpochMs
    }
}

/// Alarm that records what was armed and never fires on its own.
#[derive(Debug, Default)]
pub struct ManualAlarm {
    armed: Mutex<Option<EpochMs>>,
    sets: AtomicUsize,
}

impl ManualAlarm {
    pub fn armed(&self) -> Option<EpochMs> {
        *self.armed.lock().unwrap()
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeAlarm for ManualAlarm {
    async fn set_alarm(&self, epoch: EpochMs) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        *self.armed.lock().unwrap() = Some(epoch);
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<EpochMs>> {
        Ok(self.armed())
    }

    async fn delete_alarm(&self) -> Result<()> {
        *self.armed.lock().unwrap() = None;
        Ok(())
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_prefix: Mutex<Option<String>>,
    failed_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Only writes to keys containing `fragment` fail.
    pub fn fail_writes_to(&self, fragment: &str) {
        *self.fail_prefix.lock().unwrap() = Some(fragment.to_string());
        self.fail_writes(true);
    }

    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn check(&self, key: &str) -> Result<()> {
        if !self.fail_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let targeted = match self.fail_prefix.lock().unwrap().as_deref() {
            Some(fragment) => key.contains(fragment),
            None => true,
        };
        if targeted {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::storage(format!("injected write failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.check(key)?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        self.inner.list(prefix).await
    }
}

struct Gate {
    permits: Semaphore,
    started: AtomicUsize,
    finished: AtomicUsize,
}

/// Action that blocks until released, then replies with a fixed input.
#[derive(Clone)]
pub struct GatedAction {
    gate: Arc<Gate>,
    reply: Option<String>,
}

impl GatedAction {
    pub fn replying(reply: &str) -> Self {
        Self {
            gate: Arc::new(Gate {
                permits: Semaphore::new(0),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }),
            reply: Some(reply.to_string()),
        }
    }

    pub fn release(&self, n: usize) {
        self.gate.permits.add_permits(n);
    }

    pub fn started(&self) -> usize {
        self.gate.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.gate.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action<String> for GatedAction {
    async fn invoke(&self, _argument: Option<Value>) -> Result<Option<String>> {
        self.gate.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .permits
            .acquire()
            .await
            .map_err(|e| Error::action(e.to_string()))?;
        permit.forget();
        self.gate.finished.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Action that always fails, counting its attempts.
#[derive(Clone, Default)]
pub struct FailingAction {
    calls: Arc<AtomicUsize>,
}

impl FailingAction {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action<String> for FailingAction {
    async fn invoke(&self, _argument: Option<Value>) -> Result<Option<String>> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(Error::action(format!("attempt {attempt} failed")))
    }
}

/// Scripted machine for engine tests.
///
/// State is the list of inputs applied so far. Each input is echoed as the
/// output and may carry `;`-separated directives:
/// `invoke:<action>[:<timeout>[:<backoff>]]`, `timer:<delay>:<input>`,
/// `cancel:<action>`, `fail` and `panic`.
pub struct Scripted {
    actions: Mutex<Option<ActionTable<String>>>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::with_actions(ActionTable::new())
    }

    pub fn with_actions(actions: ActionTable<String>) -> Self {
        Self {
            actions: Mutex::new(Some(actions)),
        }
    }
}

impl Machine for Scripted {
    type State = Vec<String>;
    type Input = String;
    type Output = String;

    fn initial_state(&self) -> Vec<String> {
        Vec::new()
    }

    fn transition(
        &self,
        state: &Vec<String>,
        input: &String,
    ) -> Result<Transition<Vec<String>, String, String>> {
        let mut applied = state.clone();
        applied.push(input.clone());
        let mut transition = Transition::to(applied).emit(input.clone());

        for directive in input.split(';') {
            let parts: Vec<&str> = directive.split(':').collect();
            transition = match parts.as_slice() {
                ["fail"] => return Err(Error::transition("scripted to fail")),
                ["panic"] => panic!("scripted to panic"),
                ["invoke", action] => transition.invoke(ActionInvocation::new(*action)),
                ["invoke", action, timeout] => transition.invoke(
                    ActionInvocation::new(*action).with_timeout_ms(parse_ms(timeout)?),
                ),
                ["invoke", action, timeout, backoff] => transition.invoke(
                    ActionInvocation::new(*action)
                        .with_timeout_ms(parse_ms(timeout)?)
                        .with_retries(RetryOptions::fixed(parse_ms(backoff)?)),
                ),
                ["timer", delay, next] => transition.after(parse_ms(delay)?, next.to_string()),
                ["cancel", action] => transition.cancel(*action),
                _ => transition,
            };
        }
        Ok(transition)
    }

    fn actions(&self) -> ActionTable<String> {
        self.actions.lock().unwrap().take().unwrap_or_default()
    }
}

fn parse_ms(raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| Error::transition(format!("bad duration {raw:?}")))
}

/// Reporter that keeps everything it is told.
#[derive(Default)]
pub struct RecordingReporter {
    executions: Mutex<Vec<String>>,
    invocations: Mutex<Vec<(String, Error)>>,
}

impl RecordingReporter {
    pub fn execution_errors(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }

    pub fn invocation_errors(&self) -> Vec<(String, Error)> {
        self.invocations.lock().unwrap().clone()
    }
}

impl<S, I> ErrorReporter<S, I> for RecordingReporter {
    fn execution_error(&self, _state: &S, _input: &I, error: &Error) {
        self.executions.lock().unwrap().push(error.to_string());
    }

    fn invocation_error(&self, invocation: &ActionInvocation, error: &Error) {
        self.invocations
            .lock()
            .unwrap()
            .push((invocation.action_id.clone(), error.clone()));
    }
}

/// Scheduler that only records what it was given.
pub struct RecordingScheduler<I> {
    scheduled: Mutex<Vec<Effects<I>>>,
    events: Option<Arc<Mutex<Vec<String>>>>,
    fail: AtomicBool,
    bound: Mutex<Option<Weak<dyn Dispatch<I>>>>,
}

impl<I: Clone> RecordingScheduler<I> {
    pub fn new() -> Self {
        Self {
            scheduled: Mutex::new(Vec::new()),
            events: None,
            fail: AtomicBool::new(false),
            bound: Mutex::new(None),
        }
    }

    /// Also appends `"schedule"` to a shared event log.
    pub fn logging_to(events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn scheduled(&self) -> Vec<Effects<I>> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.lock().unwrap().is_some()
    }
}

#[async_trait]
impl<I: Clone + Send + Sync + 'static> EffectsScheduler<I> for RecordingScheduler<I> {
    fn bind(&self, executor: Weak<dyn Dispatch<I>>) {
        *self.bound.lock().unwrap() = Some(executor);
    }

    async fn schedule(&self, effects: Effects<I>) -> Result<()> {
        if let Some(events) = &self.events {
            events.lock().unwrap().push("schedule".to_string());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::storage("injected schedule failure"));
        }
        self.scheduled.lock().unwrap().push(effects);
        Ok(())
    }
}
