use super::{
    Dispatch, EffectsScheduler, ExecutorLink,
    records::{Effect, EffectRecord, EffectRecords, TIMER_ID},
};
use crate::{
    Error, Result,
    alarm::{Clock, EpochMs, WakeAlarm, deadline_after},
    fsm::{Action, ActionInvocation, ActionTable, Effects, FsmValue, RetryOptions},
    storage::KvStore,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 60_000;

/// How soon a wake-up is retried after a record write failed.
const FAILED_WRITE_BACKOFF_MS: u64 = 1_000;

/// Cap on timeout-retries. Unbounded unless `max_attempts` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub fn max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub default_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            retry: RetryPolicy::unbounded(),
        }
    }
}

struct Running {
    attempt: u64,
    handle: JoinHandle<()>,
}

/// Everything reconciliation reads and writes, guarded by one lock.
struct Tracking<I> {
    records: EffectRecords<I>,
    running: HashMap<String, Running>,
    current_alarm: Option<EpochMs>,
    next_attempt: u64,
}

struct Core<I> {
    actions: Arc<ActionTable<I>>,
    alarm: Arc<dyn WakeAlarm>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    executor: ExecutorLink<I>,
    tracking: Mutex<Tracking<I>>,
}

/// Persistent, crash-recoverable scheduler.
///
/// Persisted [`EffectRecord`]s are the only truth about what is outstanding.
/// The table of running attempts is a cache that reconciliation rebuilds
/// from them: anything persisted but not running is started, anything
/// running but no longer persisted is aborted, and the alarm is moved to the
/// earliest remaining deadline.
pub struct DurableScheduler<I> {
    core: Arc<Core<I>>,
}

impl<I: FsmValue> DurableScheduler<I> {
    /// Loads the unconfirmed records. Nothing is started until the first
    /// reconciliation (see `Executor::recover`).
    pub async fn open(
        store: Arc<dyn KvStore>,
        alarm: Arc<dyn WakeAlarm>,
        actions: Arc<ActionTable<I>>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let records = EffectRecords::load(store).await?;
        let current_alarm = alarm.get_alarm().await?;

        info!(
            "Opened durable scheduler with {} outstanding effects",
            records.len()
        );

        Ok(Self {
            core: Arc::new(Core {
                actions,
                alarm,
                clock,
                settings,
                executor: ExecutorLink::new(),
                tracking: Mutex::new(Tracking {
                    records,
                    running: HashMap::new(),
                    current_alarm,
                    next_attempt: 0,
                }),
            }),
        })
    }

    /// Snapshot of the unconfirmed effects, ordered by id.
    pub async fn pending(&self) -> Vec<EffectRecord<I>> {
        let tracking = self.core.tracking.lock().await;
        tracking.records.iter().cloned().collect()
    }

    /// Ids with an attempt currently tracked as running.
    pub async fn running_ids(&self) -> Vec<String> {
        let tracking = self.core.tracking.lock().await;
        let mut ids: Vec<String> = tracking.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The wake-up instant this scheduler last armed.
    pub async fn next_wake(&self) -> Option<EpochMs> {
        self.core.tracking.lock().await.current_alarm
    }

    pub async fn reconcile(&self) -> Result<()> {
        let mut tracking = self.core.tracking.lock().await;
        self.core.reconcile(&mut tracking).await
    }
}

#[async_trait]
impl<I: FsmValue> EffectsScheduler<I> for DurableScheduler<I> {
    fn bind(&self, executor: Weak<dyn Dispatch<I>>) {
        self.core.executor.bind(executor);
    }

    async fn schedule(&self, effects: Effects<I>) -> Result<()> {
        let mut tracking = self.core.tracking.lock().await;
        match self.core.record_effects(&mut tracking, effects).await {
            Ok(()) => self.core.reconcile(&mut tracking).await,
            Err(e) => {
                self.core.after_failed_write(&mut tracking).await;
                Err(e)
            }
        }
    }

    async fn wake(&self) -> Result<Option<I>> {
        let mut tracking = self.core.tracking.lock().await;
        // A fired alarm is consumed; ask the platform what is still armed.
        tracking.current_alarm = self.core.alarm.get_alarm().await?;

        match self.core.handle_elapsed(&mut tracking).await {
            Ok(fired) => {
                self.core.reconcile(&mut tracking).await?;
                Ok(fired)
            }
            Err(e) => {
                self.core.after_failed_write(&mut tracking).await;
                Err(e)
            }
        }
    }

    async fn confirm_timer(&self) -> Result<()> {
        let mut tracking = self.core.tracking.lock().await;
        if tracking.records.confirm(TIMER_ID).await? {
            debug!("Timer input rejected, timer confirmed");
        }
        self.core.arm(&mut tracking).await
    }
}

impl<I: FsmValue> Core<I> {
    fn timeout_for(&self, invocation: &ActionInvocation) -> u64 {
        invocation
            .timeout_ms
            .or_else(|| {
                self.actions
                    .get(&invocation.action_id)
                    .and_then(|registered| registered.timeout_ms())
            })
            .unwrap_or(self.settings.default_timeout_ms)
    }

    fn retries_for(&self, invocation: &ActionInvocation) -> Option<RetryOptions> {
        invocation.retries.or_else(|| {
            self.actions
                .get(&invocation.action_id)
                .and_then(|registered| registered.retries())
        })
    }

    /// Persists one transition's effects: cancellations, then the timer,
    /// then fresh invocations.
    async fn record_effects(
        &self,
        tracking: &mut Tracking<I>,
        effects: Effects<I>,
    ) -> Result<()> {
        let now = self.clock.now_ms();

        for action_id in &effects.cancellations {
            let cancelled: Vec<String> = tracking
                .records
                .iter()
                .filter(|record| record.action_id() == Some(action_id.as_str()))
                .map(|record| record.invocation_id.clone())
                .collect();
            for invocation_id in cancelled {
                tracking.records.confirm(&invocation_id).await?;
                info!(%invocation_id, %action_id, "Cancelled outstanding invocation");
            }
        }

        match effects.timer {
            Some(timer) => {
                let timeout_epoch = deadline_after(now, timer.delay_ms);
                debug!(timeout_epoch, "Scheduling timer");
                tracking
                    .records
                    .upsert(EffectRecord::timer(timeout_epoch, timer))
                    .await?;
            }
            None => {
                if tracking.records.confirm(TIMER_ID).await? {
                    debug!("Cleared pending timer");
                }
            }
        }

        for invocation in effects.invocations {
            let invocation_id = Uuid::new_v4().to_string();
            let timeout_epoch = deadline_after(now, self.timeout_for(&invocation));
            debug!(
                %invocation_id,
                action_id = %invocation.action_id,
                timeout_epoch,
                "Scheduling invocation"
            );
            tracking
                .records
                .upsert(EffectRecord::invocation(
                    invocation_id,
                    timeout_epoch,
                    invocation,
                ))
                .await?;
        }

        Ok(())
    }

    /// Retries or drops elapsed invocations, then hands back the input of an
    /// elapsed timer.
    ///
    /// The timer record survives until the executor has applied its input:
    /// its deadline moves one timeout window out, so a failed apply is
    /// delivered again instead of lost.
    async fn handle_elapsed(&self, tracking: &mut Tracking<I>) -> Result<Option<I>> {
        let now = self.clock.now_ms();
        let (timers, invocations): (Vec<EffectRecord<I>>, Vec<EffectRecord<I>>) = tracking
            .records
            .iter()
            .filter(|record| record.timeout_epoch <= now)
            .cloned()
            .partition(EffectRecord::is_timer);

        for record in invocations {
            self.retry(tracking, record, now).await?;
        }

        let mut fired = None;
        for mut record in timers {
            let Effect::Timer(timer) = record.effect.clone() else {
                continue;
            };
            record.timeout_epoch = deadline_after(now, self.settings.default_timeout_ms);
            tracking.records.upsert(record).await?;
            debug!("⏰ Timer elapsed");
            fired = Some(timer.input);
        }
        Ok(fired)
    }

    async fn retry(
        &self,
        tracking: &mut Tracking<I>,
        mut record: EffectRecord<I>,
        now: EpochMs,
    ) -> Result<()> {
        let Effect::Invocation(invocation) = record.effect.clone() else {
            return Ok(());
        };
        if let Some(running) = tracking.running.remove(&record.invocation_id) {
            running.handle.abort();
        }

        let attempt = record.attempt + 1;
        let retries = self.retries_for(&invocation);
        let allowed = self.settings.retry.allows(attempt)
            && retries.is_none_or(|retries| retries.allows(attempt));
        if !allowed {
            let error = Error::RetriesExhausted {
                invocation_id: record.invocation_id.clone(),
                attempts: record.attempt,
            };
            error!(action_id = %invocation.action_id, "❌ {}", error);
            tracking.records.confirm(&record.invocation_id).await?;
            self.executor.invocation_failed(&invocation, &error);
            return Ok(());
        }

        let backoff_ms = retries.map_or(0, |retries| retries.interval.delay_ms(record.attempt));
        warn!(
            invocation_id = %record.invocation_id,
            action_id = %invocation.action_id,
            attempt,
            backoff_ms,
            "⌛ Invocation timed out, retrying"
        );
        let start_at = deadline_after(now, backoff_ms);
        record.attempt = attempt;
        record.start_after = (backoff_ms > 0).then_some(start_at);
        record.timeout_epoch = deadline_after(start_at, self.timeout_for(&invocation));
        tracking.records.upsert(record).await
    }

    /// Aborts running attempts whose record is gone.
    fn stop_superseded(&self, tracking: &mut Tracking<I>) {
        let stop: Vec<String> = tracking
            .running
            .keys()
            .filter(|id| !tracking.records.contains(id))
            .cloned()
            .collect();
        for invocation_id in stop {
            if let Some(running) = tracking.running.remove(&invocation_id) {
                running.handle.abort();
                info!(%invocation_id, "🛑 Aborted superseded invocation");
            }
        }
    }

    async fn reconcile(self: &Arc<Self>, tracking: &mut Tracking<I>) -> Result<()> {
        self.stop_superseded(tracking);

        let now = self.clock.now_ms();
        let start: Vec<EffectRecord<I>> = tracking
            .records
            .iter()
            .filter(|record| {
                !record.is_timer()
                    && !record.is_backing_off(now)
                    && !tracking.running.contains_key(&record.invocation_id)
            })
            .cloned()
            .collect();
        if !start.is_empty() {
            debug!(start = start.len(), "🔄 Reconciling effects");
        }
        for record in start {
            self.start(tracking, record).await?;
        }

        self.arm(tracking).await
    }

    /// A record write failed part way. Whatever was already deleted must
    /// not keep running, and the alarm must stay armed so the survivors are
    /// picked up again.
    async fn after_failed_write(&self, tracking: &mut Tracking<I>) {
        self.stop_superseded(tracking);
        let floor = deadline_after(self.clock.now_ms(), FAILED_WRITE_BACKOFF_MS);
        if let Err(e) = self.arm_no_earlier_than(tracking, floor).await {
            warn!("Failed to re-arm wake-up after a failed write: {}", e);
        }
    }

    async fn start(
        self: &Arc<Self>,
        tracking: &mut Tracking<I>,
        record: EffectRecord<I>,
    ) -> Result<()> {
        let Effect::Invocation(invocation) = record.effect else {
            return Ok(());
        };
        let invocation_id = record.invocation_id;

        let Some(registered) = self.actions.get(&invocation.action_id) else {
            let error = Error::ActionNotFound {
                action_id: invocation.action_id.clone(),
            };
            error!(%invocation_id, "❌ {}, dropping invocation", error);
            tracking.records.confirm(&invocation_id).await?;
            self.executor.invocation_failed(&invocation, &error);
            return Ok(());
        };

        let action = registered.action();
        let attempt = tracking.next_attempt;
        tracking.next_attempt += 1;

        let core = Arc::clone(self);
        let task_id = invocation_id.clone();
        let handle = tokio::spawn(async move {
            core.run_attempt(task_id, attempt, action, invocation).await;
        });
        tracking
            .running
            .insert(invocation_id, Running { attempt, handle });
        Ok(())
    }

    async fn run_attempt(
        self: Arc<Self>,
        invocation_id: String,
        attempt: u64,
        action: Arc<dyn Action<I>>,
        invocation: ActionInvocation,
    ) {
        debug!(%invocation_id, action_id = %invocation.action_id, "▶️ Running invocation");
        let outcome = action.invoke(invocation.argument.clone()).await;

        let mut tracking = self.tracking.lock().await;
        let is_current = tracking
            .running
            .get(&invocation_id)
            .is_some_and(|running| running.attempt == attempt);
        if !is_current {
            debug!(%invocation_id, "Discarding result of a superseded attempt");
            return;
        }

        match outcome {
            Ok(next_input) => {
                match tracking.records.confirm(&invocation_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracking.running.remove(&invocation_id);
                        debug!(%invocation_id, "Record already gone, discarding result");
                        return;
                    }
                    Err(e) => {
                        // Left running and persisted: the timeout retries it.
                        error!(%invocation_id, "Failed to confirm invocation: {}", e);
                        return;
                    }
                }
                tracking.running.remove(&invocation_id);
                if let Err(e) = self.arm(&mut tracking).await {
                    warn!("Failed to re-arm wake-up after confirmation: {}", e);
                }
                drop(tracking);

                info!(
                    %invocation_id,
                    action_id = %invocation.action_id,
                    has_result = next_input.is_some(),
                    "✅ Invocation confirmed"
                );
                if let Some(input) = next_input {
                    self.executor.dispatch(input).await;
                }
            }
            Err(e) => {
                drop(tracking);
                warn!(
                    %invocation_id,
                    action_id = %invocation.action_id,
                    "Invocation failed, retrying after its timeout: {}",
                    e
                );
                self.executor.invocation_failed(&invocation, &e);
            }
        }
    }

    async fn arm(&self, tracking: &mut Tracking<I>) -> Result<()> {
        self.arm_no_earlier_than(tracking, EpochMs::MIN).await
    }

    async fn arm_no_earlier_than(
        &self,
        tracking: &mut Tracking<I>,
        floor: EpochMs,
    ) -> Result<()> {
        let next = tracking
            .records
            .next_deadline(self.clock.now_ms())
            .map(|deadline| deadline.max(floor));
        match next {
            Some(deadline) if tracking.current_alarm != Some(deadline) => {
                self.alarm.set_alarm(deadline).await?;
                tracking.current_alarm = Some(deadline);
                debug!(deadline, "⏰ Wake-up armed");
            }
            Some(_) => {}
            None if tracking.current_alarm.is_some() => {
                self.alarm.delete_alarm().await?;
                tracking.current_alarm = None;
                debug!("Wake-up disarmed, nothing outstanding");
            }
            None => {}
        }
        Ok(())
    }
}

impl<I> Drop for DurableScheduler<I> {
    fn drop(&mut self) {
        if let Ok(mut tracking) = self.core.tracking.try_lock() {
            for (_, running) in tracking.running.drain() {
                running.handle.abort();
            }
        }
    }
}
