use crate::{
    Result,
    alarm::EpochMs,
    fsm::{ActionInvocation, FsmValue, Timer},
    storage::KvStore,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Fixed identity of the instance's single timer.
pub const TIMER_ID: &str = "timer";

const RECORD_PREFIX: &str = "effect::";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect<I> {
    Timer(Timer<I>),
    Invocation(ActionInvocation),
}

/// Persisted descriptor of one effect that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectRecord<I> {
    pub invocation_id: String,
    pub timeout_epoch: EpochMs,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Retry backoff: the attempt is not started before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<EpochMs>,
    pub effect: Effect<I>,
}

fn first_attempt() -> u32 {
    1
}

impl<I> EffectRecord<I> {
    pub fn timer(timeout_epoch: EpochMs, timer: Timer<I>) -> Self {
        Self {
            invocation_id: TIMER_ID.to_string(),
            timeout_epoch,
            attempt: 1,
            start_after: None,
            effect: Effect::Timer(timer),
        }
    }

    pub fn invocation(
        invocation_id: String,
        timeout_epoch: EpochMs,
        invocation: ActionInvocation,
    ) -> Self {
        Self {
            invocation_id,
            timeout_epoch,
            attempt: 1,
            start_after: None,
            effect: Effect::Invocation(invocation),
        }
    }

    pub fn is_timer(&self) -> bool {
        matches!(self.effect, Effect::Timer(_))
    }

    /// Still waiting out a retry backoff at `now`.
    pub fn is_backing_off(&self, now: EpochMs) -> bool {
        self.start_after.is_some_and(|at| at > now)
    }

    /// When this record next needs attention: the end of its backoff, or
    /// its deadline.
    pub fn wake_at(&self, now: EpochMs) -> EpochMs {
        match self.start_after {
            Some(at) if at > now => at,
            _ => self.timeout_epoch,
        }
    }

    pub fn action_id(&self) -> Option<&str> {
        match &self.effect {
            Effect::Invocation(invocation) => Some(invocation.action_id.as_str()),
            Effect::Timer(_) => None,
        }
    }
}

/// The unconfirmed effect set: durable records plus an in-memory mirror.
///
/// The store is always written first, so the mirror never claims more than
/// what has been persisted.
pub struct EffectRecords<I> {
    store: Arc<dyn KvStore>,
    cache: BTreeMap<String, EffectRecord<I>>,
}

impl<I: FsmValue> EffectRecords<I> {
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut cache = BTreeMap::new();
        for (_, value) in store.list(RECORD_PREFIX).await? {
            let record: EffectRecord<I> = serde_json::from_value(value)?;
            cache.insert(record.invocation_id.clone(), record);
        }
        debug!("Loaded {} unconfirmed effect records", cache.len());
        Ok(Self { store, cache })
    }

    pub async fn upsert(&mut self, record: EffectRecord<I>) -> Result<()> {
        let value = serde_json::to_value(&record)?;
        self.store.put(&key(&record.invocation_id), value).await?;
        self.cache.insert(record.invocation_id.clone(), record);
        Ok(())
    }

    /// Marks an effect complete. Confirming an unknown id is a no-op.
    pub async fn confirm(&mut self, invocation_id: &str) -> Result<bool> {
        if !self.cache.contains_key(invocation_id) {
            return Ok(false);
        }
        self.store.delete(&key(invocation_id)).await?;
        self.cache.remove(invocation_id);
        Ok(true)
    }

    pub fn get(&self, invocation_id: &str) -> Option<&EffectRecord<I>> {
        self.cache.get(invocation_id)
    }

    pub fn contains(&self, invocation_id: &str) -> bool {
        self.cache.contains_key(invocation_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectRecord<I>> {
        self.cache.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.cache.keys().map(String::as_str)
    }

    pub fn next_deadline(&self, now: EpochMs) -> Option<EpochMs> {
        self.cache.values().map(|record| record.wake_at(now)).min()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn key(invocation_id: &str) -> String {
    format!("{RECORD_PREFIX}{invocation_id}")
}
