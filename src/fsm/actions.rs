use super::RetryOptions;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};

/// An asynchronous side effect a transition can ask for by name.
///
/// A returned input is fed back into the executor as a new transition.
#[async_trait]
pub trait Action<I>: Send + Sync {
    async fn invoke(&self, argument: Option<Value>) -> Result<Option<I>>;
}

/// Adapts an async closure into an [`Action`].
pub struct FnAction<F>(F);

#[async_trait]
impl<I, F, Fut> Action<I> for FnAction<F>
where
    I: Send + 'static,
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<I>>> + Send + 'static,
{
    async fn invoke(&self, argument: Option<Value>) -> Result<Option<I>> {
        (self.0)(argument).await
    }
}

pub struct RegisteredAction<I> {
    action: Arc<dyn Action<I>>,
    timeout_ms: Option<u64>,
    retries: Option<RetryOptions>,
}

impl<I> RegisteredAction<I> {
    pub fn action(&self) -> Arc<dyn Action<I>> {
        Arc::clone(&self.action)
    }

    /// Default timeout window for invocations that don't set their own.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Retry options for invocations that don't set their own.
    pub fn retries(&self) -> Option<RetryOptions> {
        self.retries
    }
}

/// Closed dispatch table of a machine's actions, keyed by action id.
///
/// Built once when the definition is created and never mutated afterwards.
pub struct ActionTable<I> {
    actions: HashMap<String, RegisteredAction<I>>,
}

impl<I: Send + 'static> ActionTable<I> {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    pub fn with(mut self, action_id: impl Into<String>, action: impl Action<I> + 'static) -> Self {
        self.insert(action_id.into(), Arc::new(action), None);
        self
    }

    pub fn with_fn<F, Fut>(self, action_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<I>>> + Send + 'static,
    {
        self.with(action_id, FnAction(f))
    }

    pub fn with_timeout<F, Fut>(mut self, action_id: impl Into<String>, timeout_ms: u64, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<I>>> + Send + 'static,
    {
        self.insert(action_id.into(), Arc::new(FnAction(f)), Some(timeout_ms));
        self
    }

    /// Attaches retry options to an action registered earlier.
    pub fn with_retries(mut self, action_id: &str, retries: RetryOptions) -> Self {
        match self.actions.get_mut(action_id) {
            Some(registered) => registered.retries = Some(retries),
            None => tracing::warn!(action_id, "Retry options for an unregistered action ignored"),
        }
        self
    }

    fn insert(&mut self, action_id: String, action: Arc<dyn Action<I>>, timeout_ms: Option<u64>) {
        self.actions.insert(
            action_id,
            RegisteredAction {
                action,
                timeout_ms,
                retries: None,
            },
        );
    }
}

impl<I> ActionTable<I> {
    pub fn get(&self, action_id: &str) -> Option<&RegisteredAction<I>> {
        self.actions.get(action_id)
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.actions.contains_key(action_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<I: Send + 'static> Default for ActionTable<I> {
    fn default() -> Self {
        Self::new()
    }
}
