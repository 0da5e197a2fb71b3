use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt::Debug;

/// Bound shared by every application-supplied State, Input and Output.
///
/// The engine never looks inside these values. They only need to be cloned,
/// logged and persisted.
pub trait FsmValue: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> FsmValue for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A deferred self-input. At most one is outstanding per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer<I> {
    pub delay_ms: u64,
    pub input: I,
}

impl<I> Timer<I> {
    pub fn new(delay_ms: u64, input: I) -> Self {
        Self { delay_ms, input }
    }
}

const MAX_BACKOFF_MS: u64 = 10 * 60 * 1_000;

/// Delay before a timed-out invocation is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryInterval {
    Fixed(u64),
    /// One second doubled per retry, capped at ten minutes.
    Exponential,
}

impl RetryInterval {
    /// `retry` counts from 1 for the first retry.
    pub fn delay_ms(&self, retry: u32) -> u64 {
        match self {
            RetryInterval::Fixed(ms) => *ms,
            RetryInterval::Exponential => 1_000u64
                .saturating_mul(2u64.saturating_pow(retry))
                .min(MAX_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    pub interval: RetryInterval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl RetryOptions {
    pub fn fixed(interval_ms: u64) -> Self {
        Self {
            interval: RetryInterval::Fixed(interval_ms),
            max_retries: None,
        }
    }

    pub fn exponential() -> Self {
        Self {
            interval: RetryInterval::Exponential,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Whether attempt number `attempt` (the first run is 1) may start.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max.saturating_add(1))
    }
}

/// Request to run a named action from the machine's action table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInvocation {
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the retry options registered with the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryOptions>,
}

impl ActionInvocation {
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            argument: None,
            timeout_ms: None,
            retries: None,
        }
    }

    pub fn with_argument(mut self, argument: impl Into<Value>) -> Self {
        self.argument = Some(argument.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: RetryOptions) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// The side effects of one transition, as handed to a scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Effects<I> {
    pub timer: Option<Timer<I>>,
    pub invocations: Vec<ActionInvocation>,
    /// Action ids whose outstanding invocations this transition withdraws.
    pub cancellations: Vec<String>,
}

impl<I> Effects<I> {
    pub fn none() -> Self {
        Self {
            timer: None,
            invocations: Vec::new(),
            cancellations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timer.is_none() && self.invocations.is_empty() && self.cancellations.is_empty()
    }
}

impl<I> Default for Effects<I> {
    fn default() -> Self {
        Self::none()
    }
}

/// Result of applying one input to one state.
///
/// Produced by a pure function, so it must be the same every time the same
/// `(state, input)` pair is replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, I, O> {
    pub state: S,
    pub output: Option<O>,
    pub timer: Option<Timer<I>>,
    pub invocations: Vec<ActionInvocation>,
    pub cancellations: Vec<String>,
}

impl<S, I, O> Transition<S, I, O> {
    pub fn to(state: S) -> Self {
        Self {
            state,
            output: None,
            timer: None,
            invocations: Vec::new(),
            cancellations: Vec::new(),
        }
    }

    pub fn emit(mut self, output: O) -> Self {
        self.output = Some(output);
        self
    }

    pub fn after(mut self, delay_ms: u64, input: I) -> Self {
        self.timer = Some(Timer::new(delay_ms, input));
        self
    }

    pub fn invoke(mut self, invocation: ActionInvocation) -> Self {
        self.invocations.push(invocation);
        self
    }

    pub fn cancel(mut self, action_id: impl Into<String>) -> Self {
        self.cancellations.push(action_id.into());
        self
    }

    pub fn into_parts(self) -> (S, Option<O>, Effects<I>) {
        let effects = Effects {
            timer: self.timer,
            invocations: self.invocations,
            cancellations: self.cancellations,
        };
        (self.state, self.output, effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_exponential_interval_doubles_then_caps() {
        let interval = RetryInterval::Exponential;
        assert_eq!(interval.delay_ms(1), 2_000);
        assert_eq!(interval.delay_ms(2), 4_000);
        assert_eq!(interval.delay_ms(9), MAX_BACKOFF_MS);
        assert_eq!(interval.delay_ms(200), MAX_BACKOFF_MS);
        assert_eq!(RetryInterval::Fixed(750).delay_ms(5), 750);
    }

    #[test]
    fn test_max_retries_counts_the_first_run_separately() {
        let options = RetryOptions::fixed(100).with_max_retries(2);
        assert!(options.allows(3));
        assert!(!options.allows(4));
        assert!(RetryOptions::exponential().allows(u32::MAX));
    }

    #[test]
    fn test_invocation_retries_wire_format() {
        let invocation = ActionInvocation::new("slow")
            .with_retries(RetryOptions::fixed(500).with_max_retries(3));
        assert_eq!(
            serde_json::to_value(&invocation).unwrap(),
            json!({"actionId": "slow", "retries": {"interval": {"fixed": 500}, "maxRetries": 3}})
        );

        let parsed: ActionInvocation = serde_json::from_value(json!({
            "actionId": "slow",
            "retries": {"interval": "exponential"}
        }))
        .unwrap();
        assert_eq!(parsed.retries, Some(RetryOptions::exponential()));
    }
}
