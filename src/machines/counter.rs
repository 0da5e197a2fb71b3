use crate::{
    Error, Result,
    fsm::{ActionInvocation, ActionTable, Machine, Transition},
};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const TRIPLE_DELAY_MS: u64 = 2_000;

/// Keeps invoking `triple` while the running total stays at or below this.
const INVOKE_LIMIT: i64 = 10;

/// Adds integer inputs to a running total.
///
/// While the total is small it asks `triple` to produce the next input,
/// which makes it a compact end-to-end exercise of the re-entry loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counter;

impl Machine for Counter {
    type State = i64;
    type Input = String;
    type Output = String;

    fn initial_state(&self) -> i64 {
        0
    }

    fn transition(&self, state: &i64, input: &String) -> Result<Transition<i64, String, String>> {
        let delta: i64 = input
            .trim()
            .parse()
            .map_err(|e| Error::transition(format!("invalid counter input {input:?}: {e}")))?;
        let total = state
            .checked_add(delta)
            .ok_or_else(|| Error::transition(format!("counter overflow: {state} + {delta}")))?;

        let mut transition = Transition::to(total).emit(format!("{:.2}", total as f64));
        if total <= INVOKE_LIMIT {
            transition = transition.invoke(ActionInvocation::new("triple").with_argument(total));
        }
        Ok(transition)
    }

    fn actions(&self) -> ActionTable<String> {
        ActionTable::new()
            .with_fn("double", double)
            .with_fn("triple", triple)
    }
}

async fn double(argument: Option<Value>) -> Result<Option<String>> {
    let value = integer_argument(argument)?;
    Ok(Some(value.to_string()))
}

async fn triple(argument: Option<Value>) -> Result<Option<String>> {
    let value = integer_argument(argument)?;
    debug!(value, "Tripling after {}ms", TRIPLE_DELAY_MS);
    tokio::time::sleep(Duration::from_millis(TRIPLE_DELAY_MS)).await;
    Ok(Some((value * 2).to_string()))
}

fn integer_argument(argument: Option<Value>) -> Result<i64> {
    argument
        .as_ref()
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::action(format!("expected an integer argument, got {argument:?}")))
}
