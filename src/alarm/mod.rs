//! The single per-instance wake-up alarm and the clock deadlines are measured
//! against.

mod tokio_alarm;

pub use tokio_alarm::TokioAlarm;

use crate::Result;
use async_trait::async_trait;

/// Milliseconds since the Unix epoch.
pub type EpochMs = i64;

/// `epoch + delay_ms`, saturating instead of overflowing on huge delays.
pub fn deadline_after(epoch: EpochMs, delay_ms: u64) -> EpochMs {
    epoch.saturating_add(EpochMs::try_from(delay_ms).unwrap_or(EpochMs::MAX))
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> EpochMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EpochMs {
        chrono::Utc::now().timestamp_millis()
    }
}

/// One future alarm per instance. Setting it replaces whatever was armed.
#[async_trait]
pub trait WakeAlarm: Send + Sync {
    async fn set_alarm(&self, epoch: EpochMs) -> Result<()>;

    async fn get_alarm(&self) -> Result<Option<EpochMs>>;

    async fn delete_alarm(&self) -> Result<()>;
}

/// Receives the platform callback when an alarm fires.
#[async_trait]
pub trait AlarmHandler: Send + Sync {
    async fn on_alarm(&self);
}
