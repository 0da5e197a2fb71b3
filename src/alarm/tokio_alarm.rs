use super::{AlarmHandler, Clock, EpochMs, WakeAlarm};
use crate::{Error, Result};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex, OnceLock, Weak},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

struct Armed {
    epoch: EpochMs,
    generation: u64,
    handle: JoinHandle<()>,
}

struct Shared {
    handler: OnceLock<Weak<dyn AlarmHandler>>,
    armed: Mutex<Option<Armed>>,
}

impl Shared {
    fn armed(&self) -> Result<std::sync::MutexGuard<'_, Option<Armed>>> {
        self.armed
            .lock()
            .map_err(|e| Error::internal(format!("Mutex lock failed: {e}")))
    }
}

/// [`WakeAlarm`] implemented with a tokio sleep task.
///
/// The task is replaced on every re-arm. When it fires it disarms itself and
/// then calls the bound [`AlarmHandler`].
pub struct TokioAlarm {
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl TokioAlarm {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shared: Arc::new(Shared {
                handler: OnceLock::new(),
                armed: Mutex::new(None),
            }),
            next_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Wires the callback target. Only the first binding takes effect.
    pub fn bind(&self, handler: Weak<dyn AlarmHandler>) {
        if self.shared.handler.set(handler).is_err() {
            warn!("Alarm already bound to a handler, ignoring rebind");
        }
    }
}

#[async_trait]
impl WakeAlarm for TokioAlarm {
    async fn set_alarm(&self, epoch: EpochMs) -> Result<()> {
        let delay_ms = epoch.saturating_sub(self.clock.now_ms()).max(0) as u64;
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);

        // Hold the slot while spawning so an already-due task can't look
        // before it has been registered.
        let mut armed = self.shared.armed()?;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let still_armed = match shared.armed() {
                Ok(mut armed) => match armed.as_ref() {
                    Some(current) if current.generation == generation => {
                        armed.take();
                        true
                    }
                    _ => false,
                },
                Err(e) => {
                    warn!("Alarm state unavailable: {}", e);
                    false
                }
            };
            if !still_armed {
                trace!(epoch, "Stale alarm task, not firing");
                return;
            }

            match shared.handler.get().and_then(Weak::upgrade) {
                Some(handler) => {
                    debug!(epoch, "⏰ Alarm fired");
                    handler.on_alarm().await;
                }
                None => warn!(epoch, "Alarm fired with no live handler"),
            }
        });

        let previous = armed.replace(Armed {
            epoch,
            generation,
            handle,
        });
        drop(armed);
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        debug!(epoch, delay_ms, "Alarm armed");
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<EpochMs>> {
        Ok(self.shared.armed()?.as_ref().map(|armed| armed.epoch))
    }

    async fn delete_alarm(&self) -> Result<()> {
        if let Some(previous) = self.shared.armed()?.take() {
            previous.handle.abort();
            debug!(epoch = previous.epoch, "Alarm disarmed");
        }
        Ok(())
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        if let Ok(mut armed) = self.shared.armed.lock() {
            if let Some(previous) = armed.take() {
                previous.handle.abort();
            }
        }
    }
}
