use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::events::trigger::{Trigger, TriggerEvent};

/// Spawns a tokio task that emits TriggerEvents every `trigger.period()`,
/// starting after `trigger.first_delay()`. Returns `None` for non-periodic
/// triggers and for a zero period. Ticks missed while the runtime was busy
/// are dropped, never replayed.
pub fn spawn_interval_trigger(
    pipeline: String,
    trigger: Trigger,
    sender: mpsc::Sender<TriggerEvent>,
) -> Option<JoinHandle<()>> {
    let period = trigger.period()?;
    if period.is_zero() {
        tracing::warn!(pipeline = %pipeline, %trigger, "zero schedule period, not scheduling");
        return None;
    }
    let first = trigger.first_delay(Utc::now())?;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let event = TriggerEvent {
                pipeline: pipeline.clone(),
                trigger: trigger.clone(),
            };
            if sender.send(event).await.is_err() {
                // Receiver dropped, stop producing
                break;
            }
        }
    }))
}
