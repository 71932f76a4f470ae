use std::time::Duration;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::EltResult;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};

/// An external precondition polled until it holds.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// `Ok(true)` once the condition holds. Errors count as "not yet".
    async fn poll(&self) -> EltResult<bool>;
}

/// Floor for `poke_interval`; a zero interval would spin on the sensor.
pub const MIN_POKE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorConfig {
    pub poke_interval: Duration,
    pub timeout: Duration,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            poke_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorState {
    Waiting,
    Satisfied,
    TimedOut,
}

/// Outcome of a poll loop: how many pokes it took and the final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorOutcome {
    pub state: SensorState,
    pub pokes: u32,
}

/// Poll `sensor` until satisfied, the deadline passes or the run is cancelled.
///
/// The first poke happens immediately; later pokes are `poke_interval` apart.
/// The sensor never fails before `timeout` has elapsed, and a single poke
/// that hangs is abandoned at the deadline.
pub async fn wait_for(
    name: &str,
    sensor: &dyn Sensor,
    config: SensorConfig,
    cancel: &mut watch::Receiver<bool>,
) -> EltResult<SensorOutcome> {
    let started = Instant::now();
    let deadline = started + config.timeout;
    let poke_interval = config.poke_interval.max(MIN_POKE_INTERVAL);
    let mut pokes = 0u32;

    loop {
        if *cancel.borrow() {
            return Err(Error::Cancelled);
        }

        pokes += 1;
        let poked = tokio::select! {
            poked = timeout_at(deadline, sensor.poll()) => poked,
            Ok(()) = cancel.changed() => continue,
        };
        match poked {
            Err(_elapsed) => tracing::warn!(sensor = name, pokes, "poke still pending at deadline"),
            Ok(Ok(true)) => {
                tracing::info!(sensor = name, pokes, "sensor satisfied");
                return Ok(SensorOutcome {
                    state: SensorState::Satisfied,
                    pokes,
                });
            }
            Ok(Ok(false)) => tracing::debug!(sensor = name, pokes, "condition not met yet"),
            Ok(Err(e)) => tracing::warn!(sensor = name, pokes, error = %e, "poke failed, will retry"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::SensorTimeout {
                sensor: name.to_string(),
                waited: now - started,
            });
        }

        let next = (now + poke_interval).min(deadline);
        tokio::select! {
            _ = sleep_until(next) => {}
            changed = cancel.changed() => {
                // Sender gone: nobody can cancel any more, keep waiting.
                if changed.is_err() {
                    sleep_until(next).await;
                }
            }
        }
    }
}
