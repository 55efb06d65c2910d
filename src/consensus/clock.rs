//! Background tick driver.
//!
//! Hosts with their own simulation loop call [`ConsensusEngine::tick`]
//! directly. Hosts without one can let a [`RoundClock`] advance the engine
//! on a fixed wall-clock period.

use crate::consensus::engine::ConsensusEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Periodically advances an engine until shut down.
pub struct RoundClock {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl RoundClock {
    /// Start ticking `engine` every `period` on the current runtime.
    pub fn spawn(engine: Arc<ConsensusEngine>, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick completes immediately.
            ticker.tick().await;
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        debug!("round clock received shutdown signal");
                        break;
                    }

                    _ = ticker.tick() => {
                        let tick = engine.tick();
                        ticks += 1;
                        debug!(tick, "engine advanced");
                    }
                }
            }
            ticks
        });
        info!(period_ms = period.as_millis() as u64, "round clock started");
        Self { shutdown, handle }
    }

    /// Stop the clock. Returns how many ticks it drove.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        let ticks = self.handle.await.unwrap_or(0);
        info!(ticks, "round clock stopped");
        ticks
    }
}
