//! Background Expiry Reaper
//!
//! Lazy expiry only reclaims keys that somebody reads again. A key that
//! expires and is never touched would stay in memory forever, so a
//! background task sweeps the whole keyspace on a fixed period.
//!
//! Each cycle samples the clock once and removes every entry whose deadline
//! is at or before that instant. The task stops when its [`ExpirySweeper`]
//! handle is stopped or dropped.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the expiry reaper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Time between two sweeps (default: 100ms)
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

/// A handle to the running reaper.
///
/// When this handle is dropped, the reaper task is stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the reaper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(engine, config.clone(), shutdown_rx));

        info!(
            interval_ms = config.interval.as_millis() as u64,
            "Background expiry reaper started"
        );

        Self { shutdown_tx }
    }

    /// Stops the reaper. Called automatically on drop.
    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            debug!("Background expiry reaper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    trace!("Expiry reaper received shutdown signal");
                    return;
                }
            }
        }

        let expired = engine.cleanup_expired(Instant::now());

        if expired > 0 {
            debug!(
                expired = expired,
                keys_remaining = engine.len(),
                "Expired keys reclaimed"
            );
        }
    }
}
