//! Background sweep stopping instances older than the configured maximum runtime.

use crate::manager::InstanceManager;
use chrono::{DateTime, Utc};
use ctf_common::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Reaper {
    manager: InstanceManager,
    max_runtime: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(manager: InstanceManager) -> Self {
        let max_runtime = manager.config().max_runtime;
        let interval = manager.config().reaper_interval;
        Self {
            manager,
            max_runtime,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn expired(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // A limit past chrono's range never elapses.
        match chrono::Duration::from_std(self.max_runtime) {
            Ok(limit) => now - started_at > limit,
            Err(_) => false,
        }
    }

    /// One pass over every tagged instance. Returns the ids stopped.
    ///
    /// A failed stop is logged and the pass moves on to the next candidate.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let tagged = self.manager.list_tagged().await?;
        let mut stopped = Vec::new();

        for container in tagged {
            let Some(started_at) = container.started_at else {
                warn!(instance_id = %container.instance_id, "Instance has no readable start time, skipping");
                continue;
            };
            if !self.expired(started_at, now) {
                continue;
            }
            match self.manager.stop(&container.instance_id).await {
                Ok(_) => {
                    info!(instance_id = %container.instance_id, owner_id = %container.owner_id, "Reaped expired instance");
                    stopped.push(container.instance_id);
                }
                Err(e) => {
                    error!(instance_id = %container.instance_id, error = %e, "Failed to reap instance");
                }
            }
        }
        Ok(stopped)
    }

    pub async fn sweep(&self) -> Result<Vec<String>> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweeps every `interval` until `shutdown` flips to `true` or its sender
    /// is dropped. The first sweep happens one interval after start.
    ///
    /// The interval is clamped to between one second and one day.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.interval.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
        info!(
            interval_secs = period.as_secs(),
            max_runtime_secs = self.max_runtime.as_secs(),
            "Reaper started"
        );
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(stopped) if stopped.is_empty() => debug!("Reaper sweep found nothing to stop"),
                        Ok(stopped) => info!(count = stopped.len(), ?stopped, "Reaper sweep complete"),
                        Err(e) => error!(error = %e, "Reaper sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reaper stopped");
    }
}
