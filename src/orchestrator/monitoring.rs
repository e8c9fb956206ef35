//! Periodic health monitor.
//!
//! A background task sweeps every service row on a fixed period, asks the
//! supervisor whether the unit is active, and records transitions on the
//! row together with `last_health_check`. Sweeps are panic-isolated so one
//! bad cycle cannot kill the monitor, and cancellation is cooperative: on
//! shutdown the next scheduled tick is simply skipped.

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::model::ServiceStatus;

use super::Orchestrator;

impl Orchestrator {
    /// Start the health monitor. The task runs until
    /// [`shutdown`](Orchestrator::shutdown) is called.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let period = orchestrator.settings.health_check_period();
            let mut interval = tokio::time::interval(period);
            // The immediate first tick would race service startup; skip it.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = orchestrator.shutdown.cancelled() => {
                        tracing::debug!("health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        // Small jitter so multiple hosts sharing a clock
                        // don't sweep in lockstep.
                        let jitter_ms: u64 = rand::thread_rng().gen_range(0..=500);
                        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

                        let sweep = AssertUnwindSafe(orchestrator.run_health_sweep())
                            .catch_unwind()
                            .await;
                        if let Err(panic) = sweep {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "unknown panic".into());
                            tracing::error!("health sweep panicked: {}", message);
                        }
                    }
                }
            }
        })
    }

    /// One monitor pass over every row. Deploying rows are skipped (the
    /// pipeline owns them); error rows only leave `error` when the unit is
    /// observed running, so a failed deployment stays visible until the
    /// operator acts.
    pub async fn run_health_sweep(&self) {
        let services = match self.repo.list().await {
            Ok(services) => services,
            Err(e) => {
                tracing::error!("health sweep could not list services: {}", e);
                return;
            }
        };

        for mut service in services {
            if service.status == ServiceStatus::Deploying {
                continue;
            }

            let active = self.systemd.is_active(&service.project_name).await;
            let observed = if active {
                ServiceStatus::Active
            } else if service.status == ServiceStatus::Error {
                ServiceStatus::Error
            } else {
                ServiceStatus::Inactive
            };

            if observed != service.status {
                tracing::info!(
                    service = %service.project_name,
                    from = %service.status,
                    to = %observed,
                    "status transition observed"
                );
                service.status = observed;
            }
            service.last_health_check = Some(Utc::now());

            if let Err(e) = self.repo.update(&service).await {
                tracing::warn!(
                    service = %service.project_name,
                    "failed to record health check: {}",
                    e
                );
            }
        }
    }
}
