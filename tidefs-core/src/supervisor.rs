//! Consolidated periodic scheduler.
//!
//! One task dispatches the lifecycle tick, the usage-accounting sample, and
//! the catalog/namespace refresh, each at its own jittered cadence, and
//! stops on a shutdown signal. Keeping every timer in one loop means a
//! single cancellation point on shutdown, and a read stall on one item can
//! never delay the ticks (handlers run on their own tasks).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::accounting::UsageAccountant;
use crate::catalog::ItemCatalog;
use crate::config::TidefsConfig;
use crate::lifecycle::LifecycleDriver;
use crate::namespace::NamespaceResolver;

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Spawns the scheduler loop.
    pub fn spawn(
        lifecycle: LifecycleDriver,
        accountant: UsageAccountant,
        namespace: Arc<NamespaceResolver>,
        catalog: Arc<ItemCatalog>,
        config: &TidefsConfig,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let lifecycle_cfg = config.lifecycle.clone();
        let accounting_cfg = config.accounting.clone();
        let refresh_interval = config.namespace.refresh_interval;

        let task = tokio::spawn(async move {
            let mut next_tick =
                Instant::now() + jittered(lifecycle_cfg.tick_interval, lifecycle_cfg.tick_jitter);
            let mut next_sample = Instant::now()
                + jittered(accounting_cfg.sample_interval, accounting_cfg.sample_jitter);
            let mut next_refresh = Instant::now() + refresh_interval;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(next_tick) => {
                        lifecycle.tick().await;
                        next_tick = Instant::now()
                            + jittered(lifecycle_cfg.tick_interval, lifecycle_cfg.tick_jitter);
                    }
                    _ = tokio::time::sleep_until(next_sample) => {
                        accountant.sample().await;
                        next_sample = Instant::now()
                            + jittered(accounting_cfg.sample_interval, accounting_cfg.sample_jitter);
                    }
                    _ = tokio::time::sleep_until(next_refresh) => {
                        catalog.sync_from_store().await;
                        namespace.refresh();
                        next_refresh = Instant::now() + refresh_interval;
                    }
                }
            }
            tracing::debug!("Supervisor stopped");
        });

        Self { shutdown_tx, task }
    }

    /// Signals the loop to stop and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    base + jitter.mul_f64(rand::rng().random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        let jitter = Duration::from_millis(10);
        for _ in 0..50 {
            let d = jittered(base, jitter);
            assert!(d >= base);
            assert!(d <= base + jitter);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let base = Duration::from_millis(100);
        assert_eq!(jittered(base, Duration::ZERO), base);
    }
}
