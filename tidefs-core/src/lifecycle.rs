//! Per-item lifecycle state machine.
//!
//! Wall-clock-driven transitions run only from the supervisor tick, so the
//! tick cadence bounds their latency. Event-driven transitions (interest
//! signals, readiness, deletion) are handled by the engine registry's event
//! pumps; this driver evaluates the time-based conditions: interest grace
//! expiry, seed-hour credits, and the retention policy that frees an item.

use std::sync::Arc;

use chrono::Utc;

use crate::catalog::ItemCatalog;
use crate::config::LifecycleConfig;
use crate::registry::{EngineEntry, EngineRegistry};
use crate::store::{ItemPatch, ItemState, TrackedItem};

/// Evaluates lifecycle transitions on each supervisor tick.
pub struct LifecycleDriver {
    catalog: Arc<ItemCatalog>,
    registry: Arc<EngineRegistry>,
    config: LifecycleConfig,
}

impl LifecycleDriver {
    pub fn new(
        catalog: Arc<ItemCatalog>,
        registry: Arc<EngineRegistry>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            config,
        }
    }

    /// Re-evaluates every tracked item.
    pub async fn tick(&self) {
        for item in self.catalog.snapshot() {
            self.evaluate(&item).await;
        }
    }

    async fn evaluate(&self, item: &Arc<TrackedItem>) {
        // Deletion preempts all state-driven transitions
        if item.delete_requested {
            self.registry.ensure_deletion(item).await;
            return;
        }

        let Some(entry) = self.registry.entry(item.id).await else {
            // Items that were active when last persisted resume their
            // engines; Freed and Idle items stay dormant until a read.
            if matches!(
                item.state,
                None | Some(ItemState::Leech) | Some(ItemState::Seed)
            ) {
                if let Err(e) = self.registry.acquire(item).await {
                    tracing::warn!("Resuming engine for item {} failed: {e}", item.id);
                }
            }
            return;
        };

        match item.state {
            Some(ItemState::Leech) => {
                let lost_at = *entry.interest_lost_at.lock();
                if lost_at.is_some_and(|t| t.elapsed() >= self.config.interest_grace) {
                    self.switch_to_seed(item, &entry).await;
                }
            }
            Some(ItemState::Seed) => {
                self.credit_seed_hours(item, &entry).await;

                // Credit may have bumped the hour counter just now
                let item = self.catalog.item(item.id).unwrap_or_else(|| item.clone());
                if item.seed_hours >= self.config.seed_retention_hours && self.is_idle(&item, &entry)
                {
                    self.switch_to_freed(&item).await;
                }
            }
            _ => {}
        }
    }

    /// The swarm has wanted nothing for the whole grace window.
    async fn switch_to_seed(&self, item: &Arc<TrackedItem>, entry: &Arc<EngineEntry>) {
        tracing::info!("SEED {}", item.name);
        let patch = ItemPatch {
            state: Some(ItemState::Seed),
            ..Default::default()
        };
        if let Err(e) = self.catalog.update(item.id, patch).await {
            tracing::warn!("Recording SEED for item {} failed: {e}", item.id);
        }
        *entry.seed_credit_at.lock() = Some(std::time::Instant::now());
    }

    async fn credit_seed_hours(&self, item: &Arc<TrackedItem>, entry: &Arc<EngineEntry>) {
        let due = {
            let mut credit_at = entry.seed_credit_at.lock();
            match *credit_at {
                Some(epoch) if epoch.elapsed() >= self.config.seed_hour_interval => {
                    *credit_at = Some(std::time::Instant::now());
                    true
                }
                None => {
                    *credit_at = Some(std::time::Instant::now());
                    false
                }
                _ => false,
            }
        };
        if !due {
            return;
        }

        let hours = item.seed_hours + 1;
        tracing::info!("SEED {}h {}", hours, item.name);
        let patch = ItemPatch {
            seed_hours: Some(hours),
            ..Default::default()
        };
        if let Err(e) = self.catalog.update(item.id, patch).await {
            tracing::warn!("Recording seed hours for item {} failed: {e}", item.id);
        }
    }

    fn is_idle(&self, item: &TrackedItem, entry: &Arc<EngineEntry>) -> bool {
        let last_read = entry.last_read_at().or(item.last_read_at);
        let window = chrono::Duration::from_std(self.config.idle_free_window)
            .unwrap_or(chrono::Duration::MAX);
        // An item that was never read counts as idle since forever
        last_read.is_none_or(|t| Utc::now().signed_duration_since(t) >= window)
    }

    /// Retention satisfied: tear down the engine and discard cached pieces.
    async fn switch_to_freed(&self, item: &Arc<TrackedItem>) {
        tracing::info!("FREED {}", item.name);
        let patch = ItemPatch {
            state: Some(ItemState::Freed),
            ..Default::default()
        };
        if let Err(e) = self.catalog.update(item.id, patch).await {
            tracing::warn!("Recording FREED for item {} failed: {e}", item.id);
        }
        self.registry.release_and_purge(item.id).await;
    }
}
