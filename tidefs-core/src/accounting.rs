//! Usage accounting: transfer counters and last-read persistence.
//!
//! Samples each live engine's cumulative byte counters on the accounting
//! cadence, adds the deltas to the item's persisted totals, and flushes the
//! runtime last-read timestamp. Nothing is written when nothing changed,
//! which keeps reads from turning into store writes while bounding
//! accounting drift to one sampling interval.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::catalog::ItemCatalog;
use crate::registry::EngineRegistry;
use crate::store::ItemPatch;

pub struct UsageAccountant {
    catalog: Arc<ItemCatalog>,
    registry: Arc<EngineRegistry>,
}

impl UsageAccountant {
    pub fn new(catalog: Arc<ItemCatalog>, registry: Arc<EngineRegistry>) -> Self {
        Self { catalog, registry }
    }

    /// Samples every live engine once.
    pub async fn sample(&self) {
        for entry in self.registry.live_entries().await {
            let Some(item) = self.catalog.item(entry.item_id) else {
                continue;
            };

            let uploaded = entry.engine.uploaded();
            let downloaded = entry.engine.downloaded();
            let uploaded_delta =
                uploaded.saturating_sub(entry.last_sampled_uploaded.swap(uploaded, Ordering::SeqCst));
            let downloaded_delta = downloaded
                .saturating_sub(entry.last_sampled_downloaded.swap(downloaded, Ordering::SeqCst));

            let last_read = entry.last_read_at();
            let read_changed = last_read.is_some() && last_read != item.last_read_at;

            if uploaded_delta == 0 && downloaded_delta == 0 && !read_changed {
                continue;
            }

            let patch = ItemPatch {
                total_uploaded: (uploaded_delta > 0)
                    .then_some(item.total_uploaded + uploaded_delta),
                total_downloaded: (downloaded_delta > 0)
                    .then_some(item.total_downloaded + downloaded_delta),
                last_read_at: if read_changed { last_read } else { None },
                ..Default::default()
            };

            tracing::debug!(
                "Accounting item {}: +{uploaded_delta} up, +{downloaded_delta} down",
                entry.item_id
            );
            if let Err(e) = self.catalog.update(entry.item_id, patch).await {
                tracing::warn!("Persisting usage for item {} failed: {e}", entry.item_id);
            }
        }
    }
}
