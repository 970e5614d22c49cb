//! In-process replica of the tracked-item records.
//!
//! The catalog caches store records as immutable `Arc<TrackedItem>` snapshots
//! swapped atomically on every change, so readers never observe a
//! half-updated record. Fields this core mutates (state, counters, seed
//! hours, last-read) are written through to the store and stay authoritative
//! in memory; fields mutated externally (new records, deletions, the
//! delete-requested flag) are picked up by the periodic sync.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::store::{ItemId, ItemPatch, RecordStore, StoreError, TrackedItem};

struct CatalogInner {
    items: HashMap<ItemId, Arc<TrackedItem>>,
    generation: u64,
}

/// Cached, periodically refreshed view of the record store.
pub struct ItemCatalog {
    store: Arc<dyn RecordStore>,
    inner: RwLock<CatalogInner>,
}

impl ItemCatalog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            inner: RwLock::new(CatalogInner {
                items: HashMap::new(),
                generation: 0,
            }),
        }
    }

    /// The backing record store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Monotonic counter bumped whenever the cached item set changes.
    ///
    /// An unchanged generation lets consumers skip rebuilding derived
    /// structures.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Current records, unordered.
    pub fn snapshot(&self) -> Vec<Arc<TrackedItem>> {
        self.inner.read().items.values().cloned().collect()
    }

    /// One record by id.
    pub fn item(&self, id: ItemId) -> Option<Arc<TrackedItem>> {
        self.inner.read().items.get(&id).cloned()
    }

    /// Re-reads the store and merges external changes into the cache.
    ///
    /// New records are added, vanished records dropped, and the
    /// `delete_requested` flag overlaid onto cached records. All other
    /// fields of already-cached records are daemon-owned and left alone.
    /// Store read failures are logged and leave the cache untouched.
    pub async fn sync_from_store(&self) {
        let fetched = match self.store.fetch_all().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Catalog sync failed, keeping cached records: {e}");
                return;
            }
        };

        let mut inner = self.inner.write();
        let mut changed = false;
        let mut seen = HashMap::with_capacity(fetched.len());

        for incoming in fetched {
            let id = incoming.id;
            match inner.items.get(&id) {
                None => {
                    tracing::debug!("Discovered item {id} ({})", incoming.name);
                    seen.insert(id, Arc::new(incoming));
                    changed = true;
                }
                Some(cached) => {
                    if cached.delete_requested != incoming.delete_requested {
                        let mut updated = (**cached).clone();
                        updated.delete_requested = incoming.delete_requested;
                        seen.insert(id, Arc::new(updated));
                        changed = true;
                    } else {
                        seen.insert(id, cached.clone());
                    }
                }
            }
        }

        if seen.len() != inner.items.len() {
            changed = true;
        }

        if changed {
            inner.items = seen;
            inner.generation += 1;
        }
    }

    /// Applies a patch: persists it through the store, then swaps the cached
    /// record.
    ///
    /// A failed persist is logged and the in-memory record still updated;
    /// memory stays authoritative until the next successful write.
    pub async fn update(&self, id: ItemId, patch: ItemPatch) -> Result<Arc<TrackedItem>, StoreError> {
        if self.item(id).is_none() {
            return Err(StoreError::ItemNotFound { id });
        }

        if let Err(e) = self.store.update(id, patch.clone()).await {
            tracing::warn!("Persisting update for item {id} failed: {e}");
        }

        let mut inner = self.inner.write();
        let cached = inner
            .items
            .get(&id)
            .ok_or(StoreError::ItemNotFound { id })?;
        let mut updated = (**cached).clone();
        patch.apply(&mut updated);
        let updated = Arc::new(updated);
        inner.items.insert(id, updated.clone());
        inner.generation += 1;
        Ok(updated)
    }

    /// Deletes the record from the store and drops it from the cache.
    ///
    /// The cache entry is dropped even if the store delete fails, so path
    /// resolution stops immediately; the orphaned record is retried on a
    /// later deletion pass.
    pub async fn remove(&self, id: ItemId) {
        if let Err(e) = self.store.delete(id).await {
            tracing::warn!("Deleting item {id} from store failed: {e}");
        }

        let mut inner = self.inner.write();
        if inner.items.remove(&id).is_some() {
            inner.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ItemSource, ItemState, JsonFileStore, NewItem};

    async fn catalog_with_store() -> (tempfile::TempDir, Arc<ItemCatalog>) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("items.json"))
            .await
            .unwrap();
        let catalog = Arc::new(ItemCatalog::new(Arc::new(store)));
        (dir, catalog)
    }

    fn magnet_item(name: &str) -> NewItem {
        NewItem {
            source: ItemSource::Magnet(format!("magnet:?xt=urn:btih:{name}")),
            name: name.to_string(),
            info_hash: None,
            category: None,
        }
    }

    #[tokio::test]
    async fn test_sync_discovers_new_items() {
        let (_dir, catalog) = catalog_with_store().await;
        assert_eq!(catalog.generation(), 0);

        catalog.store().insert(magnet_item("a")).await.unwrap();
        catalog.sync_from_store().await;

        assert_eq!(catalog.snapshot().len(), 1);
        let generation = catalog.generation();
        assert!(generation > 0);

        // Unchanged store leaves the generation alone
        catalog.sync_from_store().await;
        assert_eq!(catalog.generation(), generation);
    }

    #[tokio::test]
    async fn test_sync_overlays_delete_flag_only() {
        let (_dir, catalog) = catalog_with_store().await;
        let record = catalog.store().insert(magnet_item("a")).await.unwrap();
        catalog.sync_from_store().await;

        // Daemon-owned field changed in memory and persisted
        catalog
            .update(
                record.id,
                ItemPatch {
                    state: Some(ItemState::Leech),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // External writer flags deletion
        catalog
            .store()
            .update(
                record.id,
                ItemPatch {
                    delete_requested: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        catalog.sync_from_store().await;
        let cached = catalog.item(record.id).unwrap();
        assert!(cached.delete_requested);
        assert_eq!(cached.state, Some(ItemState::Leech));
    }

    #[tokio::test]
    async fn test_update_swaps_new_arc() {
        let (_dir, catalog) = catalog_with_store().await;
        let record = catalog.store().insert(magnet_item("a")).await.unwrap();
        catalog.sync_from_store().await;

        let before = catalog.item(record.id).unwrap();
        let after = catalog
            .update(
                record.id,
                ItemPatch {
                    seed_hours: Some(7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(before.seed_hours, 0);
        assert_eq!(after.seed_hours, 7);
        assert_eq!(catalog.item(record.id).unwrap().seed_hours, 7);
    }

    #[tokio::test]
    async fn test_remove_drops_cache_and_store() {
        let (_dir, catalog) = catalog_with_store().await;
        let record = catalog.store().insert(magnet_item("a")).await.unwrap();
        catalog.sync_from_store().await;

        catalog.remove(record.id).await;

        assert!(catalog.item(record.id).is_none());
        assert!(catalog.store().fetch_all().await.unwrap().is_empty());
    }
}
