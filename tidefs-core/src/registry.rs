//! Engine registry: at most one live swarm engine per active item.
//!
//! Engines start lazily on first acquisition, are reused while live, and are
//! torn down by lifecycle transitions (freed, deleted, shutdown). All
//! mutations of the id-to-engine map serialize through one async mutex, so
//! concurrent acquisitions can never launch duplicate engines. Each engine's
//! event channel is drained by a dedicated pump task that feeds the
//! lifecycle state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::catalog::ItemCatalog;
use crate::config::SwarmConfig;
use crate::namespace::namespaced_file_list;
use crate::store::{FileEntry, InfoHash, ItemId, ItemPatch, ItemState, TrackedItem};
use crate::swarm::{EngineLauncher, SwarmEngine, SwarmError, SwarmEvent};

/// Runtime handle for one item's live engine.
///
/// Never persisted; destroyed on any lifecycle transition that tears the
/// engine down.
pub struct EngineEntry {
    pub item_id: ItemId,
    pub engine: Arc<dyn SwarmEngine>,
    ready_rx: watch::Receiver<bool>,
    listening: AtomicBool,
    deleting: AtomicBool,
    /// Set while the swarm reports no outstanding demand
    pub interest_lost_at: Mutex<Option<Instant>>,
    /// Epoch of the last seed-hour credit, while seeding
    pub seed_credit_at: Mutex<Option<Instant>>,
    /// Counter values at the accountant's last sample
    pub last_sampled_uploaded: AtomicU64,
    pub last_sampled_downloaded: AtomicU64,
    last_read_at: Mutex<Option<DateTime<Utc>>>,
}

impl EngineEntry {
    /// Suspends until the engine has resolved its file list.
    ///
    /// # Errors
    /// - `SwarmError::EngineStopped` - Engine torn down before readiness
    pub async fn wait_ready(&self) -> Result<(), SwarmError> {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| SwarmError::EngineStopped)?;
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Records a successful read now, for idle detection and accounting.
    pub fn signal_read(&self) {
        *self.last_read_at.lock() = Some(Utc::now());
    }

    pub fn last_read_at(&self) -> Option<DateTime<Utc>> {
        *self.last_read_at.lock()
    }
}

/// Registry of live engines, keyed by item id.
pub struct EngineRegistry {
    launcher: Arc<dyn EngineLauncher>,
    catalog: Arc<ItemCatalog>,
    swarm_config: SwarmConfig,
    entries: AsyncMutex<HashMap<ItemId, Arc<EngineEntry>>>,
}

impl EngineRegistry {
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        catalog: Arc<ItemCatalog>,
        swarm_config: SwarmConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            catalog,
            swarm_config,
            entries: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Returns the live engine for `item`, launching one if absent.
    ///
    /// Idempotent per item; the map mutex doubles as the lazy-construction
    /// guard. Items already marked for deletion skip normal startup: their
    /// engine only runs long enough to reach readiness and be torn down.
    ///
    /// # Errors
    /// - `SwarmError::InvalidSource` - The item's source cannot be launched
    pub async fn acquire(
        self: &Arc<Self>,
        item: &Arc<TrackedItem>,
    ) -> Result<Arc<EngineEntry>, SwarmError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&item.id) {
            return Ok(entry.clone());
        }

        let (engine, events) = self
            .launcher
            .launch(&item.source, &self.swarm_config.scratch_dir)
            .await?;
        let (ready_tx, ready_rx) = watch::channel(false);

        let entry = Arc::new(EngineEntry {
            item_id: item.id,
            engine,
            ready_rx,
            listening: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
            interest_lost_at: Mutex::new(Some(Instant::now())),
            seed_credit_at: Mutex::new(
                matches!(item.state, Some(ItemState::Seed)).then(Instant::now),
            ),
            last_sampled_uploaded: AtomicU64::new(0),
            last_sampled_downloaded: AtomicU64::new(0),
            last_read_at: Mutex::new(item.last_read_at),
        });
        entries.insert(item.id, entry.clone());
        drop(entries);

        tracing::info!(
            "Started engine for item {} ({}, state {})",
            item.id,
            item.name,
            item.state.map_or("new".to_string(), |s| s.to_string())
        );

        tokio::spawn(Self::run_event_pump(
            self.clone(),
            entry.clone(),
            events,
            ready_tx,
        ));

        if !item.delete_requested && matches!(item.state, None | Some(ItemState::Freed)) {
            self.switch_to_leech(&entry).await;
        }

        Ok(entry)
    }

    /// The live entry for `id`, if any.
    pub async fn entry(&self, id: ItemId) -> Option<Arc<EngineEntry>> {
        self.entries.lock().await.get(&id).cloned()
    }

    /// All live entries.
    pub async fn live_entries(&self) -> Vec<Arc<EngineEntry>> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Destroys the live engine for `id`; no-op if absent.
    pub async fn release(&self, id: ItemId) {
        let entry = self.entries.lock().await.remove(&id);
        if let Some(entry) = entry {
            if let Err(e) = entry.engine.destroy().await {
                tracing::warn!("Destroying engine for item {id} failed: {e}");
            }
        }
    }

    /// Destroys the live engine for `id` and discards its cached piece data.
    pub async fn release_and_purge(&self, id: ItemId) {
        let entry = self.entries.lock().await.remove(&id);
        if let Some(entry) = entry {
            if let Err(e) = entry.engine.destroy().await {
                tracing::warn!("Destroying engine for item {id} failed: {e}");
            }
            if let Err(e) = entry.engine.purge_cache().await {
                tracing::warn!("Purging cache for item {id} failed: {e}");
            }
        }
    }

    /// Drives a delete-requested item toward teardown.
    ///
    /// Starts the engine if necessary; deletion itself runs once the engine
    /// reports readiness and takes precedence over every state-driven
    /// transition.
    pub async fn ensure_deletion(self: &Arc<Self>, item: &Arc<TrackedItem>) {
        match self.entry(item.id).await {
            None => {
                if let Err(e) = self.acquire(item).await {
                    tracing::warn!("Starting engine to delete item {} failed: {e}", item.id);
                }
            }
            Some(entry) => {
                if entry.is_ready() {
                    let registry = self.clone();
                    tokio::spawn(async move { registry.run_deletion(entry).await });
                }
            }
        }
    }

    /// Destroys every live engine. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.entries.lock().await.drain().collect();
        futures::future::join_all(entries.into_iter().map(|(id, entry)| async move {
            if let Err(e) = entry.engine.destroy().await {
                tracing::warn!("Destroying engine for item {id} failed: {e}");
            }
        }))
        .await;
    }

    /// Forces the item into the leeching state.
    ///
    /// Clears the disinterest mark, persists the state (resetting
    /// accumulated seed hours), and begins listening if not already.
    async fn switch_to_leech(&self, entry: &Arc<EngineEntry>) {
        let id = entry.item_id;
        let Some(item) = self.catalog.item(id) else {
            return;
        };
        if item.delete_requested {
            return;
        }

        *entry.interest_lost_at.lock() = None;

        if item.state != Some(ItemState::Leech) {
            tracing::info!("LEECH {}", item.name);
            let patch = ItemPatch {
                state: Some(ItemState::Leech),
                seed_hours: Some(0),
                ..Default::default()
            };
            if let Err(e) = self.catalog.update(id, patch).await {
                tracing::warn!("Recording LEECH for item {id} failed: {e}");
            }
        }

        self.start_listening(entry).await;
    }

    async fn start_listening(&self, entry: &Arc<EngineEntry>) {
        if entry.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = entry.engine.listen(self.swarm_config.listen_port).await {
            tracing::warn!("Listen failed for item {}: {e}", entry.item_id);
            entry.listening.store(false, Ordering::SeqCst);
        }
    }

    /// Single consumer of one engine's event channel.
    ///
    /// Ends when the engine drops its sender (destroy or launcher teardown).
    async fn run_event_pump(
        registry: Arc<Self>,
        entry: Arc<EngineEntry>,
        mut events: mpsc::Receiver<SwarmEvent>,
        ready_tx: watch::Sender<bool>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SwarmEvent::Ready { files, info_hash } => {
                    registry
                        .handle_ready(&entry, files, info_hash, &ready_tx)
                        .await;
                }
                SwarmEvent::Interested => {
                    registry.switch_to_leech(&entry).await;
                }
                SwarmEvent::Uninterested => {
                    tracing::debug!("Item {} uninterested", entry.item_id);
                    *entry.interest_lost_at.lock() = Some(Instant::now());
                }
                SwarmEvent::PieceDownloaded { piece } => {
                    tracing::trace!("Item {} received piece {piece}", entry.item_id);
                }
            }
        }
        tracing::debug!("Event channel closed for item {}", entry.item_id);
    }

    async fn handle_ready(
        self: &Arc<Self>,
        entry: &Arc<EngineEntry>,
        files: Vec<FileEntry>,
        info_hash: InfoHash,
        ready_tx: &watch::Sender<bool>,
    ) {
        let id = entry.item_id;
        let Some(item) = self.catalog.item(id) else {
            return;
        };

        if item.delete_requested {
            // Let any pending wait-for-ready complete once, then tear down
            let _ = ready_tx.send(true);
            self.run_deletion(entry.clone()).await;
            return;
        }

        if !item.is_resolved() {
            let files = namespaced_file_list(&item.name, files);
            let patch = ItemPatch {
                file_list: Some(files),
                info_hash: item.info_hash.is_none().then_some(info_hash),
                ..Default::default()
            };
            if let Err(e) = self.catalog.update(id, patch).await {
                tracing::warn!("Caching file list for item {id} failed: {e}");
            }
        }

        tracing::info!("Item {id} ready ({})", item.name);
        let _ = ready_tx.send(true);

        if matches!(item.state, Some(ItemState::Leech) | Some(ItemState::Seed)) {
            self.start_listening(entry).await;
        }
    }

    /// Full teardown of a delete-requested item: destroy the engine, purge
    /// cached data, delete the record, and drop the registry entry.
    async fn run_deletion(&self, entry: Arc<EngineEntry>) {
        if entry.deleting.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = entry.item_id;
        tracing::info!("Deleting item {id}");

        if let Err(e) = entry.engine.destroy().await {
            tracing::warn!("Destroying engine for item {id} failed: {e}");
        }
        if let Err(e) = entry.engine.purge_cache().await {
            tracing::warn!("Purging cache for item {id} failed: {e}");
        }

        self.catalog.remove(id).await;
        self.entries.lock().await.remove(&id);
        tracing::info!("Item {id} deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ItemSource, JsonFileStore, NewItem, RecordStore};
    use crate::swarm::stub::{StubLauncher, test_files};

    async fn setup(
        names: &[&str],
    ) -> (
        tempfile::TempDir,
        Arc<ItemCatalog>,
        Arc<StubLauncher>,
        Arc<EngineRegistry>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(
            JsonFileStore::open(dir.path().join("items.json"))
                .await
                .unwrap(),
        );
        for name in names {
            store
                .insert(NewItem {
                    source: ItemSource::Magnet(format!("magnet:?xt=urn:btih:{name}")),
                    name: name.to_string(),
                    info_hash: None,
                    category: None,
                })
                .await
                .unwrap();
        }
        let catalog = Arc::new(ItemCatalog::new(store));
        catalog.sync_from_store().await;
        let launcher = StubLauncher::new();
        let registry = EngineRegistry::new(launcher.clone(), catalog.clone(), SwarmConfig::default());
        (dir, catalog, launcher, registry)
    }

    fn first_item(catalog: &ItemCatalog) -> Arc<TrackedItem> {
        let mut items = catalog.snapshot();
        items.sort_by_key(|i| i.id);
        items[0].clone()
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let (_dir, catalog, launcher, registry) = setup(&["alpha"]).await;
        let item = first_item(&catalog);

        let first = registry.acquire(&item).await.unwrap();
        let second = registry.acquire(&item).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_item_switches_to_leech_and_listens() {
        let (_dir, catalog, launcher, registry) = setup(&["alpha"]).await;
        let item = first_item(&catalog);

        let entry = registry.acquire(&item).await.unwrap();

        assert_eq!(catalog.item(item.id).unwrap().state, Some(ItemState::Leech));
        assert!(entry.is_listening());
        assert!(launcher.control(0).engine.listen_port().is_some());
        // Fresh items start with no disinterest mark
        assert!(entry.interest_lost_at.lock().is_none());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_dir, catalog, launcher, registry) = setup(&["alpha"]).await;
        let item = first_item(&catalog);
        registry.acquire(&item).await.unwrap();

        registry.release(item.id).await;
        assert!(launcher.control(0).engine.is_destroyed());
        assert!(registry.entry(item.id).await.is_none());

        // Releasing again is a no-op
        registry.release(item.id).await;
    }

    #[tokio::test]
    async fn test_ready_persists_namespaced_file_list() {
        let (_dir, catalog, launcher, registry) = setup(&["alpha"]).await;
        let item = first_item(&catalog);
        registry.acquire(&item).await.unwrap();

        launcher
            .control(0)
            .make_ready(test_files(&[("video.mp4", 100)]))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let cached = catalog.item(item.id).unwrap();
        assert_eq!(cached.file_list.len(), 1);
        assert_eq!(cached.file_list[0].path, "alpha/video.mp4");
        assert!(cached.info_hash.is_some());
    }

    #[tokio::test]
    async fn test_delete_requested_item_is_torn_down_on_ready() {
        let (_dir, catalog, launcher, registry) = setup(&["alpha"]).await;
        let item = first_item(&catalog);
        catalog
            .store()
            .update(
                item.id,
                ItemPatch {
                    delete_requested: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        catalog.sync_from_store().await;
        let item = first_item(&catalog);

        registry.acquire(&item).await.unwrap();
        launcher
            .control(0)
            .make_ready(test_files(&[("video.mp4", 100)]))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(launcher.control(0).engine.is_destroyed());
        assert!(launcher.control(0).engine.is_purged());
        assert!(catalog.item(item.id).is_none());
        assert!(catalog.store().fetch_all().await.unwrap().is_empty());
        assert!(registry.entry(item.id).await.is_none());
    }

    #[tokio::test]
    async fn test_uninterested_then_interested_tracks_demand() {
        let (_dir, catalog, launcher, registry) = setup(&["alpha"]).await;
        let item = first_item(&catalog);
        let entry = registry.acquire(&item).await.unwrap();

        launcher.control(0).uninterested().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(entry.interest_lost_at.lock().is_some());

        launcher.control(0).interested().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(entry.interest_lost_at.lock().is_none());
        assert_eq!(catalog.item(item.id).unwrap().state, Some(ItemState::Leech));
    }
}
