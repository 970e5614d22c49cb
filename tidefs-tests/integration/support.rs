//! Shared fixtures for the integration suite.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tidefs_core::config::TidefsConfig;
use tidefs_core::daemon::TidefsDaemon;
use tidefs_core::store::{ItemSource, JsonFileStore, NewItem, RecordStore, TrackedItem};
use tidefs_sim::{SimConfig, SimLauncher};

pub struct TestBed {
    pub _dir: tempfile::TempDir,
    pub store: Arc<dyn RecordStore>,
    pub launcher: Arc<SimLauncher>,
}

impl TestBed {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("items.json");
        let store: Arc<dyn RecordStore> =
            Arc::new(JsonFileStore::open(&store_path).await.unwrap());
        let launcher = SimLauncher::new(SimConfig {
            ready_delay: Duration::from_millis(2),
            ..Default::default()
        });
        Self {
            _dir: dir,
            store,
            launcher,
        }
    }

    pub async fn insert_magnet(&self, name: &str, category: Option<&str>) -> TrackedItem {
        self.store
            .insert(NewItem {
                source: ItemSource::Magnet(magnet_for(name)),
                name: name.to_string(),
                info_hash: None,
                category: category.map(|c| c.to_string()),
            })
            .await
            .unwrap()
    }

    pub async fn start_daemon(&self) -> TidefsDaemon {
        TidefsDaemon::start(
            TidefsConfig::for_testing(),
            self.store.clone(),
            self.launcher.clone(),
        )
        .await
    }

    pub async fn fetch(&self, name: &str) -> Option<TrackedItem> {
        self.store
            .fetch_all()
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.name == name)
    }
}

pub fn magnet_for(name: &str) -> String {
    format!("magnet:?xt=urn:btih:0000000000000000000000000000000000000000&dn={name}")
}

/// Polls `check` until it returns true or the timeout elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
