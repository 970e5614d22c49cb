//! JSON-document record store.
//!
//! One JSON file holds every tracked item. Each operation reloads the
//! document, applies its change, and commits atomically via a temp file and
//! rename, so a CLI process and a running mount daemon sharing the file see
//! each other's record-level writes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ItemId, ItemPatch, NewItem, RecordStore, StoreError, TrackedItem};

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    next_id: u64,
    items: Vec<TrackedItem>,
}

/// File-backed [`RecordStore`] implementation.
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes load-modify-write cycles within this process
    guard: Mutex<()>,
}

impl JsonFileStore {
    /// Opens (or prepares to create) the store at `path`.
    ///
    /// The file itself is created lazily on the first insert.
    ///
    /// # Errors
    /// - `StoreError::Io` - Parent directory could not be created
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            guard: Mutex::new(()),
        })
    }

    /// Default store location under the user's home directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join(".tidefs")
            .join("items.json")
    }

    async fn load(&self) -> Result<StoreDocument, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes)?;
                Ok(doc)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let temp_path = temp_path_for(&self.path);
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

#[async_trait::async_trait]
impl RecordStore for JsonFileStore {
    async fn insert(&self, item: NewItem) -> Result<TrackedItem, StoreError> {
        let _guard = self.guard.lock().await;
        let mut doc = self.load().await?;

        doc.next_id += 1;
        let record = TrackedItem {
            id: ItemId(doc.next_id),
            source: item.source,
            name: item.name,
            info_hash: item.info_hash,
            category: item.category,
            file_list: Vec::new(),
            state: None,
            seed_hours: 0,
            total_uploaded: 0,
            total_downloaded: 0,
            last_read_at: None,
            delete_requested: false,
        };
        doc.items.push(record.clone());

        self.commit(&doc).await?;
        tracing::info!("Inserted item {} ({})", record.id, record.name);
        Ok(record)
    }

    async fn fetch_all(&self) -> Result<Vec<TrackedItem>, StoreError> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.items)
    }

    async fn fetch_after(&self, after: ItemId) -> Result<Vec<TrackedItem>, StoreError> {
        let _guard = self.guard.lock().await;
        let doc = self.load().await?;
        Ok(doc.items.into_iter().filter(|i| i.id > after).collect())
    }

    async fn update(&self, id: ItemId, patch: ItemPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let _guard = self.guard.lock().await;
        let mut doc = self.load().await?;

        let item = doc
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::ItemNotFound { id })?;
        patch.apply(item);

        self.commit(&doc).await
    }

    async fn delete(&self, id: ItemId) -> Result<(), StoreError> {
        let _guard = self.guard.lock().await;
        let mut doc = self.load().await?;

        let before = doc.items.len();
        doc.items.retain(|i| i.id != id);
        if doc.items.len() == before {
            return Err(StoreError::ItemNotFound { id });
        }

        self.commit(&doc).await?;
        tracing::info!("Deleted item {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::ItemSource;
    use super::*;

    fn new_item(name: &str) -> NewItem {
        NewItem {
            source: ItemSource::Magnet(format!("magnet:?xt=urn:btih:{name}")),
            name: name.to_string(),
            info_hash: None,
            category: None,
        }
    }

    async fn temp_store() -> (tempfile::TempDir, JsonFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("items.json"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let (_dir, store) = temp_store().await;

        let a = store.insert(new_item("a")).await.unwrap();
        let b = store.insert(new_item("b")).await.unwrap();

        assert!(b.id > a.id);
        assert_eq!(store.fetch_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_after_returns_only_newer() {
        let (_dir, store) = temp_store().await;

        let a = store.insert(new_item("a")).await.unwrap();
        let b = store.insert(new_item("b")).await.unwrap();

        let newer = store.fetch_after(a.id).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, b.id);
    }

    #[tokio::test]
    async fn test_update_persists_patch() {
        let (_dir, store) = temp_store().await;
        let a = store.insert(new_item("a")).await.unwrap();

        store
            .update(
                a.id,
                ItemPatch {
                    state: Some(crate::store::ItemState::Leech),
                    delete_requested: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all[0].state, Some(crate::store::ItemState::Leech));
        assert!(all[0].delete_requested);
    }

    #[tokio::test]
    async fn test_update_missing_item_fails() {
        let (_dir, store) = temp_store().await;
        let result = store
            .update(
                ItemId(42),
                ItemPatch {
                    seed_hours: Some(1),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::ItemNotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let (_dir, store) = temp_store().await;
        let a = store.insert(new_item("a")).await.unwrap();

        store.delete(a.id).await.unwrap();

        assert!(store.fetch_all().await.unwrap().is_empty());
        assert!(matches!(
            store.delete(a.id).await,
            Err(StoreError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reopen_preserves_id_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let a = store.insert(new_item("a")).await.unwrap();
        store.delete(a.id).await.unwrap();
        drop(store);

        let store = JsonFileStore::open(&path).await.unwrap();
        let b = store.insert(new_item("b")).await.unwrap();
        assert!(b.id > a.id);
    }
}
