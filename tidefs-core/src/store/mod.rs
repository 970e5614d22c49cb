//! Persisted item records and the record store interface.
//!
//! Defines the `TrackedItem` model (one record per torrent) and the
//! `RecordStore` trait the orchestration layer persists through. The store
//! owns the records; the in-process catalog is a cached read replica with
//! write-through for the fields this core mutates.

pub mod json_store;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use json_store::JsonFileStore;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| StoreError::InvalidRecord {
            reason: format!("Invalid info hash hex: {s}"),
        })?;
        let hash: [u8; 20] = bytes.try_into().map_err(|_| StoreError::InvalidRecord {
            reason: format!("Info hash must be 20 bytes: {s}"),
        })?;
        Ok(Self(hash))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Stable identifier assigned to a tracked item by the record store.
///
/// Monotonically increasing, so `fetch_after` can discover records added
/// since the last sync.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl ItemId {
    /// Returns the underlying id as u64.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operating state of a tracked item, as persisted.
///
/// `Idle` is retained for record compatibility but is never entered by the
/// current retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemState {
    /// Actively trying to complete the download
    Leech,
    /// Download complete, uploading to peers
    Seed,
    /// Engine stopped but cached data retained
    Idle,
    /// Cached data deliberately discarded; resumes into Leech on next access
    Freed,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Leech => write!(f, "LEECH"),
            ItemState::Seed => write!(f, "SEED"),
            ItemState::Idle => write!(f, "IDLE"),
            ItemState::Freed => write!(f, "FREED"),
        }
    }
}

/// Where an item's torrent comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    /// Magnet URI
    Magnet(String),
    /// Hex-encoded raw .torrent descriptor
    RawDescriptor(String),
}

/// One file within an item, as resolved from the swarm and cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the mount (or category) root; the first segment is
    /// the item's own directory
    pub path: String,
    /// Declared length in bytes
    pub length: u64,
}

/// One record per tracked torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: ItemId,
    pub source: ItemSource,
    pub name: String,
    pub info_hash: Option<InfoHash>,
    #[serde(default)]
    pub category: Option<String>,
    /// Derived once from the swarm on first readiness, then cached
    #[serde(default)]
    pub file_list: Vec<FileEntry>,
    #[serde(default)]
    pub state: Option<ItemState>,
    #[serde(default)]
    pub seed_hours: u32,
    #[serde(default)]
    pub total_uploaded: u64,
    #[serde(default)]
    pub total_downloaded: u64,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delete_requested: bool,
}

impl TrackedItem {
    /// True when the swarm has resolved this item's files at least once.
    pub fn is_resolved(&self) -> bool {
        !self.file_list.is_empty()
    }
}

/// Insert payload; the store assigns the id and zeroes the counters.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub source: ItemSource,
    pub name: String,
    pub info_hash: Option<InfoHash>,
    pub category: Option<String>,
}

/// Partial update applied to a stored record.
///
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub info_hash: Option<InfoHash>,
    pub file_list: Option<Vec<FileEntry>>,
    pub state: Option<ItemState>,
    pub seed_hours: Option<u32>,
    pub total_uploaded: Option<u64>,
    pub total_downloaded: Option<u64>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub delete_requested: Option<bool>,
}

impl ItemPatch {
    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.info_hash.is_none()
            && self.file_list.is_none()
            && self.state.is_none()
            && self.seed_hours.is_none()
            && self.total_uploaded.is_none()
            && self.total_downloaded.is_none()
            && self.last_read_at.is_none()
            && self.delete_requested.is_none()
    }

    /// Applies the patch to a record in place.
    pub fn apply(&self, item: &mut TrackedItem) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(info_hash) = self.info_hash {
            item.info_hash = Some(info_hash);
        }
        if let Some(file_list) = &self.file_list {
            item.file_list = file_list.clone();
        }
        if let Some(state) = self.state {
            item.state = Some(state);
        }
        if let Some(seed_hours) = self.seed_hours {
            item.seed_hours = seed_hours;
        }
        if let Some(total_uploaded) = self.total_uploaded {
            item.total_uploaded = total_uploaded;
        }
        if let Some(total_downloaded) = self.total_downloaded {
            item.total_downloaded = total_downloaded;
        }
        if let Some(last_read_at) = self.last_read_at {
            item.last_read_at = Some(last_read_at);
        }
        if let Some(delete_requested) = self.delete_requested {
            item.delete_requested = delete_requested;
        }
    }
}

/// Record-oriented storage for tracked items.
///
/// Implementations handle storage backend details; callers treat failures
/// per the recovery policy (log, stay authoritative in memory, retry on the
/// next write) rather than propagating them to filesystem callers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record, assigning the next id.
    ///
    /// # Errors
    /// - `StoreError::Io` - Backend read/write failed
    async fn insert(&self, item: NewItem) -> Result<TrackedItem, StoreError>;

    /// Fetches every stored record.
    ///
    /// # Errors
    /// - `StoreError::Io` - Backend read failed
    async fn fetch_all(&self) -> Result<Vec<TrackedItem>, StoreError>;

    /// Fetches records with ids strictly greater than `after`.
    ///
    /// Supports incremental discovery of newly added items.
    ///
    /// # Errors
    /// - `StoreError::Io` - Backend read failed
    async fn fetch_after(&self, after: ItemId) -> Result<Vec<TrackedItem>, StoreError>;

    /// Applies a partial field update to one record.
    ///
    /// # Errors
    /// - `StoreError::ItemNotFound` - No record with this id
    /// - `StoreError::Io` - Backend read/write failed
    async fn update(&self, id: ItemId, patch: ItemPatch) -> Result<(), StoreError>;

    /// Deletes one record.
    ///
    /// # Errors
    /// - `StoreError::ItemNotFound` - No record with this id
    /// - `StoreError::Io` - Backend read/write failed
    async fn delete(&self, id: ItemId) -> Result<(), StoreError>;
}

/// Errors that occur during record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists with the requested id
    #[error("Item {id} not found")]
    ItemNotFound {
        /// Id of the missing record
        id: ItemId,
    },

    /// Stored data could not be interpreted
    #[error("Invalid record: {reason}")]
    InvalidRecord { reason: String },

    /// Serialization of records failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display_roundtrip() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        let hex = info_hash.to_string();
        assert_eq!(hex, "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(hex.parse::<InfoHash>().unwrap(), info_hash);
    }

    #[test]
    fn test_info_hash_rejects_bad_input() {
        assert!("zz".parse::<InfoHash>().is_err());
        assert!("0123".parse::<InfoHash>().is_err());
    }

    #[test]
    fn test_item_state_serde_uses_legacy_names() {
        let json = serde_json::to_string(&ItemState::Leech).unwrap();
        assert_eq!(json, "\"LEECH\"");
        let state: ItemState = serde_json::from_str("\"FREED\"").unwrap();
        assert_eq!(state, ItemState::Freed);
    }

    #[test]
    fn test_patch_apply() {
        let mut item = TrackedItem {
            id: ItemId(1),
            source: ItemSource::Magnet("magnet:?xt=urn:btih:00".into()),
            name: "old".into(),
            info_hash: None,
            category: None,
            file_list: Vec::new(),
            state: None,
            seed_hours: 0,
            total_uploaded: 0,
            total_downloaded: 0,
            last_read_at: None,
            delete_requested: false,
        };

        let patch = ItemPatch {
            state: Some(ItemState::Seed),
            seed_hours: Some(3),
            ..Default::default()
        };
        patch.apply(&mut item);

        assert_eq!(item.state, Some(ItemState::Seed));
        assert_eq!(item.seed_hours, 3);
        assert_eq!(item.name, "old");
    }

    #[test]
    fn test_empty_patch() {
        assert!(ItemPatch::default().is_empty());
        let patch = ItemPatch {
            seed_hours: Some(1),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
