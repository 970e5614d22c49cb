//! Tidefs Core - BitTorrent-backed read-only virtual filesystem
//!
//! This crate provides the orchestration layer that exposes tracked torrents
//! as a directory tree of ordinary files: item catalog and namespace
//! resolution, per-item engine lifecycle, read-session management, usage
//! accounting, and the filesystem bridge handlers.

pub mod accounting;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod lifecycle;
pub mod namespace;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod swarm;
pub mod tracing_setup;
pub mod vfs;

// Re-export main types for convenient access
pub use catalog::ItemCatalog;
pub use config::TidefsConfig;
pub use daemon::TidefsDaemon;
pub use namespace::NamespaceResolver;
pub use registry::EngineRegistry;
pub use store::{InfoHash, ItemId, ItemState, RecordStore, StoreError, TrackedItem};
pub use swarm::{EngineLauncher, SwarmEngine, SwarmError, SwarmEvent};
pub use vfs::{FsError, TorrentVfs};

/// Core errors that can bubble up from any tidefs subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TidefsError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidefsError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TidefsError::Store(e) => match e {
                StoreError::ItemNotFound { id } => format!("Item {id} not found"),
                _ => "Record store error occurred".to_string(),
            },
            TidefsError::Swarm(_) => "Swarm engine error occurred".to_string(),
            TidefsError::Fs(_) => "Filesystem error occurred".to_string(),
            TidefsError::Configuration { reason } => format!("Configuration error: {reason}"),
            TidefsError::Io(_) => "File system error occurred".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TidefsError>;
