//! Swarm engine collaborator interface.
//!
//! The BitTorrent engine itself (peer discovery, piece selection, disk
//! caching, wire protocol) is an external collaborator behind these traits.
//! Engines are constructed per item from its source, report their resolved
//! file list once via a `Ready` event, and expose forward-only byte streams
//! over individual files.

#[cfg(any(test, feature = "test-utils"))]
pub mod stub;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::store::{FileEntry, InfoHash, ItemSource};

/// Signals emitted by a swarm engine over its per-item event channel.
///
/// Explicit enum-tagged events with a single consumer per item replace any
/// implicit global event bus.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// Metadata resolved; emitted exactly once
    Ready {
        files: Vec<FileEntry>,
        info_hash: InfoHash,
    },
    /// One piece fully received and verified
    PieceDownloaded { piece: u32 },
    /// The swarm still wants data (pieces remain to fetch)
    Interested,
    /// No more pieces wanted
    Uninterested,
}

/// A running swarm instance for one item.
///
/// Counters are cumulative for the engine's lifetime. All teardown paths go
/// through `destroy`; `purge_cache` additionally discards any cached piece
/// data in the scratch directory.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Starts accepting inbound peer connections.
    async fn listen(&self, port: u16) -> Result<(), SwarmError>;

    /// Stops the engine and releases its network resources.
    async fn destroy(&self) -> Result<(), SwarmError>;

    /// Removes cached piece data from the scratch directory.
    async fn purge_cache(&self) -> Result<(), SwarmError>;

    /// Suspends piece exchange without tearing down connections.
    async fn pause(&self);

    /// Resumes piece exchange after a pause.
    async fn resume(&self);

    /// Cumulative bytes uploaded to peers.
    fn uploaded(&self) -> u64;

    /// Cumulative bytes downloaded from peers.
    fn downloaded(&self) -> u64;

    /// The resolved file list, once the engine has emitted `Ready`.
    fn resolved_files(&self) -> Option<Vec<FileEntry>>;

    /// The torrent's info hash, once resolved.
    fn info_hash(&self) -> Option<InfoHash>;

    /// Opens a forward-only byte stream over one file, starting at `start`.
    ///
    /// # Errors
    /// - `SwarmError::NotReady` - Called before the engine resolved its files
    /// - `SwarmError::FileOutOfRange` - No file at this index
    async fn open_stream(
        &self,
        file_index: usize,
        start: u64,
    ) -> Result<Box<dyn FileStream>, SwarmError>;
}

/// Forward-only byte source over one file inside a swarm.
///
/// Dropping the stream cancels it.
#[async_trait]
pub trait FileStream: Send {
    /// Returns up to `max_len` bytes, suspending until at least one byte is
    /// available. An empty buffer signals end of file.
    ///
    /// There is deliberately no timeout: a stalled swarm leaves the caller
    /// suspended rather than surfacing a spurious I/O error.
    ///
    /// # Errors
    /// - `SwarmError::EngineStopped` - The engine was destroyed mid-read
    async fn read_at_most(&mut self, max_len: usize) -> Result<Bytes, SwarmError>;
}

/// Constructs swarm engines from item sources.
///
/// Implementations own peer-protocol details; the registry only consumes
/// the engine handle and its event channel.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Launches an engine for `source`, caching pieces under `scratch_dir`.
    ///
    /// The returned receiver is the single consumer of this engine's events.
    ///
    /// # Errors
    /// - `SwarmError::InvalidSource` - The source could not be interpreted
    async fn launch(
        &self,
        source: &ItemSource,
        scratch_dir: &Path,
    ) -> Result<(Arc<dyn SwarmEngine>, mpsc::Receiver<SwarmEvent>), SwarmError>;
}

/// Errors that can occur in swarm engine operations.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// The item source could not be interpreted as a torrent
    #[error("Invalid torrent source: {reason}")]
    InvalidSource { reason: String },

    /// Operation requires resolved metadata
    #[error("Engine has not resolved its file list yet")]
    NotReady,

    /// No file exists at the requested index
    #[error("File index {index} out of range ({count} files)")]
    FileOutOfRange { index: usize, count: usize },

    /// The engine was destroyed while an operation was in flight
    #[error("Engine stopped")]
    EngineStopped,

    /// I/O error in the engine's scratch storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
