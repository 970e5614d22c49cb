//! Deterministic in-memory swarm engines for tidefs.
//!
//! Implements the swarm collaborator traits without any networking: every
//! launched engine resolves the same file layout after a configurable delay
//! and serves bytes computed from a seed derived from the item's source, so
//! reads are reproducible across runs and processes. Used as the
//! development-mode backend and by the integration test suite; a production
//! BitTorrent backend plugs in through the same `EngineLauncher` trait.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tidefs_core::store::{FileEntry, InfoHash, ItemSource};
use tidefs_core::swarm::{EngineLauncher, FileStream, SwarmEngine, SwarmError, SwarmEvent};

/// Behavior knobs for simulated engines.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay before a launched engine emits `Ready`
    pub ready_delay: Duration,
    /// Largest chunk a stream returns per read
    pub chunk_size: usize,
    /// Emit `Uninterested` right after `Ready`; a simulated swarm has all
    /// its pieces, so nothing is ever wanted
    pub uninterested_on_ready: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ready_delay: Duration::from_millis(10),
            chunk_size: 16 * 1024,
            uninterested_on_ready: true,
        }
    }
}

/// File layout every simulated item resolves to.
///
/// Bare paths on purpose: the orchestration layer is responsible for
/// namespacing them under the item's own directory.
fn simulated_files() -> Vec<FileEntry> {
    vec![
        FileEntry {
            path: "video.mp4".to_string(),
            length: 64 * 1024,
        },
        FileEntry {
            path: "extras/sample.txt".to_string(),
            length: 4 * 1024,
        },
    ]
}

/// Seed derived from an item source; FNV-1a over the source text.
pub fn source_seed(source: &ItemSource) -> u64 {
    let text = match source {
        ItemSource::Magnet(url) => url.as_str(),
        ItemSource::RawDescriptor(hex) => hex.as_str(),
    };
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// The byte at `offset` of file `file_index` for an item with `seed`.
///
/// Pure function of its inputs, so tests can predict any read result.
pub fn content_byte(seed: u64, file_index: usize, offset: u64) -> u8 {
    let mixed = seed
        .wrapping_add((file_index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(offset)
        .wrapping_mul(0x2545_f491_4f6c_dd1d);
    (mixed >> 32) as u8
}

/// Expected content of a whole byte range, for assertions.
pub fn expected_content(seed: u64, file_index: usize, range: std::ops::Range<u64>) -> Vec<u8> {
    range
        .map(|offset| content_byte(seed, file_index, offset))
        .collect()
}

/// Launches [`SimSwarmEngine`]s and keeps a control handle per launch.
pub struct SimLauncher {
    config: SimConfig,
    launched: Mutex<Vec<SimControl>>,
}

impl SimLauncher {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            launched: Mutex::new(Vec::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SimConfig::default())
    }

    /// Control handle for the engine launched from `source`, if any.
    ///
    /// Re-launched sources (an item freed and resumed) return the most
    /// recent engine.
    pub fn control_for(&self, source: &ItemSource) -> Option<SimControl> {
        self.launched
            .lock()
            .iter()
            .rev()
            .find(|c| &c.source == source)
            .cloned()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }
}

#[async_trait]
impl EngineLauncher for SimLauncher {
    async fn launch(
        &self,
        source: &ItemSource,
        _scratch_dir: &Path,
    ) -> Result<(Arc<dyn SwarmEngine>, mpsc::Receiver<SwarmEvent>), SwarmError> {
        let seed = source_seed(source);
        let (events_tx, events_rx) = mpsc::channel(16);

        let engine = Arc::new(SimSwarmEngine {
            seed,
            chunk_size: self.config.chunk_size,
            files: Mutex::new(None),
            uploaded: AtomicU64::new(0),
            downloaded: Arc::new(AtomicU64::new(0)),
            destroyed: AtomicBool::new(false),
            purged: AtomicBool::new(false),
            listen_port: Mutex::new(None),
        });

        let control = SimControl {
            source: source.clone(),
            engine: engine.clone(),
            events: events_tx.clone(),
        };
        self.launched.lock().push(control);

        // Resolve metadata after the configured delay, as a real engine
        // would once it has fetched the info dictionary
        let ready_engine = engine.clone();
        let ready_delay = self.config.ready_delay;
        let uninterested = self.config.uninterested_on_ready;
        tokio::spawn(async move {
            tokio::time::sleep(ready_delay).await;
            if ready_engine.destroyed.load(Ordering::SeqCst) {
                return;
            }
            let files = simulated_files();
            *ready_engine.files.lock() = Some(files.clone());
            let info_hash = info_hash_from_seed(ready_engine.seed);
            tracing::debug!("Simulated engine ready (seed {:#x})", ready_engine.seed);
            if events_tx
                .send(SwarmEvent::Ready { files, info_hash })
                .await
                .is_err()
            {
                return;
            }
            if uninterested {
                let _ = events_tx.send(SwarmEvent::Uninterested).await;
            }
        });

        Ok((engine, events_rx))
    }
}

/// Test-side handle for one simulated engine.
#[derive(Clone)]
pub struct SimControl {
    pub source: ItemSource,
    pub engine: Arc<SimSwarmEngine>,
    events: mpsc::Sender<SwarmEvent>,
}

impl SimControl {
    /// Signals renewed swarm demand.
    pub async fn interested(&self) {
        let _ = self.events.send(SwarmEvent::Interested).await;
    }

    /// Signals that nothing more is wanted.
    pub async fn uninterested(&self) {
        let _ = self.events.send(SwarmEvent::Uninterested).await;
    }

    /// Reports a received piece.
    pub async fn piece_downloaded(&self, piece: u32) {
        let _ = self.events.send(SwarmEvent::PieceDownloaded { piece }).await;
    }

    /// Advances the cumulative upload counter, as peer traffic would.
    pub fn add_uploaded(&self, bytes: u64) {
        self.engine.uploaded.fetch_add(bytes, Ordering::SeqCst);
    }
}

fn info_hash_from_seed(seed: u64) -> InfoHash {
    let mut hash = [0u8; 20];
    for (i, chunk) in hash.chunks_mut(8).enumerate() {
        let word = seed.wrapping_mul(i as u64 + 1).to_be_bytes();
        let len = chunk.len();
        chunk.copy_from_slice(&word[..len]);
    }
    InfoHash::new(hash)
}

/// One simulated swarm.
pub struct SimSwarmEngine {
    seed: u64,
    chunk_size: usize,
    files: Mutex<Option<Vec<FileEntry>>>,
    uploaded: AtomicU64,
    // Shared with open streams, which advance it as they serve bytes
    downloaded: Arc<AtomicU64>,
    destroyed: AtomicBool,
    purged: AtomicBool,
    listen_port: Mutex<Option<u16>>,
}

impl SimSwarmEngine {
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_purged(&self) -> bool {
        self.purged.load(Ordering::SeqCst)
    }

    pub fn listen_port(&self) -> Option<u16> {
        *self.listen_port.lock()
    }
}

#[async_trait]
impl SwarmEngine for SimSwarmEngine {
    async fn listen(&self, port: u16) -> Result<(), SwarmError> {
        *self.listen_port.lock() = Some(port);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), SwarmError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn purge_cache(&self) -> Result<(), SwarmError> {
        self.purged.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) {}

    async fn resume(&self) {}

    fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    fn resolved_files(&self) -> Option<Vec<FileEntry>> {
        self.files.lock().clone()
    }

    fn info_hash(&self) -> Option<InfoHash> {
        self.files
            .lock()
            .is_some()
            .then(|| info_hash_from_seed(self.seed))
    }

    async fn open_stream(
        &self,
        file_index: usize,
        start: u64,
    ) -> Result<Box<dyn FileStream>, SwarmError> {
        let files = self.files.lock();
        let Some(files) = files.as_ref() else {
            return Err(SwarmError::NotReady);
        };
        let Some(file) = files.get(file_index) else {
            return Err(SwarmError::FileOutOfRange {
                index: file_index,
                count: files.len(),
            });
        };

        Ok(Box::new(SimStream {
            seed: self.seed,
            file_index,
            pos: start.min(file.length),
            length: file.length,
            chunk_size: self.chunk_size,
            downloaded: self.downloaded.clone(),
        }))
    }
}

struct SimStream {
    seed: u64,
    file_index: usize,
    pos: u64,
    length: u64,
    chunk_size: usize,
    downloaded: Arc<AtomicU64>,
}

#[async_trait]
impl FileStream for SimStream {
    async fn read_at_most(&mut self, max_len: usize) -> Result<Bytes, SwarmError> {
        if self.pos >= self.length {
            return Ok(Bytes::new());
        }
        let remaining = (self.length - self.pos) as usize;
        let len = max_len.min(self.chunk_size).min(remaining);
        let chunk: Vec<u8> = (0..len as u64)
            .map(|i| content_byte(self.seed, self.file_index, self.pos + i))
            .collect();
        self.pos += len as u64;
        self.downloaded.fetch_add(len as u64, Ordering::SeqCst);
        Ok(Bytes::from(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_is_deterministic() {
        let source = ItemSource::Magnet("magnet:?xt=urn:btih:aa".to_string());
        let seed = source_seed(&source);
        assert_eq!(seed, source_seed(&source));
        assert_eq!(
            expected_content(seed, 0, 100..200),
            expected_content(seed, 0, 100..200)
        );
        // Different files diverge
        assert_ne!(
            expected_content(seed, 0, 0..64),
            expected_content(seed, 1, 0..64)
        );
    }

    #[tokio::test]
    async fn test_engine_becomes_ready_and_streams() {
        let launcher = SimLauncher::new(SimConfig {
            ready_delay: Duration::from_millis(1),
            ..Default::default()
        });
        let source = ItemSource::Magnet("magnet:?xt=urn:btih:bb".to_string());
        let (engine, mut events) = launcher.launch(&source, Path::new("/tmp")).await.unwrap();

        match events.recv().await {
            Some(SwarmEvent::Ready { files, .. }) => assert_eq!(files.len(), 2),
            other => panic!("expected Ready, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(SwarmEvent::Uninterested)));

        let seed = source_seed(&source);
        let mut stream = engine.open_stream(0, 16).await.unwrap();
        let chunk = stream.read_at_most(32).await.unwrap();
        assert_eq!(&chunk[..], &expected_content(seed, 0, 16..48)[..]);
        assert_eq!(engine.downloaded(), 32);
    }

    #[tokio::test]
    async fn test_stream_ends_at_file_length() {
        let launcher = SimLauncher::new(SimConfig {
            ready_delay: Duration::from_millis(1),
            ..Default::default()
        });
        let source = ItemSource::Magnet("magnet:?xt=urn:btih:cc".to_string());
        let (engine, mut events) = launcher.launch(&source, Path::new("/tmp")).await.unwrap();
        let Some(SwarmEvent::Ready { files, .. }) = events.recv().await else {
            panic!("expected Ready");
        };

        let length = files[1].length;
        let mut stream = engine.open_stream(1, length - 3).await.unwrap();
        assert_eq!(stream.read_at_most(100).await.unwrap().len(), 3);
        assert!(stream.read_at_most(100).await.unwrap().is_empty());
    }
}
