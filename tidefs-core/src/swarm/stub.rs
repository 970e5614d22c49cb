//! Controllable in-memory swarm engine for unit tests.
//!
//! Readiness, interest signals, counters, and per-file content are all
//! driven explicitly by the test. Content availability can be throttled via
//! a watermark to exercise suspended reads.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{EngineLauncher, FileStream, SwarmEngine, SwarmError, SwarmEvent};
use crate::store::{FileEntry, InfoHash, ItemSource};

/// Launcher returning a [`StubControl`] per launched engine, keyed by the
/// order of launches.
#[derive(Default)]
pub struct StubLauncher {
    launched: Mutex<Vec<StubControl>>,
}

/// Test-side handle for one launched stub engine.
#[derive(Clone)]
pub struct StubControl {
    pub source: ItemSource,
    pub engine: Arc<StubSwarm>,
    events: mpsc::Sender<SwarmEvent>,
}

impl StubControl {
    /// Resolves the engine's files and emits `Ready`.
    pub async fn make_ready(&self, files: Vec<(FileEntry, Vec<u8>)>) {
        let entries: Vec<FileEntry> = files.iter().map(|(entry, _)| entry.clone()).collect();
        {
            let mut inner = self.engine.inner.lock();
            inner.files = Some(entries.clone());
            inner.content = files.into_iter().map(|(_, data)| data).collect();
        }
        let info_hash = self.engine.info_hash;
        let _ = self
            .events
            .send(SwarmEvent::Ready {
                files: entries,
                info_hash,
            })
            .await;
    }

    pub async fn interested(&self) {
        let _ = self.events.send(SwarmEvent::Interested).await;
    }

    pub async fn uninterested(&self) {
        let _ = self.events.send(SwarmEvent::Uninterested).await;
    }

    /// Advances the cumulative transfer counters.
    pub fn add_traffic(&self, uploaded: u64, downloaded: u64) {
        self.engine.uploaded.fetch_add(uploaded, Ordering::SeqCst);
        self.engine
            .downloaded
            .fetch_add(downloaded, Ordering::SeqCst);
    }

    /// Limits how many bytes of each file are currently readable.
    pub fn set_available(&self, bytes: u64) {
        let _ = self.engine.available_tx.send(bytes);
    }
}

impl StubLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Control handle for the `n`th launched engine.
    pub fn control(&self, n: usize) -> StubControl {
        self.launched.lock()[n].clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }
}

#[async_trait]
impl EngineLauncher for StubLauncher {
    async fn launch(
        &self,
        source: &ItemSource,
        _scratch_dir: &Path,
    ) -> Result<(Arc<dyn SwarmEngine>, mpsc::Receiver<SwarmEvent>), SwarmError> {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (available_tx, available_rx) = watch::channel(u64::MAX);
        let engine = Arc::new(StubSwarm {
            info_hash: InfoHash::new([7u8; 20]),
            inner: Mutex::new(StubInner {
                files: None,
                content: Vec::new(),
            }),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            purged: AtomicBool::new(false),
            listen_port: Mutex::new(None),
            available_tx,
            available_rx,
        });

        self.launched.lock().push(StubControl {
            source: source.clone(),
            engine: engine.clone(),
            events: events_tx,
        });

        Ok((engine, events_rx))
    }
}

struct StubInner {
    files: Option<Vec<FileEntry>>,
    content: Vec<Vec<u8>>,
}

pub struct StubSwarm {
    info_hash: InfoHash,
    inner: Mutex<StubInner>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    destroyed: AtomicBool,
    purged: AtomicBool,
    listen_port: Mutex<Option<u16>>,
    available_tx: watch::Sender<u64>,
    available_rx: watch::Receiver<u64>,
}

impl StubSwarm {
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
impl SwarmEngine for StubSwarm {
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
        self.inner.lock().files.clone()
    }

    fn info_hash(&self) -> Option<InfoHash> {
        Some(self.info_hash)
    }

    async fn open_stream(
        &self,
        file_index: usize,
        start: u64,
    ) -> Result<Box<dyn FileStream>, SwarmError> {
        let inner = self.inner.lock();
        if inner.files.is_none() {
            return Err(SwarmError::NotReady);
        }
        let Some(data) = inner.content.get(file_index) else {
            return Err(SwarmError::FileOutOfRange {
                index: file_index,
                count: inner.content.len(),
            });
        };
        Ok(Box::new(StubStream {
            data: Bytes::copy_from_slice(data),
            pos: start.min(data.len() as u64) as usize,
            available: self.available_rx.clone(),
        }))
    }
}

struct StubStream {
    data: Bytes,
    pos: usize,
    available: watch::Receiver<u64>,
}

#[async_trait]
impl FileStream for StubStream {
    async fn read_at_most(&mut self, max_len: usize) -> Result<Bytes, SwarmError> {
        if self.pos >= self.data.len() {
            return Ok(Bytes::new());
        }
        loop {
            let available = (*self.available.borrow()).min(self.data.len() as u64) as usize;
            if self.pos < available {
                let end = (self.pos + max_len).min(available);
                let chunk = self.data.slice(self.pos..end);
                self.pos = end;
                return Ok(chunk);
            }
            self.available
                .changed()
                .await
                .map_err(|_| SwarmError::EngineStopped)?;
        }
    }
}

/// File entries with generated content for quick test setup.
pub fn test_files(specs: &[(&str, usize)]) -> Vec<(FileEntry, Vec<u8>)> {
    specs
        .iter()
        .map(|(path, len)| {
            let data: Vec<u8> = (0..*len).map(|i| (i * 31 % 251) as u8).collect();
            (
                FileEntry {
                    path: path.to_string(),
                    length: *len as u64,
                },
                data,
            )
        })
        .collect()
}

/// Content generator matching [`test_files`], for asserting read results.
pub fn test_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
