//! Filesystem bridge handlers.
//!
//! The handler set the kernel bridge collaborator invokes: directory,
//! attribute, open, read, and release requests over the namespace, plus
//! rejecting stubs for every mutating operation. The filesystem is
//! read-only.

#[cfg(feature = "fuse")]
pub mod fuse;
pub mod session;

use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::catalog::ItemCatalog;
use crate::namespace::{FileRef, NamespaceResolver, PathTarget};
use crate::registry::{EngineEntry, EngineRegistry};
use crate::store::TrackedItem;
pub use session::ReadSession;

/// Errors surfaced to the kernel bridge.
///
/// Everything else (store failures, engine launch failures, slow swarms) is
/// recovered internally: logged and retried, or left pending. A stalled
/// swarm manifests as a hanging read, never as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// Path resolves to neither a file nor a directory prefix
    #[error("No such file or directory")]
    NotFound,

    /// Mutating operation on a read-only filesystem
    #[error("Operation not permitted")]
    PermissionDenied,
}

/// Node type reported by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Attributes for one resolved path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub size: u64,
    /// Permission bits only; the bridge adds the node-type bits
    pub perm: u16,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

/// Synthetic filesystem statistics.
///
/// Fixed values; nothing meaningful can be reported for a swarm-backed
/// mount.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

impl Default for FsStats {
    fn default() -> Self {
        Self {
            block_size: 1_000_000,
            fragment_size: 1_000_000,
            blocks: 1_000_000,
            blocks_free: 1_000_000,
            blocks_available: 1_000_000,
            files: 1_000_000,
            files_free: 1_000_000,
            name_max: 1_000_000,
        }
    }
}

const FILE_PERM: u16 = 0o666;
const DIR_PERM: u16 = 0o755;
const DIR_SIZE: u64 = 4096;

struct HandleSlot {
    path: String,
    // None while a read has the session checked out
    session: Option<ReadSession>,
}

#[derive(Default)]
struct HandleTable {
    slots: Vec<Option<HandleSlot>>,
}

impl HandleTable {
    /// Allocates a handle, reusing the lowest freed slot index.
    fn open(&mut self, path: &str) -> u64 {
        let slot = HandleSlot {
            path: path.to_string(),
            session: Some(ReadSession::new()),
        };
        match self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            Some((index, empty)) => {
                *empty = Some(slot);
                index as u64
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u64
            }
        }
    }

    fn release(&mut self, fh: u64) -> bool {
        match self.slots.get_mut(fh as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// The read-only filesystem over tracked items.
pub struct TorrentVfs {
    catalog: Arc<ItemCatalog>,
    registry: Arc<EngineRegistry>,
    namespace: Arc<NamespaceResolver>,
    handles: Mutex<HandleTable>,
    // Mount-time constants for ctime/mtime
    mounted_at: SystemTime,
}

impl TorrentVfs {
    pub fn new(
        catalog: Arc<ItemCatalog>,
        registry: Arc<EngineRegistry>,
        namespace: Arc<NamespaceResolver>,
    ) -> Self {
        Self {
            catalog,
            registry,
            namespace,
            handles: Mutex::new(HandleTable::default()),
            mounted_at: SystemTime::now(),
        }
    }

    /// Attributes for a file or derived directory.
    ///
    /// A file's reported size is its declared length and never changes.
    pub fn getattr(&self, path: &str) -> Result<FileAttributes, FsError> {
        match self.resolve_live(path)? {
            PathTarget::File(file_ref) => Ok(FileAttributes {
                kind: NodeKind::File,
                size: file_ref.length,
                perm: FILE_PERM,
                ctime: self.mounted_at,
                mtime: self.mounted_at,
                atime: SystemTime::now(),
            }),
            PathTarget::Directory => Ok(FileAttributes {
                kind: NodeKind::Directory,
                size: DIR_SIZE,
                perm: DIR_PERM,
                ctime: self.mounted_at,
                mtime: self.mounted_at,
                atime: SystemTime::now(),
            }),
        }
    }

    /// Immediate child names under a directory path.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        self.namespace
            .index()
            .children(path)
            .ok_or(FsError::NotFound)
    }

    /// Allocates a file handle for a resolvable file path.
    pub fn open(&self, path: &str) -> Result<u64, FsError> {
        match self.resolve_live(path)? {
            PathTarget::File(_) => Ok(self.handles.lock().open(path)),
            PathTarget::Directory => Err(FsError::NotFound),
        }
    }

    /// Reads up to `size` bytes at `offset` through the handle's session.
    ///
    /// Suspends until the backing engine has resolved its file list and
    /// until the stream yields data; a short result only ever means end of
    /// file. There is no timeout on either wait.
    pub async fn read(
        &self,
        path: &str,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let (file_ref, item) = match self.resolve_live(path)? {
            PathTarget::File(file_ref) => {
                let item = self
                    .catalog
                    .item(file_ref.item_id)
                    .ok_or(FsError::NotFound)?;
                (file_ref, item)
            }
            PathTarget::Directory => return Err(FsError::NotFound),
        };

        // Never read past the declared length
        let len = if offset >= file_ref.length {
            0
        } else {
            (u64::from(size)).min(file_ref.length - offset) as usize
        };
        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut session = self.checkout_session(fh, path)?;
        let result = self
            .read_session(&item, file_ref, &mut session, offset, len)
            .await;
        if result.is_err() {
            session.invalidate_stream();
        }
        self.checkin_session(fh, session);
        result
    }

    async fn read_session(
        &self,
        item: &Arc<TrackedItem>,
        file_ref: FileRef,
        session: &mut ReadSession,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, FsError> {
        // Seek invalidation: a non-sequential offset discards the stream
        if session.stream.is_some() && session.offset != offset {
            session.invalidate_stream();
        }

        let entry = self.acquire_engine(item).await?;
        entry.wait_ready().await.map_err(|_| FsError::NotFound)?;

        // The wait may have completed because the item is being deleted
        if self
            .catalog
            .item(item.id)
            .is_none_or(|i| i.delete_requested)
        {
            return Err(FsError::NotFound);
        }

        entry.signal_read();

        if session.stream.is_none() {
            let stream = entry
                .engine
                .open_stream(file_ref.file_index, offset)
                .await
                .map_err(|e| {
                    tracing::warn!("Opening stream for item {} failed: {e}", item.id);
                    FsError::NotFound
                })?;
            session.offset = offset;
            session.stream = Some(stream);
        }
        let Some(stream) = session.stream.as_mut() else {
            return Err(FsError::NotFound);
        };

        // Drain until the request is satisfied; an empty chunk is end of
        // file, anything else loops for more rather than returning a
        // spurious zero-length result.
        let mut buf = BytesMut::with_capacity(len);
        while buf.len() < len {
            let chunk = stream
                .read_at_most(len - buf.len())
                .await
                .map_err(|_| FsError::NotFound)?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        session.offset = offset + buf.len() as u64;
        Ok(buf.freeze())
    }

    /// Destroys any open stream for the handle and frees the slot.
    ///
    /// Releasing a handle that was never opened is a safe no-op.
    pub fn release(&self, fh: u64) {
        self.handles.lock().release(fh);
    }

    pub fn statfs(&self) -> FsStats {
        FsStats::default()
    }

    // Mutating operations fail unconditionally; extended attributes are
    // not supported either.

    pub fn write(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn unlink(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn rename(&self, _from: &str, _to: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn mkdir(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn rmdir(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn create(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn setxattr(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    pub fn getxattr(&self, _path: &str) -> FsError {
        FsError::PermissionDenied
    }

    fn resolve_live(&self, path: &str) -> Result<PathTarget, FsError> {
        let target = self
            .namespace
            .index()
            .resolve(path)
            .ok_or(FsError::NotFound)?;
        // The index refreshes on a cadence; deletion must take effect now
        if let PathTarget::File(file_ref) = &target {
            let live = self
                .catalog
                .item(file_ref.item_id)
                .is_some_and(|i| !i.delete_requested);
            if !live {
                return Err(FsError::NotFound);
            }
        }
        Ok(target)
    }

    async fn acquire_engine(&self, item: &Arc<TrackedItem>) -> Result<Arc<EngineEntry>, FsError> {
        self.registry.acquire(item).await.map_err(|e| {
            tracing::warn!("Acquiring engine for item {} failed: {e}", item.id);
            FsError::NotFound
        })
    }

    fn checkout_session(&self, fh: u64, path: &str) -> Result<ReadSession, FsError> {
        let mut handles = self.handles.lock();
        let slot = handles
            .slots
            .get_mut(fh as usize)
            .and_then(|s| s.as_mut())
            .ok_or(FsError::NotFound)?;
        if slot.path != path {
            return Err(FsError::NotFound);
        }
        slot.session.take().ok_or(FsError::NotFound)
    }

    fn checkin_session(&self, fh: u64, session: ReadSession) {
        let mut handles = self.handles.lock();
        if let Some(Some(slot)) = handles.slots.get_mut(fh as usize) {
            slot.session = Some(session);
        }
        // Slot released mid-read: the session (and stream) just drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwarmConfig;
    use crate::store::{ItemSource, JsonFileStore, NewItem, RecordStore};
    use crate::swarm::stub::{StubLauncher, test_files};

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: Arc<ItemCatalog>,
        launcher: Arc<StubLauncher>,
        vfs: TorrentVfs,
        namespace: Arc<NamespaceResolver>,
    }

    async fn fixture_with_items(items: &[(&str, Option<&str>)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(
            JsonFileStore::open(dir.path().join("items.json"))
                .await
                .unwrap(),
        );
        for (name, category) in items {
            store
                .insert(NewItem {
                    source: ItemSource::Magnet(format!("magnet:?xt=urn:btih:{name}")),
                    name: name.to_string(),
                    info_hash: None,
                    category: category.map(|c| c.to_string()),
                })
                .await
                .unwrap();
        }

        let catalog = Arc::new(ItemCatalog::new(store));
        catalog.sync_from_store().await;
        let launcher = StubLauncher::new();
        let registry = EngineRegistry::new(launcher.clone(), catalog.clone(), SwarmConfig::default());
        let namespace = Arc::new(NamespaceResolver::new(catalog.clone()));
        namespace.refresh();
        let vfs = TorrentVfs::new(catalog.clone(), registry, namespace.clone());

        Fixture {
            _dir: dir,
            catalog,
            launcher,
            vfs,
            namespace,
        }
    }

    /// Launches the item's engine and resolves its files through the stub.
    async fn resolve_item(fixture: &Fixture, n: usize, files: &[(&str, usize)]) {
        // First read acquires lazily; make the engine ready up front instead
        let item = {
            let mut items = fixture.catalog.snapshot();
            items.sort_by_key(|i| i.id);
            items[n].clone()
        };
        let registry = &fixture.vfs.registry;
        registry.acquire(&item).await.unwrap();
        fixture
            .launcher
            .control(fixture.launcher.launch_count() - 1)
            .make_ready(test_files(files))
            .await;
        // Let the event pump persist the file list
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        fixture.namespace.refresh();
    }

    #[tokio::test]
    async fn test_getattr_reports_declared_size() {
        let fixture = fixture_with_items(&[("alpha", None)]).await;
        resolve_item(&fixture, 0, &[("alpha/a.bin", 1000)]).await;

        let attr = fixture.vfs.getattr("/alpha/a.bin").unwrap();
        assert_eq!(attr.kind, NodeKind::File);
        assert_eq!(attr.size, 1000);

        let dir = fixture.vfs.getattr("/alpha").unwrap();
        assert_eq!(dir.kind, NodeKind::Directory);

        assert_eq!(fixture.vfs.getattr("/missing"), Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_readdir_lists_distinct_segments() {
        let fixture = fixture_with_items(&[("alpha", None), ("beta", Some("tv"))]).await;
        resolve_item(&fixture, 0, &[("alpha/a.bin", 10), ("alpha/sub/b.bin", 10)]).await;
        resolve_item(&fixture, 1, &[("beta/c.bin", 10)]).await;

        assert_eq!(fixture.vfs.readdir("/").unwrap(), vec!["alpha", "tv"]);
        assert_eq!(fixture.vfs.readdir("/alpha").unwrap(), vec!["a.bin", "sub"]);
        assert_eq!(fixture.vfs.readdir("/tv/beta").unwrap(), vec!["c.bin"]);
        assert_eq!(fixture.vfs.readdir("/nope"), Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_open_allocates_and_reuses_slots() {
        let fixture = fixture_with_items(&[("alpha", None)]).await;
        resolve_item(&fixture, 0, &[("alpha/a.bin", 10)]).await;

        let first = fixture.vfs.open("/alpha/a.bin").unwrap();
        let second = fixture.vfs.open("/alpha/a.bin").unwrap();
        assert_ne!(first, second);

        fixture.vfs.release(first);
        let third = fixture.vfs.open("/alpha/a.bin").unwrap();
        assert_eq!(third, first);

        assert_eq!(fixture.vfs.open("/alpha"), Err(FsError::NotFound));
        assert_eq!(fixture.vfs.open("/missing"), Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_release_of_unopened_handle_is_noop() {
        let fixture = fixture_with_items(&[("alpha", None)]).await;
        fixture.vfs.release(17);
    }

    #[tokio::test]
    async fn test_read_clamps_to_file_length() {
        let fixture = fixture_with_items(&[("alpha", None)]).await;
        resolve_item(&fixture, 0, &[("alpha/a.bin", 100)]).await;

        let fh = fixture.vfs.open("/alpha/a.bin").unwrap();
        let data = fixture.vfs.read("/alpha/a.bin", fh, 90, 64).await.unwrap();
        assert_eq!(data.len(), 10);

        let empty = fixture.vfs.read("/alpha/a.bin", fh, 100, 64).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_seek_recreates_stream_without_corruption() {
        let fixture = fixture_with_items(&[("alpha", None)]).await;
        resolve_item(&fixture, 0, &[("alpha/a.bin", 2000)]).await;
        let content = crate::swarm::stub::test_content(2000);

        let fh = fixture.vfs.open("/alpha/a.bin").unwrap();
        let first = fixture.vfs.read("/alpha/a.bin", fh, 0, 1000).await.unwrap();
        let second = fixture
            .vfs
            .read("/alpha/a.bin", fh, 500, 1000)
            .await
            .unwrap();

        assert_eq!(&first[..], &content[0..1000]);
        assert_eq!(&second[..], &content[500..1500]);
    }

    #[tokio::test]
    async fn test_read_waits_for_data_instead_of_short_read() {
        let fixture = fixture_with_items(&[("alpha", None)]).await;
        resolve_item(&fixture, 0, &[("alpha/a.bin", 100)]).await;
        let control = fixture.launcher.control(0);
        control.set_available(10);

        let fh = fixture.vfs.open("/alpha/a.bin").unwrap();
        let vfs = &fixture.vfs;
        let read = vfs.read("/alpha/a.bin", fh, 0, 50);

        let release = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            control.set_available(100);
        };

        let (data, ()) = tokio::join!(read, release);
        assert_eq!(data.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_mutating_operations_denied() {
        let fixture = fixture_with_items(&[]).await;
        let vfs = &fixture.vfs;
        assert_eq!(vfs.write("/x"), FsError::PermissionDenied);
        assert_eq!(vfs.unlink("/x"), FsError::PermissionDenied);
        assert_eq!(vfs.rename("/x", "/y"), FsError::PermissionDenied);
        assert_eq!(vfs.mkdir("/x"), FsError::PermissionDenied);
        assert_eq!(vfs.rmdir("/x"), FsError::PermissionDenied);
        assert_eq!(vfs.create("/x"), FsError::PermissionDenied);
        assert_eq!(vfs.setxattr("/x"), FsError::PermissionDenied);
        assert_eq!(vfs.getxattr("/x"), FsError::PermissionDenied);
    }
}
