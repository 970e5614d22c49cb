//! Kernel filesystem bridge.
//!
//! A thin translation layer: kernel requests arrive via the `fuser` crate,
//! are mapped from inodes to the path-based handlers of [`TorrentVfs`], and
//! errors are mapped to `ENOENT`/`EPERM`. Async handlers run on the daemon's
//! runtime through a captured handle; the kernel dispatch thread blocks on
//! them (fuser processes requests sequentially).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request,
};

use super::{FileAttributes, FsError, NodeKind, TorrentVfs};

const ROOT_INO: u64 = 1;
// Attributes change as items resolve and disappear; keep the kernel cache short
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Mount options surfaced to the CLI.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn errno(error: FsError) -> c_int {
    match error {
        FsError::NotFound => libc::ENOENT,
        FsError::PermissionDenied => libc::EPERM,
    }
}

/// Attaches the handler set to the kernel and returns the running session.
///
/// Must be called from within the daemon's tokio runtime; the bridge
/// captures the runtime handle to drive async handlers from the kernel
/// dispatch thread. Dropping the returned session unmounts.
///
/// # Errors
/// - `std::io::Error` - The kernel mount itself failed
pub fn mount(
    vfs: Arc<TorrentVfs>,
    mountpoint: &Path,
    options: &MountOptions,
) -> std::io::Result<fuser::BackgroundSession> {
    let bridge = FuseBridge::new(vfs, tokio::runtime::Handle::current());

    let mut mount_options = vec![MountOption::RO, MountOption::FSName("tidefs".to_string())];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }

    tracing::info!("Mounting tidefs at {}", mountpoint.display());
    fuser::spawn_mount2(bridge, mountpoint, &mount_options)
}

struct FuseBridge {
    vfs: Arc<TorrentVfs>,
    runtime: tokio::runtime::Handle,
    ino_to_path: HashMap<u64, String>,
    path_to_ino: HashMap<String, u64>,
    next_ino: u64,
    uid: u32,
    gid: u32,
}

impl FuseBridge {
    fn new(vfs: Arc<TorrentVfs>, runtime: tokio::runtime::Handle) -> Self {
        let mut ino_to_path = HashMap::new();
        let mut path_to_ino = HashMap::new();
        ino_to_path.insert(ROOT_INO, String::new());
        path_to_ino.insert(String::new(), ROOT_INO);

        Self {
            vfs,
            runtime,
            ino_to_path,
            path_to_ino,
            next_ino: ROOT_INO + 1,
            // The mount reports the daemon's identity on every node
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(String::as_str)
    }

    fn intern(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.path_to_ino.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.ino_to_path.insert(ino, path.to_string());
        self.path_to_ino.insert(path.to_string(), ino);
        ino
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str()?;
        if parent_path.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{parent_path}/{name}"))
        }
    }

    fn to_file_attr(&self, ino: u64, attr: &FileAttributes) -> FileAttr {
        let (kind, nlink) = match attr.kind {
            NodeKind::File => (FileType::RegularFile, 1),
            NodeKind::Directory => (FileType::Directory, 2),
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.ctime,
            kind,
            perm: attr.perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for FuseBridge {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.vfs.getattr(&path) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &self.to_file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.vfs.getattr(path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.to_file_attr(ino, &attr)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let children = match self.vfs.readdir(&path) {
            Ok(children) => children,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };

        let parent_ino = match path.rsplit_once('/') {
            Some((parent, _)) => self.path_to_ino.get(parent).copied().unwrap_or(ROOT_INO),
            None => ROOT_INO,
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for name in children {
            let child = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            let kind = match self.vfs.getattr(&child) {
                Ok(attr) if attr.kind == NodeKind::File => FileType::RegularFile,
                Ok(_) => FileType::Directory,
                // Vanished between listing and stat
                Err(_) => continue,
            };
            let child_ino = self.intern(&child);
            entries.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.vfs.open(path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vfs = self.vfs.clone();
        let result = self
            .runtime
            .block_on(async move { vfs.read(&path, fh, offset.max(0) as u64, size).await });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.vfs.release(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.vfs.statfs();
        reply.statfs(
            stats.blocks,
            stats.blocks_free,
            stats.blocks_available,
            stats.files,
            stats.files_free,
            stats.block_size,
            stats.name_max,
            stats.fragment_size,
        );
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(errno(self.vfs.write("")));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(errno(self.vfs.unlink(&path)));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = self.child_path(parent, name).unwrap_or_default();
        let to = self.child_path(newparent, newname).unwrap_or_default();
        reply.error(errno(self.vfs.rename(&from, &to)));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(errno(self.vfs.mkdir(&path)));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(errno(self.vfs.rmdir(&path)));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(errno(self.vfs.create(&path)));
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = self.path_of(ino).unwrap_or_default().to_string();
        reply.error(errno(self.vfs.setxattr(&path)));
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        let path = self.path_of(ino).unwrap_or_default().to_string();
        reply.error(errno(self.vfs.getxattr(&path)));
    }
}
