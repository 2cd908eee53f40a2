//! Serves the kernel-facing FUSE protocol operations (§4.4) by combining the Namespace Model
//! (virtual paths) with per-image [`ImageReader`]s (in-image paths) through a union-reader
//! abstraction and a per-image directory cache.

mod dircache;
mod union_reader;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::image::{FileType as ImageFileType, ImageReader};
use crate::inode::{self, ROOT_INODE, ROOT_SENTINEL};
use crate::namespace::{Namespace, VirtualNode};

use dircache::{CachedChild, DirCache};

/// Attribute and entry cache TTL advertised to the kernel. The store is immutable per image, so
/// there is nothing to invalidate short of an explicit Namespace Model mutation; advertising a
/// TTL far in the future lets the kernel skip round-trips entirely (§4.4 "cache policy").
const CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

const BLOCK_SIZE: u32 = 4096;
const PREFERRED_IO_SIZE: u32 = 64 * 1024;

/// The `fuser::Filesystem` implementation. Holds the Namespace Model, the repo directory images
/// are read from, and the lazily-populated per-image reader slots and directory caches.
///
/// Every field is itself `Arc`-wrapped, so `Frontend` is cheap to [`Clone`]: the kernel-facing
/// mount takes one clone (`fuser` needs to own its `Filesystem` by value), and the scanner and
/// [`crate::control`] service share another, all backed by the same image slots and caches.
#[derive(Clone)]
pub struct Frontend {
    namespace: Arc<Namespace>,
    repo: Arc<PathBuf>,
    image_slots: Arc<RwLock<Vec<Option<Arc<ImageReader>>>>>,
    dircaches: Arc<RwLock<Vec<Arc<DirCache>>>>,
}

impl Frontend {
    pub fn new(namespace: Arc<Namespace>, repo: PathBuf) -> Self {
        Self {
            namespace,
            repo: Arc::new(repo),
            image_slots: Arc::new(RwLock::new(Vec::new())),
            dircaches: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Lazily opens (or returns the already-open) [`ImageReader`] for `image_index` (§4.4
    /// "lazy image opening", §5's "open outside lock, install under writer lock" approach).
    pub(crate) fn ensure_open(&self, image_index: usize) -> Result<Arc<ImageReader>> {
        if let Some(reader) = self
            .image_slots
            .read()
            .unwrap()
            .get(image_index)
            .and_then(|slot| slot.clone())
        {
            return Ok(reader);
        }

        let name = self
            .namespace
            .package_name(image_index)
            .ok_or_else(|| Error::UnknownPackage(format!("image index {image_index}")))?;
        let path = self.repo.join(format!("{name}.squashfs"));
        let opened = Arc::new(ImageReader::open(&path)?);

        let mut slots = self.image_slots.write().unwrap();
        if slots.len() <= image_index {
            slots.resize(image_index + 1, None);
        }
        // Re-check under the writer lock: another thread may have raced us and opened it first.
        // An image is opened at most once (§3's invariant); keep whichever reader won the race.
        if slots[image_index].is_none() {
            slots[image_index] = Some(opened);
        }
        Ok(slots[image_index].clone().expect("just installed above"))
    }

    fn dircache_for(&self, image_index: usize) -> Arc<DirCache> {
        if let Some(cache) = self
            .dircaches
            .read()
            .unwrap()
            .get(image_index)
            .cloned()
        {
            return cache;
        }
        let mut caches = self.dircaches.write().unwrap();
        if caches.len() <= image_index {
            caches.resize_with(image_index + 1, || Arc::new(DirCache::default()));
        }
        caches[image_index].clone()
    }

    /// Drops the cached directory listing for an in-image inode, given as an external inode.
    /// Called by the scanner right after recording a new runtime union against it (§4.3 step
    /// 3: "invalidate any cached directory listing for the affected source inode"). A no-op if
    /// `external` doesn't decode to an image inode.
    pub(crate) fn invalidate_dircache(&self, external: u64) {
        if let inode::Decoded::Image {
            image_index,
            internal,
        } = inode::decode(external)
        {
            self.dircache_for(image_index).invalidate(internal);
        }
    }

    /// Substitutes an image's real root inode for the [`ROOT_SENTINEL`] placeholder (§4.2).
    fn substitute_root(&self, image: &ImageReader, internal: u64) -> u64 {
        if internal == ROOT_SENTINEL {
            image.root_inode()
        } else {
            internal
        }
    }

    /// Resolves `name` inside the virtual or in-image directory `parent` (already an external
    /// inode), returning the child's external inode. The pure, reply-free core of `Lookup`
    /// (§4.4); the `Filesystem` impl below just wires this to a `ReplyEntry`, and integration
    /// tests call it directly without a kernel mount.
    pub fn resolve(&self, parent: u64, name: &OsStr) -> Result<u64> {
        match inode::decode(parent) {
            inode::Decoded::Root => self.namespace.lookup(ROOT_INODE, name),
            inode::Decoded::Virtual(v) => self.namespace.lookup(v, name),
            inode::Decoded::Image { .. } => {
                let listing = self.union_readdir(parent)?;
                listing
                    .into_iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, child)| child.inode)
                    .ok_or(Error::NotFound)
            }
        }
    }

    /// Builds kernel-facing attributes for any external inode. The pure core of `GetAttr`.
    pub fn stat(&self, external: u64) -> Result<FileAttr> {
        match inode::decode(external) {
            inode::Decoded::Root => Ok(dir_attr(ROOT_INODE, 0)),
            inode::Decoded::Virtual(v) => match self.namespace.node(v)? {
                VirtualNode::Directory(_) => Ok(dir_attr(v, 0)),
                VirtualNode::Symlink(s) => Ok(symlink_attr(v, &s.target)),
            },
            inode::Decoded::Image {
                image_index,
                internal,
            } => {
                let image = self.ensure_open(image_index)?;
                let internal = self.substitute_root(&image, internal);
                let attr = image.stat(internal)?;
                Ok(FileAttr {
                    ino: external,
                    size: attr.size,
                    blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
                    atime: mtime_to_systemtime(attr.mtime),
                    mtime: mtime_to_systemtime(attr.mtime),
                    ctime: mtime_to_systemtime(attr.mtime),
                    crtime: mtime_to_systemtime(attr.mtime),
                    kind: image_file_type_to_fuse(attr.file_type),
                    perm: attr.perm,
                    nlink: if attr.file_type == ImageFileType::Directory {
                        2
                    } else {
                        1
                    },
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    blksize: BLOCK_SIZE,
                    flags: 0,
                })
            }
        }
    }

    /// `ReadDir`'s directory listing as `(name, child_external_inode, kind)` triples. The pure
    /// core of `ReadDir`.
    pub fn list_dir(&self, ino: u64) -> Result<Vec<(std::ffi::OsString, u64, FuseFileType)>> {
        match inode::decode(ino) {
            inode::Decoded::Root => self.virtual_readdir(ROOT_INODE),
            inode::Decoded::Virtual(v) => self.virtual_readdir(v),
            inode::Decoded::Image { .. } => Ok(self
                .union_readdir(ino)?
                .into_iter()
                .map(|(name, child)| {
                    (name, child.inode, image_file_type_to_fuse(child.file_type))
                })
                .collect()),
        }
    }

    /// Resolves the symlink target of any external inode. The pure core of `ReadLink`.
    pub fn read_link(&self, ino: u64) -> Result<PathBuf> {
        match inode::decode(ino) {
            inode::Decoded::Root => Err(Error::InvalidArgument("root is not a symlink".into())),
            inode::Decoded::Virtual(v) => match self.namespace.node(v)? {
                VirtualNode::Symlink(s) => Ok(s.target),
                VirtualNode::Directory(_) => {
                    Err(Error::InvalidArgument(format!("inode {v} is not a symlink")))
                }
            },
            inode::Decoded::Image {
                image_index,
                internal,
            } => {
                let image = self.ensure_open(image_index)?;
                let internal = self.substitute_root(&image, internal);
                image.readlink(internal).map(|p| p.to_path_buf())
            }
        }
    }

    fn virtual_readdir(
        &self,
        v: u64,
    ) -> Result<Vec<(std::ffi::OsString, u64, FuseFileType)>> {
        self.namespace
            .readdir(v)?
            .into_iter()
            .map(|(name, child)| {
                let kind = match inode::decode(child) {
                    inode::Decoded::Root => FuseFileType::Directory,
                    inode::Decoded::Virtual(cv) => match self.namespace.node(cv)? {
                        VirtualNode::Directory(_) => FuseFileType::Directory,
                        VirtualNode::Symlink(_) => FuseFileType::Symlink,
                    },
                    // The only Image-encoded dirents a virtual directory ever holds are live
                    // package roots (§3), which are always directories.
                    inode::Decoded::Image { .. } => FuseFileType::Directory,
                };
                Ok((name, child, kind))
            })
            .collect()
    }
}

fn dir_attr(ino: u64, size: u64) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: 0,
        atime: std::time::UNIX_EPOCH,
        mtime: std::time::UNIX_EPOCH,
        ctime: std::time::UNIX_EPOCH,
        crtime: std::time::UNIX_EPOCH,
        kind: FuseFileType::Directory,
        perm: 0o555,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn symlink_attr(ino: u64, target: &Path) -> FileAttr {
    FileAttr {
        ino,
        size: target.as_os_str().len() as u64,
        blocks: 0,
        atime: std::time::UNIX_EPOCH,
        mtime: std::time::UNIX_EPOCH,
        ctime: std::time::UNIX_EPOCH,
        crtime: std::time::UNIX_EPOCH,
        kind: FuseFileType::Symlink,
        perm: 0o444,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn mtime_to_systemtime(mtime: u32) -> std::time::SystemTime {
    std::time::UNIX_EPOCH + Duration::from_secs(mtime as u64)
}

fn image_file_type_to_fuse(ft: ImageFileType) -> FuseFileType {
    match ft {
        ImageFileType::RegularFile => FuseFileType::RegularFile,
        ImageFileType::Directory => FuseFileType::Directory,
        ImageFileType::Symlink => FuseFileType::Symlink,
        ImageFileType::CharDevice => FuseFileType::CharDevice,
        ImageFileType::BlockDevice => FuseFileType::BlockDevice,
        ImageFileType::NamedPipe => FuseFileType::NamedPipe,
        ImageFileType::Socket => FuseFileType::Socket,
    }
}

impl Filesystem for Frontend {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, ?name, "lookup");
        match self.resolve(parent, name) {
            Ok(child) => match self.stat(child) {
                Ok(attr) => reply.entry(&CACHE_TTL, &attr, 0),
                Err(e) => reply.error(e.as_errno()),
            },
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        trace!(ino, "getattr");
        match self.stat(ino) {
            Ok(attr) => reply.attr(&CACHE_TTL, &attr),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(ino, "readlink");
        match self.read_link(ino) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(ino, offset, "readdir");
        let entries = match self.list_dir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.as_errno());
                return;
            }
        };
        for (i, (name, child_ino, kind)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, i as i64 + 1, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let (image_index, internal) = match inode::decode(ino) {
            inode::Decoded::Image {
                image_index,
                internal,
            } => (image_index, internal),
            _ => {
                warn!(ino, "read on a non-image inode");
                reply.error(libc::EISDIR);
                return;
            }
        };
        let image = match self.ensure_open(image_index) {
            Ok(image) => image,
            Err(e) => {
                reply.error(e.as_errno());
                return;
            }
        };
        let internal = self.substitute_root(&image, internal);
        let mut buf = vec![0u8; size as usize];
        match image.read_at(internal, offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, PREFERRED_IO_SIZE, 255, BLOCK_SIZE);
    }
}
