//! Read-only random access to one immutable compressed package image (§4.1).
//!
//! Wraps [`backhand::FilesystemReader`], the teacher's own SquashFS decoder, and adapts its
//! path-indexed, forward-only-per-file API into the dense-internal-inode, positional-read
//! contract the rest of this crate is built around.

mod cursor;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use backhand::{FilesystemReader, InnerNode};
use tracing::trace;

use crate::error::{Error, Result};

pub use cursor::FileCursor;

/// Kind of a directory entry, mirroring the kernel's `FileType` distinctions this core cares
/// about. Devices/pipes/sockets inside a package image are surfaced as-is for `stat` but are
/// never traversed into (they have no children).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

/// Attributes returned by [`ImageReader::stat`].
#[derive(Debug, Clone)]
pub struct Attr {
    pub size: u64,
    pub file_type: FileType,
    pub perm: u16,
    pub mtime: u32,
}

struct Entry {
    name: OsString,
    parent: u64,
    file_type: FileType,
    perm: u16,
    size: u64,
    symlink_target: Option<PathBuf>,
    /// Index into `FilesystemReader::files()` for `InnerNode::File` entries only.
    file_node_index: Option<usize>,
    children: Vec<(OsString, u64)>,
}

/// One opened package image.
///
/// Internal inode numbers are synthetic: they are assigned in discovery order while walking
/// `backhand`'s flat, path-indexed node list, starting with `0` for the image root. This
/// satisfies every invariant the Inode Codec and Namespace Model place on "internal inode"
/// (dense, stable for the process lifetime, unique within the image) without depending on
/// SquashFS's own on-disk inode numbering, which `backhand`'s reader API does not expose.
pub struct ImageReader {
    filesystem: FilesystemReader<'static>,
    entries: Vec<Entry>,
    path_to_inode: HashMap<PathBuf, u64>,
    mtime: u32,
    /// One positional-read cursor per file inode, created lazily and reused across calls.
    cursors: RwLock<HashMap<u64, Arc<Mutex<FileCursor>>>>,
}

/// Internal inode of the image root. Chosen as `1`, matching real SquashFS images (where the
/// root inode is always on-disk inode 1), so that the Inode Codec's `ROOT_SENTINEL`
/// substitution (§4.2: "low 48 bits equal 1" always means "this image's root") lines up with
/// this reader's own numbering instead of shadowing a distinct, real entry that happens to land
/// on internal inode 1.
const ROOT_INTERNAL_INODE: u64 = 1;

impl ImageReader {
    /// Opens and fully indexes a SquashFS image from `path`.
    ///
    /// Directory listings, inode attributes and the name index are all built at open time:
    /// `backhand::FilesystemReader` itself already parses the whole node table eagerly (it
    /// does not offer partial/streaming directory parsing), so there's nothing to gain by
    /// deferring this work further once the file is open. Only file *contents* are read
    /// lazily, through [`Self::cursor_read_at`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let filesystem = FilesystemReader::from_reader(BufReader::new(file))?;
        let mtime = filesystem.mod_time;

        let mut entries = vec![Entry {
            name: OsString::new(),
            parent: ROOT_INTERNAL_INODE,
            file_type: FileType::Directory,
            perm: 0o555,
            size: 0,
            symlink_target: None,
            file_node_index: None,
            children: Vec::new(),
        }];
        let mut path_to_inode = HashMap::new();
        path_to_inode.insert(PathBuf::from("/"), ROOT_INTERNAL_INODE);

        // backhand's `files()` yields every node (including the root) in the order it was
        // encoded into the image, which is deterministic for a given image but not
        // necessarily parent-before-children; do a first pass to allocate inodes, parented
        // by normalized path lookup, then wire up `children` in a second pass so that
        // `readdir` order matches original insertion order regardless of path discovery
        // order.
        for (index, node) in filesystem.files().enumerate() {
            if node.fullpath == Path::new("/") || node.fullpath.as_os_str().is_empty() {
                continue;
            }
            let name = match node.fullpath.file_name() {
                Some(n) => n.to_os_string(),
                None => continue,
            };
            let perm = node.header.permissions;
            let (file_type, size, symlink_target, file_node_index) = match &node.inner {
                InnerNode::Dir(_) => (FileType::Directory, 0, None, None),
                InnerNode::Symlink(s) => (
                    FileType::Symlink,
                    s.link.as_os_str().len() as u64,
                    Some(s.link.clone()),
                    None,
                ),
                InnerNode::File(f) => {
                    (FileType::RegularFile, f.file_len() as u64, None, Some(index))
                }
                InnerNode::CharacterDevice(_) => (FileType::CharDevice, 0, None, None),
                InnerNode::BlockDevice(_) => (FileType::BlockDevice, 0, None, None),
                InnerNode::NamedPipe => (FileType::NamedPipe, 0, None, None),
                InnerNode::Socket => (FileType::Socket, 0, None, None),
            };

            // Entries vec index `i` always holds internal inode `i + 1` (root occupies index 0
            // / inode 1), so this is `entries.len()` before the push below.
            let inode = entries.len() as u64 + 1;
            entries.push(Entry {
                name,
                parent: ROOT_INTERNAL_INODE, // fixed up below
                file_type,
                perm,
                size,
                symlink_target,
                file_node_index,
                children: Vec::new(),
            });
            path_to_inode.insert(node.fullpath.clone(), inode);
        }

        // second pass: wire up parent/children using the path index now that every path is
        // known. Collect first so we aren't borrowing `path_to_inode` while mutating
        // `entries`.
        let discovered: Vec<(PathBuf, u64)> = path_to_inode
            .iter()
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (path, inode) in discovered {
            if inode == ROOT_INTERNAL_INODE {
                continue;
            }
            let parent_path = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("/"));
            let parent_inode = *path_to_inode.get(parent_path).unwrap_or(&ROOT_INTERNAL_INODE);
            let index = (inode - 1) as usize;
            let parent_index = (parent_inode - 1) as usize;
            entries[index].parent = parent_inode;
            let name = entries[index].name.clone();
            entries[parent_index].children.push((name, inode));
        }

        Ok(Self {
            filesystem,
            entries,
            path_to_inode,
            mtime,
            cursors: RwLock::new(HashMap::new()),
        })
    }

    /// Synthetic internal inode of this image's root directory. Always `1`.
    pub fn root_inode(&self) -> u64 {
        ROOT_INTERNAL_INODE
    }

    pub fn stat(&self, inode: u64) -> Result<Attr> {
        let entry = self.entry(inode)?;
        Ok(Attr {
            size: entry.size,
            file_type: entry.file_type,
            perm: entry.perm,
            mtime: self.mtime,
        })
    }

    /// Ordered `(name, child_inode, file_type)` triples, in on-disk insertion order.
    pub fn readdir(&self, inode: u64) -> Result<Vec<(OsString, u64, FileType)>> {
        let entry = self.entry(inode)?;
        if entry.file_type != FileType::Directory {
            return Err(Error::InvalidArgument(format!(
                "inode {inode} is not a directory"
            )));
        }
        entry
            .children
            .iter()
            .map(|(name, child)| {
                let child_entry = self.entry(*child)?;
                Ok((name.clone(), *child, child_entry.file_type))
            })
            .collect()
    }

    pub fn readlink(&self, inode: u64) -> Result<&Path> {
        let entry = self.entry(inode)?;
        entry
            .symlink_target
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument(format!("inode {inode} is not a symlink")))
    }

    /// Resolves a `/`-separated path (relative to the image root, no leading slash required)
    /// to an internal inode, without following symlinks found along the way other than at
    /// intermediate components that are themselves directories symlinked elsewhere.
    ///
    /// Symlinks are resolved one level at a time against the already-built path index, which
    /// is sufficient for this core's needs (resolving `out/<subdir>` style lookups against a
    /// package's own, self-contained tree).
    pub fn lookup_path(&self, path: &str) -> Result<u64> {
        let normalized = normalize(Path::new(path));
        if let Some(inode) = self.path_to_inode.get(&normalized) {
            return Ok(*inode);
        }
        self.lookup_path_by_component(path)
    }

    fn lookup_path_by_component(&self, path: &str) -> Result<u64> {
        let mut inode = ROOT_INTERNAL_INODE;
        for component in Path::new(path).components() {
            let name = match component {
                Component::Normal(n) => n,
                Component::RootDir | Component::CurDir => continue,
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported path component in {path:?}"
                    )))
                }
            };
            inode = self.lookup_child(inode, name)?;
            // Transparently follow a symlink component so deeper lookups keep working;
            // bounded to one hop since package trees never nest a symlink inside itself.
            if let Ok(entry) = self.entry(inode) {
                if entry.file_type == FileType::Symlink {
                    if let Some(target) = &entry.symlink_target {
                        if let Ok(resolved) = self.lookup_path(&target.to_string_lossy()) {
                            inode = resolved;
                        }
                    }
                }
            }
        }
        Ok(inode)
    }

    fn lookup_child(&self, parent: u64, name: &OsStr) -> Result<u64> {
        let entry = self.entry(parent)?;
        entry
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, inode)| *inode)
            .ok_or(Error::NotFound)
    }

    fn entry(&self, inode: u64) -> Result<&Entry> {
        let index = inode.checked_sub(1).ok_or(Error::NotFound)?;
        self.entries.get(index as usize).ok_or(Error::NotFound)
    }

    /// Reads up to `buf.len()` bytes starting at `offset` from the file at `inode`.
    ///
    /// Memoizes one [`FileCursor`] per file inode (the "positional byte reader" of §4.4);
    /// concurrent first accesses race to insert the same empty cursor under the outer lock,
    /// so at most one is ever created per inode, and the actual decompression work happens
    /// only once the per-file lock is held. Returns the number of bytes actually read; a
    /// short read at end-of-file is not an error.
    pub fn read_at(&self, inode: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self.entry(inode)?;
        let file_node_index = entry
            .file_node_index
            .ok_or_else(|| Error::InvalidArgument(format!("inode {inode} is not a file")))?;

        let cursor = {
            if let Some(c) = self.cursors.read().unwrap().get(&inode) {
                c.clone()
            } else {
                self.cursors
                    .write()
                    .unwrap()
                    .entry(inode)
                    .or_insert_with(|| Arc::new(Mutex::new(FileCursor::new(file_node_index))))
                    .clone()
            }
        };
        let mut cursor = cursor.lock().unwrap();
        trace!(inode, offset, len = buf.len(), "read_at");
        cursor.read_at(&self.filesystem, offset, buf)
    }
}

/// Normalizes a lookup path into the absolute, `/`-rooted form `backhand` reports as each
/// node's `fullpath`, so it can be used as a `path_to_inode` key directly.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        if let Component::Normal(n) = component {
            out.push(n);
        }
    }
    out
}
