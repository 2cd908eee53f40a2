//! Owns the virtual overlay tree: known packages, exchange directories, and the symlinks that
//! aggregate package outputs across images (§4.3).
//!
//! Everything mutable lives behind a single [`RwLock`]; readers (lookup, readdir enumeration of
//! the virtual tree) take the read side, writers (adding a package, creating an exchange
//! directory, recording a runtime union) take the write side. This mirrors the locking shape
//! `backhand`'s own [`backhand::FilesystemReader`] uses for its directory cache — a small number
//! of coarse-grained locks rather than one per node.

pub mod metadata;

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::inode::ROOT_SENTINEL;

pub use metadata::{PackageMeta, RuntimeUnion};

/// A tagged virtual inode object: either a directory or a symlink dirent.
///
/// Kept as a tagged variant rather than two separate maps or subtype polymorphism, per this
/// core's own design note: the frontend branches on the tag in `getattr`/`readlink`.
#[derive(Debug, Clone)]
pub enum VirtualNode {
    Directory(Directory),
    Symlink(Symlink),
}

/// A virtual directory: an ordered sequence of dirents plus a name index, matching §3's
/// `(entries, by_name)` pair. Tombstoned slots are `None` and keep their position so that
/// readdir offsets issued before a mutation stay meaningful.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Vec<Option<Dirent>>,
    by_name: HashMap<OsString, usize>,
}

#[derive(Debug, Clone)]
struct Dirent {
    name: OsString,
    inode: u64,
}

/// A virtual symlink dirent.
#[derive(Debug, Clone)]
pub struct Symlink {
    pub target: PathBuf,
}

impl Directory {
    /// Inserts or replaces the entry named `name`. Replacing tombstones the old slot and
    /// appends a new one, matching the package-table and exchange-directory shadowing rule:
    /// indices, once handed out, never move.
    fn upsert(&mut self, name: OsString, inode: u64) {
        if let Some(&slot) = self.by_name.get(&name) {
            self.entries[slot] = None;
        }
        let slot = self.entries.len();
        self.entries.push(Some(Dirent {
            name: name.clone(),
            inode,
        }));
        self.by_name.insert(name, slot);
    }

    /// Returns the non-tombstoned entry's inode for `name`, if any (including tombstoned
    /// slots' former inode is not returned — tombstones are invisible to lookups).
    fn get(&self, name: &std::ffi::OsStr) -> Option<u64> {
        self.by_name
            .get(name)
            .and_then(|&slot| self.entries[slot].as_ref())
            .map(|d| d.inode)
    }

    /// Non-tombstoned entries in stored order.
    pub fn entries(&self) -> impl Iterator<Item = (&std::ffi::OsStr, u64)> {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref())
            .map(|d| (d.name.as_os_str(), d.inode))
    }
}

/// One entry in the append-only package table (§3). A tombstone is represented by `name` being
/// empty, per spec; this core never produces tombstones itself (package removal while mounted is
/// a non-goal) but keeps the representation so a future eviction implementation has somewhere to
/// put them without renumbering image indices.
#[derive(Debug, Clone)]
struct Package {
    name: String,
    meta: PackageMeta,
}

/// All virtual state, protected by one readers-writer lock.
struct Inner {
    packages: Vec<Package>,
    package_by_name: HashMap<String, usize>,
    /// Path -> inode for every virtual directory, including the root (`/`) and every exchange
    /// directory and its ancestors.
    directories_by_path: HashMap<PathBuf, u64>,
    /// inode -> virtual node, for every directory or symlink the model owns.
    nodes: HashMap<u64, VirtualNode>,
    /// Runtime unions recorded against an in-image inode, keyed by the external (codec-encoded)
    /// inode of the unioning directory, valued by the external inodes to concatenate at readdir
    /// time, in the order recorded.
    unions: HashMap<u64, Vec<u64>>,
    next_inode: u64,
}

/// The virtual overlay tree and package table (§3, §4.3).
pub struct Namespace {
    inner: RwLock<Inner>,
}

/// A snapshot of a live package, returned to the Filesystem Frontend so it can resolve the
/// package's image slot without holding the namespace lock across an image open.
#[derive(Debug, Clone)]
pub struct LivePackage {
    pub image_index: usize,
    pub name: String,
}

impl Namespace {
    /// Builds an empty namespace: just the root directory (inode 1) pre-created.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(crate::inode::ROOT_INODE, VirtualNode::Directory(Directory::default()));
        let mut directories_by_path = HashMap::new();
        directories_by_path.insert(PathBuf::from("/"), crate::inode::ROOT_INODE);

        Self {
            inner: RwLock::new(Inner {
                packages: Vec::new(),
                package_by_name: HashMap::new(),
                directories_by_path,
                nodes,
                unions: HashMap::new(),
                // 1 and 2 are reserved for root and ctl.
                next_inode: 3,
            }),
        }
    }

    /// Looks up a virtual inode's directory listing for `readdir`.
    pub fn readdir(&self, inode: u64) -> Result<Vec<(OsString, u64)>> {
        let inner = self.inner.read().unwrap();
        match inner.nodes.get(&inode) {
            Some(VirtualNode::Directory(dir)) => Ok(dir
                .entries()
                .map(|(name, inode)| (name.to_os_string(), inode))
                .collect()),
            Some(VirtualNode::Symlink(_)) => Err(Error::InvalidArgument(format!(
                "inode {inode} is not a directory"
            ))),
            None => Err(Error::NotFound),
        }
    }

    /// Looks up `name` inside the virtual directory `parent`.
    pub fn lookup(&self, parent: u64, name: &std::ffi::OsStr) -> Result<u64> {
        let inner = self.inner.read().unwrap();
        match inner.nodes.get(&parent) {
            Some(VirtualNode::Directory(dir)) => dir.get(name).ok_or(Error::NotFound),
            Some(VirtualNode::Symlink(_)) => Err(Error::InvalidArgument(format!(
                "inode {parent} is not a directory"
            ))),
            None => Err(Error::NotFound),
        }
    }

    /// Returns a clone of the virtual node for `inode`, used by `getattr`/`readlink`.
    pub fn node(&self, inode: u64) -> Result<VirtualNode> {
        self.inner
            .read()
            .unwrap()
            .nodes
            .get(&inode)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Runtime-union partners recorded for `inode`, in recording order. Empty if none.
    pub fn unions_of(&self, inode: u64) -> Vec<u64> {
        self.inner
            .read()
            .unwrap()
            .unions
            .get(&inode)
            .cloned()
            .unwrap_or_default()
    }

    /// The live (non-tombstoned) package table, in table order.
    pub fn live_packages(&self) -> Vec<LivePackage> {
        self.inner
            .read()
            .unwrap()
            .packages
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.name.is_empty())
            .map(|(image_index, p)| LivePackage {
                image_index,
                name: p.name.clone(),
            })
            .collect()
    }

    /// Resolves a live package name to its image index.
    pub fn package_image_index(&self, name: &str) -> Option<usize> {
        self.inner.read().unwrap().package_by_name.get(name).copied()
    }

    /// The package name recorded at `image_index`, if live.
    pub fn package_name(&self, image_index: usize) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .packages
            .get(image_index)
            .filter(|p| !p.name.is_empty())
            .map(|p| p.name.clone())
    }

    /// Returns the parsed metadata sidecar recorded for a package, if its image index is live.
    pub fn package_meta(&self, image_index: usize) -> Option<PackageMeta> {
        self.inner
            .read()
            .unwrap()
            .packages
            .get(image_index)
            .filter(|p| !p.name.is_empty())
            .map(|p| p.meta.clone())
    }

    /// Whether `name` already names a live package (used by `mkdir_all` precedence rule, §4.5).
    pub fn has_live_package(&self, name: &str) -> bool {
        self.inner.read().unwrap().package_by_name.contains_key(name)
    }

    /// The first live package whose name starts with `prefix`, if any. Used to resolve the
    /// configured libc package basename to a concrete image index (Open Question 9c).
    pub fn package_name_with_prefix(&self, prefix: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .packages
            .iter()
            .find(|p| !p.name.is_empty() && p.name.starts_with(prefix))
            .map(|p| p.name.clone())
    }

    /// Ensures `path` (and every ancestor) exists as an exchange directory, returning its
    /// inode. Idempotent.
    pub fn mkdir_all(&self, path: &Path) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        Self::mkdir_all_locked(&mut inner, path)
    }

    fn mkdir_all_locked(inner: &mut Inner, path: &Path) -> Result<u64> {
        let normalized = normalize(path);
        if let Some(&inode) = inner.directories_by_path.get(&normalized) {
            return Ok(inode);
        }

        let parent_path = normalized.parent().unwrap_or(Path::new("/")).to_path_buf();
        let parent_inode = if parent_path.as_os_str().is_empty() || parent_path == normalized {
            crate::inode::ROOT_INODE
        } else {
            Self::mkdir_all_locked(inner, &parent_path)?
        };
        let name = normalized
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("bad exchange directory path {path:?}")))?
            .to_os_string();

        let inode = inner.next_inode;
        inner.next_inode += 1;
        inner.nodes.insert(inode, VirtualNode::Directory(Directory::default()));
        inner.directories_by_path.insert(normalized, inode);

        match inner.nodes.get_mut(&parent_inode) {
            Some(VirtualNode::Directory(dir)) => dir.upsert(name, inode),
            _ => return Err(Error::InvalidArgument(format!("{parent_path:?} is not a directory"))),
        }
        Ok(inode)
    }

    /// Inserts `name -> symlink(target)` into the directory at `dir_inode`, unless an existing
    /// non-tombstoned entry under that name is itself a subdirectory: exchange directories
    /// always win over a same-named symlink, which is silently suppressed instead (§3).
    fn upsert_symlink_guarded(
        inner: &mut Inner,
        dir_inode: u64,
        name: OsString,
        target: PathBuf,
    ) -> Result<()> {
        let existing = match inner.nodes.get(&dir_inode) {
            Some(VirtualNode::Directory(dir)) => dir.get(&name),
            _ => return Err(Error::InvalidArgument(format!("{dir_inode} is not a directory"))),
        };
        if let Some(existing_inode) = existing {
            if matches!(inner.nodes.get(&existing_inode), Some(VirtualNode::Directory(_))) {
                trace!(?name, "symlink suppressed: shadowed by an existing subdirectory");
                return Ok(());
            }
        }
        let symlink_inode = inner.next_inode;
        inner.next_inode += 1;
        inner
            .nodes
            .insert(symlink_inode, VirtualNode::Symlink(Symlink { target }));
        match inner.nodes.get_mut(&dir_inode) {
            Some(VirtualNode::Directory(dir)) => dir.upsert(name, symlink_inode),
            _ => unreachable!("checked above"),
        }
        Ok(())
    }

    /// Creates a root-level exchange directory on behalf of a `MkdirAll` control call (§4.5).
    /// A no-op success if a live package already bears that name.
    pub fn control_mkdir(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "invalid exchange directory name {name:?}"
            )));
        }
        if self.has_live_package(name) {
            return Ok(());
        }
        self.mkdir_all(Path::new("/").join(name).as_path())?;
        Ok(())
    }

    /// Integrates one newly discovered package into the model (§4.3's scanning algorithm).
    ///
    /// `package_root` resolves a path inside a not-yet-open package image to an internal inode,
    /// and `open_image` lazily opens (or returns the already-open) `ImageReader` for a package
    /// name, both supplied by the Filesystem Frontend since only it owns image slots. Returns
    /// the package's newly assigned image index, or `None` if the package was already known
    /// (scan is idempotent, §8).
    pub fn scan_package(
        &self,
        name: &str,
        meta: PackageMeta,
        exchange_dirs: &[PathBuf],
        resolve_union_target: impl Fn(&str, &str) -> Result<(usize, u64)>,
        resolve_own_subdir: impl Fn(&str) -> Result<Option<u64>>,
        walk_exchange_subtree: impl Fn(usize, &Path) -> Result<Vec<(PathBuf, bool)>>,
        invalidate_dircache: impl Fn(u64),
    ) -> Result<Option<usize>> {
        let mut inner = self.inner.write().unwrap();
        if inner.package_by_name.contains_key(name) {
            debug!(package = name, "scan_package: already known, skipping");
            return Ok(None);
        }

        let image_index = inner.packages.len();
        inner.packages.push(Package {
            name: name.to_string(),
            meta: meta.clone(),
        });
        inner.package_by_name.insert(name.to_string(), image_index);
        drop(inner);

        for union in &meta.runtime_unions {
            match resolve_union_target(&union.pkg, &union.dir) {
                Ok((target_image_index, target_inode)) => {
                    if let Ok(Some(source_inode)) = resolve_own_subdir(&union.dir) {
                        let source_external =
                            crate::inode::encode(Some(image_index), source_inode);
                        let target_external =
                            crate::inode::encode(Some(target_image_index), target_inode);
                        let mut inner = self.inner.write().unwrap();
                        inner
                            .unions
                            .entry(source_external)
                            .or_default()
                            .push(target_external);
                        drop(inner);
                        invalidate_dircache(source_external);
                    }
                }
                Err(e) => {
                    warn!(
                        package = name,
                        target = %union.pkg,
                        error = %e,
                        "runtime union target unavailable, skipping"
                    );
                }
            }
        }

        for exchange_dir in exchange_dirs {
            let package_subdir = strip_out_prefix(exchange_dir);
            let entries = match walk_exchange_subtree(image_index, &package_subdir) {
                Ok(entries) => entries,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            for (relative_path, is_dir) in entries {
                let full_exchange_path = exchange_dir.join(&relative_path);
                if is_dir {
                    self.mkdir_all(&full_exchange_path)?;
                    continue;
                }
                let dir_path = full_exchange_path.parent().unwrap_or(Path::new("/"));
                let dir_inode = self.mkdir_all(dir_path)?;
                let link_name = match relative_path.file_name() {
                    Some(n) => n.to_os_string(),
                    None => continue,
                };
                let depth = dir_path.components().filter(|c| *c != Component::RootDir).count();
                let mut target = PathBuf::new();
                for _ in 0..depth {
                    target.push("..");
                }
                target.push(name);
                target.push(package_subdir.strip_prefix("/").unwrap_or(&package_subdir));
                target.push(&relative_path);

                let mut inner = self.inner.write().unwrap();
                Self::upsert_symlink_guarded(&mut inner, dir_inode, link_name, target)?;
            }
        }

        trace!(package = name, image_index, "scan_package: integrated");
        Ok(Some(image_index))
    }

    /// Installs a live package dirent at the mount root, pointing at the package image's own
    /// root inode via the [`ROOT_SENTINEL`] substitution the Inode Codec defers to its caller.
    pub fn install_root_dirent(&self, image_index: usize, name: &str) {
        let external = crate::inode::encode(Some(image_index), ROOT_SENTINEL);
        let mut inner = self.inner.write().unwrap();
        if let Some(VirtualNode::Directory(root)) = inner.nodes.get_mut(&crate::inode::ROOT_INODE) {
            root.upsert(OsString::from(name), external);
        }
    }

    /// Installs a single synthetic symlink at `dir_path/name`, creating `dir_path` (and its
    /// ancestors) as an exchange directory first if it doesn't already exist. Used for the
    /// `/lib/<loader>` symlink synthesized when `/lib` isn't among the active exchange
    /// directories (§6) — a one-off symlink outside the normal per-package scan walk.
    pub fn install_symlink(&self, dir_path: &Path, name: &str, target: PathBuf) -> Result<()> {
        let dir_inode = self.mkdir_all(dir_path)?;
        let mut inner = self.inner.write().unwrap();
        Self::upsert_symlink_guarded(&mut inner, dir_inode, OsString::from(name), target)
    }

    /// Installs the `ctl` symlink at the mount root (inode 2), pointing at the control socket
    /// path. Idempotent; call once at startup.
    pub fn install_ctl_symlink(&self, socket_path: &Path) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(
            crate::inode::CTL_INODE,
            VirtualNode::Symlink(Symlink {
                target: socket_path.to_path_buf(),
            }),
        );
        if let Some(VirtualNode::Directory(root)) = inner.nodes.get_mut(&crate::inode::ROOT_INODE) {
            root.upsert(OsString::from("ctl"), crate::inode::CTL_INODE);
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        if let Component::Normal(n) = component {
            out.push(n);
        }
    }
    out
}

/// Strips a leading `/out` prefix from a configured exchange-directory path, per §4.3's
/// "resolve the corresponding path inside the package image (with the `/out` prefix stripped)".
/// Exchange directories with no `/out` prefix (e.g. `/bin`) resolve against the image root as-is.
fn strip_out_prefix(path: &Path) -> PathBuf {
    path.strip_prefix("/out")
        .map(|p| Path::new("/").join(p))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_all_is_idempotent_and_prefix_closed() {
        let ns = Namespace::new();
        let inode = ns.mkdir_all(Path::new("/out/share/man")).unwrap();
        assert_eq!(ns.mkdir_all(Path::new("/out/share/man")).unwrap(), inode);

        assert!(ns.lookup(crate::inode::ROOT_INODE, std::ffi::OsStr::new("out")).is_ok());
        let out = ns.lookup(crate::inode::ROOT_INODE, std::ffi::OsStr::new("out")).unwrap();
        assert!(ns.lookup(out, std::ffi::OsStr::new("share")).is_ok());
    }

    #[test]
    fn root_listing_includes_created_directories() {
        let ns = Namespace::new();
        ns.mkdir_all(Path::new("/bin")).unwrap();
        let root_entries = ns.readdir(crate::inode::ROOT_INODE).unwrap();
        assert!(root_entries.iter().any(|(name, _)| name == "bin"));
    }

    #[test]
    fn ctl_symlink_is_installed_at_known_inode() {
        let ns = Namespace::new();
        ns.install_ctl_symlink(Path::new("/run/distrifs.sock"));
        match ns.node(crate::inode::CTL_INODE).unwrap() {
            VirtualNode::Symlink(s) => assert_eq!(s.target, Path::new("/run/distrifs.sock")),
            _ => panic!("expected symlink"),
        }
        let root_entries = ns.readdir(crate::inode::ROOT_INODE).unwrap();
        assert!(root_entries.iter().any(|(name, inode)| name == "ctl" && *inode == crate::inode::CTL_INODE));
    }

    #[test]
    fn install_symlink_creates_ancestors() {
        let ns = Namespace::new();
        ns.install_symlink(Path::new("/lib"), "ld-linux-x86-64.so.2", "../glibc-amd64/lib/ld-linux-x86-64.so.2".into())
            .unwrap();
        let lib = ns.lookup(crate::inode::ROOT_INODE, std::ffi::OsStr::new("lib")).unwrap();
        match ns.node(ns.lookup(lib, std::ffi::OsStr::new("ld-linux-x86-64.so.2")).unwrap()).unwrap() {
            VirtualNode::Symlink(s) => assert_eq!(s.target, Path::new("../glibc-amd64/lib/ld-linux-x86-64.so.2")),
            _ => panic!("expected symlink"),
        }
    }

    #[test]
    fn later_dirent_shadows_earlier_one_with_same_name() {
        let ns = Namespace::new();
        let dir_inode = ns.mkdir_all(Path::new("/bin")).unwrap();
        {
            let mut inner = ns.inner.write().unwrap();
            inner.nodes.insert(100, VirtualNode::Symlink(Symlink { target: "../a/bin/less".into() }));
            inner.nodes.insert(101, VirtualNode::Symlink(Symlink { target: "../b/bin/less".into() }));
            match inner.nodes.get_mut(&dir_inode) {
                Some(VirtualNode::Directory(dir)) => {
                    dir.upsert(OsString::from("less"), 100);
                    dir.upsert(OsString::from("less"), 101);
                }
                _ => unreachable!(),
            }
        }
        let entries = ns.readdir(dir_inode).unwrap();
        let matches: Vec<_> = entries.iter().filter(|(name, _)| name == "less").collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, 101);
    }

    #[test]
    fn symlink_is_suppressed_when_name_already_names_a_subdirectory() {
        let ns = Namespace::new();
        let man_inode = ns.mkdir_all(Path::new("/out/share/man")).unwrap();
        // A package's subdir happens to collide with a file contributed by another package
        // under the same basename ("man1" as both a directory and, hypothetically, a symlink).
        {
            let mut inner = ns.inner.write().unwrap();
            Namespace::upsert_symlink_guarded(
                &mut inner,
                man_inode,
                OsString::from("man1"),
                "../some-pkg/share/man/man1".into(),
            )
            .unwrap();
        }
        ns.mkdir_all(Path::new("/out/share/man/man1")).unwrap();
        {
            let mut inner = ns.inner.write().unwrap();
            Namespace::upsert_symlink_guarded(
                &mut inner,
                man_inode,
                OsString::from("man1"),
                "../other-pkg/share/man/man1".into(),
            )
            .unwrap();
        }
        let man1 = ns.lookup(man_inode, std::ffi::OsStr::new("man1")).unwrap();
        assert!(matches!(ns.node(man1).unwrap(), VirtualNode::Directory(_)));
    }
}
