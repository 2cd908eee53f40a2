//! Store scanning: enumerates `<name>.squashfs` images in the repo directory and integrates
//! newly discovered packages into the Namespace Model (§4.3, §6's "Store layout").
//!
//! This module only drives the Namespace Model's own `scan_package` algorithm; it owns no
//! state of its own beyond the repo path it's told to enumerate.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::frontend::Frontend;
use crate::image::FileType as ImageFileType;
use crate::namespace::metadata;
use crate::namespace::Namespace;

/// Enumerates `<name>.squashfs` files directly under `repo`, returning their basenames in
/// ascending sorted order.
///
/// Sorting matters: within one invocation, §4.3 says "the order in which packages are supplied
/// determines final shadowing" and later scans win. Package basenames like
/// `less-amd64-530` / `less-amd64-530-2` sort the older version first lexicographically (it's a
/// strict prefix of the newer one), which is exactly the tie-break scenario 1 in §8 requires.
pub fn discover_packages(repo: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(repo)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension() == Some(OsStr::new("squashfs")) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Scans every discovered package not already known, in sorted order, optionally restricted to
/// `allow` (the `-pkgs` startup flag; `None` scans everything discovered). Per-package failures
/// are logged and skipped — packages processed before a failing one remain integrated (§4.3
/// "Failure", §7 "Scan failures after mount are logged and leave the model in its pre-scan
/// state for the affected package only"). Returns the number of packages newly integrated.
pub fn scan_all(
    namespace: &Namespace,
    frontend: &Frontend,
    repo: &Path,
    exchange_dirs: &[PathBuf],
    allow: Option<&[String]>,
) -> Result<usize> {
    let discovered = discover_packages(repo)?;
    let mut scanned = 0;
    for name in discovered {
        if let Some(allow) = allow {
            if !allow.iter().any(|a| a == &name) {
                continue;
            }
        }
        match scan_one(namespace, frontend, repo, &name, exchange_dirs) {
            Ok(Some(_)) => scanned += 1,
            Ok(None) => {}
            Err(e) => warn!(package = %name, error = %e, "scan failed, skipping package"),
        }
    }
    Ok(scanned)
}

/// Reads and parses one package's metadata sidecar, then integrates it into the model. Returns
/// `Ok(None)` if the package was already known (scan is idempotent, §8).
fn scan_one(
    namespace: &Namespace,
    frontend: &Frontend,
    repo: &Path,
    name: &str,
    exchange_dirs: &[PathBuf],
) -> Result<Option<usize>> {
    let meta_path = repo.join(format!("{name}.meta.textproto"));
    let meta_src = fs::read_to_string(&meta_path)?;
    let meta = metadata::parse(&meta_src)?;

    let result = namespace.scan_package(
        name,
        meta,
        exchange_dirs,
        |target_pkg, dir| resolve_union_target(namespace, frontend, target_pkg, dir),
        |dir| resolve_own_subdir(namespace, frontend, name, dir),
        |image_index, subdir| walk_exchange_subtree(frontend, image_index, subdir),
        |external| frontend.invalidate_dircache(external),
    )?;

    if let Some(image_index) = result {
        info!(package = name, image_index, "scanned package");
        namespace.install_root_dirent(image_index, name);
    }
    Ok(result)
}

/// Resolves a runtime union's `(target_pkg, dir)` declaration to the target package's image
/// index and the internal inode of `out/<dir>` inside it.
fn resolve_union_target(
    namespace: &Namespace,
    frontend: &Frontend,
    target_pkg: &str,
    dir: &str,
) -> Result<(usize, u64)> {
    let image_index = namespace
        .package_image_index(target_pkg)
        .ok_or_else(|| Error::UnknownPackage(target_pkg.to_string()))?;
    let image = frontend.ensure_open(image_index)?;
    let inode = image.lookup_path(&format!("out/{dir}"))?;
    Ok((image_index, inode))
}

/// Resolves `out/<dir>` inside the package currently being scanned. `None` if the package has
/// no such subtree (a package need not ship every subdir it declares a union against).
fn resolve_own_subdir(
    namespace: &Namespace,
    frontend: &Frontend,
    name: &str,
    dir: &str,
) -> Result<Option<u64>> {
    let image_index = namespace
        .package_image_index(name)
        .ok_or_else(|| Error::UnknownPackage(name.to_string()))?;
    let image = frontend.ensure_open(image_index)?;
    match image.lookup_path(&format!("out/{dir}")) {
        Ok(inode) => Ok(Some(inode)),
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Recursively walks `subdir` (relative to the package image root, with any `/out` prefix
/// already stripped by the caller) and returns every descendant as `(relative_path,
/// is_directory)`, relative to `subdir` itself, in breadth-first discovery order.
///
/// Returns [`Error::NotFound`] if `subdir` doesn't exist in this package's image, which
/// `Namespace::scan_package` treats as "this package doesn't contribute to this exchange
/// directory" rather than a scan failure.
fn walk_exchange_subtree(
    frontend: &Frontend,
    image_index: usize,
    subdir: &Path,
) -> Result<Vec<(PathBuf, bool)>> {
    let image = frontend.ensure_open(image_index)?;
    let root_inode = image.lookup_path(&subdir.to_string_lossy())?;

    let mut out = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back((root_inode, PathBuf::new()));
    while let Some((inode, prefix)) = queue.pop_front() {
        for (child_name, child_inode, file_type) in image.readdir(inode)? {
            let relative = prefix.join(&child_name);
            match file_type {
                ImageFileType::Directory => {
                    out.push((relative.clone(), true));
                    queue.push_back((child_inode, relative));
                }
                _ => out.push((relative, false)),
            }
        }
    }
    Ok(out)
}
