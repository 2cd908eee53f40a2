//! Synthesizes the `/lib/<loader>` symlink pointing at the dynamic loader inside the canonical
//! libc package, when `/lib` isn't itself among the active exchange directories (§6, Open
//! Question 9c). Binaries in the store hardcode this interpreter path, so a store configured
//! without `/lib` as one of its `-overlays` still needs it resolvable.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::namespace::Namespace;

/// Installs the loader symlink if `/lib` isn't active and a live package matches
/// `libc_pkg_prefix`. A no-op, logged at `warn`, if no such package is currently live — a store
/// built for a different architecture may legitimately have none, and this is not a fatal
/// startup error.
pub fn maybe_install(
    namespace: &Namespace,
    libc_pkg_prefix: &str,
    loader_path: &str,
    active_exchange_dirs: &[PathBuf],
) -> Result<()> {
    if active_exchange_dirs.iter().any(|d| d.as_path() == Path::new("/lib")) {
        return Ok(());
    }

    let Some(libc_name) = namespace.package_name_with_prefix(libc_pkg_prefix) else {
        warn!(
            prefix = libc_pkg_prefix,
            "no live package matches libc-pkg prefix; /lib loader symlink not created"
        );
        return Ok(());
    };

    let loader_name = match Path::new(loader_path).file_name() {
        Some(n) => n.to_os_string(),
        None => {
            warn!(loader_path, "libc-loader-path has no file name component");
            return Ok(());
        }
    };

    let target = Path::new("..").join(&libc_name).join(loader_path);
    namespace.install_symlink(Path::new("/lib"), &loader_name.to_string_lossy(), target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_when_lib_is_already_active() {
        let ns = Namespace::new();
        maybe_install(&ns, "glibc-amd64", "lib/ld-linux-x86-64.so.2", &[PathBuf::from("/lib")]).unwrap();
        assert!(ns.lookup(crate::inode::ROOT_INODE, std::ffi::OsStr::new("lib")).is_err());
    }

    #[test]
    fn skips_quietly_when_no_libc_package_is_live() {
        let ns = Namespace::new();
        maybe_install(&ns, "glibc-amd64", "lib/ld-linux-x86-64.so.2", &[]).unwrap();
        assert!(ns.lookup(crate::inode::ROOT_INODE, std::ffi::OsStr::new("lib")).is_err());
    }
}
