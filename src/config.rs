//! Command-line configuration (§6).

use std::path::PathBuf;

use clap::Parser;

/// The built-in exchange-directory set (§6), in the order new packages are walked against them.
pub const BUILTIN_EXCHANGE_DIRS: &[&str] = &[
    "/bin",
    "/out/lib",
    "/out/lib/gio",
    "/out/lib/girepository-1.0",
    "/out/include",
    "/out/share/aclocal",
    "/out/share/gettext",
    "/out/share/gir-1.0",
    "/out/share/glib-2.0/schemas",
    "/out/share/mime",
    "/out/share/man",
    "/out/share/dbus-1",
    "/out/share/fonts/truetype",
    "/out/share/X11/xorg.conf.d",
    "/out/gopath",
];

/// Default compiled-in store path, used when `-repo` is not given.
pub const DEFAULT_REPO: &str = "/var/lib/distrifs/store";

/// A read-only FUSE filesystem presenting a store of SquashFS package images as a single
/// unified namespace.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the package store directory (contains `<name>.squashfs` / `<name>.meta.textproto`
    /// pairs).
    #[arg(long = "repo", default_value = DEFAULT_REPO)]
    pub repo: PathBuf,

    /// File descriptor to close once the mount is live, signalling readiness to a supervising
    /// process.
    #[arg(long = "readiness")]
    pub readiness: Option<i32>,

    /// Restrict the set of exchange directories to this comma-separated subset of the built-in
    /// set. Defaults to the full built-in set.
    #[arg(long = "overlays", value_delimiter = ',')]
    pub overlays: Option<Vec<String>>,

    /// Restrict the set of packages scanned at startup to this comma-separated list of basenames
    /// (without the `.squashfs` suffix). Defaults to scanning every package found in `-repo`.
    #[arg(long = "pkgs", value_delimiter = ',')]
    pub pkgs: Option<Vec<String>>,

    /// Basename prefix identifying the canonical libc package, used to resolve the synthetic
    /// `/lib/<loader>` symlink (Open Question 9c).
    #[arg(long = "libc-pkg", default_value = "glibc-amd64")]
    pub libc_pkg: String,

    /// Path of the dynamic loader inside the canonical libc package's image.
    #[arg(long = "libc-loader-path", default_value = "lib/ld-linux-x86-64.so.2")]
    pub libc_loader_path: String,

    /// Mount point.
    pub mountpoint: PathBuf,
}

impl Args {
    /// The effective exchange-directory set after applying `-overlays`.
    pub fn exchange_dirs(&self) -> Vec<PathBuf> {
        match &self.overlays {
            Some(selected) => BUILTIN_EXCHANGE_DIRS
                .iter()
                .filter(|d| selected.iter().any(|s| s == *d))
                .map(PathBuf::from)
                .collect(),
            None => BUILTIN_EXCHANGE_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}
