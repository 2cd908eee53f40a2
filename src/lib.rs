//! A read-only FUSE filesystem that presents a store of immutable SquashFS package images as a
//! single unified namespace: one subdirectory per package plus a set of *exchange directories*
//! aggregating well-known package outputs (`/bin`, `/out/lib`, `/out/share/man`, ...) as
//! symlinks, with newer package versions shadowing older ones. A small control channel,
//! reachable through the root-level `ctl` symlink, lets an external client trigger a rescan or
//! create additional exchange directories at runtime.
//!
//! The crate is organized the way the spec's component breakdown lays it out:
//!
//! - [`image`] — read-only random access to one SquashFS image (wraps [`backhand`]).
//! - [`inode`] — the bijection between external (kernel-facing) and (image index, internal
//!   inode) identifiers.
//! - [`namespace`] — the virtual overlay tree: packages, exchange directories, runtime unions.
//! - [`frontend`] — the `fuser::Filesystem` implementation tying the above two together.
//! - [`control`] — the Unix-domain-socket administrative RPC service.
//! - [`scanner`] — store enumeration and the scan-a-package orchestration.
#![doc = document_features::document_features!()]

pub mod config;
pub mod control;
pub mod error;
pub mod frontend;
pub mod image;
pub mod inode;
pub mod libc_loader;
pub mod namespace;
pub mod scanner;

pub use config::Args;
pub use error::{Error, Result};
pub use frontend::Frontend;
pub use namespace::Namespace;
