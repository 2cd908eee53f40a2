//! Errors

use std::io;

use thiserror::Error;

/// Errors generated from the core filesystem library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("squashfs image error: {0}")]
    Image(#[from] backhand::BackhandError),

    #[error("no such entry")]
    NotFound,

    #[error("package {0:?} not found")]
    UnknownPackage(String),

    #[error("malformed metadata sidecar: {0}")]
    MalformedMetadata(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("package {0:?} already present")]
    DuplicatePackage(String),

    #[error("control socket error: {0}")]
    Control(String),
}

/// The three error kinds observable at the filesystem surface (§7 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoEntry,
    Io,
    InvalidArgument,
}

impl Error {
    /// Maps any internal error to the narrow kernel-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound | Error::UnknownPackage(_) => ErrorKind::NoEntry,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::StdIo(_)
            | Error::Image(_)
            | Error::MalformedMetadata(_)
            | Error::DuplicatePackage(_)
            | Error::Control(_) => ErrorKind::Io,
        }
    }

    /// Maps to the libc errno `fuser` replies expect.
    pub fn as_errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::NoEntry => libc::ENOENT,
            ErrorKind::Io => libc::EIO,
            ErrorKind::InvalidArgument => libc::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
