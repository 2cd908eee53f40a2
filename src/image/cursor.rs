//! Adapts `backhand`'s forward-only, per-file [`std::io::Read`] adapter into the positional
//! `read_at` this crate's [`super::ImageReader`] exposes.
//!
//! SquashFS file data is stored as a sequence of independently-compressed blocks (plus an
//! optional trailing fragment) and `backhand`'s reader only exposes sequential [`Read`] over
//! them, with no seek primitive. Holding that reader alive across FUSE calls would make
//! [`super::ImageReader`] self-referential (the reader borrows from the very
//! `FilesystemReader` the image owns), which isn't expressible without unsafe code or an
//! extra self-referencing-struct crate this pack's teacher never reaches for. Instead, the
//! "positional byte reader" this core's spec calls for is implemented as a memoized,
//! fully-decompressed byte buffer per file inode: decompression happens in full exactly once
//! (coalesced the same way a streaming reader's first open would be), and every `read_at`
//! after that is a plain slice copy that trivially supports arbitrary offsets and short reads
//! at end-of-file. Package store contents (binaries, shared libraries, small data files) are
//! comfortably sized for this; see `DESIGN.md` for the tradeoff this resolves.

use std::io::Read;

use backhand::{FilesystemReader, InnerNode};

use crate::error::{Error, Result};

pub struct FileCursor {
    file_node_index: usize,
    bytes: Option<Vec<u8>>,
}

impl FileCursor {
    pub fn new(file_node_index: usize) -> Self {
        Self {
            file_node_index,
            bytes: None,
        }
    }

    pub fn read_at(
        &mut self,
        filesystem: &FilesystemReader<'_>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if self.bytes.is_none() {
            self.bytes = Some(Self::decompress(filesystem, self.file_node_index)?);
        }
        let bytes = self.bytes.as_ref().expect("just populated above");

        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(bytes.len());
        let n = end - offset;
        buf[..n].copy_from_slice(&bytes[offset..end]);
        Ok(n)
    }

    fn decompress(filesystem: &FilesystemReader<'_>, file_node_index: usize) -> Result<Vec<u8>> {
        let node = filesystem
            .files()
            .nth(file_node_index)
            .ok_or(Error::NotFound)?;
        let file = match &node.inner {
            InnerNode::File(f) => f,
            _ => return Err(Error::NotFound),
        };
        let mut reader = filesystem.file(file).reader();
        let mut out = Vec::with_capacity(file.file_len());
        reader.read_to_end(&mut out)?;
        Ok(out)
    }
}
