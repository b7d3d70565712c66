//! Abstractions to access the raw image being scanned.
//!
//! Everything here reads through *positioned* reads, so there is no shared cursor: a scan and any
//! number of virtual files may read the same source at the same time.

use std::fs::File;
use std::io;
use std::num::NonZeroU32;

use anyhow::{ensure, Context};

use crate::util::ReadAtExt;

/// A byte source that can be read at arbitrary offsets
pub trait ReadAt {
    /// Read up to `buf.len()` bytes starting at `offset`, returning how many were read
    ///
    /// Returns 0 at (or past) the end of the source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the source, in bytes
    fn size(&self) -> io::Result<u64>;
}

impl ReadAt for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        return std::os::unix::fs::FileExt::read_at(self, buf, offset);

        #[cfg(windows)]
        return std::os::windows::fs::FileExt::seek_read(self, buf, offset);
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset).map_or(self.len(), |x| x.min(self.len()));
        let len = buf.len().min(self.len() - start);
        buf[..len].copy_from_slice(&self[start..start + len]);
        Ok(len)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.as_slice().read_at(offset, buf)
    }

    fn size(&self) -> io::Result<u64> {
        self.as_slice().size()
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}

/// A raw image, viewed as a sequence of fixed-size blocks within a `[start, end)` window
#[derive(Debug)]
pub struct BlockSource<R> {
    inner: R,
    block_size: NonZeroU32,
    start_offset: u64,
    end_offset: u64,
}

impl<R: ReadAt> BlockSource<R> {
    /// Wrap a byte source. An `end_offset` of `None`, or one past the end of the source, means
    /// the end of the source.
    pub fn new(
        inner: R,
        block_size: NonZeroU32,
        start_offset: u64,
        end_offset: Option<u64>,
    ) -> anyhow::Result<Self> {
        let size = inner.size().context("could not determine image size")?;
        let end_offset = end_offset.map_or(size, |x| x.min(size));
        ensure!(
            start_offset <= end_offset,
            "start offset {start_offset:#x} is past end offset {end_offset:#x}",
        );

        Ok(Self {
            inner,
            block_size,
            start_offset,
            end_offset,
        })
    }

    pub fn block_size(&self) -> NonZeroU32 {
        self.block_size
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// How many block-sized strides fit (even partially) in the window
    pub fn block_count(&self) -> u64 {
        let block_size = u64::from(self.block_size.get());
        (self.end_offset - self.start_offset + block_size - 1) / block_size
    }

    /// The file offsets of every block-sized stride in the window, in order
    pub fn block_offsets(&self) -> impl Iterator<Item = u64> {
        (self.start_offset..self.end_offset).step_by(self.block_size.get() as usize)
    }

    /// Read the block beginning at `offset` into `buf`, which is truncated at the end of the
    /// window. Returns the number of bytes read.
    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        let len = buf
            .len()
            .min(self.block_size.get() as usize)
            .min(usize::try_from(self.end_offset.saturating_sub(offset)).unwrap_or(usize::MAX));

        self.inner
            .read_full_at(offset, &mut buf[..len])
            .with_context(|| format!("could not read block at offset {offset:#x}"))
    }

    /// Read arbitrary bytes from the underlying source, ignoring the window
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.inner
            .read_full_at(offset, buf)
            .with_context(|| format!("could not read {} bytes at offset {offset:#x}", buf.len()))
    }
}
