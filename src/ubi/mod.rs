//! This module reconstructs the volumes of a UBI image from a raw flash dump.
//!
//! UBI writes two headers at the start of every physical eraseblock ("PEB") it uses: an "erase
//! counter" ("EC") header, and if the block holds data, a "volume ID" ("VID") header naming the
//! volume and logical eraseblock ("LEB") number it belongs to. The LEBs of a volume are scattered
//! around the flash in no particular order, and wear-leveling may leave stale copies behind:
//!
//! ```text
//! PEB:   0         1         2         3         4         5
//!     +---------+---------+---------+---------+---------+---------+
//!     | layout  | layout  | vol 0   | (free)  | vol 1   | vol 0   |
//!     | LEB 0   | LEB 1   | LEB 1   |         | LEB 0   | LEB 0   |
//!     +---------+---------+---------+---------+---------+---------+
//! ```
//!
//! Reading an image happens in three passes:
//! 1. [scan_blocks] walks the image one PEB-sized stride at a time and decodes every block that
//!    starts with an EC header, skipping anything else (bootloaders, padding).
//! 2. [build_images] groups the blocks by image, reads the volume table out of the layout volume,
//!    and decides which block holds the live copy of every LEB.
//! 3. [LebVirtualFile] reads a volume back in LEB order, as one contiguous file.
//!
//! [Ubi] does all of this for one source.

mod headers;
mod leb_file;
mod scan;
#[cfg(test)]
mod testimg;
mod volume;

use std::num::NonZeroU32;

pub use headers::{
    has_ec_magic, Decoded, Ec, HeaderError, Vid, VolTableRecord, VolType, VolumeTable,
    UBI_INTERNAL_VOL_START, UBI_LAYOUT_VOLUME_ID,
};
pub use leb_file::LebVirtualFile;
pub use scan::{scan_blocks, Block, BlockHeaders, BlockMap, Scan};
pub use volume::{build_images, Image, Volume};

use crate::source::{BlockSource, ReadAt};

/// How to scan an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// The PEB size, which is also the stride of the scan
    pub block_size: NonZeroU32,

    /// Where in the source to begin scanning
    pub start_offset: u64,

    /// Where in the source to stop scanning; the end of the source if `None`
    pub end_offset: Option<u64>,

    /// Use blocks with damaged headers or data as best as possible, instead of leaving them out
    pub ignore_block_errors: bool,
}

impl ScanConfig {
    /// Scan the whole source, in strides of `block_size`
    pub fn new(block_size: NonZeroU32) -> Self {
        Self {
            block_size,
            start_offset: 0,
            end_offset: None,
            ignore_block_errors: false,
        }
    }

    pub fn start_offset(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn end_offset(mut self, offset: u64) -> Self {
        self.end_offset = Some(offset);
        self
    }

    pub fn ignore_block_errors(mut self, ignore: bool) -> Self {
        self.ignore_block_errors = ignore;
        self
    }
}

/// A scanned and indexed UBI source
pub struct Ubi<R> {
    source: BlockSource<R>,
    scan: Scan,
    images: Vec<Image>,
}

impl<R: ReadAt> Ubi<R> {
    /// Scan `inner` for UBI blocks and index the images and volumes found.
    ///
    /// Only failing to read `inner` is an error. Damaged blocks are reported through `howudoin`
    /// and flagged on the blocks and volumes they affect.
    pub fn open(inner: R, config: &ScanConfig) -> anyhow::Result<Self> {
        let source = BlockSource::new(
            inner,
            config.block_size,
            config.start_offset,
            config.end_offset,
        )?;
        let scan = scan_blocks(&source, config)?;
        let images = build_images(&scan.blocks, config);

        Ok(Self {
            source,
            scan,
            images,
        })
    }

    pub fn source(&self) -> &BlockSource<R> {
        &self.source
    }

    /// The results of the block scan, including how much of the source was not UBI
    pub fn scan(&self) -> &Scan {
        &self.scan
    }

    /// Every block found, keyed by PEB number
    pub fn blocks(&self) -> &BlockMap {
        &self.scan.blocks
    }

    /// Every image found, in order of image sequence number
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Open a volume of one of this source's images for reading
    pub fn volume_file<'a>(&'a self, volume: &'a Volume) -> LebVirtualFile<'a, R> {
        LebVirtualFile::new(&self.source, &self.scan.blocks, volume)
    }
}
