//! This module contains code to scan a raw image for UBI blocks and determine their contents.

use std::collections::BTreeMap;

use super::headers::*;
use super::ScanConfig;
use crate::source::{BlockSource, ReadAt};
use crate::util::PageUtil;

/// The headers that could be recovered from a UBI block, in the order UBI writes them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHeaders {
    /// Only the EC header can be used. The block is free, or its VID header is missing or was
    /// rejected.
    Ec(Ec),

    /// The block holds a LEB of some volume
    EcVid(Ec, Vid),

    /// The block holds a copy of the volume table, in the layout volume
    Layout(Ec, Vid, VolumeTable),
}

impl BlockHeaders {
    pub fn ec(&self) -> &Ec {
        match self {
            Self::Ec(ec) | Self::EcVid(ec, _) | Self::Layout(ec, _, _) => ec,
        }
    }

    pub fn vid(&self) -> Option<&Vid> {
        match self {
            Self::Ec(_) => None,
            Self::EcVid(_, vid) | Self::Layout(_, vid, _) => Some(vid),
        }
    }
}

/// A UBI block found in the image. Blocks are never modified once scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Position of this block among the UBI blocks found, in scan order
    pub peb_num: u32,

    /// Where the block begins in the image file
    pub file_offset: u64,

    /// The size of the whole PEB
    pub size: u32,

    headers: BlockHeaders,
    errors: Vec<HeaderError>,

    /// Volume table records that failed to decode, by volume ID. These don't make the block
    /// invalid: the rest of the table is still usable.
    table_errors: Vec<(u32, HeaderError)>,
}

impl Block {
    /// Decode the header chain of a block which begins with the EC header magic.
    ///
    /// Problems with headers are kept in the block rather than returned. Unless `ignore_errors`
    /// is set, a corrupt header stops decoding of the headers after it. Returns `None` only if
    /// not even the EC header can be read.
    fn decode(
        peb_num: u32,
        file_offset: u64,
        buf: &[u8],
        ignore_errors: bool,
    ) -> Option<Self> {
        let Decoded { header: ec, error } = Ec::decode(buf).ok()?;

        let mut errors = Vec::new();
        let mut table_errors = Vec::new();
        let headers = Self::decode_chain(
            ec,
            error,
            buf,
            ignore_errors,
            &mut errors,
            &mut table_errors,
        );

        Some(Self {
            peb_num,
            file_offset,
            size: buf.len() as u32,
            headers,
            errors,
            table_errors,
        })
    }

    fn decode_chain(
        ec: Ec,
        ec_error: Option<HeaderError>,
        buf: &[u8],
        ignore_errors: bool,
        errors: &mut Vec<HeaderError>,
        table_errors: &mut Vec<(u32, HeaderError)>,
    ) -> BlockHeaders {
        if let Some(error) = ec_error {
            errors.push(error);
            if !ignore_errors {
                return BlockHeaders::Ec(ec);
            }
        }

        let Some(vid_bytes) = buf
            .get(ec.vid_hdr_offset as usize..)
            .and_then(|x| x.get(..UBI_VID_HDR_SIZE))
        else {
            errors.push(HeaderError::BadOffset {
                offset: ec.vid_hdr_offset,
            });
            return BlockHeaders::Ec(ec);
        };

        let vid = match Vid::decode(vid_bytes) {
            Ok(Decoded { header, error }) => {
                if let Some(error) = error {
                    errors.push(error);
                    if !ignore_errors {
                        return BlockHeaders::Ec(ec);
                    }
                }
                header
            }

            // No VID header and nothing written where it would be: this PEB is simply unused
            Err(HeaderError::BadMagic) if vid_bytes.is_erased() => return BlockHeaders::Ec(ec),

            Err(error) => {
                errors.push(error);
                return BlockHeaders::Ec(ec);
            }
        };

        let Some(data) = buf.get(ec.data_offset as usize..) else {
            errors.push(HeaderError::BadOffset {
                offset: ec.data_offset,
            });
            return BlockHeaders::Ec(ec);
        };

        if vid.data_size > 0 {
            match data.get(..vid.data_size as usize) {
                Some(bytes) => {
                    let computed = UBI_CRC.checksum(bytes);
                    if computed != vid.data_crc {
                        errors.push(HeaderError::DataCrc {
                            stored: vid.data_crc,
                            computed,
                        });
                    }
                }
                None => errors.push(HeaderError::Truncated {
                    needed: vid.data_size as usize,
                    actual: data.len(),
                }),
            }
        }

        if vid.vol_id == UBI_LAYOUT_VOLUME_ID {
            let (table, bad_records) = decode_volume_table(data, ignore_errors);
            *table_errors = bad_records;
            BlockHeaders::Layout(ec, vid, table)
        } else {
            BlockHeaders::EcVid(ec, vid)
        }
    }

    pub fn headers(&self) -> &BlockHeaders {
        &self.headers
    }

    pub fn ec(&self) -> &Ec {
        self.headers.ec()
    }

    pub fn vid(&self) -> Option<&Vid> {
        self.headers.vid()
    }

    /// The LEB this block holds, if it holds one at all
    pub fn leb_num(&self) -> Option<u32> {
        self.vid().map(|vid| vid.lnum)
    }

    pub fn vol_id(&self) -> Option<u32> {
        self.vid().map(|vid| vid.vol_id)
    }

    pub fn image_seq(&self) -> u32 {
        self.ec().image_seq
    }

    /// The volume table held by this block, if it is part of the layout volume
    pub fn volume_table(&self) -> Option<&VolumeTable> {
        match &self.headers {
            BlockHeaders::Layout(_, _, table) => Some(table),
            _ => None,
        }
    }

    pub fn is_internal_volume(&self) -> bool {
        self.vid().is_some_and(Vid::is_internal)
    }

    pub fn is_volume_table(&self) -> bool {
        matches!(self.headers, BlockHeaders::Layout(..))
    }

    /// Did every header (and data CRC, where present) check out?
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The problems found while decoding this block
    pub fn errors(&self) -> &[HeaderError] {
        &self.errors
    }

    /// The volume table records of this block that were damaged, by volume ID
    pub fn table_errors(&self) -> &[(u32, HeaderError)] {
        &self.table_errors
    }

    /// The file offset of the data area (i.e. the start of the LEB)
    pub fn data_offset(&self) -> u64 {
        self.file_offset + u64::from(self.ec().data_offset)
    }

    /// The size of the data area, ignoring any volume alignment padding
    pub fn data_len(&self) -> u32 {
        self.size.saturating_sub(self.ec().data_offset)
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PEB {} @ {:#x}: ", self.peb_num, self.file_offset)?;
        match &self.headers {
            BlockHeaders::Ec(ec) => write!(f, "free, ec={}", ec.ec)?,
            BlockHeaders::EcVid(ec, vid) => write!(
                f,
                "vol {} LEB {}, ec={}, sqnum={}",
                vid.vol_id, vid.lnum, ec.ec, vid.sqnum
            )?,
            BlockHeaders::Layout(ec, vid, table) => write!(
                f,
                "layout LEB {}, {} volume(s), ec={}, sqnum={}",
                vid.lnum,
                table.len(),
                ec.ec,
                vid.sqnum
            )?,
        }
        if !self.is_valid() {
            write!(f, " [invalid: {}]", self.errors[0])?;
        }
        for (vol_id, error) in &self.table_errors {
            write!(f, " [record {vol_id}: {error}]")?;
        }
        Ok(())
    }
}

/// Every UBI block found in an image, keyed by PEB number
pub type BlockMap = BTreeMap<u32, Block>;

/// The result of [scan_blocks]
#[derive(Debug, Default, Clone)]
pub struct Scan {
    pub blocks: BlockMap,

    /// Bytes of the window skipped before the first UBI block was found
    pub leading_dead_space: u64,

    /// Bytes of the window, in total, that did not hold UBI blocks
    pub dead_space: u64,
}

impl Scan {
    fn push(mut self, block: Block) -> Self {
        self.blocks.insert(block.peb_num, block);
        self
    }

    fn skip(mut self, len: u64) -> Self {
        if self.blocks.is_empty() {
            self.leading_dead_space += len;
        }
        self.dead_space += len;
        self
    }

    /// The PEB number the next UBI block found will get
    fn next_peb_num(&self) -> u32 {
        self.blocks.len() as u32
    }
}

/// Walk the window of `source` one block at a time, and decode every block that begins with an
/// EC header.
///
/// Strides that don't begin with the EC magic (bootloaders, padding, garbage) are skipped without
/// consuming a PEB number, so the scan re-synchronizes on the next UBI block wherever it is.
pub fn scan_blocks<R: ReadAt>(
    source: &BlockSource<R>,
    config: &ScanConfig,
) -> anyhow::Result<Scan> {
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(source.block_count());

    let mut buf = vec![0u8; source.block_size().get() as usize];
    let scan = source
        .block_offsets()
        .try_fold(Scan::default(), |scan, offset| -> anyhow::Result<Scan> {
            rpt.inc();
            let len = source.read_block(offset, &mut buf)?;

            // A short read is the tail end of the window; it can't hold a whole block
            let block = (len == buf.len() && has_ec_magic(&buf))
                .then(|| {
                    Block::decode(
                        scan.next_peb_num(),
                        offset,
                        &buf,
                        config.ignore_block_errors,
                    )
                })
                .flatten();

            Ok(match block {
                Some(block) => {
                    if !block.is_valid() || !block.table_errors().is_empty() {
                        rpt.add_warn(format!("{block}"));
                    }
                    scan.push(block)
                }
                None => scan.skip(len as u64),
            })
        })?;

    if scan.leading_dead_space > 0 {
        rpt.add_info(format!(
            "Skipped {:#x} bytes before the first UBI block",
            scan.leading_dead_space
        ));
    }
    rpt.close();

    Ok(scan)
}
