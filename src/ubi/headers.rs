//! This module contains the code necessary to read EC/VID headers and volume table records, with
//! magic, version and CRC verification.
//!
//! All multi-byte fields are big-endian. Offsets are from the start of each structure:
//!
//! ```text
//! EC header (64 bytes)          VID header (64 bytes)         Volume table record (172 bytes)
//!  0 magic "UBI#"     4          0 magic "UBI!"     4          0 reserved_pebs  4
//!  4 version          1          4 version          1          4 alignment      4
//!  5 padding          3          5 vol_type         1          8 data_pad       4
//!  8 ec               8          6 copy_flag        1         12 vol_type       1
//! 16 vid_hdr_offset   4          7 compat           1         13 upd_marker     1
//! 20 data_offset      4          8 vol_id           4         14 name_len       2
//! 24 image_seq        4         12 lnum             4         16 name         128
//! 28 padding         32         16 padding          4        144 flags          1
//! 60 hdr_crc          4         20 data_size        4        145 padding       23
//!                               24 used_ebs         4        168 crc            4
//!                               28 data_pad         4
//!                               32 data_crc         4
//!                               36 padding          4
//!                               40 sqnum            8
//!                               48 padding         12
//!                               60 hdr_crc          4
//! ```
//!
//! Each CRC covers every byte of its structure before the CRC field itself.

use std::collections::BTreeMap;

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::DekuContainerRead;
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use thiserror::Error;

use crate::util::PageUtil;

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;
pub const UBI_MAX_VOLUMES: usize = 128;
pub const UBI_VOL_NAME_MAX: usize = 127;

/// Volume IDs at or above this belong to UBI's internal volumes, rather than user data
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;

/// The internal volume holding the volume table
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;

const CRC_SIZE: usize = std::mem::size_of::<u32>();

/// Problems found while decoding a header. These are always scoped to a single block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Buffer too short for header: {actual} < {needed}")]
    Truncated { needed: usize, actual: usize },
    #[error("Header magic not found")]
    BadMagic,
    #[error("Unsupported header version: {0}")]
    BadVersion(u8),
    #[error("Header CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadCrc { stored: u32, computed: u32 },
    #[error("Invalid volume type: {0}")]
    BadVolType(u8),
    #[error("Invalid volume name")]
    BadName,
    #[error("Header offset {offset:#x} lies outside the block")]
    BadOffset { offset: u32 },
    #[error("Data CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    DataCrc { stored: u32, computed: u32 },
    #[error("Malformed header: {0}")]
    Malformed(String),
}

impl HeaderError {
    /// Is this a sign of a corrupt header, as opposed to there being no header at all?
    pub fn is_corruption(&self) -> bool {
        !matches!(self, Self::BadMagic)
    }
}

/// A header decoded on a best-effort basis, along with the integrity problem found in it (if any)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<T> {
    pub header: T,
    pub error: Option<HeaderError>,
}

impl<T> Decoded<T> {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        Decoded {
            header: f(self.header),
            error: self.error,
        }
    }
}

/// Check the CRC stored at the end of a fixed-size structure
fn check_crc(bytes: &[u8], stored: u32) -> Result<(), HeaderError> {
    let computed = UBI_CRC.checksum(&bytes[..bytes.len() - CRC_SIZE]);
    if stored == computed {
        Ok(())
    } else {
        Err(HeaderError::BadCrc { stored, computed })
    }
}

/// A trait missing from the `income` crate: implements parsing UBI headers from byteslices, with
/// magic, version and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> {
    const SIZE: usize;

    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;
    fn get_crc(&self) -> u32;

    /// Decode a header from the start of `buf`.
    ///
    /// A short buffer or a magic mismatch means there is no header here at all, and is an `Err`.
    /// A bad version or CRC is returned alongside the decoded header.
    fn parse(buf: &'a [u8]) -> Result<Decoded<Self>, HeaderError> {
        let buf = buf.get(..Self::SIZE).ok_or(HeaderError::Truncated {
            needed: Self::SIZE,
            actual: buf.len(),
        })?;

        let (_, header) =
            Self::from_bytes((buf, 0)).map_err(|e| HeaderError::Malformed(e.to_string()))?;

        if header.get_hdr_magic() != Self::get_magic() {
            return Err(HeaderError::BadMagic);
        }

        let error = check_crc(buf, header.get_crc()).err().or_else(|| {
            let version = header.get_hdr_version();
            (version != UBI_VERSION).then_some(HeaderError::BadVersion(version))
        });

        Ok(Decoded { header, error })
    }
}

impl ParseHeader<'_> for EcHdr {
    const SIZE: usize = UBI_EC_HDR_SIZE;

    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
}

impl ParseHeader<'_> for VidHdr {
    const SIZE: usize = UBI_VID_HDR_SIZE;

    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
}

/// Does this buffer begin with the EC header magic? This is how UBI blocks are told apart from
/// anything else in an image.
pub fn has_ec_magic(buf: &[u8]) -> bool {
    buf.starts_with(UBI_EC_HDR_MAGIC)
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    /// The erase counter: how many times this PEB has been erased
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,

    /// Identifies the UBI instance this PEB was formatted for
    pub image_seq: u32,
}

impl Ec {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Decoded<Self>, HeaderError> {
        EcHdr::parse(bytes).map(|x| x.map(Into::into))
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            x => Err(HeaderError::BadVolType(x)),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written.
    pub sqnum: u64,
}

impl Vid {
    /// Convert from a byte slice
    ///
    /// An unknown volume type is reported as an integrity problem, with `Dynamic` assumed.
    pub fn decode(bytes: &[u8]) -> Result<Decoded<Self>, HeaderError> {
        let Decoded { header, error } = VidHdr::parse(bytes)?;
        let (vid, type_error) = Self::from_raw(header);
        Ok(Decoded {
            header: vid,
            error: error.or(type_error),
        })
    }

    /// Is this block part of one of UBI's internal volumes?
    pub fn is_internal(&self) -> bool {
        self.vol_id >= UBI_INTERNAL_VOL_START
    }

    fn from_raw(value: VidHdr) -> (Self, Option<HeaderError>) {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let (vol_type, error) = match VolType::try_from(vol_type) {
            Ok(x) => (x, None),
            Err(e) => (VolType::default(), Some(e)),
        };

        let vid = Self {
            vol_type,
            copy_flag: copy_flag != 0,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        };

        (vid, error)
    }
}

/// This represents the specific fields we care about in a volume table record
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. Bytes that aren't UTF-8 are replaced.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Convert from a byte slice
    ///
    /// An unused slot in the volume table decodes as `None`.
    pub fn decode(bytes: &[u8]) -> Result<Decoded<Option<Self>>, HeaderError> {
        let bytes = bytes
            .get(..UBI_VTBL_RECORD_SIZE)
            .ok_or(HeaderError::Truncated {
                needed: UBI_VTBL_RECORD_SIZE,
                actual: bytes.len(),
            })?;

        let (_, raw) =
            VtblRecord::from_bytes((bytes, 0)).map_err(|e| HeaderError::Malformed(e.to_string()))?;
        let crc_error = check_crc(bytes, raw.crc).err();

        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = raw;

        if name_len == 0 {
            return Ok(Decoded {
                header: None,
                error: crc_error,
            });
        }

        let name = name
            .get(..name_len as usize)
            .filter(|_| name_len as usize <= UBI_VOL_NAME_MAX)
            .ok_or(HeaderError::BadName)?;
        let name = String::from_utf8_lossy(name).into_owned();

        let (vol_type, type_error) = match VolType::try_from(vol_type) {
            Ok(x) => (x, None),
            Err(e) => (VolType::default(), Some(e)),
        };

        Ok(Decoded {
            header: Some(Self {
                reserved_pebs,
                alignment,
                data_pad,
                vol_type,
                upd_marker: upd_marker != 0,
                name,
                flags,
            }),
            error: crc_error.or(type_error),
        })
    }
}

/// The volume table, indexed by volume ID
pub type VolumeTable = BTreeMap<u32, VolTableRecord>;

/// Decode the volume table found in the data area of a layout volume block.
///
/// Returns the table along with the problems found in any of its records. Records with problems
/// are left out of the table, unless `ignore_errors` is set and the record is still readable.
pub fn decode_volume_table(
    data: &[u8],
    ignore_errors: bool,
) -> (VolumeTable, Vec<(u32, HeaderError)>) {
    let mut table = VolumeTable::new();
    let mut errors = Vec::new();

    for (vol_id, bytes) in data
        .chunks_exact(UBI_VTBL_RECORD_SIZE)
        .take(UBI_MAX_VOLUMES)
        .enumerate()
    {
        let vol_id = vol_id as u32;

        // Never-written slot
        if bytes.is_erased() {
            continue;
        }

        match VolTableRecord::decode(bytes) {
            Ok(Decoded { header, error }) => {
                if let Some(error) = error {
                    errors.push((vol_id, error));
                    if !ignore_errors {
                        continue;
                    }
                }
                if let Some(record) = header {
                    table.insert(vol_id, record);
                }
            }
            Err(error) => errors.push((vol_id, error)),
        }
    }

    (table, errors)
}
