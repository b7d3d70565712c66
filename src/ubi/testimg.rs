//! Builds synthetic UBI images in memory, for tests.
//!
//! Unlike a real ubinize, blocks are written exactly in the order (and with the erase counters)
//! the test asks for, so wear-leveling leftovers and damaged blocks can be laid out by hand.

use std::num::NonZeroU32;

use super::headers::*;

pub const TEST_PEB_SIZE: NonZeroU32 = match NonZeroU32::new(1024) {
    Some(x) => x,
    None => panic!(),
};

const VID_HDR_OFFSET: u32 = 64;
const DATA_OFFSET: u32 = 128;

/// A VID header for LEB `lnum` of dynamic volume `vol_id`
pub fn vid(vol_id: u32, lnum: u32) -> Vid {
    Vid {
        vol_id,
        lnum,
        ..Default::default()
    }
}

pub struct ImageBuilder {
    peb_size: usize,
    image_seq: u32,
    sqnum: u64,
    data: Vec<u8>,

    /// Offset of every PEB written so far, in order
    pebs: Vec<usize>,
}

impl ImageBuilder {
    pub fn new(peb_size: NonZeroU32) -> Self {
        Self {
            peb_size: peb_size.get() as usize,
            image_seq: 0x5EED,
            sqnum: 0,
            data: Vec::new(),
            pebs: Vec::new(),
        }
    }

    /// The LEB size of a volume with no alignment padding
    pub fn leb_size(&self) -> usize {
        self.peb_size - DATA_OFFSET as usize
    }

    /// Change the image sequence number of blocks written from now on
    pub fn image_seq(&mut self, image_seq: u32) -> &mut Self {
        self.image_seq = image_seq;
        self
    }

    /// A dynamic volume table record
    pub fn record(name: &str, reserved_pebs: u32) -> VolTableRecord {
        VolTableRecord {
            reserved_pebs,
            alignment: 1,
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A static volume table record
    pub fn static_record(name: &str, reserved_pebs: u32) -> VolTableRecord {
        VolTableRecord {
            vol_type: VolType::Static,
            ..Self::record(name, reserved_pebs)
        }
    }

    /// Append raw bytes that aren't UBI blocks
    pub fn padding(&mut self, len: usize) -> &mut Self {
        self.data.resize(self.data.len() + len, 0xAA);
        self
    }

    /// Append arbitrary bytes
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    fn ec_header(&mut self, ec: u64) -> usize {
        let start = self.data.len();
        self.pebs.push(start);
        self.data.resize(start + self.peb_size, 0xFF);

        Ec {
            ec,
            vid_hdr_offset: VID_HDR_OFFSET,
            data_offset: DATA_OFFSET,
            image_seq: self.image_seq,
        }
        .encode(&mut self.data[start..])
        .unwrap();

        start
    }

    /// Append an unused PEB, with only an EC header
    pub fn free(&mut self, ec: u64) -> &mut Self {
        self.ec_header(ec);
        self
    }

    /// Append a PEB holding a LEB. The sequence number is assigned, unless `vid` already has one.
    pub fn leb(&mut self, ec: u64, mut vid: Vid, data: &[u8]) -> &mut Self {
        let start = self.ec_header(ec);

        self.sqnum += 1;
        if vid.sqnum == 0 {
            vid.sqnum = self.sqnum;
        }
        vid.encode(&mut self.data[start + VID_HDR_OFFSET as usize..])
            .unwrap();

        let data_start = start + DATA_OFFSET as usize;
        self.data[data_start..][..data.len()].copy_from_slice(data);
        self
    }

    /// Append a PEB holding a LEB of a static volume, with its data CRC
    pub fn static_leb(&mut self, ec: u64, vid: Vid, data: &[u8], used_ebs: u32) -> &mut Self {
        let vid = Vid {
            vol_type: VolType::Static,
            used_ebs,
            data_size: data.len() as u32,
            data_crc: UBI_CRC.checksum(data),
            ..vid
        };
        self.leb(ec, vid, data)
    }

    /// Append both copies of the layout volume, holding the given volume table
    pub fn layout(&mut self, records: &[(u32, VolTableRecord)]) -> &mut Self {
        self.layout_leb(0, records).layout_leb(1, records)
    }

    /// Append one copy of the layout volume
    pub fn layout_leb(&mut self, lnum: u32, records: &[(u32, VolTableRecord)]) -> &mut Self {
        let slots = (self.leb_size() / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES);

        let mut table = Vec::with_capacity(slots * UBI_VTBL_RECORD_SIZE);
        for slot in 0..slots as u32 {
            match records.iter().find(|(id, _)| *id == slot) {
                Some((_, record)) => table.extend(record.clone().into_bytes()),
                None => table.extend(VolTableRecord::none_into_bytes()),
            }
        }

        let layout_vid = Vid {
            compat: 5,
            ..vid(UBI_LAYOUT_VOLUME_ID, lnum)
        };
        self.leb(0, layout_vid, &table)
    }

    /// Split `content` into LEBs of a dynamic volume, written in order
    pub fn volume(&mut self, vol_id: u32, content: &[u8]) -> &mut Self {
        let leb_size = self.leb_size();
        for (lnum, chunk) in content.chunks(leb_size).enumerate() {
            self.leb(0, vid(vol_id, lnum as u32), chunk);
        }
        self
    }

    /// Flip a bit of the EC header CRC of the `n`th PEB written
    pub fn corrupt_ec(&mut self, n: usize) -> &mut Self {
        self.data[self.pebs[n] + UBI_EC_HDR_SIZE - 1] ^= 0x01;
        self
    }

    /// Flip a bit of the VID header CRC of the `n`th PEB written
    pub fn corrupt_vid(&mut self, n: usize) -> &mut Self {
        self.data[self.pebs[n] + VID_HDR_OFFSET as usize + UBI_VID_HDR_SIZE - 1] ^= 0x01;
        self
    }

    /// Flip a bit of the first data byte of the `n`th PEB written
    pub fn corrupt_data(&mut self, n: usize) -> &mut Self {
        self.data[self.pebs[n] + DATA_OFFSET as usize] ^= 0x01;
        self
    }

    /// Flip a bit of volume table record `slot` in the `n`th PEB written, which must be a copy of
    /// the layout volume
    pub fn corrupt_record(&mut self, n: usize, slot: usize) -> &mut Self {
        self.data[self.pebs[n] + DATA_OFFSET as usize + slot * UBI_VTBL_RECORD_SIZE] ^= 0x01;
        self
    }

    /// Overwrite the VID header area of the `n`th PEB written with non-header bytes
    pub fn scribble_vid(&mut self, n: usize) -> &mut Self {
        let start = self.pebs[n] + VID_HDR_OFFSET as usize;
        self.data[start..][..UBI_VID_HDR_SIZE].fill(0x00);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.data.clone()
    }
}

#[test]
fn test_builder_layout() {
    let mut img = ImageBuilder::new(TEST_PEB_SIZE);
    let leb_size = img.leb_size();
    img.padding(10)
        .layout(&[(2, ImageBuilder::record("x", 1))])
        .volume(2, &vec![0x77; leb_size + 1]);
    let image = img.build();

    // padding + 2 layout PEBs + 2 data PEBs
    assert_eq!(image.len(), 10 + 4 * TEST_PEB_SIZE.get() as usize);
    assert!(has_ec_magic(&image[10..]));
    assert!(!has_ec_magic(&image));
}
