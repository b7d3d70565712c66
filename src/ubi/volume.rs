//! This module groups scanned blocks into images and volumes.
//!
//! An image is every block sharing one `image_seq`. Its volume table comes from the layout
//! volume; each volume then maps its LEB numbers onto the PEBs currently holding them.

use std::collections::BTreeMap;

use super::headers::{VolTableRecord, VolType, VolumeTable};
use super::scan::{Block, BlockMap};
use super::ScanConfig;

/// A UBI volume, as recovered from the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    vol_id: u32,
    record: Option<VolTableRecord>,
    vol_type: VolType,
    leb_size: u32,

    /// LEB number => PEB number of the block holding its live copy
    lebs: BTreeMap<u32, u32>,

    /// For static volumes, the number of LEBs the volume claims to use
    used_ebs: Option<u32>,

    data_size: u64,
    degraded: bool,
}

impl Volume {
    pub fn vol_id(&self) -> u32 {
        self.vol_id
    }

    /// The name from the volume table, or one made up from the volume ID for orphan volumes
    pub fn name(&self) -> String {
        match &self.record {
            Some(record) => record.name.clone(),
            None => format!("vol_{}", self.vol_id),
        }
    }

    /// This volume's entry in the volume table
    pub fn record(&self) -> Option<&VolTableRecord> {
        self.record.as_ref()
    }

    pub fn vol_type(&self) -> VolType {
        self.vol_type
    }

    /// The number of usable data bytes in each LEB
    pub fn leb_size(&self) -> u32 {
        self.leb_size
    }

    /// The LEB number => PEB number mapping for this volume
    pub fn lebs(&self) -> &BTreeMap<u32, u32> {
        &self.lebs
    }

    /// Which PEB holds the given LEB, if any
    pub fn peb_for(&self, leb_num: u32) -> Option<u32> {
        self.lebs.get(&leb_num).copied()
    }

    pub fn max_leb(&self) -> Option<u32> {
        self.lebs.keys().next_back().copied()
    }

    /// The blocks of this volume, in LEB order
    pub fn blocks<'a>(&'a self, blocks: &'a BlockMap) -> impl Iterator<Item = &'a Block> + 'a {
        self.lebs.values().filter_map(|peb| blocks.get(peb))
    }

    /// For static volumes, the exact number of bytes stored; for dynamic volumes, `None`
    pub fn data_size(&self) -> Option<u64> {
        (self.vol_type == VolType::Static).then_some(self.data_size)
    }

    /// Was this volume found in the image without an entry in the volume table?
    pub fn is_orphan(&self) -> bool {
        self.record.is_none()
    }

    /// Were fewer LEBs found than the volume should have?
    ///
    /// Static volumes are checked against the LEB count in their VID headers, dynamic volumes
    /// against the PEBs reserved for them in the volume table.
    pub fn is_incomplete(&self) -> bool {
        let expected = match (self.used_ebs, &self.record) {
            (Some(used_ebs), _) => used_ebs,
            (None, Some(record)) => record.reserved_pebs,
            (None, None) => return false,
        };

        (self.lebs.len() as u64) < u64::from(expected)
    }

    /// Does this volume use blocks that failed an integrity check? This only happens when block
    /// errors are being ignored.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// One UBI instance found in the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    image_seq: u32,
    peb_size: u32,
    layout_peb: Option<u32>,
    volumes: BTreeMap<u32, Volume>,
}

impl Image {
    pub fn image_seq(&self) -> u32 {
        self.image_seq
    }

    pub fn peb_size(&self) -> u32 {
        self.peb_size
    }

    /// The PEB whose copy of the volume table was used, if one was found
    pub fn layout_peb(&self) -> Option<u32> {
        self.layout_peb
    }

    /// Every volume of the image, keyed by volume ID
    pub fn volumes(&self) -> &BTreeMap<u32, Volume> {
        &self.volumes
    }

    /// Find a volume by name
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.values().find(|x| x.name() == name)
    }
}

/// Decide whether `candidate` should replace `current` as the live copy of a LEB.
///
/// A block that passed its integrity checks always beats one that didn't, whose erase counter
/// can't be trusted. Otherwise the block with the higher erase counter wins, since UBI only ever
/// moves a LEB onto a freshly erased PEB. Ties go to the higher PEB number.
fn supersedes(candidate: &Block, current: &Block) -> bool {
    let key = |block: &Block| (block.is_valid(), block.ec().ec, block.peb_num);
    key(candidate) > key(current)
}

/// Pick the copy of the volume table to trust: the most recently written intact one, preferring
/// LEB 0 if both were written together.
fn select_layout<'a>(blocks: &[&'a Block]) -> Option<&'a Block> {
    blocks
        .iter()
        .copied()
        .filter(|block| block.is_volume_table())
        .max_by_key(|block| {
            let vid = block.vid().copied().unwrap_or_default();
            (block.is_valid(), vid.sqnum, std::cmp::Reverse(vid.lnum))
        })
}

/// Accumulates the blocks of one volume
#[derive(Default)]
struct VolumeBuilder<'a> {
    lebs: BTreeMap<u32, &'a Block>,
}

impl<'a> VolumeBuilder<'a> {
    fn insert(&mut self, block: &'a Block) {
        let Some(leb_num) = block.leb_num() else {
            return;
        };

        self.lebs
            .entry(leb_num)
            .and_modify(|current| {
                if supersedes(block, current) {
                    *current = block;
                }
            })
            .or_insert(block);
    }

    fn build(
        self,
        vol_id: u32,
        record: Option<VolTableRecord>,
        peb_size: u32,
        default_data_offset: u32,
    ) -> Volume {
        let first_vid = self.lebs.values().find_map(|block| block.vid().copied());

        let vol_type = record
            .as_ref()
            .map(|x| x.vol_type)
            .or(first_vid.map(|x| x.vol_type))
            .unwrap_or_default();

        let data_offset = self
            .lebs
            .values()
            .next()
            .map_or(default_data_offset, |block| block.ec().data_offset);
        let data_pad = record
            .as_ref()
            .map(|x| x.data_pad)
            .or(first_vid.map(|x| x.data_pad))
            .unwrap_or(0);
        let leb_size = peb_size.saturating_sub(data_offset).saturating_sub(data_pad);

        let used_ebs = first_vid
            .filter(|x| x.vol_type == VolType::Static)
            .map(|x| x.used_ebs);

        let data_size = self
            .lebs
            .values()
            .filter_map(|block| block.vid())
            .map(|vid| u64::from(vid.data_size))
            .sum();

        Volume {
            vol_id,
            record,
            vol_type,
            leb_size,
            lebs: self
                .lebs
                .iter()
                .map(|(&leb, block)| (leb, block.peb_num))
                .collect(),
            used_ebs,
            data_size,
            degraded: self.lebs.values().any(|block| !block.is_valid()),
        }
    }
}

/// Build the image of one `image_seq` out of its blocks
fn build_image(image_seq: u32, blocks: &[&Block], rpt: &howudoin::Tx) -> Image {
    let peb_size = blocks.first().map_or(0, |block| block.size);

    let layout = select_layout(blocks);
    let table: VolumeTable = layout
        .and_then(|block| block.volume_table())
        .cloned()
        .unwrap_or_default();
    let default_data_offset = layout.map_or(0, |block| block.ec().data_offset);

    let mut builders: BTreeMap<u32, VolumeBuilder> = table
        .keys()
        .map(|&vol_id| (vol_id, VolumeBuilder::default()))
        .collect();

    for &block in blocks {
        if block.is_internal_volume() {
            continue;
        }
        if let Some(vol_id) = block.vol_id() {
            builders.entry(vol_id).or_default().insert(block);
        }
    }

    let volumes: BTreeMap<u32, Volume> = builders
        .into_iter()
        .map(|(vol_id, builder)| {
            let record = table.get(&vol_id).cloned();
            let volume = builder.build(vol_id, record, peb_size, default_data_offset);
            (vol_id, volume)
        })
        .collect();

    if layout.is_none() {
        rpt.add_warn(format!("Image {image_seq:#010x}: no volume table found"));
    }
    for volume in volumes.values() {
        if volume.is_orphan() {
            rpt.add_warn(format!(
                "Image {image_seq:#010x}: volume {} is not in the volume table",
                volume.vol_id()
            ));
        } else if volume.is_incomplete() {
            rpt.add_warn(format!(
                "Image {image_seq:#010x}: volume {:?} is missing LEBs",
                volume.name()
            ));
        }
    }

    Image {
        image_seq,
        peb_size,
        layout_peb: layout.map(|block| block.peb_num),
        volumes,
    }
}

/// Group the scanned blocks into images, each with its volumes.
///
/// Only blocks holding a LEB take part. Blocks that failed an integrity check are left out,
/// unless `config` says to ignore block errors.
pub fn build_images(blocks: &BlockMap, config: &ScanConfig) -> Vec<Image> {
    let rpt = howudoin::new().label("Indexing volumes");

    let mut by_image_seq: BTreeMap<u32, Vec<&Block>> = BTreeMap::new();
    for block in blocks.values() {
        if block.vid().is_none() || !(block.is_valid() || config.ignore_block_errors) {
            continue;
        }
        by_image_seq
            .entry(block.image_seq())
            .or_default()
            .push(block);
    }

    let images = by_image_seq
        .into_iter()
        .map(|(image_seq, blocks)| build_image(image_seq, &blocks, &rpt))
        .collect();

    rpt.close();
    images
}
