//! Utilities for working with images.
//!
//! Flash dumps rarely say where UBI begins or how large their eraseblocks are. These guess both
//! from where the EC header magic turns up.

use std::collections::BTreeMap;

use anyhow::Context;
use income::UBI_EC_HDR_MAGIC;

use crate::source::ReadAt;
use crate::ubi::has_ec_magic;
use crate::util::ReadAtExt;

/// How much of the image to search at once
const SEARCH_CHUNK: usize = 1 << 20;

/// Call `found` with the offset of every EC header magic in `source`, in order, until it returns
/// `false` or the source ends.
fn for_each_ec_magic<R: ReadAt + ?Sized>(
    source: &R,
    mut found: impl FnMut(u64) -> bool,
) -> anyhow::Result<()> {
    // Chunks overlap so that a magic straddling two of them is still seen
    let overlap = UBI_EC_HDR_MAGIC.len() - 1;
    let mut buf = vec![0u8; SEARCH_CHUNK + overlap];

    let mut offset = 0u64;
    loop {
        let len = source
            .read_full_at(offset, &mut buf)
            .with_context(|| format!("could not read image at offset {offset:#x}"))?;

        let matches = buf[..len]
            .windows(UBI_EC_HDR_MAGIC.len())
            .take(SEARCH_CHUNK)
            .enumerate()
            .filter(|(_, x)| has_ec_magic(x));
        for (pos, _) in matches {
            if !found(offset + pos as u64) {
                return Ok(());
            }
        }

        if len < buf.len() {
            return Ok(());
        }
        offset += SEARCH_CHUNK as u64;
    }
}

/// Find where the first UBI block begins, i.e. the offset of the first EC header magic.
pub fn guess_start_offset<R: ReadAt + ?Sized>(source: &R) -> anyhow::Result<Option<u64>> {
    let mut first = None;
    for_each_ec_magic(source, |offset| {
        first = Some(offset);
        false
    })?;

    Ok(first)
}

/// Guess the PEB size of the image, as the distance most often seen between one EC header magic
/// and the next. Ties go to the smaller distance.
///
/// Returns `None` if fewer than two EC headers were found.
pub fn guess_peb_size<R: ReadAt + ?Sized>(source: &R) -> anyhow::Result<Option<u64>> {
    let mut distances: BTreeMap<u64, usize> = BTreeMap::new();
    let mut last = None;
    for_each_ec_magic(source, |offset| {
        if let Some(last) = last {
            *distances.entry(offset - last).or_default() += 1;
        }
        last = Some(offset);
        true
    })?;

    // max_by_key keeps the last maximum, so walk the distances from largest to smallest
    Ok(distances
        .into_iter()
        .rev()
        .max_by_key(|&(_, count)| count)
        .map(|(distance, _)| distance))
}
