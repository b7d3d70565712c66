//! A volume's LEBs, presented as one contiguous file.

use std::io::{self, Read, Seek, SeekFrom};

use anyhow::Context;

use super::scan::BlockMap;
use super::volume::Volume;
use crate::source::{BlockSource, ReadAt};

/// A read-only view of one volume as a single stream of bytes.
///
/// LEB `n` of the volume lives at offset `n * leb_size`. LEBs that were never found read as zeros.
/// Every read goes to the source by position, so any number of these may be used at once.
pub struct LebVirtualFile<'a, R> {
    source: &'a BlockSource<R>,
    blocks: &'a BlockMap,
    volume: &'a Volume,
    pos: u64,
}

impl<'a, R: ReadAt> LebVirtualFile<'a, R> {
    pub fn new(source: &'a BlockSource<R>, blocks: &'a BlockMap, volume: &'a Volume) -> Self {
        Self {
            source,
            blocks,
            volume,
            pos: 0,
        }
    }

    pub fn volume(&self) -> &'a Volume {
        self.volume
    }

    /// The logical length, which runs up to the end of the highest LEB found
    pub fn len(&self) -> u64 {
        self.volume.max_leb().map_or(0, |max_leb| {
            (u64::from(max_leb) + 1) * u64::from(self.volume.leb_size())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at logical offset `offset`, returning how many were read.
    ///
    /// Only returns fewer bytes than asked for at the end of the file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        let leb_size = u64::from(self.volume.leb_size());
        let remaining = self.len().saturating_sub(offset);
        let total = buf
            .len()
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));

        let mut done = 0;
        while done < total {
            let pos = offset + done as u64;
            let intra = pos % leb_size;
            let len = (total - done).min((leb_size - intra) as usize);

            // pos < len(), so the LEB number is at most max_leb
            self.read_leb((pos / leb_size) as u32, intra, &mut buf[done..][..len])?;
            done += len;
        }

        Ok(total)
    }

    /// Fill `out` from LEB `leb_num`, starting `intra` bytes into it
    fn read_leb(&self, leb_num: u32, intra: u64, out: &mut [u8]) -> anyhow::Result<()> {
        let Some(block) = self
            .volume
            .peb_for(leb_num)
            .and_then(|peb| self.blocks.get(&peb))
        else {
            out.fill(0);
            return Ok(());
        };

        let read = self
            .source
            .read_at(block.data_offset() + intra, out)
            .with_context(|| {
                format!(
                    "could not read LEB {leb_num} of volume {:?} from PEB {}",
                    self.volume.name(),
                    block.peb_num
                )
            })?;

        // A block cut short by the end of the image
        out[read..].fill(0);
        Ok(())
    }
}

impl<R: ReadAt> Read for LebVirtualFile<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self
            .read_at(self.pos, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<R: ReadAt> Seek for LebVirtualFile<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(x) => Some(x),
            SeekFrom::End(x) => self.len().checked_add_signed(x),
            SeekFrom::Current(x) => self.pos.checked_add_signed(x),
        };

        let Some(new_pos) = new_pos else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ));
        };

        self.pos = new_pos;
        Ok(new_pos)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::testimg::{vid, ImageBuilder, TEST_PEB_SIZE};
    use crate::ubi::{ScanConfig, Ubi};

    const LEB_SIZE: usize = TEST_PEB_SIZE.get() as usize - 128;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn read_all<R: ReadAt>(file: &mut LebVirtualFile<R>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let alpha = pattern(2 * LEB_SIZE + 208, 1);
        let beta = pattern(LEB_SIZE + 5, 2);

        // Write the LEBs of both volumes scattered and out of order
        let mut img = ImageBuilder::new(TEST_PEB_SIZE);
        img.layout(&[
            (0, ImageBuilder::record("alpha", 3)),
            (1, ImageBuilder::record("beta", 2)),
        ])
        .leb(0, vid(0, 2), &alpha[2 * LEB_SIZE..])
        .leb(0, vid(1, 1), &beta[LEB_SIZE..])
        .free(0)
        .leb(0, vid(0, 0), &alpha[..LEB_SIZE])
        .padding(TEST_PEB_SIZE.get() as usize)
        .leb(0, vid(1, 0), &beta[..LEB_SIZE])
        .leb(0, vid(0, 1), &alpha[LEB_SIZE..2 * LEB_SIZE]);
        let ubi = Ubi::open(img.build(), &ScanConfig::new(TEST_PEB_SIZE))?;
        let image = &ubi.images()[0];

        for (name, content) in [("alpha", &alpha), ("beta", &beta)] {
            let volume = image.volume(name).unwrap();
            let mut file = ubi.volume_file(volume);
            let out = read_all(&mut file)?;

            assert_eq!(out.len() as u64, file.len());
            assert_eq!(&out[..content.len()], &content[..]);
            // Past the data written, the rest of the last LEB is still erased
            assert!(out[content.len()..].iter().all(|&b| b == 0xFF));
        }

        Ok(())
    }

    #[test]
    fn test_holes_read_as_zeros() -> anyhow::Result<()> {
        let mut img = ImageBuilder::new(TEST_PEB_SIZE);
        img.layout(&[(0, ImageBuilder::record("sparse", 4))])
            .leb(0, vid(0, 0), &[0x11; LEB_SIZE])
            .leb(0, vid(0, 3), &[0x44; LEB_SIZE]);
        let ubi = Ubi::open(img.build(), &ScanConfig::new(TEST_PEB_SIZE))?;
        let volume = ubi.images()[0].volume("sparse").unwrap();
        let file = ubi.volume_file(volume);

        // Length runs to the highest LEB, holes included
        assert_eq!(file.len(), 4 * LEB_SIZE as u64);

        let mut buf = vec![0xEE; 3 * LEB_SIZE];
        assert_eq!(file.read_at(LEB_SIZE as u64 / 2, &mut buf)?, buf.len());
        let (first, rest) = buf.split_at(LEB_SIZE / 2);
        let (hole, last) = rest.split_at(2 * LEB_SIZE);
        assert!(first.iter().all(|&b| b == 0x11));
        assert!(hole.iter().all(|&b| b == 0));
        assert!(last.iter().all(|&b| b == 0x44));

        Ok(())
    }

    #[test]
    fn test_read_across_lebs() -> anyhow::Result<()> {
        let content = pattern(3 * LEB_SIZE, 7);
        let mut img = ImageBuilder::new(TEST_PEB_SIZE);
        img.layout(&[(0, ImageBuilder::record("data", 3))])
            .volume(0, &content);
        let ubi = Ubi::open(img.build(), &ScanConfig::new(TEST_PEB_SIZE))?;
        let volume = ubi.images()[0].volume("data").unwrap();
        let mut file = ubi.volume_file(volume);

        let start = LEB_SIZE - 3;
        file.seek(SeekFrom::Start(start as u64))?;
        let mut buf = vec![0; LEB_SIZE + 6];
        file.read_exact(&mut buf)?;
        assert_eq!(buf, content[start..][..buf.len()]);
        assert_eq!(file.stream_position()?, (start + buf.len()) as u64);

        // Reads stop at the end of the file
        assert_eq!(file.seek(SeekFrom::End(-4))?, content.len() as u64 - 4);
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;
        assert_eq!(tail, content[content.len() - 4..]);
        assert_eq!(file.read(&mut buf)?, 0);

        assert!(file.seek(SeekFrom::Current(-(1 << 40))).is_err());

        Ok(())
    }

    #[test]
    fn test_empty_volume() -> anyhow::Result<()> {
        let mut img = ImageBuilder::new(TEST_PEB_SIZE);
        img.layout(&[(0, ImageBuilder::record("empty", 2))]);
        let ubi = Ubi::open(img.build(), &ScanConfig::new(TEST_PEB_SIZE))?;
        let volume = ubi.images()[0].volume("empty").unwrap();
        let mut file = ubi.volume_file(volume);

        assert!(file.is_empty());
        assert!(read_all(&mut file)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_concurrent_readers() -> anyhow::Result<()> {
        let a = pattern(4 * LEB_SIZE, 3);
        let b = pattern(4 * LEB_SIZE, 9);
        let mut img = ImageBuilder::new(TEST_PEB_SIZE);
        img.layout(&[
            (0, ImageBuilder::record("a", 4)),
            (1, ImageBuilder::record("b", 4)),
        ])
        .volume(0, &a)
        .volume(1, &b);
        let ubi = Ubi::open(img.build(), &ScanConfig::new(TEST_PEB_SIZE))?;
        let ubi = &ubi;
        let image = &ubi.images()[0];

        std::thread::scope(|s| -> anyhow::Result<()> {
            let readers: Vec<_> = [("a", &a), ("b", &b), ("a", &a)]
                .into_iter()
                .map(|(name, content)| {
                    let volume = image.volume(name).unwrap();
                    s.spawn(move || -> io::Result<bool> {
                        let mut file = ubi.volume_file(volume);
                        Ok(read_all(&mut file)? == *content)
                    })
                })
                .collect();

            for reader in readers {
                assert!(reader.join().unwrap()?);
            }
            Ok(())
        })
    }

    #[test]
    fn test_corrupt_ec_tolerance() -> anyhow::Result<()> {
        let content = pattern(2 * LEB_SIZE, 5);
        let mut img = ImageBuilder::new(TEST_PEB_SIZE);
        img.layout(&[
            (0, ImageBuilder::record("data", 2)),
            (1, ImageBuilder::record("other", 1)),
        ])
        .volume(0, &content)
        .leb(0, vid(1, 0), b"other")
        .corrupt_ec(4);
        let image = img.build();

        // The damaged block belongs to "other"; "data" still reads back whole
        let ubi = Ubi::open(&image[..], &ScanConfig::new(TEST_PEB_SIZE))?;
        let found = &ubi.images()[0];
        let data = found.volume("data").unwrap();
        assert_eq!(read_all(&mut ubi.volume_file(data))?, content);
        assert_eq!(found.volume("other").unwrap().max_leb(), None);

        let config = ScanConfig::new(TEST_PEB_SIZE).ignore_block_errors(true);
        let ubi = Ubi::open(&image[..], &config)?;
        let other = ubi.images()[0].volume("other").unwrap();
        assert!(other.is_degraded());
        let out = read_all(&mut ubi.volume_file(other))?;
        assert_eq!(&out[..5], b"other");

        Ok(())
    }
}
