//! Useful traits and other utilities that don't really belong anywhere else.

use std::io;

use crate::source::ReadAt;

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

pub trait ReadAtExt {
    /// Tries to fill `buf` from `offset`, like `read_exact`, but unlike `read_exact`, is forgiving
    /// of unexpected EOF.
    ///
    /// Returns the number of bytes read, which is strictly shorter than `buf.len()` only if an EOF
    /// was encountered.
    fn read_full_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: ReadAt + ?Sized> ReadAtExt for T {
    fn read_full_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read_at(offset + cursor as u64, &mut buf[cursor..]) {
                // This is an EOF; it means the final read size is `cursor`
                Ok(0) => break,

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        Ok(cursor)
    }
}

#[test]
fn test_read_full_at() -> io::Result<()> {
    let data: Vec<u8> = (0..10).collect();

    let mut buf = [0u8; 4];
    assert_eq!(data.read_full_at(2, &mut buf)?, 4);
    assert_eq!(buf, [2, 3, 4, 5]);

    // Short read at the end of the source
    assert_eq!(data.read_full_at(8, &mut buf)?, 2);
    assert_eq!(buf[..2], [8, 9]);

    // Entirely past the end
    assert_eq!(data.read_full_at(100, &mut buf)?, 0);
    Ok(())
}

#[test]
fn test_is_erased() {
    assert!([0xFFu8; 16][..].is_erased());
    assert!([0u8; 0][..].is_erased());
    assert!(![0xFF, 0xFF, 0x7F][..].is_erased());
}
