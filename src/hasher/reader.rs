//! Random-access byte-range reader over a media file.
//!
//! Works for regular files and block devices; the size is taken by seeking
//! to the end, which is what block devices answer correctly. A short read
//! at end-of-media returns the truncated count without error. The reader
//! itself holds no cursor, so positioned reads do not interfere with each
//! other; callers still construct one per thread or serialize, as the
//! underlying descriptor is shared.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Positioned reader over one media file.
pub struct FileReader {
    file: File,
    path: PathBuf,
    filesize: u64,
}

impl FileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| Error::Io(format!("cannot open media '{}': {e}", path.display())))?;
        let filesize = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            filesize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    /// Fills as much of `buf` as the media allows starting at `offset`.
    /// Returns the number of bytes read; less than `buf.len()` only at
    /// end-of-media.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        match self.file.seek_read(buf, offset) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn media_with(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media.dd");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_exact_ranges() {
        let (_dir, path) = media_with(b"0123456789");
        let reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.filesize(), 10);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(2, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"2345");
    }

    #[test]
    fn short_read_at_eof_is_not_an_error() {
        let (_dir, path) = media_with(b"0123456789");
        let reader = FileReader::open(&path).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(6, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(reader.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_media_is_an_io_error() {
        assert!(matches!(
            FileReader::open(Path::new("/nonexistent/media.dd")),
            Err(Error::Io(_))
        ));
    }
}
