//! Pre-allocation of download targets without writing their content.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Opens `path` for reading and writing with a length of `size` bytes,
/// leaving unwritten regions sparse. An existing file is kept as is, which
/// is what resuming a download relies on.
pub fn allocate_sparse(path: &Path, size: u64) -> io::Result<File> {
    platform::allocate(path, size)
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    // NTFS only keeps a file sparse if its last byte is written before the
    // length is set; extending the length alone zero-fills.
    pub(super) fn allocate(path: &Path, size: u64) -> io::Result<File> {
        if !path.exists() && size > 0 {
            let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
            file.seek(SeekFrom::Start(size - 1))?;
            file.write_all(&[0])?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        Ok(file)
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    pub(super) fn allocate(path: &Path, size: u64) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::tempdir;

    #[test]
    fn test_allocates_final_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.part");
        let file = allocate_sparse(&path, 3 * 1024 * 1024 + 7).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 3 * 1024 * 1024 + 7);
    }

    #[test]
    fn test_existing_content_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.part");
        {
            let mut file = allocate_sparse(&path, 64).unwrap();
            file.seek(SeekFrom::Start(10)).unwrap();
            file.write_all(b"kept").unwrap();
        }
        let mut file = allocate_sparse(&path, 64).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 64);
        assert_eq!(&content[10..14], b"kept");
        assert!(content[..10].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_sized_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.part");
        let file = allocate_sparse(&path, 0).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 0);
    }
}
