//! Physical file backend for memory-mapped I/O.
//!
//! [`Physical`] maps the target image read-only with `memmap2` so the loader can parse it
//! without copying it first. The mapping is released when the [`crate::file::File`] owning it is
//! dropped; the model loader copies out what it needs and drops the file before returning, so
//! the same path can be rewritten afterwards.
//!
//! # Safety
//!
//! Memory mapping is `unsafe` because another process could modify the file while it is
//! mapped. The target is exclusively owned during a patch run, and the mapping only lives for
//! the duration of a load.

use super::Backend;
use crate::{Error::FileError, Result};

use memmap2::Mmap;
use std::{fs, path::Path};

/// Input file backed by a read-only memory mapping.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Opens and maps the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) => return Err(FileError(error)),
        };

        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(FileError(error)),
        };

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Terraria.exe");
        let mut content = vec![0xCC_u8; 1048];
        content[..2].copy_from_slice(b"MZ");
        std::fs::write(&path, &content).unwrap();

        let physical = Physical::new(&path).unwrap();
        assert_eq!(physical.len(), 1048);
        assert_eq!(physical.data_slice(0, 3).unwrap(), b"MZ\xCC");
        assert_eq!(physical.data_slice(1047, 1).unwrap(), &[0xCC]);
        assert!(matches!(
            physical.data_slice(1047, 2),
            Err(crate::Error::OutOfBounds { .. })
        ));
        assert!(physical.data_slice(usize::MAX, 1).is_err());
    }

    #[test]
    fn test_physical_missing_file() {
        match Physical::new("/nonexistent/Terraria.exe") {
            Err(FileError(error)) => assert_eq!(error.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected a file error, got {other:?}"),
        }
    }

    #[test]
    fn test_physical_released_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Terraria.exe");
        std::fs::write(&path, [1u8; 64]).unwrap();

        let physical = Physical::new(&path).unwrap();
        assert_eq!(physical.data()[63], 1);
        drop(physical);
        std::fs::write(&path, [2u8; 16]).unwrap();
        assert_eq!(Physical::new(&path).unwrap().len(), 16);
    }
}
