//! In-place fix-up of the COFF `LARGE_ADDRESS_AWARE` characteristic.
//!
//! Rewriting an image's managed metadata does not touch its native headers, so an executable
//! that was large-address-aware before patching is only so afterwards if the bit is set again.
//! [`set_large_address_aware`] reads the DOS header, follows `e_lfanew` to the PE signature and
//! rewrites the two characteristic bytes of the COFF header. Nothing else in the file is read
//! or written, and files that are not PE images are left alone.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{file::io::read_le, patcher::PatchStep, Error, Result};

const DOS_MAGIC: u16 = 0x5A4D;
const PE_SIGNATURE: u32 = 0x0000_4550;
const E_LFANEW_OFFSET: u64 = 0x3C;
/// Offset of `Characteristics` from the PE signature: signature (4) + COFF fields (0x12)
const CHARACTERISTICS_OFFSET: u64 = 4 + 0x12;

/// `IMAGE_FILE_LARGE_ADDRESS_AWARE`
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

/// Outcome of [`set_large_address_aware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum HeaderPatch {
    /// The bit was clear and has been set
    #[strum(serialize = "applied")]
    Applied,
    /// The bit was already set; the file is unchanged
    #[strum(serialize = "already set")]
    AlreadySet,
    /// No `MZ` header; the file is unchanged
    #[strum(serialize = "not an executable")]
    NotExecutable,
    /// No `PE\0\0` signature at `e_lfanew`; the file is unchanged
    #[strum(serialize = "not a PE image")]
    NotPortable,
}

fn read_array<const N: usize>(file: &mut File, position: u64) -> io::Result<Option<[u8; N]>> {
    let mut buffer = [0u8; N];
    file.seek(SeekFrom::Start(position))?;
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(Some(buffer)),
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(error) => Err(error),
    }
}

/// Locates the characteristics field and returns its offset and value.
fn characteristics(file: &mut File) -> io::Result<std::result::Result<(u64, u16), HeaderPatch>> {
    let magic = read_array::<2>(file, 0)?.and_then(|bytes| read_le::<u16>(&bytes).ok());
    if magic != Some(DOS_MAGIC) {
        return Ok(Err(HeaderPatch::NotExecutable));
    }

    let Some(e_lfanew) = read_array::<4>(file, E_LFANEW_OFFSET)?.and_then(|bytes| read_le::<u32>(&bytes).ok())
    else {
        return Ok(Err(HeaderPatch::NotExecutable));
    };
    let pe_offset = u64::from(e_lfanew);

    let signature = read_array::<4>(file, pe_offset)?.and_then(|bytes| read_le::<u32>(&bytes).ok());
    if signature != Some(PE_SIGNATURE) {
        return Ok(Err(HeaderPatch::NotPortable));
    }

    let offset = pe_offset + CHARACTERISTICS_OFFSET;
    match read_array::<2>(file, offset)?.and_then(|bytes| read_le::<u16>(&bytes).ok()) {
        Some(value) => Ok(Ok((offset, value))),
        None => Ok(Err(HeaderPatch::NotPortable)),
    }
}

fn patch(path: &Path) -> io::Result<HeaderPatch> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    let (offset, value) = match characteristics(&mut file)? {
        Ok(found) => found,
        Err(outcome) => return Ok(outcome),
    };
    if value & IMAGE_FILE_LARGE_ADDRESS_AWARE != 0 {
        return Ok(HeaderPatch::AlreadySet);
    }

    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&(value | IMAGE_FILE_LARGE_ADDRESS_AWARE).to_le_bytes())?;
    file.sync_all()?;
    Ok(HeaderPatch::Applied)
}

/// Sets `IMAGE_FILE_LARGE_ADDRESS_AWARE` in the COFF header of the file at `path`.
///
/// Unrecognized files are not an error: they report [`HeaderPatch::NotExecutable`] or
/// [`HeaderPatch::NotPortable`] and are not modified. Calling this twice is harmless.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the file cannot be opened, read or written.
///
/// # Examples
///
/// ```rust,no_run
/// use cilpatch::header::{set_large_address_aware, HeaderPatch};
///
/// match set_large_address_aware("Terraria.exe")? {
///     HeaderPatch::Applied | HeaderPatch::AlreadySet => println!("ok"),
///     other => println!("skipped: {other}"),
/// }
/// # Ok::<(), cilpatch::Error>(())
/// ```
pub fn set_large_address_aware(path: impl AsRef<Path>) -> Result<HeaderPatch> {
    let path = path.as_ref();
    let outcome = patch(path).map_err(|e| Error::io(path, PatchStep::HeaderPatch, e))?;
    match outcome {
        HeaderPatch::Applied => log::info!("set large address aware flag on {}", path.display()),
        HeaderPatch::AlreadySet => {
            log::warn!("{} is already large address aware", path.display());
        }
        HeaderPatch::NotExecutable | HeaderPatch::NotPortable => {
            log::warn!("left {} unchanged: {outcome}", path.display());
        }
    }
    Ok(outcome)
}

/// Reads whether `IMAGE_FILE_LARGE_ADDRESS_AWARE` is set, without modifying the file.
///
/// Returns `None` for files that are not PE images.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the file cannot be opened or read.
pub fn is_large_address_aware(path: impl AsRef<Path>) -> Result<Option<bool>> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| Error::io(path, PatchStep::HeaderPatch, e))?;
    let found = characteristics(&mut file).map_err(|e| Error::io(path, PatchStep::HeaderPatch, e))?;
    Ok(found
        .ok()
        .map(|(_, value)| value & IMAGE_FILE_LARGE_ADDRESS_AWARE != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::builder::ImageBuilder;

    const CHARACTERISTICS: usize = 0x80 + 4 + 0x12;

    fn write(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.exe");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_sets_bit_once() {
        let image = ImageBuilder::new(vec![0xAB; 16]).build();
        let (_dir, path) = write(&image);

        assert_eq!(is_large_address_aware(&path).unwrap(), Some(false));
        assert_eq!(set_large_address_aware(&path).unwrap(), HeaderPatch::Applied);

        let patched = std::fs::read(&path).unwrap();
        assert_eq!(patched.len(), image.len());
        let differing: Vec<usize> = (0..image.len()).filter(|&i| image[i] != patched[i]).collect();
        assert_eq!(differing, [CHARACTERISTICS]);
        assert_eq!(patched[CHARACTERISTICS], image[CHARACTERISTICS] | 0x20);

        assert_eq!(set_large_address_aware(&path).unwrap(), HeaderPatch::AlreadySet);
        assert_eq!(std::fs::read(&path).unwrap(), patched);
        assert_eq!(is_large_address_aware(&path).unwrap(), Some(true));
    }

    #[test]
    fn test_respects_preset_bit() {
        let image = ImageBuilder::new(Vec::new())
            .characteristics(IMAGE_FILE_LARGE_ADDRESS_AWARE)
            .build();
        let (_dir, path) = write(&image);
        assert_eq!(set_large_address_aware(&path).unwrap(), HeaderPatch::AlreadySet);
        assert_eq!(std::fs::read(&path).unwrap(), image);
    }

    #[test]
    fn test_ignores_foreign_files() {
        let (_dir, path) = write(b"#!/bin/sh\necho hello\n");
        assert_eq!(set_large_address_aware(&path).unwrap(), HeaderPatch::NotExecutable);
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\necho hello\n");

        let (_dir, path) = write(b"M");
        assert_eq!(set_large_address_aware(&path).unwrap(), HeaderPatch::NotExecutable);

        let mut dos_only = vec![0u8; 0x100];
        dos_only[..2].copy_from_slice(b"MZ");
        dos_only[0x3C] = 0x80;
        let (_dir, path) = write(&dos_only);
        assert_eq!(set_large_address_aware(&path).unwrap(), HeaderPatch::NotPortable);
        assert_eq!(std::fs::read(&path).unwrap(), dos_only);
        assert_eq!(is_large_address_aware(&path).unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = set_large_address_aware(dir.path().join("missing.exe")).unwrap_err();
        assert_eq!(error.step(), Some(PatchStep::HeaderPatch));
    }
}
