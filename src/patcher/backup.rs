//! Backup, restore and helper file deployment around a patch run.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use crate::{patcher::PatchStep, Error, Result};

/// `<target><suffix>` next to the target, e.g. `Terraria.exe.bak`.
#[must_use]
pub fn backup_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    target.with_file_name(name)
}

/// Copies `target` to `backup` unless a backup already exists.
///
/// Returns `true` if a backup was created. An existing backup is never overwritten, so it keeps
/// the unpatched original across repeated runs.
///
/// # Errors
///
/// Returns [`Error::Io`] with [`PatchStep::Backup`] if the copy fails.
pub fn ensure_backup(target: &Path, backup: &Path) -> Result<bool> {
    if backup.exists() {
        log::debug!("Keeping existing backup {}", backup.display());
        return Ok(false);
    }
    fs::copy(target, backup).map_err(|e| Error::io(backup, PatchStep::Backup, e))?;
    log::info!("Backed up {} to {}", target.display(), backup.display());
    Ok(true)
}

/// Overwrites `target` with `backup`.
///
/// # Errors
///
/// Returns [`Error::BackupMissing`] if there is no backup, and [`Error::Io`] with
/// [`PatchStep::Restore`] if the copy fails.
pub fn restore(target: &Path, backup: &Path) -> Result<()> {
    if !backup.is_file() {
        return Err(Error::BackupMissing(backup.to_path_buf()));
    }
    fs::copy(backup, target).map_err(|e| Error::io(target, PatchStep::Restore, e))?;
    log::info!("Restored {} from {}", target.display(), backup.display());
    Ok(())
}

/// Copies each of `files` from `source` into `destination`, overwriting existing copies.
///
/// Returns the written paths.
///
/// # Errors
///
/// Returns [`Error::Io`] with [`PatchStep::CopyRequiredFiles`] naming the first file that could
/// not be copied.
pub fn copy_required_files(source: &Path, destination: &Path, files: &[String]) -> Result<Vec<PathBuf>> {
    files
        .iter()
        .map(|file| {
            let from = source.join(file);
            let to = destination.join(file);
            fs::copy(&from, &to).map_err(|e| Error::io(&from, PatchStep::CopyRequiredFiles, e))?;
            log::debug!("Copied {} to {}", from.display(), to.display());
            Ok(to)
        })
        .collect()
}
