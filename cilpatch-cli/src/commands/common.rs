use std::path::Path;

use anyhow::{bail, Context};
use cilpatch::patcher::{PatchConfig, Patcher};

use crate::app::PatchOptions;

/// Build the patch configuration from the command line options.
pub fn patch_config(options: &PatchOptions) -> PatchConfig {
    let mut config = PatchConfig::item_modification();
    if let Some(dir) = &options.helper_dir {
        config = config.with_helper_directory(dir);
    }
    if options.no_laa {
        config.large_address_aware = false;
    }
    if options.no_copy {
        config.required_files.clear();
    }
    config
}

/// Fail early with a readable message if the target does not exist.
pub fn require_file(path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        bail!("executable not found: {}", path.display());
    }
    Ok(())
}

/// Refuse to restore a backup of an older game version unless forced.
pub fn check_backup_version(patcher: &Patcher, force: bool) -> anyhow::Result<()> {
    if !patcher.has_backup() || !patcher.target().is_file() {
        return Ok(());
    }
    let older = patcher
        .backup_is_older()
        .with_context(|| format!("failed to compare backup of {}", patcher.target().display()))?;
    if older {
        if !force {
            bail!(
                "the backup at {} is an older game version; pass --force to restore it anyway",
                patcher.backup_path().display()
            );
        }
        log::warn!("restoring a backup of an older game version");
    }
    Ok(())
}
