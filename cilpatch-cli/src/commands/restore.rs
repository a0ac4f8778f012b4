use std::path::Path;

use anyhow::Context;
use cilpatch::patcher::{PatchConfig, Patcher};
use serde::Serialize;

use crate::{
    app::{GlobalOptions, PatchOptions},
    commands::{
        common::{check_backup_version, patch_config},
        patch::PatchOutput,
    },
    output::print_output,
};

#[derive(Debug, Serialize)]
struct RestoreOutput {
    path: String,
    backup: String,
}

pub fn run(path: &Path, force: bool, opts: &GlobalOptions) -> anyhow::Result<()> {
    let patcher = Patcher::new(path, PatchConfig::default());
    check_backup_version(&patcher, force)?;
    patcher
        .restore()
        .with_context(|| format!("failed to restore {}", path.display()))?;

    let output = RestoreOutput {
        path: path.display().to_string(),
        backup: patcher.backup_path().display().to_string(),
    };
    print_output(&output, opts, |out| {
        println!("Restored {} from {}", out.path, out.backup);
    })
}

pub fn run_and_patch(
    path: &Path,
    force: bool,
    options: &PatchOptions,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let patcher = Patcher::new(path, patch_config(options));
    check_backup_version(&patcher, force)?;
    let report = patcher
        .restore_and_patch()
        .with_context(|| format!("failed to restore and patch {}", path.display()))?;

    print_output(&PatchOutput::new(path, &report), opts, PatchOutput::print)
}
