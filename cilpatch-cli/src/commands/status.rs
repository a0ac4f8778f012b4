use std::path::Path;

use anyhow::Context;
use cilpatch::patcher::{PatchConfig, Patcher};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::require_file,
    output::{print_output, TabWriter},
};

#[derive(Debug, Serialize)]
struct StatusOutput {
    path: String,
    version: String,
    patched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup_is_older: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    large_address_aware: Option<bool>,
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    require_file(path)?;
    let patcher = Patcher::new(path, PatchConfig::default());
    let status = patcher
        .status()
        .with_context(|| format!("failed to read {}", path.display()))?;

    let backup_is_older = match status.backup {
        Some(_) => Some(patcher.backup_is_older()?),
        None => None,
    };

    let output = StatusOutput {
        path: path.display().to_string(),
        version: status.version.to_string(),
        patched: status.patched,
        backup: status.backup.map(|backup| backup.display().to_string()),
        backup_is_older,
        large_address_aware: status.large_address_aware,
    };

    print_output(&output, opts, |out| {
        println!("{}", out.path);
        let mut tw = TabWriter::new(&[]);
        tw.row(vec!["Version".into(), out.version.clone()]);
        tw.row(vec!["Patched".into(), yes_no(out.patched)]);
        tw.row(vec![
            "Backup".into(),
            out.backup.clone().unwrap_or_else(|| "none".into()),
        ]);
        if let Some(older) = out.backup_is_older {
            tw.row(vec!["Backup is older".into(), yes_no(older)]);
        }
        tw.row(vec![
            "Large address aware".into(),
            out.large_address_aware.map_or_else(|| "n/a".into(), yes_no),
        ]);
        tw.print();
    })
}
