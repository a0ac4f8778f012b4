use std::path::Path;

use anyhow::Context;
use cilpatch::patcher::{PatchReport, Patcher};
use serde::Serialize;

use crate::{
    app::{GlobalOptions, PatchOptions},
    commands::common::{patch_config, require_file},
    output::{print_output, TabWriter},
};

#[derive(Debug, Serialize)]
pub struct InjectionEntry {
    anchor: String,
    helper: String,
    index: usize,
    inserted: usize,
}

#[derive(Debug, Serialize)]
pub struct PatchOutput {
    path: String,
    backup_created: bool,
    injections: Vec<InjectionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    copied_files: Vec<String>,
}

impl PatchOutput {
    pub fn new(path: &Path, report: &PatchReport) -> Self {
        Self {
            path: path.display().to_string(),
            backup_created: report.backup_created,
            injections: report
                .anchors
                .iter()
                .map(|injection| InjectionEntry {
                    anchor: injection.anchor.to_string(),
                    helper: injection.helper.full_name(),
                    index: injection.index,
                    inserted: injection.inserted,
                })
                .collect(),
            header: report.header.map(|outcome| outcome.to_string()),
            copied_files: report
                .copied_files
                .iter()
                .map(|file| file.display().to_string())
                .collect(),
        }
    }

    pub fn print(&self) {
        println!("Patched {}", self.path);
        if self.backup_created {
            println!("  backup created");
        }

        let mut tw = TabWriter::new(&["Anchor", "Index", "Added", "Helper"]).right(1).right(2);
        for entry in &self.injections {
            tw.row(vec![
                entry.anchor.clone(),
                entry.index.to_string(),
                entry.inserted.to_string(),
                entry.helper.clone(),
            ]);
        }
        tw.print();

        if let Some(header) = &self.header {
            println!("  large address aware: {header}");
        }
        for file in &self.copied_files {
            println!("  copied {file}");
        }
    }
}

pub fn run(path: &Path, options: &PatchOptions, opts: &GlobalOptions) -> anyhow::Result<()> {
    require_file(path)?;
    let patcher = Patcher::new(path, patch_config(options));
    let report = patcher
        .patch()
        .with_context(|| format!("failed to patch {}", path.display()))?;

    print_output(&PatchOutput::new(path, &report), opts, PatchOutput::print)
}
