use std::path::Path;

use cilpatch::header::{set_large_address_aware, HeaderPatch};
use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::require_file, output::print_output};

#[derive(Debug, Serialize)]
struct LaaOutput {
    path: String,
    outcome: String,
    changed: bool,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    require_file(path)?;
    let outcome = set_large_address_aware(path)?;

    let output = LaaOutput {
        path: path.display().to_string(),
        outcome: outcome.to_string(),
        changed: outcome == HeaderPatch::Applied,
    };
    print_output(&output, opts, |out| {
        println!("{}: {}", out.path, out.outcome);
    })
}
