use std::{
    io::{self, BufWriter, Write},
    path::Path,
};

use anyhow::{bail, Context};
use cilpatch::metadata::model::BinaryModel;

use crate::commands::common::require_file;

pub fn run(path: &Path, type_name: &str, method_filter: Option<&str>) -> anyhow::Result<()> {
    require_file(path)?;
    let model = BinaryModel::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let definition = model.type_def(type_name)?;

    let methods: Vec<_> = definition
        .methods
        .iter()
        .filter(|method| method_filter.map_or(true, |name| method.name == name))
        .collect();
    if methods.is_empty() {
        bail!(
            "no methods matching '{}' found on {}",
            method_filter.unwrap_or("*"),
            definition.full_name()
        );
    }

    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());

    writeln!(w, ".class {}", definition.full_name())?;
    writeln!(w, "{{")?;
    for method in methods {
        let modifier = if method.is_static() { "static " } else { "" };
        writeln!(
            w,
            "  .method {modifier}{} {}({})",
            method.signature.return_type,
            method.name,
            method.signature.parameter_list()
        )?;
        match method.body() {
            Some(body) => {
                writeln!(w, "  {{")?;
                writeln!(w, "    .maxstack {}", body.max_stack)?;
                if !body.locals.is_empty() {
                    let locals: Vec<String> = body.locals.iter().map(ToString::to_string).collect();
                    writeln!(w, "    .locals ({})", locals.join(", "))?;
                }
                for line in body.listing().lines() {
                    writeln!(w, "    {line}")?;
                }
                writeln!(w, "  }}")?;
            }
            None => writeln!(w, "  // no body")?,
        }
    }
    writeln!(w, "}}")?;

    w.flush()?;
    Ok(())
}
