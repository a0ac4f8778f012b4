mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Show cilpatch info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("cilpatch", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Patch { path, options } => commands::patch::run(path, options, &cli.global),
        Command::Restore { path, force } => commands::restore::run(path, *force, &cli.global),
        Command::RestorePatch {
            path,
            force,
            options,
        } => commands::restore::run_and_patch(path, *force, options, &cli.global),
        Command::Status { path } => commands::status::run(path, &cli.global),
        Command::Laa { path } => commands::laa::run(path, &cli.global),
        Command::Disasm {
            path,
            r#type,
            method,
        } => commands::disasm::run(path, r#type, method.as_deref()),
    }
}
