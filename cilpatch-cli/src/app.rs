use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// cilpatch - inject helper calls into a managed executable and fix up its header
#[derive(Debug, Parser)]
#[command(name = "cilpatch", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Options controlling a patch run.
#[derive(Debug, Args)]
pub struct PatchOptions {
    /// Directory holding the helper files to deploy (defaults to the directory of this program).
    #[arg(long, value_name = "DIR")]
    pub helper_dir: Option<PathBuf>,

    /// Do not set the large-address-aware header bit.
    #[arg(long)]
    pub no_laa: bool,

    /// Do not copy helper files next to the executable.
    #[arg(long)]
    pub no_copy: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Back up, patch and header-fix the executable.
    Patch {
        /// Path to the executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[command(flatten)]
        options: PatchOptions,
    },

    /// Overwrite the executable with its backup.
    Restore {
        /// Path to the executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Restore even if the backup holds an older game version.
        #[arg(short, long)]
        force: bool,
    },

    /// Restore the backup, then patch it.
    RestorePatch {
        /// Path to the executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Restore even if the backup holds an older game version.
        #[arg(short, long)]
        force: bool,

        #[command(flatten)]
        options: PatchOptions,
    },

    /// Show version, patch marker, backup and header state.
    Status {
        /// Path to the executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Only set the large-address-aware header bit.
    Laa {
        /// Path to the executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// List the instructions of a type's methods.
    Disasm {
        /// Path to the executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Type name, simple or namespace-qualified.
        #[arg(long, value_name = "NAME")]
        r#type: String,

        /// Only methods with this name.
        #[arg(long, value_name = "NAME")]
        method: Option<String>,
    },
}
