use std::path::PathBuf;

use thiserror::Error;

use crate::patcher::PatchStep;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The kind of definition a failed lookup was searching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DefinitionKind {
    /// A type definition inside the loaded module.
    #[strum(serialize = "type")]
    Type,
    /// A method definition on a type.
    #[strum(serialize = "method")]
    Method,
    /// A field definition on a type.
    #[strum(serialize = "field")]
    Field,
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into three groups. Parsing errors ([`Error::Malformed`],
/// [`Error::OutOfBounds`], [`Error::BinaryFormat`], [`Error::GoblinErr`]) mean the input image
/// could not be understood. Resolution errors ([`Error::DefinitionNotFound`],
/// [`Error::UnresolvedReference`]) usually mean the target binary is a version this tool was not
/// written against. Patch errors ([`Error::AnchorNotFound`], [`Error::AnchorShape`],
/// [`Error::AlreadyPatched`], [`Error::BackupMissing`], [`Error::Io`]) carry the anchor and the
/// [`PatchStep`] at which the run was aborted.
///
/// None of these are retried internally: a half-applied patch is not safe to re-run blindly.
///
/// # Examples
///
/// ```rust,no_run
/// use cilpatch::{Error, patcher::{Patcher, PatchConfig}};
///
/// let patcher = Patcher::new("Terraria.exe", PatchConfig::default());
/// match patcher.patch() {
///     Ok(report) => println!("patched {} anchors", report.anchors.len()),
///     Err(Error::AlreadyPatched { .. }) => eprintln!("restore from backup first"),
///     Err(e) => eprintln!("patch failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// Includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// The input is a valid file but not a managed image this crate understands.
    ///
    /// Raised by the loader when the PE container parses but carries no managed metadata
    /// section, or when the metadata stream has an unknown magic or version.
    #[error("Not a recognized managed image - {0}")]
    BinaryFormat(String),

    /// The image uses a metadata feature the writer cannot preserve.
    ///
    /// Raised for uncompressed (`#-`) or pointer-table metadata, for images whose rows would
    /// have to be renumbered under VTable fixups, and when an edited model no longer matches
    /// the rows it was loaded from.
    #[error("Unsupported image - {0}")]
    Unsupported(String),

    /// File I/O error without patch context.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// A named type, method or field does not exist in the loaded model.
    ///
    /// This is the primary signal that the target binary's version is incompatible.
    #[error("Failed to locate {kind} '{name}'")]
    DefinitionNotFound {
        /// What kind of definition was requested
        kind: DefinitionKind,
        /// The fully qualified name that was searched for
        name: String,
    },

    /// An instruction references an external member that was never imported.
    ///
    /// Call [`crate::metadata::model::BinaryModel::import_method`] before emitting
    /// instructions that target helper-library code.
    #[error("Reference to '{0}' has not been imported into the module")]
    UnresolvedReference(String),

    /// An anchor method could not be resolved in the target binary.
    #[error("Anchor '{anchor}' not found during {step}: {reason}")]
    AnchorNotFound {
        /// The anchor that failed, as `Type::Method/arity`
        anchor: String,
        /// The step at which the run was aborted
        step: PatchStep,
        /// Why the lookup failed
        reason: String,
    },

    /// The anchor method exists, but its body does not have the expected shape.
    #[error("Anchor '{anchor}' has an unexpected shape during {step}: {reason}")]
    AnchorShape {
        /// The anchor that failed, as `Type::Method/arity`
        anchor: String,
        /// The step at which the run was aborted
        step: PatchStep,
        /// What was wrong with the body
        reason: String,
    },

    /// The target already carries the patch marker field.
    #[error("'{}' is already patched (marker field '{marker}' present)", path.display())]
    AlreadyPatched {
        /// The patched target
        path: PathBuf,
        /// The marker field that was found
        marker: String,
    },

    /// A restore was requested but there is no backup next to the target.
    #[error("No backup found at '{}'", .0.display())]
    BackupMissing(PathBuf),

    /// A filesystem operation failed while patching.
    #[error("I/O error on '{}' during {step}: {source}", path.display())]
    Io {
        /// The file that was being accessed
        path: PathBuf,
        /// The step at which the run was aborted
        step: PatchStep,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps an [`std::io::Error`] with the file and step it occurred at.
    pub(crate) fn io(path: impl Into<PathBuf>, step: PatchStep, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            step,
            source,
        }
    }

    /// Returns the patch step an orchestrator error was raised at, if any.
    #[must_use]
    pub fn step(&self) -> Option<PatchStep> {
        match self {
            Error::AnchorNotFound { step, .. }
            | Error::AnchorShape { step, .. }
            | Error::Io { step, .. } => Some(*step),
            Error::AlreadyPatched { .. } => Some(PatchStep::MarkerCheck),
            _ => None,
        }
    }
}
