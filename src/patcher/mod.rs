//! Applies a set of helper-call injections to a managed executable exactly once.
//!
//! A run walks through the [`PatchStep`]s in order:
//!
//! 1. `Backup` - copy the target to `<target>.bak` unless a backup already exists
//! 2. `Load` - read the target into a [`BinaryModel`]
//! 3. `MarkerCheck` - fail with [`Error::AlreadyPatched`] if the marker field exists, else add it
//! 4. `Inject` - resolve each anchor, import its helper method and splice in the call
//! 5. `Write` - serialize the model back over the target
//! 6. `HeaderPatch` - set the large-address-aware bit if configured
//! 7. `CopyRequiredFiles` - deploy the helper library next to the target
//!
//! Nothing touches the target before `Write`, so a run failing at `Inject` leaves it unchanged
//! and the marker is only ever written together with every injection.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilpatch::patcher::{PatchConfig, Patcher};
//!
//! let patcher = Patcher::new("Terraria.exe", PatchConfig::default().with_helper_directory("."));
//! if !patcher.is_patched()? {
//!     let report = patcher.patch()?;
//!     for injection in &report.anchors {
//!         println!("{} -> {} at {}", injection.anchor, injection.helper.name, injection.index);
//!     }
//! }
//! # Ok::<(), cilpatch::Error>(())
//! ```

mod backup;
mod config;

pub use backup::{backup_path, copy_required_files, ensure_backup, restore};
pub use config::{AnchorSpec, HelperLibrary, HookSpec, Injection, PatchConfig};

use std::path::{Path, PathBuf};

use crate::{
    assembly::{Instruction, OpCode},
    header::{self, HeaderPatch},
    metadata::{
        model::BinaryModel,
        references::{ExternalMethod, MethodRef, Version},
        signatures::{MethodSig, TypeSig},
    },
    scanner, Error, Result,
};

/// The stages of a patch or restore run, as reported by [`Error::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PatchStep {
    /// Creating the backup
    #[strum(serialize = "backup")]
    Backup,
    /// Reading the target
    #[strum(serialize = "load")]
    Load,
    /// Looking for and adding the marker field
    #[strum(serialize = "marker check")]
    MarkerCheck,
    /// Resolving anchors and splicing in calls
    #[strum(serialize = "inject")]
    Inject,
    /// Writing the target
    #[strum(serialize = "write")]
    Write,
    /// Setting the large-address-aware bit
    #[strum(serialize = "header patch")]
    HeaderPatch,
    /// Deploying helper files
    #[strum(serialize = "copy required files")]
    CopyRequiredFiles,
    /// Restoring from the backup
    #[strum(serialize = "restore")]
    Restore,
}

/// One completed injection.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionReport {
    /// The patched method
    pub anchor: AnchorSpec,
    /// The called helper
    pub helper: MethodRef,
    /// Index of the first injected instruction
    pub index: usize,
    /// Number of instructions spliced in
    pub inserted: usize,
}

/// The outcome of [`Patcher::patch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchReport {
    /// Injections, in configuration order
    pub anchors: Vec<InjectionReport>,
    /// A new backup was created by this run
    pub backup_created: bool,
    /// Outcome of the header fix-up, `None` when disabled
    pub header: Option<HeaderPatch>,
    /// Helper files written next to the target
    pub copied_files: Vec<PathBuf>,
}

/// A read-only summary of a target, see [`Patcher::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchStatus {
    /// Assembly version of the target
    pub version: Version,
    /// The marker field is present
    pub patched: bool,
    /// Path of the backup, if one exists
    pub backup: Option<PathBuf>,
    /// Large-address-aware bit, `None` if the target is not a PE image
    pub large_address_aware: Option<bool>,
}

/// Maps bare I/O failures of the model layer onto the step they happened in.
fn at_step(path: &Path, step: PatchStep) -> impl FnOnce(Error) -> Error + '_ {
    move |error| match error {
        Error::FileError(source) => Error::io(path, step, source),
        other => other,
    }
}

/// State threaded through one patch run.
struct PatchContext<'a> {
    target: &'a Path,
    config: &'a PatchConfig,
    model: BinaryModel,
    report: PatchReport,
}

impl<'a> PatchContext<'a> {
    fn load(target: &'a Path, config: &'a PatchConfig, backup_created: bool) -> Result<Self> {
        let model = BinaryModel::load(target).map_err(at_step(target, PatchStep::Load))?;
        log::info!("Loaded {} {} from {}", model.name, model.version, target.display());
        Ok(PatchContext {
            target,
            config,
            model,
            report: PatchReport {
                backup_created,
                ..PatchReport::default()
            },
        })
    }

    fn mark(&mut self) -> Result<()> {
        let config = self.config;
        if self.model.has_field(&config.primary_type, &config.marker_field) {
            return Err(Error::AlreadyPatched {
                path: self.target.to_path_buf(),
                marker: config.marker_field.clone(),
            });
        }
        self.model
            .add_static_field(&config.primary_type, &config.marker_field, TypeSig::Boolean)?;
        Ok(())
    }

    fn inject(&mut self, hook: &HookSpec) -> Result<()> {
        let anchor = &hook.anchor;
        let not_found = |error: Error| match error {
            Error::DefinitionNotFound { .. } => Error::AnchorNotFound {
                anchor: anchor.to_string(),
                step: PatchStep::Inject,
                reason: error.to_string(),
            },
            other => other,
        };
        let shape = |reason: &str| Error::AnchorShape {
            anchor: anchor.to_string(),
            step: PatchStep::Inject,
            reason: reason.to_string(),
        };

        let declaring_type = self.model.type_def(&anchor.type_name).map_err(not_found)?.reference();
        let is_static = self
            .model
            .method(&anchor.type_name, &anchor.method_name, anchor.parameter_count)
            .map_err(not_found)?
            .is_static();

        let pass_this = matches!(hook.injection, Injection::BeforeFinalReturn { pass_this: true });
        if pass_this && is_static {
            return Err(shape("a static method has no instance to pass"));
        }

        let params = if pass_this {
            vec![TypeSig::Class(declaring_type)]
        } else {
            Vec::new()
        };
        let helper = self.model.import_method(&ExternalMethod {
            assembly: self.config.helper.assembly.clone(),
            namespace: self.config.helper.namespace.clone(),
            type_name: self.config.helper.type_name.clone(),
            name: hook.helper_method.clone(),
            signature: MethodSig::new_static(TypeSig::Void, params),
        })?;

        let method = self
            .model
            .method_mut(&anchor.type_name, &anchor.method_name, anchor.parameter_count)
            .map_err(not_found)?;
        let body = method.body_mut().ok_or_else(|| shape("method has no body"))?;

        let (index, inserted) = match &hook.injection {
            Injection::AtEntry => (0, body.prepend([Instruction::call(helper.clone())])),
            Injection::BeforeFinalReturn { pass_this } => {
                let Some(last) = body.instructions.last() else {
                    return Err(shape("body is empty"));
                };
                if last.opcode != OpCode::Ret {
                    return Err(shape(&format!("body ends in '{}' instead of 'ret'", last.opcode)));
                }

                let at = body.len() - 1;
                let mut instructions = Vec::with_capacity(3);
                if *pass_this {
                    instructions.push(Instruction::load_argument(0));
                }
                instructions.push(Instruction::call(helper.clone()));
                instructions.push(Instruction::simple(OpCode::Ret));
                (at, body.replace_range(at, at + 1, instructions) - at)
            }
            Injection::AtPattern {
                pattern,
                occurrence,
                at_end,
            } => {
                let found = scanner::find(&body.instructions, pattern, *occurrence, 0)
                    .ok_or_else(|| shape(&format!("pattern match #{occurrence} not found")))?;
                let at = if *at_end { found.end } else { found.start };
                (at, body.insert(at, [Instruction::call(helper.clone())]) - at)
            }
        };
        body.reserve_stack(u16::from(pass_this));

        log::info!("Injected call to {} into {anchor} at {index}", helper.name);
        self.report.anchors.push(InjectionReport {
            anchor: anchor.clone(),
            helper,
            index,
            inserted,
        });
        Ok(())
    }

    fn write(&self) -> Result<()> {
        self.model
            .write(self.target)
            .map_err(at_step(self.target, PatchStep::Write))?;
        log::info!("Wrote {}", self.target.display());
        Ok(())
    }

    fn patch_header(&mut self) -> Result<()> {
        if self.config.large_address_aware {
            self.report.header = Some(header::set_large_address_aware(self.target)?);
        }
        Ok(())
    }

    fn copy_files(&mut self) -> Result<()> {
        let files = &self.config.required_files;
        if files.is_empty() {
            return Ok(());
        }

        let source = match &self.config.helper_directory {
            Some(directory) => directory.clone(),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| Error::io(self.target, PatchStep::CopyRequiredFiles, e))?;
                exe.parent().map(Path::to_path_buf).unwrap_or_default()
            }
        };
        let destination = match self.target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        self.report.copied_files = copy_required_files(&source, &destination, files)?;
        Ok(())
    }
}

/// Patches, restores and inspects one target file.
#[derive(Debug, Clone)]
pub struct Patcher {
    target: PathBuf,
    config: PatchConfig,
}

impl Patcher {
    /// Creates a patcher for the executable at `target`.
    pub fn new(target: impl Into<PathBuf>, config: PatchConfig) -> Self {
        Patcher {
            target: target.into(),
            config,
        }
    }

    /// The target executable.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Where the backup lives.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        backup_path(&self.target, &self.config.backup_suffix)
    }

    /// Returns `true` if a backup exists.
    #[must_use]
    pub fn has_backup(&self) -> bool {
        self.backup_path().is_file()
    }

    /// Returns `true` if the target carries the marker field.
    ///
    /// # Errors
    ///
    /// Returns the loader's errors.
    pub fn is_patched(&self) -> Result<bool> {
        let model = BinaryModel::load(&self.target).map_err(at_step(&self.target, PatchStep::Load))?;
        Ok(model.has_field(&self.config.primary_type, &self.config.marker_field))
    }

    /// Summarizes the target without modifying anything.
    ///
    /// # Errors
    ///
    /// Returns the loader's errors.
    pub fn status(&self) -> Result<PatchStatus> {
        let model = BinaryModel::load(&self.target).map_err(at_step(&self.target, PatchStep::Load))?;
        let backup = self.backup_path();
        Ok(PatchStatus {
            version: model.version,
            patched: model.has_field(&self.config.primary_type, &self.config.marker_field),
            backup: backup.is_file().then_some(backup),
            large_address_aware: header::is_large_address_aware(&self.target)?,
        })
    }

    /// Runs the whole patch, see the module documentation for the steps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPatched`] on a second run, [`Error::AnchorNotFound`] or
    /// [`Error::AnchorShape`] if the target does not have the expected methods, and
    /// [`Error::Io`] for filesystem failures. Loader and writer errors are passed through.
    pub fn patch(&self) -> Result<PatchReport> {
        let target = self.target.as_path();
        log::info!("Patching {}", target.display());

        let backup_created = ensure_backup(target, &self.backup_path())?;

        let mut context = PatchContext::load(target, &self.config, backup_created)?;
        context.mark()?;
        for hook in &self.config.hooks {
            context.inject(hook)?;
        }
        context.write()?;
        context.patch_header()?;
        context.copy_files()?;

        Ok(context.report)
    }

    /// Overwrites the target with its backup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackupMissing`] if there is no backup.
    pub fn restore(&self) -> Result<()> {
        restore(&self.target, &self.backup_path())
    }

    /// Restores the backup, then patches it.
    ///
    /// # Errors
    ///
    /// See [`Patcher::restore`] and [`Patcher::patch`].
    pub fn restore_and_patch(&self) -> Result<PatchReport> {
        self.restore()?;
        self.patch()
    }

    /// Returns `true` if the backup holds an older assembly version than the target.
    ///
    /// Restoring such a backup downgrades the game.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackupMissing`] if there is no backup, and the loader's errors.
    pub fn backup_is_older(&self) -> Result<bool> {
        let backup = self.backup_path();
        if !backup.is_file() {
            return Err(Error::BackupMissing(backup));
        }
        let saved = BinaryModel::load(&backup).map_err(at_step(&backup, PatchStep::Restore))?;
        let current = BinaryModel::load(&self.target).map_err(at_step(&self.target, PatchStep::Restore))?;
        Ok(saved.version < current.version)
    }
}
