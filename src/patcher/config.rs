//! Configuration for a patch run.
//!
//! The defaults describe the item modification patch: a call to the helper library's setup
//! entry point at the start of `Main::LoadPlayers`, and a call receiving the item at the end of
//! `Item::SetDefaults`, with `Main.ItemModificationPatched` as the applied-once marker.

use std::{fmt, path::PathBuf};

use crate::{
    metadata::references::{AssemblyRef, Version},
    scanner::Pattern,
};

/// Names the method an injection is anchored to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnchorSpec {
    /// Simple or namespace-qualified type name
    pub type_name: String,
    /// Method name
    pub method_name: String,
    /// Number of declared parameters, excluding `this`
    pub parameter_count: usize,
}

impl AnchorSpec {
    /// Creates an anchor.
    #[must_use]
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>, parameter_count: usize) -> Self {
        AnchorSpec {
            type_name: type_name.into(),
            method_name: method_name.into(),
            parameter_count,
        }
    }
}

impl fmt::Display for AnchorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.type_name, self.method_name, self.parameter_count)
    }
}

/// Where in the anchor's body the helper call goes.
#[derive(Debug, Clone)]
pub enum Injection {
    /// Before the first instruction; the helper takes no arguments.
    AtEntry,
    /// In place of the final `ret`, which is re-emitted after the call.
    ///
    /// Branches to the old `ret` land on the call. With `pass_this`, `ldarg.0` is loaded first
    /// and the helper takes the anchor's declaring type as its only parameter.
    BeforeFinalReturn {
        /// Pass the instance the anchor runs on
        pass_this: bool,
    },
    /// Before the first instruction of a pattern match, or after its last one with `at_end`.
    AtPattern {
        /// The pattern to look for
        pattern: Pattern,
        /// Which match to use, counting from 0
        occurrence: usize,
        /// Insert after the match instead of before it
        at_end: bool,
    },
}

/// One injected helper call.
#[derive(Debug, Clone)]
pub struct HookSpec {
    /// The method receiving the call
    pub anchor: AnchorSpec,
    /// Name of the static helper method on [`HelperLibrary::type_name`]
    pub helper_method: String,
    /// Position of the call
    pub injection: Injection,
}

/// The assembly the injected calls go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperLibrary {
    /// Assembly name and version recorded in the reference
    pub assembly: AssemblyRef,
    /// Namespace of the helper type
    pub namespace: String,
    /// Name of the helper type
    pub type_name: String,
}

/// Configuration for [`crate::patcher::Patcher`].
#[derive(Debug, Clone)]
pub struct PatchConfig {
    /// Appended to the target's file name to form the backup path (default: `.bak`)
    pub backup_suffix: String,

    /// Type carrying the marker field (default: `Main`)
    pub primary_type: String,

    /// Static field whose presence means "already patched" (default: `ItemModificationPatched`)
    pub marker_field: String,

    /// Injections, applied in order
    pub hooks: Vec<HookSpec>,

    /// The library the hooks call into
    pub helper: HelperLibrary,

    /// Files copied next to the target after a successful patch
    pub required_files: Vec<String>,

    /// Directory the required files are copied from; the current executable's directory when
    /// `None`
    pub helper_directory: Option<PathBuf>,

    /// Set `IMAGE_FILE_LARGE_ADDRESS_AWARE` after writing (default: `true`)
    pub large_address_aware: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self::item_modification()
    }
}

impl PatchConfig {
    /// The item modification patch.
    #[must_use]
    pub fn item_modification() -> Self {
        Self {
            backup_suffix: ".bak".to_string(),
            primary_type: "Main".to_string(),
            marker_field: "ItemModificationPatched".to_string(),
            hooks: vec![
                HookSpec {
                    anchor: AnchorSpec::new("Main", "LoadPlayers", 0),
                    helper_method: "OnSetupModifications".to_string(),
                    injection: Injection::AtEntry,
                },
                HookSpec {
                    anchor: AnchorSpec::new("Item", "SetDefaults", 2),
                    helper_method: "OnSetItemDefaults".to_string(),
                    injection: Injection::BeforeFinalReturn { pass_this: true },
                },
            ],
            helper: HelperLibrary {
                assembly: AssemblyRef::new("ItemModification", Version::new(1, 0, 0, 0)),
                namespace: "ItemModification".to_string(),
                type_name: "ItemModifier".to_string(),
            },
            required_files: vec!["ItemModification.dll".to_string()],
            helper_directory: None,
            large_address_aware: true,
        }
    }

    /// Creates a configuration with the given helper directory.
    #[must_use]
    pub fn with_helper_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.helper_directory = Some(directory.into());
        self
    }
}
