//! # cilpatch Prelude
//!
//! The types needed to load a binary, find and edit code in it, and run a patch.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilpatch operations
pub use crate::Error;

/// The result type used throughout cilpatch
pub use crate::Result;

/// Low-level file parsing utilities
pub use crate::{File, Parser};

// ================================================================================================
// Binary Model
// ================================================================================================

/// The loaded binary
pub use crate::metadata::model::BinaryModel;

/// Definitions and references
pub use crate::metadata::{
    method::{ExceptionHandler, MethodBody, MethodDef},
    references::{AssemblyRef, ExternalMethod, FieldRef, MethodRef, ResolutionScope, TypeRef, Version},
    signatures::{MethodSig, TypeSig},
    typedef::{FieldDef, TypeDef},
};

// ================================================================================================
// Instructions and Matching
// ================================================================================================

/// Instruction model
pub use crate::assembly::{Immediate, Instruction, InstructionId, OpCode, Operand, SlotFamily};

/// Pattern matching
pub use crate::scanner::{
    find, scan, scan_opcodes, scan_variable, CheckMode, Match, OperandCheck, Pattern, Predicate,
};

// ================================================================================================
// Patching
// ================================================================================================

/// Header fix-up
pub use crate::header::{set_large_address_aware, HeaderPatch};

/// Patch orchestration
pub use crate::patcher::{
    AnchorSpec, HookSpec, Injection, PatchConfig, PatchReport, PatchStep, Patcher,
};
