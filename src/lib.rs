// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # cilpatch
//!
//! Locates and rewrites instruction sequences inside the method bodies of an already-built
//! managed executable, then fixes up its native header.
//!
//! ## Features
//!
//! - **Pattern matching** - Declarative per-instruction checks with variable binding, repeats
//!   and bounded or open-ended gaps
//! - **Instruction editing** - Index-based insert, replace and remove that keep branch targets
//!   and exception clauses pointing at live instructions
//! - **Byte-exact round trips** - An unmodified model writes back the bytes it was loaded from
//! - **Reference import** - Calls into a helper assembly are added with their reference rows
//! - **Header fix-up** - Sets `LARGE_ADDRESS_AWARE` by touching exactly two bytes
//! - **Patch orchestration** - Backup, apply-once marker, injection, write, restore
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cilpatch::prelude::*;
//!
//! let patcher = Patcher::new("Terraria.exe", PatchConfig::default());
//! match patcher.patch() {
//!     Ok(report) => println!("patched {} anchors", report.anchors.len()),
//!     Err(Error::AlreadyPatched { .. }) => println!("nothing to do"),
//!     Err(e) => return Err(e),
//! }
//! # Ok::<(), cilpatch::Error>(())
//! ```
//!
//! ### Finding and editing code
//!
//! ```rust,no_run
//! use cilpatch::prelude::*;
//!
//! let mut model = BinaryModel::load("Terraria.exe")?;
//! let method = model.method_mut("Item", "SetDefaults", 2)?;
//! if let Some(body) = method.body_mut() {
//!     let pattern = Pattern::new(vec![
//!         OperandCheck::family(SlotFamily::Ldarg),
//!         OperandCheck::with(OpCode::Ldfld, Predicate::FieldContains("Item::type".into())),
//!     ]);
//!     if let Some(at) = scan(body, &pattern, 0, 0, true) {
//!         body.insert(at, [Instruction::simple(OpCode::Nop)]);
//!     }
//! }
//! model.write("Terraria.exe")?;
//! # Ok::<(), cilpatch::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`assembly`] - Opcodes, instructions and the code stream codec
//! - [`metadata`] - The binary model: types, members, signatures and method bodies
//! - [`scanner`] - Pattern matching over instruction lists
//! - [`MethodBody`](metadata::method::MethodBody) editing (`insert`, `replace_range`, ...)
//! - [`file`] - PE container access and the image builder
//! - [`header`] - The large-address-aware fix-up
//! - [`patcher`] - The patch run, backup and restore

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use cilpatch::prelude::*;
///
/// let model = BinaryModel::load("Terraria.exe")?;
/// println!("{} {}", model.name, model.version);
/// # Ok::<(), cilpatch::Error>(())
/// ```
pub mod prelude;

/// CIL opcodes, instructions, decoding and encoding.
pub mod assembly;

mod editor;

/// PE container access and construction.
pub mod file;

/// Native header fix-ups.
pub mod header;

/// The in-memory binary model and its on-disk metadata layout.
pub mod metadata;

/// Patch orchestration, backup and restore.
pub mod patcher;

/// Instruction pattern matching.
pub mod scanner;

/// `cilpatch` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cilpatch` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use cilpatch::{Error, metadata::model::BinaryModel};
///
/// match BinaryModel::load("notepad.exe") {
///     Ok(model) => println!("loaded {}", model.name),
///     Err(Error::BinaryFormat(reason)) => println!("not a managed image: {reason}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// ```
pub use error::{DefinitionKind, Error};

/// Raw access to an image file, memory-mapped or in memory.
pub use file::File;

/// Little-endian cursor over a byte slice.
pub use file::parser::Parser;
