//! The managed metadata of a binary: types, members, signatures and method bodies.
//!
//! # Key Components
//!
//! - [`model::BinaryModel`] - A loaded binary with lookups, imports and the writer
//! - [`method`] - Method definitions and editable method bodies
//! - [`references`] - By-value references to assemblies, types, fields and methods
//! - [`signatures`] - Type and method signatures and their blob encoding
//! - [`typedef`] - Type and field definitions
//! - [`token`] - Metadata table row references used in the code stream
//! - [`cor20header`] / [`root`] / [`streams`] / [`tables`] - The ECMA-335 physical layout:
//!   the CLR header, the `BSJB` metadata root, the heaps and the `#~` table stream
//!
//! Loading follows the CLR header from data directory 14 to the metadata root, decodes the
//! tables and heaps, and builds the model. Writing keeps every original row and heap entry,
//! appends what the model added, and places the new metadata and re-encoded method bodies in
//! a section appended to the image.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::metadata::{model::BinaryModel, references::Version};
//! use cilpatch::metadata::typedef::{TypeAttributes, TypeDef};
//!
//! let mut model = BinaryModel::new("Game", Version::new(1, 0, 0, 0));
//! model.types.push(TypeDef::new(TypeAttributes::PUBLIC, "Game", "Main"));
//!
//! let reloaded = BinaryModel::from_mem(model.to_bytes()?)?;
//! assert!(reloaded.type_def("Main").is_ok());
//! # Ok::<(), cilpatch::Error>(())
//! ```

/// The CLR 2.0 header
pub mod cor20header;
mod loader;
/// Method definitions, bodies and exception handlers
pub mod method;
/// The loaded binary
pub mod model;
/// References to assemblies, types and members
pub mod references;
/// The metadata root and its stream directory
pub mod root;
/// Type, method, field and local signatures
pub mod signatures;
/// Metadata heaps and the table stream
pub mod streams;
/// Table schemas, coded indices and row sizes
pub mod tables;
/// Commonly used metadata token type
pub mod token;
/// Type and field definitions
pub mod typedef;
mod writer;
