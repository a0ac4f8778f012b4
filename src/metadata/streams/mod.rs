//! Metadata streams of a managed image.
//!
//! The metadata root (see [`crate::metadata::root`]) is followed by a directory of
//! [`StreamHeader`]s. The streams this crate reads and rewrites are:
//!
//! - **`#~`** - [`TablesStream`], the compressed metadata tables
//! - **`#Strings`** - [`StringHeap`], NUL-terminated UTF-8 identifiers
//! - **`#US`** - [`UserStringHeap`], length-prefixed UTF-16 literals used by `ldstr`
//! - **`#Blob`** - [`BlobHeap`], length-prefixed signatures and other binary values
//! - **`#GUID`** - [`GuidHeap`], 16-byte GUIDs such as the module `Mvid`
//!
//! Heaps only ever grow. Existing offsets stay valid after an edit, so rows and method bodies
//! that were not touched keep referring to the same entries.
//!
//! # References
//!
//! - ECMA-335 6th Edition, Partition II, Section 24.2 - Metadata physical layout

mod blob;
mod guid;
mod streamheader;
mod strings;
mod tables;
mod userstrings;

pub use blob::BlobHeap;
pub use guid::GuidHeap;
pub use streamheader::StreamHeader;
pub use strings::StringHeap;
pub use tables::{RawTable, TablesStream};
pub use userstrings::UserStringHeap;
