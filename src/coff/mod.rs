//! COFF symbol names and the `ar` container used by COFF libraries.

pub mod archive;
mod string;
mod symbol;

pub use archive::{ArchiveEntry, ArchiveHeader, ArchiveIter, ArchiveView, SymbolIndex};
pub use string::*;
pub use symbol::*;
