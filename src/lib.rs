//! Zero-copy views over the parts of PE/COFF files that need more than a
//! struct cast: the x86_64 exception directory and its unwind codes, COFF
//! symbol names, and `ar` archives.
//!
//! Nothing here allocates. Every view borrows the caller's buffer. Headers
//! are validated when a view is created; malformed tables and archives
//! behind them shorten or empty the view instead of failing.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod display_utils;
mod error;
mod exception;
mod image;
mod read;

pub mod coff;
pub mod x86_64;

pub use error::{Error, UnwindError};
pub use exception::{ExceptionDirectory, RuntimeFunction};
pub use image::{DirectoryId, PeImage, PeImage32, PeImage64};
pub use read::{align_up, Result};
