use core::fmt::Debug;

use object::endian::{LittleEndian as LE, U32Bytes};
use object::read::ReadRef;
use object::Pod;

use crate::display_utils::ByteStr;
use crate::read::{until, ReadError, Result};

/// The 8-byte name field shared by COFF symbols and section headers.
///
/// If the first four bytes are zero, the last four hold an offset into the
/// string table. Otherwise the field holds the name itself, NUL-padded, and
/// without a terminator if it is exactly eight bytes long.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CoffName(pub [u8; 8]);

unsafe impl Pod for CoffName {}

impl CoffName {
    /// An inline name. Returns `None` if `name` doesn't fit, or if it would
    /// be mistaken for a string table reference.
    pub fn inline(name: &[u8]) -> Option<Self> {
        if name.len() > 8 {
            return None;
        }
        let mut raw = [0; 8];
        raw[..name.len()].copy_from_slice(name);
        let name = Self(raw);
        name.is_short().then_some(name)
    }

    /// A reference to the name at `offset` in the string table.
    pub fn long(offset: u32) -> Self {
        let mut raw = [0; 8];
        raw[4..].copy_from_slice(&offset.to_le_bytes());
        Self(raw)
    }

    #[inline]
    pub fn is_short(&self) -> bool {
        self.0[..4] != [0; 4]
    }

    /// The inline name, stopping at the first NUL and never reading past the field.
    pub fn short_name(&self) -> Option<&[u8]> {
        self.is_short().then(|| until(&self.0, |b| b == 0))
    }

    /// The string table offset of a long name.
    pub fn long_name_offset(&self) -> Option<u32> {
        if self.is_short() {
            return None;
        }
        let [_, _, _, _, a, b, c, d] = self.0;
        Some(u32::from_le_bytes([a, b, c, d]))
    }

    /// Resolve the name. A long name with no string table, or with an offset
    /// the table doesn't cover, resolves to an empty name.
    pub fn resolve<'data>(&'data self, strings: Option<&StringTable<'data>>) -> &'data [u8] {
        match self.long_name_offset() {
            None => until(&self.0, |b| b == 0),
            Some(offset) => strings.and_then(|s| s.get(offset)).unwrap_or(&[]),
        }
    }
}

impl Debug for CoffName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.long_name_offset() {
            None => Debug::fmt(&ByteStr(until(&self.0, |b| b == 0)), f),
            Some(offset) => write!(f, "/{}", offset),
        }
    }
}

/// The COFF string table: a little-endian `u32` total size, which counts
/// itself, followed by NUL-terminated strings.
#[derive(Clone, Copy, Default)]
pub struct StringTable<'data> {
    data: &'data [u8],
}

impl<'data> StringTable<'data> {
    /// Parse the table at the start of `data`. Bytes past the declared size
    /// are not part of the table.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let size = data
            .read_at::<U32Bytes<LE>>(0)
            .read_error("Could not read string table size")?
            .get(LE) as usize;
        if size < 4 {
            return Err(crate::Error::Generic("Invalid string table size"));
        }
        let data = data.get(..size).read_error("String table is truncated")?;
        Ok(Self { data })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The raw table, including the size field.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= 4
    }

    /// The string at `offset`, counted from the start of the table.
    pub fn get(&self, offset: u32) -> Option<&'data [u8]> {
        let offset = offset as usize;
        if offset < 4 {
            return None;
        }
        let tail = self.data.get(offset..)?;
        Some(until(tail, |b| b == 0))
    }
}

impl Debug for StringTable<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StringTable")
            .field("len", &self.data.len())
            .finish()
    }
}
