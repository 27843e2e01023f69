use core::fmt::Debug;
use core::ops::Range;

use object::endian::{LittleEndian, U32Bytes};
use object::read::ReadRef;
use object::Pod;

use crate::display_utils::HexNum;

/// One entry of the `.pdata` function table.
///
/// The range `begin_address..end_address` is half-open and both ends are RVAs.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin_address: U32Bytes<LittleEndian>,
    pub end_address: U32Bytes<LittleEndian>,
    /// RVA of the [`UnwindInfo`](crate::x86_64::UnwindInfo) for this function.
    pub unwind_info_address: U32Bytes<LittleEndian>,
}

unsafe impl Pod for RuntimeFunction {}

impl RuntimeFunction {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(begin_address: u32, end_address: u32, unwind_info_address: u32) -> Self {
        Self {
            begin_address: U32Bytes::new(LittleEndian, begin_address),
            end_address: U32Bytes::new(LittleEndian, end_address),
            unwind_info_address: U32Bytes::new(LittleEndian, unwind_info_address),
        }
    }

    pub fn begin_address(&self) -> u32 {
        self.begin_address.get(LittleEndian)
    }

    pub fn end_address(&self) -> u32 {
        self.end_address.get(LittleEndian)
    }

    pub fn unwind_info_address(&self) -> u32 {
        self.unwind_info_address.get(LittleEndian)
    }

    pub fn address_range(&self) -> Range<u32> {
        self.begin_address()..self.end_address()
    }

    pub fn contains(&self, rva: u32) -> bool {
        self.begin_address() <= rva && rva < self.end_address()
    }
}

impl Debug for RuntimeFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeFunction")
            .field("begin_address", &HexNum(self.begin_address()))
            .field("end_address", &HexNum(self.end_address()))
            .field("unwind_info_address", &HexNum(self.unwind_info_address()))
            .finish()
    }
}

/// A view over the exception directory (`.pdata`) of an x86_64 image.
///
/// All lookups are binary searches and assume the table is sorted by
/// `begin_address` with no overlapping ranges, which is what the linker
/// produces. On an unsorted or overlapping table the results are unspecified
/// but the lookups still never panic or read out of bounds.
#[derive(Clone, Copy)]
pub struct ExceptionDirectory<'data> {
    functions: &'data [RuntimeFunction],
    trailing_bytes: usize,
}

impl<'data> ExceptionDirectory<'data> {
    /// Wrap the raw directory contents.
    ///
    /// A directory whose size is not a multiple of the record size is malformed;
    /// the partial record at the end is ignored and reported by
    /// [`trailing_bytes`](Self::trailing_bytes).
    pub fn new(data: &'data [u8]) -> Self {
        let len = data.len() / RuntimeFunction::SIZE;
        let trailing_bytes = data.len() % RuntimeFunction::SIZE;
        if trailing_bytes != 0 {
            tracing::debug!(
                size = data.len(),
                trailing_bytes,
                "exception directory size is not a multiple of the record size"
            );
        }
        let functions = data
            .read_slice_at::<RuntimeFunction>(0, len)
            .unwrap_or(&[]);
        Self {
            functions,
            trailing_bytes,
        }
    }

    pub fn empty() -> Self {
        Self {
            functions: &[],
            trailing_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Number of bytes past the last whole record; non-zero means the directory is malformed.
    pub fn trailing_bytes(&self) -> usize {
        self.trailing_bytes
    }

    pub fn functions(&self) -> &'data [RuntimeFunction] {
        self.functions
    }

    pub fn get(&self, index: usize) -> Option<&'data RuntimeFunction> {
        self.functions.get(index)
    }

    pub fn iter(&self) -> core::slice::Iter<'data, RuntimeFunction> {
        self.functions.iter()
    }

    /// Find the function containing `rva`.
    ///
    /// Returns `None` for addresses in padding between functions or in
    /// functions without an entry (leaf functions).
    pub fn find_overlapping(&self, rva: u32) -> Option<&'data RuntimeFunction> {
        let function = self.functions.get(self.lower_bound(rva))?;
        (function.begin_address() <= rva).then_some(function)
    }

    /// Find the function starting exactly at `rva`.
    pub fn find(&self, rva: u32) -> Option<&'data RuntimeFunction> {
        let index = self
            .functions
            .binary_search_by_key(&rva, RuntimeFunction::begin_address)
            .ok()?;
        Some(&self.functions[index])
    }

    /// Index of the first function whose range ends after `rva`.
    pub fn lower_bound(&self, rva: u32) -> usize {
        self.functions.partition_point(|f| f.end_address() <= rva)
    }

    /// Index of the first function that begins after `rva`.
    pub fn upper_bound(&self, rva: u32) -> usize {
        self.functions.partition_point(|f| f.begin_address() <= rva)
    }

    /// All functions intersecting the half-open range `range`.
    pub fn equal_range(&self, range: Range<u32>) -> &'data [RuntimeFunction] {
        let lower = self.lower_bound(range.start);
        if range.is_empty() {
            return &self.functions[lower..lower];
        }
        let upper = self
            .functions
            .partition_point(|f| f.begin_address() < range.end)
            .max(lower);
        &self.functions[lower..upper]
    }
}

impl Default for ExceptionDirectory<'_> {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for ExceptionDirectory<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExceptionDirectory")
            .field("len", &self.len())
            .field("trailing_bytes", &self.trailing_bytes)
            .finish()
    }
}

impl<'data> IntoIterator for ExceptionDirectory<'data> {
    type Item = &'data RuntimeFunction;
    type IntoIter = core::slice::Iter<'data, RuntimeFunction>;

    fn into_iter(self) -> Self::IntoIter {
        self.functions.iter()
    }
}
