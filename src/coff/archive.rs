//! The Unix `ar` archive format, as used for COFF import and static libraries.
//!
//! An archive is the magic string followed by a chain of members. Every
//! member starts with a 60-byte ASCII header and its data is padded to an
//! even length. A few leading members with special names carry the
//! System V extensions: `/` is a symbol index and `//` holds member names
//! too long for the 16-byte name field.

use core::fmt::Debug;

use arrayvec::ArrayVec;
use object::endian::{BigEndian as BE, U32Bytes};
use object::read::ReadRef;
use object::Pod;

use crate::display_utils::{ByteStr, HexNum};
use crate::read::{align_up, until, ReadError, Result};

pub const MAGIC: [u8; 8] = *b"!<arch>\n";
pub const TERMINATOR: [u8; 2] = *b"`\n";

/// Symbol tables retained by an [`ArchiveView`]. Any further ones are skipped.
pub const MAX_SYMBOL_TABLES: usize = 8;

/// The header in front of every archive member.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Member name, `/` terminated and space padded, or a special name.
    pub name: [u8; 16],
    /// Decimal modification time.
    pub date: [u8; 12],
    /// Decimal user id.
    pub owner_id: [u8; 6],
    /// Decimal group id.
    pub group_id: [u8; 6],
    /// Octal file mode.
    pub mode: [u8; 8],
    /// Decimal size of the member data, excluding padding.
    pub size: [u8; 10],
    pub terminator: [u8; 2],
}

unsafe impl Pod for ArchiveHeader {}

impl ArchiveHeader {
    pub const SIZE: usize = 60;

    pub fn is_terminated(&self) -> bool {
        self.terminator == TERMINATOR
    }
}

impl Debug for ArchiveHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchiveHeader")
            .field("name", &ByteStr(&self.name))
            .field("date", &ByteStr(&self.date))
            .field("owner_id", &ByteStr(&self.owner_id))
            .field("group_id", &ByteStr(&self.group_id))
            .field("mode", &ByteStr(&self.mode))
            .field("size", &ByteStr(&self.size))
            .finish()
    }
}

/// Parse a space-padded ASCII integer field in the given radix.
///
/// Leading spaces are skipped and parsing stops at the first byte that
/// isn't a digit. Returns `None` if there are no digits or the value
/// overflows.
pub fn parse_fixed_int(field: &[u8], radix: u32) -> Option<u64> {
    let start = field.iter().position(|&b| b != b' ')?;
    let mut value: u64 = 0;
    let mut digits = 0;
    for &b in &field[start..] {
        let Some(digit) = (b as char).to_digit(radix) else {
            break;
        };
        value = value.checked_mul(radix as u64)?.checked_add(digit as u64)?;
        digits += 1;
    }
    (digits > 0).then_some(value)
}

/// A member of an archive: its header and data, plus where it sits in the
/// archive buffer.
#[derive(Clone, Copy)]
pub struct ArchiveEntry<'data> {
    offset: usize,
    header: &'data ArchiveHeader,
    data: &'data [u8],
}

impl<'data> ArchiveEntry<'data> {
    /// Read the member whose header starts at `offset`.
    ///
    /// Returns `None` if the header doesn't fit, its terminator is wrong, its
    /// size field is unreadable, or its data runs past the end of `archive`.
    pub fn parse(archive: &'data [u8], offset: usize) -> Option<Self> {
        let header = archive.read_at::<ArchiveHeader>(offset as u64).ok()?;
        if !header.is_terminated() {
            tracing::debug!(offset, "archive member header has a bad terminator");
            return None;
        }
        let size = usize::try_from(parse_fixed_int(&header.size, 10)?).ok()?;
        let data_offset = offset.checked_add(ArchiveHeader::SIZE)?;
        let Some(data) = archive.get(data_offset..data_offset.checked_add(size)?) else {
            tracing::debug!(offset, size, "archive member data is truncated");
            return None;
        };
        Some(Self {
            offset,
            header,
            data,
        })
    }

    /// Offset of the member header in the archive.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn header(&self) -> &'data ArchiveHeader {
        self.header
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// Offset of the header of the member that follows this one.
    pub fn next_offset(&self) -> usize {
        self.offset + ArchiveHeader::SIZE + align_up(self.data.len(), 2)
    }

    /// The System V symbol index, named `/`.
    pub fn is_symbol_table(&self) -> bool {
        self.header.name.starts_with(b"/ ")
    }

    /// The long name table, named `//`.
    pub fn is_string_table(&self) -> bool {
        self.header.name.starts_with(b"// ")
    }

    /// Whether the name field holds `/` and a decimal offset into the long
    /// name table instead of the name itself.
    pub fn has_long_name(&self) -> bool {
        matches!(self.header.name, [b'/', b'0'..=b'9', ..])
    }

    pub fn long_name_offset(&self) -> Option<usize> {
        if !self.has_long_name() {
            return None;
        }
        usize::try_from(parse_fixed_int(&self.header.name[1..], 10)?).ok()
    }

    /// Resolve the member name.
    ///
    /// A name in the header ends at the first `/` or space. A long name is
    /// read from `string_table` up to the next newline; if there is no
    /// table or the offset lies outside of it, the name is empty.
    pub fn name(&self, string_table: Option<&ArchiveEntry<'data>>) -> &'data [u8] {
        if !self.has_long_name() {
            return until(&self.header.name, |b| b == b'/' || b == b' ');
        }
        let Some(long_names) = string_table.map(ArchiveEntry::data) else {
            return &[];
        };
        match self.long_name_offset().and_then(|o| long_names.get(o..)) {
            Some(tail) => until(tail, |b| b == b'\n'),
            None => &[],
        }
    }

    pub fn timestamp(&self) -> Option<u64> {
        parse_fixed_int(&self.header.date, 10)
    }

    pub fn owner_id(&self) -> Option<u64> {
        parse_fixed_int(&self.header.owner_id, 10)
    }

    pub fn group_id(&self) -> Option<u64> {
        parse_fixed_int(&self.header.group_id, 10)
    }

    pub fn mode(&self) -> Option<u64> {
        parse_fixed_int(&self.header.mode, 8)
    }

    /// Size of the member data, without padding.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Parse this member as a System V symbol index.
    pub fn symbol_index(&self) -> Result<SymbolIndex<'data>> {
        SymbolIndex::parse(self.data)
    }
}

impl Debug for ArchiveEntry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchiveEntry")
            .field("offset", &HexNum(self.offset))
            .field("name", &ByteStr(&self.header.name))
            .field("size", &self.data.len())
            .finish()
    }
}

/// A read-only view of an `ar` archive.
///
/// Construction makes one pass over the leading special members: the first
/// long name table is kept, symbol indexes are collected, and the first
/// ordinary member becomes the start of iteration. A buffer without the
/// archive magic gives a view with no members.
#[derive(Clone)]
pub struct ArchiveView<'data> {
    data: &'data [u8],
    string_table: Option<ArchiveEntry<'data>>,
    symbol_tables: ArrayVec<ArchiveEntry<'data>, MAX_SYMBOL_TABLES>,
    first_entry: Option<usize>,
}

impl<'data> ArchiveView<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        let mut view = Self {
            data,
            string_table: None,
            symbol_tables: ArrayVec::new(),
            first_entry: None,
        };
        if !data.starts_with(&MAGIC) {
            tracing::debug!("missing archive magic");
            return view;
        }

        let mut offset = MAGIC.len();
        while let Some(entry) = ArchiveEntry::parse(data, offset) {
            if entry.is_string_table() {
                if view.string_table.is_none() {
                    view.string_table = Some(entry);
                } else {
                    tracing::debug!(offset, "ignoring additional long name table");
                }
            } else if entry.is_symbol_table() {
                if view.symbol_tables.try_push(entry).is_err() {
                    tracing::debug!(offset, "too many symbol tables, skipping one");
                }
            } else {
                view.first_entry = Some(offset);
                break;
            }
            offset = entry.next_offset();
        }
        view
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The long name table (`//`), if the archive has one.
    pub fn string_table(&self) -> Option<&ArchiveEntry<'data>> {
        self.string_table.as_ref()
    }

    /// The symbol indexes (`/`), in archive order.
    pub fn symbol_tables(&self) -> &[ArchiveEntry<'data>] {
        &self.symbol_tables
    }

    /// The member whose header is at `offset`, as referenced by a symbol index.
    pub fn member_at(&self, offset: usize) -> Option<(&'data [u8], ArchiveEntry<'data>)> {
        let entry = ArchiveEntry::parse(self.data, offset)?;
        Some((entry.name(self.string_table.as_ref()), entry))
    }

    /// The ordinary members, each with its resolved name.
    pub fn iter(&self) -> ArchiveIter<'data> {
        ArchiveIter {
            data: self.data,
            string_table: self.string_table,
            next: self.first_entry,
        }
    }
}

impl Debug for ArchiveView<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchiveView")
            .field("string_table", &self.string_table)
            .field("symbol_tables", &self.symbol_tables)
            .field("first_entry", &self.first_entry.map(HexNum))
            .finish()
    }
}

impl<'data> IntoIterator for &ArchiveView<'data> {
    type Item = (&'data [u8], ArchiveEntry<'data>);
    type IntoIter = ArchiveIter<'data>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over archive members, yielding `(name, entry)`.
///
/// Ends at the end of the buffer or at the first member that can't be read.
#[derive(Clone, Debug)]
pub struct ArchiveIter<'data> {
    data: &'data [u8],
    string_table: Option<ArchiveEntry<'data>>,
    next: Option<usize>,
}

impl<'data> Iterator for ArchiveIter<'data> {
    type Item = (&'data [u8], ArchiveEntry<'data>);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let entry = ArchiveEntry::parse(self.data, offset)?;
        let next = entry.next_offset();
        if next < self.data.len() {
            self.next = Some(next);
        }
        Some((entry.name(self.string_table.as_ref()), entry))
    }
}

impl core::iter::FusedIterator for ArchiveIter<'_> {}

/// The System V symbol index: a big-endian count, that many big-endian
/// member header offsets, then the same number of NUL-terminated names.
#[derive(Clone, Copy)]
pub struct SymbolIndex<'data> {
    offsets: &'data [U32Bytes<BE>],
    names: &'data [u8],
}

impl<'data> SymbolIndex<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let mut offset = 0;
        let count = data
            .read::<U32Bytes<BE>>(&mut offset)
            .read_error("Could not read symbol count")?
            .get(BE);
        let offsets = data
            .read_slice::<U32Bytes<BE>>(&mut offset, count as usize)
            .read_error("Could not read symbol offsets")?;
        let names = data.get(offset as usize..).unwrap_or(&[]);
        Ok(Self { offsets, names })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Yields `(symbol name, member header offset)`. Stops early if the name
    /// area runs out.
    pub fn iter(&self) -> SymbolIndexIter<'data> {
        SymbolIndexIter {
            offsets: self.offsets.iter(),
            names: self.names,
        }
    }
}

impl Debug for SymbolIndex<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SymbolIndex")
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SymbolIndexIter<'data> {
    offsets: core::slice::Iter<'data, U32Bytes<BE>>,
    names: &'data [u8],
}

impl<'data> Iterator for SymbolIndexIter<'data> {
    type Item = (&'data [u8], u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.names.is_empty() {
            return None;
        }
        let offset = self.offsets.next()?.get(BE);
        let name = until(self.names, |b| b == 0);
        self.names = self.names.get(name.len() + 1..).unwrap_or(&[]);
        Some((name, offset))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Append a member with the given raw name field to `out`.
    fn push_member(out: &mut ArrayVec<u8, 1024>, name: &[u8], data: &[u8]) {
        let mut header = [b' '; 60];
        header[..name.len()].copy_from_slice(name);
        header[16..17].copy_from_slice(b"0");
        header[28..29].copy_from_slice(b"0");
        header[34..35].copy_from_slice(b"0");
        header[40..43].copy_from_slice(b"644");
        let mut size = ArrayVec::<u8, 10>::new();
        let mut n = data.len();
        loop {
            size.insert(0, b'0' + (n % 10) as u8);
            n /= 10;
            if n == 0 {
                break;
            }
        }
        header[48..48 + size.len()].copy_from_slice(&size);
        header[58..60].copy_from_slice(&TERMINATOR);
        out.try_extend_from_slice(&header).unwrap();
        out.try_extend_from_slice(data).unwrap();
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }

    fn archive() -> ArrayVec<u8, 1024> {
        let mut out = ArrayVec::new();
        out.try_extend_from_slice(&MAGIC).unwrap();
        out
    }

    #[test]
    fn test_fixed_int() {
        assert_eq!(parse_fixed_int(b"1234      ", 10), Some(1234));
        assert_eq!(parse_fixed_int(b"  42", 10), Some(42));
        assert_eq!(parse_fixed_int(b"100644  ", 8), Some(0o100644));
        assert_eq!(parse_fixed_int(b"0", 10), Some(0));
        assert_eq!(parse_fixed_int(b"12/", 10), Some(12));
        assert_eq!(parse_fixed_int(b"      ", 10), None);
        assert_eq!(parse_fixed_int(b"x1", 10), None);
        assert_eq!(parse_fixed_int(b"99999999999999999999", 10), None);
    }

    #[test]
    fn test_single_empty_member() {
        let mut data = archive();
        push_member(&mut data, b"a.o/", b"");
        let view = ArchiveView::new(&data);
        assert!(view.string_table().is_none());
        assert!(view.symbol_tables().is_empty());

        let mut iter = view.iter();
        let (name, entry) = iter.next().unwrap();
        assert_eq!(name, b"a.o");
        assert_eq!(entry.offset(), 8);
        assert_eq!(entry.size(), 0);
        assert_eq!(entry.timestamp(), Some(0));
        assert_eq!(entry.mode(), Some(0o644));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut data = archive();
        push_member(&mut data, b"a.o/", b"abc");
        data[1] = b'?';
        let view = ArchiveView::new(&data);
        assert_eq!(view.iter().count(), 0);
        assert!(view.string_table().is_none());
        assert_eq!(ArchiveView::new(b"").iter().count(), 0);
    }

    #[test]
    fn test_long_names() {
        let mut data = archive();
        push_member(&mut data, b"//", b"foo\nvery_long_member_name.obj/\n");
        push_member(&mut data, b"/0", b"x");
        push_member(&mut data, b"/4", b"yz");
        push_member(&mut data, b"/99", b"");
        push_member(&mut data, b"short.o/", b"");
        let view = ArchiveView::new(&data);
        assert!(view.string_table().is_some());

        let names: ArrayVec<&[u8], 8> = view.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names.as_slice(),
            &[
                &b"foo"[..],
                &b"very_long_member_name.obj/"[..],
                &b""[..],
                &b"short.o"[..],
            ]
        );
    }

    #[test]
    fn test_long_name_without_table() {
        let mut data = archive();
        push_member(&mut data, b"/0", b"");
        let view = ArchiveView::new(&data);
        let (name, entry) = view.iter().next().unwrap();
        assert!(entry.has_long_name());
        assert_eq!(entry.long_name_offset(), Some(0));
        assert_eq!(name, b"");
    }

    #[test]
    fn test_symbol_tables() {
        let mut index = ArrayVec::<u8, 64>::new();
        index.try_extend_from_slice(&2u32.to_be_bytes()).unwrap();
        index.try_extend_from_slice(&0x80u32.to_be_bytes()).unwrap();
        index.try_extend_from_slice(&0x80u32.to_be_bytes()).unwrap();
        index.try_extend_from_slice(b"foo\0bar\0").unwrap();

        let mut data = archive();
        for _ in 0..MAX_SYMBOL_TABLES + 2 {
            push_member(&mut data, b"/", &index);
        }
        let first_offset = data.len();
        push_member(&mut data, b"lib.o/", b"\x01");

        let view = ArchiveView::new(&data);
        assert_eq!(view.symbol_tables().len(), MAX_SYMBOL_TABLES);
        let (name, entry) = view.iter().next().unwrap();
        assert_eq!(name, b"lib.o");
        assert_eq!(entry.offset(), first_offset);
        assert_eq!(entry.data(), b"\x01");

        let symbols = view.symbol_tables()[0].symbol_index().unwrap();
        assert_eq!(symbols.len(), 2);
        let mut iter = symbols.iter();
        assert_eq!(iter.next(), Some((&b"foo"[..], 0x80)));
        assert_eq!(iter.next(), Some((&b"bar"[..], 0x80)));
        assert_eq!(iter.next(), None);

        let (name, _) = view.member_at(first_offset).unwrap();
        assert_eq!(name, b"lib.o");
        assert!(view.member_at(first_offset + 1).is_none());
    }

    #[test]
    fn test_corrupt_terminator_ends_iteration() {
        let mut data = archive();
        push_member(&mut data, b"a.o/", b"ab");
        let second = data.len();
        push_member(&mut data, b"b.o/", b"cd");
        push_member(&mut data, b"c.o/", b"ef");
        data[second + 58] = b'!';

        let view = ArchiveView::new(&data);
        let names: ArrayVec<&[u8], 4> = view.iter().map(|(name, _)| name).collect();
        assert_eq!(names.as_slice(), &[&b"a.o"[..]]);
    }

    #[test]
    fn test_truncated_member() {
        let mut data = archive();
        push_member(&mut data, b"a.o/", b"abcd");
        push_member(&mut data, b"b.o/", b"efgh");
        let len = data.len();
        let view = ArchiveView::new(&data[..len - 1]);
        assert_eq!(view.iter().count(), 1);

        // An odd-sized last member may omit its padding byte.
        let mut data = archive();
        push_member(&mut data, b"a.o/", b"abc");
        let len = data.len();
        let view = ArchiveView::new(&data[..len - 1]);
        assert_eq!(view.iter().count(), 1);
    }
}
