use core::fmt::Debug;

use object::endian::{LittleEndian as LE, U16Bytes, U32Bytes};
use object::read::ReadRef;
use object::Pod;

use super::string::{CoffName, StringTable};
use crate::display_utils::{ByteStr, HexNum};
use crate::read::{ReadError, Result};

/// A record of the COFF symbol table.
///
/// Records are 18 bytes and packed back to back, so none of the fields are
/// naturally aligned.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CoffSymbol {
    pub name: CoffName,
    pub value: U32Bytes<LE>,
    /// One-based section index, or one of the special values of [`SectionNumber`].
    pub section_number: U16Bytes<LE>,
    /// Low 4 bits: base type. Remaining bits: derived type.
    pub typ: U16Bytes<LE>,
    pub storage_class: u8,
    /// Number of auxiliary records following this one.
    pub number_of_aux_symbols: u8,
}

unsafe impl Pod for CoffSymbol {}

impl CoffSymbol {
    pub const SIZE: usize = 18;

    pub fn value(&self) -> u32 {
        self.value.get(LE)
    }

    pub fn section(&self) -> SectionNumber {
        SectionNumber::from_raw(self.section_number.get(LE) as i16)
    }

    pub fn storage_class(&self) -> StorageClass {
        StorageClass(self.storage_class)
    }

    pub fn base_type(&self) -> u8 {
        (self.typ.get(LE) & 0xf) as u8
    }

    pub fn derived_type(&self) -> DerivedType {
        DerivedType::from_raw(self.typ.get(LE) >> 4)
    }

    pub fn is_function(&self) -> bool {
        self.derived_type() == DerivedType::Function
    }

    pub fn aux_count(&self) -> usize {
        self.number_of_aux_symbols as usize
    }

    /// Resolve the symbol name, inline or through `strings`.
    pub fn name<'data>(&'data self, strings: Option<&StringTable<'data>>) -> &'data [u8] {
        self.name.resolve(strings)
    }
}

impl Debug for CoffSymbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoffSymbol")
            .field("name", &self.name)
            .field("value", &HexNum(self.value()))
            .field("section", &self.section())
            .field("storage_class", &self.storage_class())
            .field("aux_count", &self.number_of_aux_symbols)
            .finish()
    }
}

/// The section a symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionNumber {
    /// An external symbol, or a common symbol if the value is non-zero.
    Undefined,
    /// The value is an absolute, non-relocatable address.
    Absolute,
    /// Debugging information that isn't part of any section.
    Debug,
    /// One-based index into the section table.
    Index(u16),
    /// Any other negative value.
    Other(i16),
}

impl SectionNumber {
    pub fn from_raw(raw: i16) -> Self {
        match raw {
            0 => SectionNumber::Undefined,
            -1 => SectionNumber::Absolute,
            -2 => SectionNumber::Debug,
            n if n > 0 => SectionNumber::Index(n as u16),
            n => SectionNumber::Other(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedType {
    None,
    Pointer,
    Function,
    Array,
    Other(u16),
}

impl DerivedType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => DerivedType::None,
            1 => DerivedType::Pointer,
            2 => DerivedType::Function,
            3 => DerivedType::Array,
            n => DerivedType::Other(n),
        }
    }
}

/// The storage class byte of a symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageClass(pub u8);

impl StorageClass {
    pub const NULL: Self = Self(0);
    pub const AUTOMATIC: Self = Self(1);
    pub const EXTERNAL: Self = Self(2);
    pub const STATIC: Self = Self(3);
    pub const REGISTER: Self = Self(4);
    pub const EXTERNAL_DEF: Self = Self(5);
    pub const LABEL: Self = Self(6);
    pub const UNDEFINED_LABEL: Self = Self(7);
    pub const MEMBER_OF_STRUCT: Self = Self(8);
    pub const ARGUMENT: Self = Self(9);
    pub const STRUCT_TAG: Self = Self(10);
    pub const MEMBER_OF_UNION: Self = Self(11);
    pub const UNION_TAG: Self = Self(12);
    pub const TYPE_DEFINITION: Self = Self(13);
    pub const UNDEFINED_STATIC: Self = Self(14);
    pub const ENUM_TAG: Self = Self(15);
    pub const MEMBER_OF_ENUM: Self = Self(16);
    pub const REGISTER_PARAM: Self = Self(17);
    pub const BIT_FIELD: Self = Self(18);
    pub const BLOCK: Self = Self(100);
    pub const FUNCTION: Self = Self(101);
    pub const END_OF_STRUCT: Self = Self(102);
    pub const FILE: Self = Self(103);
    pub const SECTION: Self = Self(104);
    pub const WEAK_EXTERNAL: Self = Self(105);
    pub const CLR_TOKEN: Self = Self(107);
    pub const END_OF_FUNCTION: Self = Self(0xff);

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NULL => "null",
            Self::AUTOMATIC => "automatic",
            Self::EXTERNAL => "external",
            Self::STATIC => "static",
            Self::REGISTER => "register",
            Self::EXTERNAL_DEF => "external_def",
            Self::LABEL => "label",
            Self::UNDEFINED_LABEL => "undefined_label",
            Self::MEMBER_OF_STRUCT => "member_of_struct",
            Self::ARGUMENT => "argument",
            Self::STRUCT_TAG => "struct_tag",
            Self::MEMBER_OF_UNION => "member_of_union",
            Self::UNION_TAG => "union_tag",
            Self::TYPE_DEFINITION => "type_definition",
            Self::UNDEFINED_STATIC => "undefined_static",
            Self::ENUM_TAG => "enum_tag",
            Self::MEMBER_OF_ENUM => "member_of_enum",
            Self::REGISTER_PARAM => "register_param",
            Self::BIT_FIELD => "bit_field",
            Self::BLOCK => "block",
            Self::FUNCTION => "function",
            Self::END_OF_STRUCT => "end_of_struct",
            Self::FILE => "file",
            Self::SECTION => "section",
            Self::WEAK_EXTERNAL => "weak_external",
            Self::CLR_TOKEN => "clr_token",
            Self::END_OF_FUNCTION => "end_of_function",
            _ => return None,
        };
        Some(name)
    }
}

impl Debug for StorageClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "StorageClass({})", self.0),
        }
    }
}

/// The symbol table of a COFF object together with the string table that
/// immediately follows it.
#[derive(Clone, Copy, Default)]
pub struct SymbolTable<'data> {
    symbols: &'data [CoffSymbol],
    strings: StringTable<'data>,
}

impl<'data> SymbolTable<'data> {
    /// Read `count` records at `offset`, then the string table after them.
    ///
    /// An object without a string table is accepted; its long names
    /// resolve to empty names.
    pub fn parse(data: &'data [u8], offset: u64, count: usize) -> Result<Self> {
        let symbols = data
            .read_slice_at::<CoffSymbol>(offset, count)
            .read_error("Could not read symbol table")?;
        let strings_offset = offset as usize + count * CoffSymbol::SIZE;
        let strings = match data.get(strings_offset..) {
            Some(tail) if !tail.is_empty() => StringTable::parse(tail)?,
            _ => {
                tracing::debug!(offset = strings_offset, "no string table after symbols");
                StringTable::empty()
            }
        };
        Ok(Self { symbols, strings })
    }

    /// Records, including auxiliary ones.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn strings(&self) -> &StringTable<'data> {
        &self.strings
    }

    /// The record at `index`. Auxiliary records aren't symbols, but this
    /// doesn't check.
    pub fn get(&self, index: usize) -> Option<&'data CoffSymbol> {
        self.symbols.get(index)
    }

    /// The raw auxiliary records of the symbol at `index`.
    pub fn aux_records(&self, index: usize) -> &'data [u8] {
        let Some(symbol) = self.symbols.get(index) else {
            return &[];
        };
        let end = (index + 1 + symbol.aux_count()).min(self.symbols.len());
        let aux = self.symbols.get(index + 1..end).unwrap_or(&[]);
        object::pod::bytes_of_slice(aux)
    }

    pub fn name(&self, symbol: &'data CoffSymbol) -> &'data [u8] {
        symbol.name(Some(&self.strings))
    }

    pub fn iter(&self) -> SymbolIter<'data> {
        SymbolIter {
            symbols: self.symbols,
            index: 0,
        }
    }
}

impl Debug for SymbolTable<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut list = f.debug_list();
        for (index, symbol) in self.iter() {
            list.entry(&(index, ByteStr(self.name(symbol))));
        }
        list.finish()
    }
}

/// Yields `(index, symbol)` for each symbol, stepping over auxiliary records.
#[derive(Clone, Debug)]
pub struct SymbolIter<'data> {
    symbols: &'data [CoffSymbol],
    index: usize,
}

impl<'data> Iterator for SymbolIter<'data> {
    type Item = (usize, &'data CoffSymbol);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.index;
        let symbol = self.symbols.get(index)?;
        self.index = index.saturating_add(1 + symbol.aux_count());
        Some((index, symbol))
    }
}

impl core::iter::FusedIterator for SymbolIter<'_> {}

#[cfg(test)]
mod test {
    use super::*;

    fn symbol(name: CoffName, value: u32, section: i16, typ: u16, class: u8, aux: u8) -> [u8; 18] {
        let mut raw = [0; 18];
        raw[0..8].copy_from_slice(&name.0);
        raw[8..12].copy_from_slice(&value.to_le_bytes());
        raw[12..14].copy_from_slice(&section.to_le_bytes());
        raw[14..16].copy_from_slice(&typ.to_le_bytes());
        raw[16] = class;
        raw[17] = aux;
        raw
    }

    #[test]
    fn test_symbol_fields() {
        assert_eq!(core::mem::size_of::<CoffSymbol>(), CoffSymbol::SIZE);

        let raw = symbol(CoffName::inline(b"main").unwrap(), 0x40, 1, 0x20, 2, 0);
        let sym = (&raw[..]).read_at::<CoffSymbol>(0).unwrap();
        assert_eq!(sym.name(None), b"main");
        assert_eq!(sym.value(), 0x40);
        assert_eq!(sym.section(), SectionNumber::Index(1));
        assert_eq!(sym.storage_class(), StorageClass::EXTERNAL);
        assert_eq!(sym.base_type(), 0);
        assert_eq!(sym.derived_type(), DerivedType::Function);
        assert!(sym.is_function());
    }

    #[test]
    fn test_section_numbers() {
        assert_eq!(SectionNumber::from_raw(0), SectionNumber::Undefined);
        assert_eq!(SectionNumber::from_raw(-1), SectionNumber::Absolute);
        assert_eq!(SectionNumber::from_raw(-2), SectionNumber::Debug);
        assert_eq!(SectionNumber::from_raw(3), SectionNumber::Index(3));
        assert_eq!(SectionNumber::from_raw(-7), SectionNumber::Other(-7));
    }

    #[test]
    fn test_table_skips_aux_records() {
        let mut data = [0u8; 4 * 18 + 23];
        let records = [
            symbol(CoffName::inline(b".file").unwrap(), 0, -2, 0, 103, 1),
            *b"very_long_file.c\0\0",
            symbol(CoffName::long(4), 0x10, 1, 0x20, 2, 0),
            symbol(CoffName::inline(b"abcdefgh").unwrap(), 0, 0, 0, 2, 0),
        ];
        for (i, record) in records.iter().enumerate() {
            data[i * 18..(i + 1) * 18].copy_from_slice(record);
        }
        let strings = b"\x17\x00\x00\x00a_rather_long_name\0";
        data[72..72 + strings.len()].copy_from_slice(strings);

        let table = SymbolTable::parse(&data, 0, 4).unwrap();
        assert_eq!(table.len(), 4);
        let mut iter = table.iter();

        let (index, file) = iter.next().unwrap();
        assert_eq!(index, 0);
        assert_eq!(table.name(file), b".file");
        assert_eq!(file.storage_class(), StorageClass::FILE);
        assert_eq!(file.section(), SectionNumber::Debug);
        assert_eq!(&table.aux_records(0)[..16], b"very_long_file.c");

        let (index, long) = iter.next().unwrap();
        assert_eq!(index, 2);
        assert_eq!(table.name(long), b"a_rather_long_name");
        assert_eq!(long.name(None), b"");

        let (index, short) = iter.next().unwrap();
        assert_eq!(index, 3);
        assert_eq!(table.name(short), b"abcdefgh");
        assert_eq!(short.section(), SectionNumber::Undefined);

        assert!(iter.next().is_none());
    }

    #[test]
    fn test_aux_count_past_end() {
        let data = symbol(CoffName::inline(b"x").unwrap(), 0, 1, 0, 3, 5);
        let table = SymbolTable::parse(&data, 0, 1).unwrap();
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.aux_records(0), b"");
        assert!(table.strings().is_empty());
    }
}
