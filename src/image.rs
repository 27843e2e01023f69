use core::fmt::Debug;
use core::mem::size_of;

use object::endian::LittleEndian as LE;
use object::pe::{
    ImageDataDirectory, ImageDosHeader, ImageFileHeader, ImageNtHeaders32, ImageNtHeaders64,
    ImageSectionHeader, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader};
use object::read::ReadRef;

use crate::coff::SymbolTable;
use crate::display_utils::{ByteStr, HexNum};
use crate::error::UnwindError;
use crate::exception::ExceptionDirectory;
use crate::read::{ReadError, Result};
use crate::x86_64::{unwind_frame, UnwindState};

/// Offset of `CheckSum` within the optional header. Same for PE32 and PE32+.
const CHECKSUM_OFFSET_IN_OPTIONAL_HEADER: usize = 64;

/// Index into the data directory array of the optional header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DirectoryId {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    /// Unlike every other directory, this one holds a file offset.
    Security = 4,
    BaseRelocation = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPointer = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    ComDescriptor = 14,
    Reserved = 15,
}

impl DirectoryId {
    pub const ALL: [DirectoryId; 16] = [
        DirectoryId::Export,
        DirectoryId::Import,
        DirectoryId::Resource,
        DirectoryId::Exception,
        DirectoryId::Security,
        DirectoryId::BaseRelocation,
        DirectoryId::Debug,
        DirectoryId::Architecture,
        DirectoryId::GlobalPointer,
        DirectoryId::Tls,
        DirectoryId::LoadConfig,
        DirectoryId::BoundImport,
        DirectoryId::Iat,
        DirectoryId::DelayImport,
        DirectoryId::ComDescriptor,
        DirectoryId::Reserved,
    ];
}

/// A PE image held in a byte buffer laid out as on disk.
///
/// Only the headers are validated up front. Everything else is resolved on
/// demand by translating RVAs through the section table.
pub struct PeImage<'data, Pe: ImageNtHeaders> {
    data: &'data [u8],
    nt_headers_offset: usize,
    nt_headers: &'data Pe,
    data_directories: &'data [ImageDataDirectory],
    sections: &'data [ImageSectionHeader],
}

pub type PeImage32<'data> = PeImage<'data, ImageNtHeaders32>;
pub type PeImage64<'data> = PeImage<'data, ImageNtHeaders64>;

impl<'data, Pe: ImageNtHeaders> PeImage<'data, Pe> {
    /// Validate the DOS and NT headers and capture the data directories and
    /// the section table.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let dos_header = data
            .read_at::<ImageDosHeader>(0)
            .read_error("Could not read DOS header")?;
        if dos_header.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
            return Err(crate::Error::Generic("Invalid DOS magic"));
        }

        let nt_headers_offset = dos_header.nt_headers_offset();
        let mut offset = nt_headers_offset as u64;
        let nt_headers = data
            .read::<Pe>(&mut offset)
            .read_error("Could not read NT headers")?;
        if nt_headers.signature() != IMAGE_NT_SIGNATURE {
            return Err(crate::Error::Generic("Invalid PE signature"));
        }
        if !nt_headers.is_valid_optional_magic() {
            return Err(crate::Error::Generic("Invalid optional header magic"));
        }

        let file_header = nt_headers.file_header();
        let optional_data_size = u64::from(file_header.size_of_optional_header.get(LE))
            .checked_sub(size_of::<Pe::ImageOptionalHeader>() as u64)
            .read_error("Optional header size is too small")?;
        let optional_data = data
            .read_bytes(&mut offset, optional_data_size)
            .read_error("Could not read optional header")?;
        let data_directories = optional_data
            .read_slice_at::<ImageDataDirectory>(
                0,
                nt_headers.optional_header().number_of_rva_and_sizes() as usize,
            )
            .read_error("Invalid number of data directories")?;

        let sections = data
            .read_slice_at::<ImageSectionHeader>(
                offset,
                file_header.number_of_sections.get(LE) as usize,
            )
            .read_error("Could not read section table")?;

        tracing::debug!(
            directories = data_directories.len(),
            sections = sections.len(),
            "parsed PE headers"
        );

        Ok(Self {
            data,
            nt_headers_offset: nt_headers_offset as usize,
            nt_headers,
            data_directories,
            sections,
        })
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    pub fn nt_headers(&self) -> &'data Pe {
        self.nt_headers
    }

    pub fn image_base(&self) -> u64 {
        self.nt_headers.optional_header().image_base()
    }

    pub fn sections(&self) -> &'data [ImageSectionHeader] {
        self.sections
    }

    pub fn data_directories(&self) -> &'data [ImageDataDirectory] {
        self.data_directories
    }

    /// The data directory entry for `id`, or `None` if the optional header
    /// doesn't have that many entries or the entry is empty.
    pub fn directory(&self, id: DirectoryId) -> Option<&'data ImageDataDirectory> {
        let dir = self.data_directories.get(id as usize)?;
        (dir.size.get(LE) != 0).then_some(dir)
    }

    /// The section whose virtual range contains `rva`.
    pub fn rva_to_section(&self, rva: u32) -> Option<&'data ImageSectionHeader> {
        self.sections.iter().find(|section| {
            let start = section.virtual_address.get(LE);
            let end = start as u64 + section.virtual_size.get(LE) as u64;
            start <= rva && (rva as u64) < end
        })
    }

    /// The file offset of `rva`, or `None` if it isn't backed by raw data
    /// (for example because it lies in the zero-filled tail of a section).
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        self.raw_range_at_rva(rva).map(|range| range.start)
    }

    /// The raw bytes from `rva` to the end of its section's raw data.
    pub fn data_at_rva(&self, rva: u32) -> Option<&'data [u8]> {
        self.data.get(self.raw_range_at_rva(rva)?)
    }

    fn raw_range_at_rva(&self, rva: u32) -> Option<core::ops::Range<usize>> {
        let section = self.rva_to_section(rva)?;
        let offset = rva - section.virtual_address.get(LE);
        let raw_size = section.size_of_raw_data.get(LE);
        if offset >= raw_size {
            return None;
        }
        let raw_start = section.pointer_to_raw_data.get(LE) as usize;
        let start = raw_start.checked_add(offset as usize)?;
        let end = raw_start
            .checked_add(raw_size as usize)?
            .min(self.data.len());
        (start < end).then_some(start..end)
    }

    /// The contents of a present data directory, clamped to the raw data
    /// available.
    pub fn directory_data(&self, id: DirectoryId) -> Option<&'data [u8]> {
        let dir = self.directory(id)?;
        let address = dir.virtual_address.get(LE);
        let size = dir.size.get(LE) as usize;
        let available = match id {
            DirectoryId::Security => self.data.get(address as usize..)?,
            _ => self.data_at_rva(address)?,
        };
        Some(&available[..size.min(available.len())])
    }

    /// The function table of the image, empty if there is none.
    pub fn exception_directory(&self) -> ExceptionDirectory<'data> {
        self.directory_data(DirectoryId::Exception)
            .map(ExceptionDirectory::new)
            .unwrap_or_default()
    }

    /// Unwind one frame of the function containing `rva`. See
    /// [`unwind_frame`](crate::x86_64::unwind_frame).
    pub fn unwind_frame<S: UnwindState>(
        &self,
        rva: u32,
        state: &mut S,
    ) -> core::result::Result<u64, UnwindError> {
        unwind_frame(&self.exception_directory(), rva, state, |address| {
            self.data_at_rva(address)
        })
    }

    /// The COFF symbol table, if the image still carries one. Linkers
    /// usually strip it from images.
    pub fn symbol_table(&self) -> Result<Option<SymbolTable<'data>>> {
        let file_header = self.nt_headers.file_header();
        let offset = file_header.pointer_to_symbol_table.get(LE);
        if offset == 0 {
            return Ok(None);
        }
        let count = file_header.number_of_symbols.get(LE) as usize;
        SymbolTable::parse(self.data, offset.into(), count).map(Some)
    }

    /// The checksum stored in the optional header.
    pub fn checksum(&self) -> u32 {
        self.nt_headers.optional_header().check_sum()
    }

    fn checksum_field_offset(&self) -> usize {
        self.nt_headers_offset
            + 4
            + size_of::<ImageFileHeader>()
            + CHECKSUM_OFFSET_IN_OPTIONAL_HEADER
    }

    /// Compute the optional header checksum of the whole buffer.
    ///
    /// The buffer is summed as little-endian 16-bit words with end-around
    /// carry, reading the stored checksum field as zero. A trailing odd byte
    /// counts as a word of its own. The file length is added last.
    pub fn compute_checksum(&self) -> u32 {
        let field = self.checksum_field_offset();
        let field = field..field + 4;
        let byte = |i: usize| {
            if field.contains(&i) {
                0
            } else {
                self.data[i] as u32
            }
        };

        let mut sum: u32 = 0;
        let mut i = 0;
        while i < self.data.len() {
            let word = if i + 1 < self.data.len() {
                byte(i) | (byte(i + 1) << 8)
            } else {
                byte(i)
            };
            sum += word;
            sum = (sum & 0xffff) + (sum >> 16);
            i += 2;
        }
        sum = (sum & 0xffff) + (sum >> 16);
        sum.wrapping_add(self.data.len() as u32)
    }
}

impl<Pe: ImageNtHeaders> Debug for PeImage<'_, Pe> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeImage")
            .field("image_base", &HexNum(self.image_base()))
            .field("checksum", &HexNum(self.checksum()))
            .field("sections", &SectionsDebug(self.sections))
            .finish_non_exhaustive()
    }
}

struct SectionsDebug<'a>(&'a [ImageSectionHeader]);

impl Debug for SectionsDebug<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(SectionDebug))
            .finish()
    }
}

struct SectionDebug<'a>(&'a ImageSectionHeader);

impl Debug for SectionDebug<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let section = self.0;
        f.debug_struct("Section")
            .field("name", &ByteStr(crate::read::until(&section.name, |b| b == 0)))
            .field("virtual_address", &HexNum(section.virtual_address.get(LE)))
            .field("virtual_size", &HexNum(section.virtual_size.get(LE)))
            .field("pointer_to_raw_data", &HexNum(section.pointer_to_raw_data.get(LE)))
            .field("size_of_raw_data", &HexNum(section.size_of_raw_data.get(LE)))
            .finish()
    }
}
