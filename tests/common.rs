#![allow(dead_code)]

use coffview::coff::archive::{MAGIC, TERMINATOR};
use coffview::x86_64::{Reg, UnwindOperation};
use coffview::{align_up, DirectoryId};

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub const FILE_ALIGNMENT: usize = 0x200;
pub const NT_HEADERS_OFFSET: usize = 0x40;

struct Section {
    name: [u8; 8],
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
}

/// Lays out a PE image the way a linker would write it to disk: headers
/// padded to the file alignment, then each section's raw data.
pub struct PeBuilder {
    is_64: bool,
    image_base: u64,
    checksum: u32,
    sections: Vec<Section>,
    directories: [(u32, u32); 16],
    symbols: Option<(u32, Vec<u8>)>,
}

impl PeBuilder {
    pub fn new64() -> Self {
        Self {
            is_64: true,
            image_base: 0x1_4000_0000,
            checksum: 0,
            sections: Vec::new(),
            directories: [(0, 0); 16],
            symbols: None,
        }
    }

    pub fn new32() -> Self {
        Self {
            is_64: false,
            image_base: 0x40_0000,
            ..Self::new64()
        }
    }

    pub fn section(self, name: &str, virtual_address: u32, data: Vec<u8>) -> Self {
        let virtual_size = data.len() as u32;
        self.section_with_virtual_size(name, virtual_address, virtual_size, data)
    }

    pub fn section_with_virtual_size(
        mut self,
        name: &str,
        virtual_address: u32,
        virtual_size: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut raw_name = [0; 8];
        raw_name[..name.len()].copy_from_slice(name.as_bytes());
        self.sections.push(Section {
            name: raw_name,
            virtual_address,
            virtual_size,
            data,
        });
        self
    }

    pub fn directory(mut self, id: DirectoryId, address: u32, size: u32) -> Self {
        self.directories[id as usize] = (address, size);
        self
    }

    pub fn checksum(mut self, checksum: u32) -> Self {
        self.checksum = checksum;
        self
    }

    /// Append a raw COFF symbol table (records plus string table).
    pub fn symbols(mut self, count: u32, raw: Vec<u8>) -> Self {
        self.symbols = Some((count, raw));
        self
    }

    pub fn optional_header_size(&self) -> usize {
        if self.is_64 {
            112 + 16 * 8
        } else {
            96 + 16 * 8
        }
    }

    /// File offset of the raw data of section `index`.
    pub fn section_offset(&self, index: usize) -> usize {
        let mut offset = FILE_ALIGNMENT;
        for section in &self.sections[..index] {
            offset += align_up(section.data.len(), FILE_ALIGNMENT);
        }
        offset
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; FILE_ALIGNMENT];
        out[0..2].copy_from_slice(b"MZ");
        put_u32(&mut out, 0x3c, NT_HEADERS_OFFSET as u32);
        out[NT_HEADERS_OFFSET..NT_HEADERS_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let file_header = NT_HEADERS_OFFSET + 4;
        put_u16(&mut out, file_header, if self.is_64 { 0x8664 } else { 0x14c });
        put_u16(&mut out, file_header + 2, self.sections.len() as u16);
        put_u16(&mut out, file_header + 16, self.optional_header_size() as u16);
        put_u16(&mut out, file_header + 18, 0x22);

        let optional_header = file_header + 20;
        let directories = if self.is_64 {
            put_u16(&mut out, optional_header, 0x20b);
            put_u64(&mut out, optional_header + 24, self.image_base);
            put_u32(&mut out, optional_header + 108, 16);
            optional_header + 112
        } else {
            put_u16(&mut out, optional_header, 0x10b);
            put_u32(&mut out, optional_header + 28, self.image_base as u32);
            put_u32(&mut out, optional_header + 92, 16);
            optional_header + 96
        };
        put_u32(&mut out, optional_header + 32, 0x1000);
        put_u32(&mut out, optional_header + 36, FILE_ALIGNMENT as u32);
        put_u32(&mut out, optional_header + 60, FILE_ALIGNMENT as u32);
        put_u32(&mut out, optional_header + 64, self.checksum);
        for (i, (address, size)) in self.directories.iter().enumerate() {
            put_u32(&mut out, directories + i * 8, *address);
            put_u32(&mut out, directories + i * 8 + 4, *size);
        }

        let section_table = optional_header + self.optional_header_size();
        let mut size_of_image = 0x1000;
        for (i, section) in self.sections.iter().enumerate() {
            let header = section_table + i * 40;
            let raw_size = align_up(section.data.len(), FILE_ALIGNMENT);
            out[header..header + 8].copy_from_slice(&section.name);
            put_u32(&mut out, header + 8, section.virtual_size);
            put_u32(&mut out, header + 12, section.virtual_address);
            put_u32(&mut out, header + 16, raw_size as u32);
            put_u32(&mut out, header + 20, self.section_offset(i) as u32);
            size_of_image = size_of_image
                .max(align_up((section.virtual_address + section.virtual_size) as usize, 0x1000));
        }
        put_u32(&mut out, optional_header + 56, size_of_image as u32);

        for section in &self.sections {
            let start = out.len();
            out.extend_from_slice(&section.data);
            out.resize(start + align_up(section.data.len(), FILE_ALIGNMENT), 0);
        }

        if let Some((count, raw)) = &self.symbols {
            let pointer = out.len() as u32;
            put_u32(&mut out, file_header + 8, pointer);
            put_u32(&mut out, file_header + 12, *count);
            out.extend_from_slice(raw);
        }
        out
    }
}

/// Serialized function table entries.
pub fn runtime_functions(entries: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (begin, end, info) in entries {
        out.extend_from_slice(&begin.to_le_bytes());
        out.extend_from_slice(&end.to_le_bytes());
        out.extend_from_slice(&info.to_le_bytes());
    }
    out
}

/// A serialized unwind info record. `ops` are given in stored order, which
/// is the reverse of prolog order.
pub struct UnwindInfoBuilder {
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    pub frame: Option<(Reg, u8)>,
    pub ops: Vec<(u8, UnwindOperation)>,
    pub trailer: Vec<u8>,
}

impl UnwindInfoBuilder {
    pub fn new(ops: &[(u8, UnwindOperation)]) -> Self {
        Self {
            version: 1,
            flags: 0,
            prolog_size: ops.iter().map(|(offset, _)| *offset).max().unwrap_or(0),
            frame: None,
            ops: ops.to_vec(),
            trailer: Vec::new(),
        }
    }

    pub fn frame(mut self, reg: Reg, offset_by_16: u8) -> Self {
        self.frame = Some((reg, offset_by_16));
        self
    }

    /// Mark the record as chained to the given function table entry.
    pub fn chained_to(mut self, begin: u32, end: u32, info: u32) -> Self {
        self.flags |= 0x4;
        self.trailer = runtime_functions(&[(begin, end, info)]);
        self
    }

    pub fn handler(mut self, handler_rva: u32, data: &[u8]) -> Self {
        self.flags |= 0x1;
        self.trailer = handler_rva.to_le_bytes().to_vec();
        self.trailer.extend_from_slice(data);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut codes = Vec::new();
        for (prolog_offset, op) in &self.ops {
            codes.extend(op.encode(*prolog_offset).unwrap());
        }
        let (frame_reg, frame_offset) = self.frame.map_or((0, 0), |(r, o)| (r as u8, o));
        let mut out = vec![
            self.version | (self.flags << 3),
            self.prolog_size,
            codes.len() as u8,
            frame_reg | (frame_offset << 4),
        ];
        for code in &codes {
            out.push(code.prolog_offset);
            out.push(code.opcode_and_info);
        }
        if codes.len() % 2 == 1 {
            out.extend_from_slice(&[0, 0]);
        }
        out.extend_from_slice(&self.trailer);
        out
    }
}

/// A System V `ar` archive: a `/` symbol index, a `//` long name table
/// when needed, then the members. Long names are newline terminated.
///
/// `symbols` map a symbol name to the index of the member defining it.
/// Returns the archive and the header offset of every member.
pub fn gnu_archive(symbols: &[(&str, usize)], members: &[(&str, &[u8])]) -> (Vec<u8>, Vec<usize>) {
    let mut long_names = Vec::new();
    let mut name_fields = Vec::new();
    for (name, _) in members {
        if name.len() < 16 {
            name_fields.push(format!("{}/", name));
        } else {
            name_fields.push(format!("/{}", long_names.len()));
            long_names.extend_from_slice(name.as_bytes());
            long_names.push(b'\n');
        }
    }

    let layout = |offsets: &[usize]| {
        let mut index = Vec::new();
        index.extend_from_slice(&(symbols.len() as u32).to_be_bytes());
        for (_, member) in symbols {
            let offset = offsets.get(*member).copied().unwrap_or(0);
            index.extend_from_slice(&(offset as u32).to_be_bytes());
        }
        for (name, _) in symbols {
            index.extend_from_slice(name.as_bytes());
            index.push(0);
        }

        let mut out = MAGIC.to_vec();
        let mut member_offsets = Vec::new();
        push_member(&mut out, "/", &index);
        if !long_names.is_empty() {
            push_member(&mut out, "//", &long_names);
        }
        for (field, (_, data)) in name_fields.iter().zip(members) {
            member_offsets.push(out.len());
            push_member(&mut out, field, data);
        }
        (out, member_offsets)
    };

    let (_, offsets) = layout(&[]);
    layout(&offsets)
}

/// Append one member with the raw name field `name`.
pub fn push_member(out: &mut Vec<u8>, name: &str, data: &[u8]) {
    let header = format!(
        "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}",
        name,
        1_700_000_000,
        0,
        0,
        "100644",
        data.len()
    );
    assert_eq!(header.len(), 58);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&TERMINATOR);
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(b'\n');
    }
}

/// A COFF symbol record.
pub fn coff_symbol(name: [u8; 8], value: u32, section: i16, typ: u16, class: u8) -> [u8; 18] {
    let mut raw = [0; 18];
    raw[0..8].copy_from_slice(&name);
    raw[8..12].copy_from_slice(&value.to_le_bytes());
    raw[12..14].copy_from_slice(&section.to_le_bytes());
    raw[14..16].copy_from_slice(&typ.to_le_bytes());
    raw[16] = class;
    raw
}

/// A COFF string table holding `names`, and the offset of each.
pub fn coff_string_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut out = vec![0; 4];
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(out.len() as u32);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    let size = out.len() as u32;
    out[0..4].copy_from_slice(&size.to_le_bytes());
    (out, offsets)
}
