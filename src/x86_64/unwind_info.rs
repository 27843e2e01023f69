use core::fmt::Debug;

use object::endian::{LittleEndian, U32Bytes};
use object::read::ReadRef;
use object::Pod;

use super::unwind_code::{UnwindCode, UnwindOperations};
use super::unwindregs::Reg;
use crate::exception::RuntimeFunction;
use crate::read::{align_up, ReadError, Result};

/// The fixed 4-byte header at the start of every unwind info record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindInfoHeader {
    /// Low 3 bits: version. High 5 bits: [`UnwindInfoFlags`].
    pub version_and_flags: u8,
    /// Length of the function prolog in bytes.
    pub prolog_size: u8,
    /// Number of slots in use in the unwind code array (not counting padding).
    pub unwind_codes_len: u8,
    /// Low nibble: frame register. High nibble: frame offset / 16.
    pub frame_register_and_offset: u8,
}

unsafe impl Pod for UnwindInfoHeader {}

/// Flags stored in the high bits of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindInfoFlags(u8);

impl UnwindInfoFlags {
    /// The function has an exception handler.
    pub const EHANDLER: u8 = 0x1;
    /// The function has a termination handler.
    pub const UHANDLER: u8 = 0x2;
    /// The trailer is a [`RuntimeFunction`] of the primary unwind info.
    pub const CHAININFO: u8 = 0x4;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x1f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has_exception_handler(self) -> bool {
        self.0 & Self::EHANDLER != 0
    }

    pub fn has_termination_handler(self) -> bool {
        self.0 & Self::UHANDLER != 0
    }

    pub fn is_chained(self) -> bool {
        self.0 & Self::CHAININFO != 0
    }
}

impl UnwindInfoHeader {
    /// `frame_register` must be one of RAX..R15 and `frame_offset_by_16`
    /// must fit in four bits.
    pub fn new(
        version: u8,
        flags: UnwindInfoFlags,
        prolog_size: u8,
        unwind_codes_len: u8,
        frame_register: Option<Reg>,
        frame_offset_by_16: u8,
    ) -> Self {
        debug_assert!(frame_register.map_or(true, Reg::is_general_purpose));
        debug_assert!(frame_offset_by_16 < 16, "frame offset {} out of range", frame_offset_by_16);
        Self {
            version_and_flags: (version & 0x7) | (flags.bits() << 3),
            prolog_size,
            unwind_codes_len,
            frame_register_and_offset: (frame_register.map_or(0, |r| r as u8) & 0xf)
                | ((frame_offset_by_16 & 0xf) << 4),
        }
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version_and_flags & 0x7
    }

    pub fn flags(&self) -> UnwindInfoFlags {
        UnwindInfoFlags::from_bits(self.version_and_flags >> 3)
    }

    #[inline]
    pub fn frame_register_raw(&self) -> u8 {
        self.frame_register_and_offset & 0xf
    }

    #[inline]
    pub fn frame_offset_raw(&self) -> u8 {
        self.frame_register_and_offset >> 4
    }

    /// The frame register, or `None` if the function doesn't use one.
    pub fn frame_register(&self) -> Option<Reg> {
        match self.frame_register_raw() {
            0 => None,
            reg => Reg::from_gpr_index(reg),
        }
    }

    /// The distance between RSP and the frame register once the frame is set up.
    pub fn frame_offset(&self) -> u64 {
        self.frame_offset_raw() as u64 * 16
    }

    /// Slot count of the code array including the padding slot.
    pub fn padded_codes_len(&self) -> usize {
        align_up(self.unwind_codes_len as usize, 2)
    }
}

/// What follows the unwind code array.
#[derive(Debug, Clone, Copy)]
pub enum UnwindInfoTrailer<'data> {
    ExceptionHandler {
        handler_rva: u32,
        handler_data: &'data [u8],
    },
    TerminationHandler {
        handler_rva: u32,
        handler_data: &'data [u8],
    },
    /// This record continues the unwind info of another function entry.
    Chained(&'data RuntimeFunction),
}

/// A parsed unwind info record.
#[derive(Clone, Copy)]
pub struct UnwindInfo<'data> {
    header: &'data UnwindInfoHeader,
    codes: &'data [UnwindCode],
    rest: &'data [u8],
}

impl<'data> UnwindInfo<'data> {
    /// Parse an unwind info record at the start of `data`.
    ///
    /// Only versions 1 and 2 are defined. `data` may extend past the end of
    /// the record; the trailer is read lazily.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let header = data
            .read_at::<UnwindInfoHeader>(0)
            .read_error("Could not read UnwindInfoHeader")?;
        if !matches!(header.version(), 1 | 2) {
            tracing::debug!(version = header.version(), "unsupported unwind info version");
            return Err(crate::Error::Generic("Unsupported UnwindInfo version"));
        }
        let header_len = core::mem::size_of::<UnwindInfoHeader>() as u64;
        let codes = data
            .read_slice_at::<UnwindCode>(header_len, header.unwind_codes_len as usize)
            .read_error("Could not read unwind codes")?;
        let trailer_offset = header_len as usize + header.padded_codes_len() * 2;
        let rest = data.get(trailer_offset..).unwrap_or(&[]);
        Ok(Self {
            header,
            codes,
            rest,
        })
    }

    pub fn header(&self) -> &'data UnwindInfoHeader {
        self.header
    }

    /// The unwind code slots in use, without the padding slot.
    pub fn codes(&self) -> &'data [UnwindCode] {
        self.codes
    }

    /// The operations in stored order, which is the reverse of prolog order.
    pub fn operations(&self) -> UnwindOperations<'data> {
        UnwindOperations::new(self.codes, self.header.version())
    }

    /// The raw 4-byte trailer field, present when any handler or chain flag is set.
    ///
    /// This is the handler RVA for handler records and the first field of the
    /// chained [`RuntimeFunction`] otherwise; look at the flags to tell which.
    pub fn handler_rva(&self) -> Option<u32> {
        let field = self.rest.read_at::<U32Bytes<LittleEndian>>(0).ok()?;
        Some(field.get(LittleEndian))
    }

    /// The function entry this record is chained to, if the chained flag is set.
    pub fn chained_function(&self) -> Option<&'data RuntimeFunction> {
        if !self.flags().is_chained() {
            return None;
        }
        self.rest.read_at::<RuntimeFunction>(0).ok()
    }

    /// Language-specific handler data following the handler RVA.
    pub fn exception_data(&self) -> &'data [u8] {
        self.rest.get(4..).unwrap_or(&[])
    }

    pub fn trailer(&self) -> Option<UnwindInfoTrailer<'data>> {
        let flags = self.flags();
        if flags.is_chained() {
            self.chained_function().map(UnwindInfoTrailer::Chained)
        } else if flags.has_exception_handler() {
            Some(UnwindInfoTrailer::ExceptionHandler {
                handler_rva: self.handler_rva()?,
                handler_data: self.exception_data(),
            })
        } else if flags.has_termination_handler() {
            Some(UnwindInfoTrailer::TerminationHandler {
                handler_rva: self.handler_rva()?,
                handler_data: self.exception_data(),
            })
        } else {
            None
        }
    }
}

impl core::ops::Deref for UnwindInfo<'_> {
    type Target = UnwindInfoHeader;

    fn deref(&self) -> &Self::Target {
        self.header
    }
}

impl Debug for UnwindInfo<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnwindInfo")
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("prolog_size", &self.prolog_size)
            .field("frame_register", &self.frame_register())
            .field("frame_offset", &self.frame_offset())
            .field("codes", &self.codes)
            .finish_non_exhaustive()
    }
}
