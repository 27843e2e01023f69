use core::fmt::{Debug, Display};

use arrayvec::ArrayVec;
use object::Pod;

use super::unwindregs::{Reg, XmmReg};
use crate::display_utils::HexNum;
use crate::error::UnwindError;

/// One 16-bit slot of the unwind code array.
///
/// Depending on the preceding slot this is either an operation or part of
/// the immediate operand of the operation before it.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    /// Offset from the start of the prolog of the end of the instruction
    /// that performs this operation.
    pub prolog_offset: u8,
    /// Low nibble: [`UnwindOpcode`]. High nibble: operation info.
    pub opcode_and_info: u8,
}

unsafe impl Pod for UnwindCode {}

impl UnwindCode {
    /// `info` must fit in four bits.
    pub fn new(prolog_offset: u8, opcode: UnwindOpcode, info: u8) -> Self {
        debug_assert!(info < 16, "operation info {} does not fit in a nibble", info);
        Self {
            prolog_offset,
            opcode_and_info: (opcode as u8) | ((info & 0xf) << 4),
        }
    }

    /// A slot carrying (part of) an immediate operand.
    pub fn from_u16(value: u16) -> Self {
        let [prolog_offset, opcode_and_info] = value.to_le_bytes();
        Self {
            prolog_offset,
            opcode_and_info,
        }
    }

    /// The slot interpreted as an immediate operand.
    pub fn as_u16(&self) -> u16 {
        u16::from_le_bytes([self.prolog_offset, self.opcode_and_info])
    }

    #[inline]
    pub fn opcode_raw(&self) -> u8 {
        self.opcode_and_info & 0xf
    }

    #[inline]
    pub fn op_info(&self) -> u8 {
        self.opcode_and_info >> 4
    }

    pub fn opcode(&self) -> Option<UnwindOpcode> {
        UnwindOpcode::try_from(self.opcode_raw()).ok()
    }
}

impl Debug for UnwindCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnwindCode")
            .field("prolog_offset", &HexNum(self.prolog_offset))
            .field("opcode", &self.opcode_raw())
            .field("op_info", &self.op_info())
            .finish()
    }
}

/// The operation codes of x86_64 unwind info.
///
/// Older headers call `SetFpreg` `set_frame` and some revisions list extra
/// CLR/CHPE codes; only the eleven codes below exist in PE images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnwindOpcode {
    /// info = register number
    PushNonvol = 0x0,
    /// info = 0: size/8 in next slot, info = 1: size in next two slots
    AllocLarge = 0x1,
    /// info = size/8 - 1
    AllocSmall = 0x2,
    /// frame register = RSP + frame offset * 16
    SetFpreg = 0x3,
    /// info = register number, offset/8 in next slot
    SaveNonvol = 0x4,
    /// info = register number, offset in next two slots
    SaveNonvolFar = 0x5,
    /// Epilog location (version 2); reserved in version 1.
    Epilog = 0x6,
    /// Reserved.
    SpareCode = 0x7,
    /// info = XMM register number, offset/16 in next slot
    SaveXmm128 = 0x8,
    /// info = XMM register number, offset in next two slots
    SaveXmm128Far = 0x9,
    /// info = 0: no error code, 1: error code
    PushMachframe = 0xa,
}

impl TryFrom<u8> for UnwindOpcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        let opcode = match value {
            0x0 => UnwindOpcode::PushNonvol,
            0x1 => UnwindOpcode::AllocLarge,
            0x2 => UnwindOpcode::AllocSmall,
            0x3 => UnwindOpcode::SetFpreg,
            0x4 => UnwindOpcode::SaveNonvol,
            0x5 => UnwindOpcode::SaveNonvolFar,
            0x6 => UnwindOpcode::Epilog,
            0x7 => UnwindOpcode::SpareCode,
            0x8 => UnwindOpcode::SaveXmm128,
            0x9 => UnwindOpcode::SaveXmm128Far,
            0xa => UnwindOpcode::PushMachframe,
            _ => return Err(()),
        };
        Ok(opcode)
    }
}

/// A decoded prolog operation.
///
/// Each variant describes what the prolog did; the interpreter in
/// [`unwinder`](super::unwinder) applies it forwards or backwards. Large and
/// small allocations both decode to `Alloc`, near and far saves to the same
/// `Save*` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOperation {
    /// `push reg`
    PushNonvol(Reg),
    /// `sub rsp, size`
    Alloc(u32),
    /// `lea fp, [rsp + frame_offset * 16]`
    SetFpreg,
    /// `mov [rsp + offset], reg`
    SaveNonvol(Reg, u32),
    /// `movaps [rsp + offset], xmm`
    SaveXmm128(XmmReg, u32),
    /// The processor pushed an interrupt or exception frame.
    PushMachframe { error_code: bool },
    /// Epilog descriptor; has no effect on the frame.
    Epilog,
    /// Reserved code; has no effect on the frame.
    Spare,
}

impl UnwindOperation {
    /// The number of slots this operation occupies when encoded.
    pub fn slot_count(&self, version: u8) -> usize {
        match *self {
            UnwindOperation::PushNonvol(_)
            | UnwindOperation::SetFpreg
            | UnwindOperation::PushMachframe { .. } => 1,
            UnwindOperation::Alloc(size) => match alloc_form(size) {
                AllocForm::Small => 1,
                AllocForm::Large16 => 2,
                AllocForm::Large32 => 3,
            },
            UnwindOperation::SaveNonvol(_, offset) => {
                if scaled_u16(offset, 8).is_some() {
                    2
                } else {
                    3
                }
            }
            UnwindOperation::SaveXmm128(_, offset) => {
                if scaled_u16(offset, 16).is_some() {
                    2
                } else {
                    3
                }
            }
            UnwindOperation::Epilog => {
                if version == 1 {
                    2
                } else {
                    1
                }
            }
            UnwindOperation::Spare => 3,
        }
    }

    /// Encode this operation into unwind code slots, choosing the most compact form.
    ///
    /// `Epilog` and `Spare` are encoded in their version 2 shape. Returns
    /// `None` if a push or save names a register outside RAX..R15.
    pub fn encode(&self, prolog_offset: u8) -> Option<ArrayVec<UnwindCode, 3>> {
        let mut slots = ArrayVec::new();
        match *self {
            UnwindOperation::PushNonvol(reg) | UnwindOperation::SaveNonvol(reg, _)
                if !reg.is_general_purpose() =>
            {
                return None;
            }
            UnwindOperation::PushNonvol(reg) => {
                slots.push(UnwindCode::new(
                    prolog_offset,
                    UnwindOpcode::PushNonvol,
                    reg as u8,
                ));
            }
            UnwindOperation::Alloc(size) => match alloc_form(size) {
                AllocForm::Small => {
                    slots.push(UnwindCode::new(
                        prolog_offset,
                        UnwindOpcode::AllocSmall,
                        (size / 8 - 1) as u8,
                    ));
                }
                AllocForm::Large16 => {
                    slots.push(UnwindCode::new(prolog_offset, UnwindOpcode::AllocLarge, 0));
                    slots.push(UnwindCode::from_u16((size / 8) as u16));
                }
                AllocForm::Large32 => {
                    slots.push(UnwindCode::new(prolog_offset, UnwindOpcode::AllocLarge, 1));
                    push_u32(&mut slots, size);
                }
            },
            UnwindOperation::SetFpreg => {
                slots.push(UnwindCode::new(prolog_offset, UnwindOpcode::SetFpreg, 0));
            }
            UnwindOperation::SaveNonvol(reg, offset) => match scaled_u16(offset, 8) {
                Some(scaled) => {
                    slots.push(UnwindCode::new(
                        prolog_offset,
                        UnwindOpcode::SaveNonvol,
                        reg as u8,
                    ));
                    slots.push(UnwindCode::from_u16(scaled));
                }
                None => {
                    slots.push(UnwindCode::new(
                        prolog_offset,
                        UnwindOpcode::SaveNonvolFar,
                        reg as u8,
                    ));
                    push_u32(&mut slots, offset);
                }
            },
            UnwindOperation::SaveXmm128(reg, offset) => match scaled_u16(offset, 16) {
                Some(scaled) => {
                    slots.push(UnwindCode::new(
                        prolog_offset,
                        UnwindOpcode::SaveXmm128,
                        reg.index(),
                    ));
                    slots.push(UnwindCode::from_u16(scaled));
                }
                None => {
                    slots.push(UnwindCode::new(
                        prolog_offset,
                        UnwindOpcode::SaveXmm128Far,
                        reg.index(),
                    ));
                    push_u32(&mut slots, offset);
                }
            },
            UnwindOperation::PushMachframe { error_code } => {
                slots.push(UnwindCode::new(
                    prolog_offset,
                    UnwindOpcode::PushMachframe,
                    error_code as u8,
                ));
            }
            UnwindOperation::Epilog => {
                slots.push(UnwindCode::new(prolog_offset, UnwindOpcode::Epilog, 0));
            }
            UnwindOperation::Spare => {
                slots.push(UnwindCode::new(prolog_offset, UnwindOpcode::SpareCode, 0));
                push_u32(&mut slots, 0);
            }
        }
        Some(slots)
    }
}

impl Display for UnwindOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UnwindOperation::PushNonvol(reg) => write!(f, "push {}", reg.name()),
            UnwindOperation::Alloc(size) => write!(f, "alloc 0x{:x}", size),
            UnwindOperation::SetFpreg => write!(f, "set_fpreg"),
            UnwindOperation::SaveNonvol(reg, offset) => {
                write!(f, "save {} at rsp+0x{:x}", reg.name(), offset)
            }
            UnwindOperation::SaveXmm128(reg, offset) => {
                write!(f, "save xmm{} at rsp+0x{:x}", reg.index(), offset)
            }
            UnwindOperation::PushMachframe { error_code: true } => {
                write!(f, "push_machframe (error code)")
            }
            UnwindOperation::PushMachframe { error_code: false } => write!(f, "push_machframe"),
            UnwindOperation::Epilog => write!(f, "epilog"),
            UnwindOperation::Spare => write!(f, "spare"),
        }
    }
}

enum AllocForm {
    Small,
    Large16,
    Large32,
}

fn alloc_form(size: u32) -> AllocForm {
    if (8..=128).contains(&size) && size % 8 == 0 {
        AllocForm::Small
    } else if scaled_u16(size, 8).is_some() {
        AllocForm::Large16
    } else {
        AllocForm::Large32
    }
}

fn scaled_u16(value: u32, scale: u32) -> Option<u16> {
    if value % scale != 0 {
        return None;
    }
    u16::try_from(value / scale).ok()
}

fn push_u32(slots: &mut ArrayVec<UnwindCode, 3>, value: u32) {
    slots.push(UnwindCode::from_u16(value as u16));
    slots.push(UnwindCode::from_u16((value >> 16) as u16));
}

/// Decode the operation starting at `slots[0]`.
///
/// Returns the prolog offset, the operation and the number of slots consumed.
pub fn decode(
    slots: &[UnwindCode],
    version: u8,
) -> Result<(u8, UnwindOperation, usize), UnwindError> {
    let code = slots.first().ok_or(UnwindError::TruncatedOpcode)?;
    let info = code.op_info();
    let invalid = UnwindError::InvalidOpcode(code.opcode_raw());
    let immediate_u16 = |index: usize| {
        slots
            .get(index)
            .map(UnwindCode::as_u16)
            .ok_or(UnwindError::TruncatedOpcode)
    };
    let immediate_u32 = || -> Result<u32, UnwindError> {
        let low = immediate_u16(1)? as u32;
        let high = immediate_u16(2)? as u32;
        Ok(low | (high << 16))
    };
    let gpr = || Reg::from_gpr_index(info).ok_or(invalid);
    let xmm = || XmmReg::new(info).ok_or(invalid);

    let opcode = code.opcode().ok_or(invalid)?;
    let (operation, consumed) = match opcode {
        UnwindOpcode::PushNonvol => (UnwindOperation::PushNonvol(gpr()?), 1),
        UnwindOpcode::AllocLarge => match info {
            0 => (
                UnwindOperation::Alloc(immediate_u16(1)? as u32 * 8),
                2,
            ),
            1 => (UnwindOperation::Alloc(immediate_u32()?), 3),
            _ => return Err(invalid),
        },
        UnwindOpcode::AllocSmall => (UnwindOperation::Alloc(info as u32 * 8 + 8), 1),
        UnwindOpcode::SetFpreg => (UnwindOperation::SetFpreg, 1),
        UnwindOpcode::SaveNonvol => (
            UnwindOperation::SaveNonvol(gpr()?, immediate_u16(1)? as u32 * 8),
            2,
        ),
        UnwindOpcode::SaveNonvolFar => (UnwindOperation::SaveNonvol(gpr()?, immediate_u32()?), 3),
        UnwindOpcode::Epilog => {
            let consumed = if version == 1 { 2 } else { 1 };
            if slots.len() < consumed {
                return Err(UnwindError::TruncatedOpcode);
            }
            (UnwindOperation::Epilog, consumed)
        }
        UnwindOpcode::SpareCode => {
            immediate_u32()?;
            (UnwindOperation::Spare, 3)
        }
        UnwindOpcode::SaveXmm128 => (
            UnwindOperation::SaveXmm128(xmm()?, immediate_u16(1)? as u32 * 16),
            2,
        ),
        UnwindOpcode::SaveXmm128Far => (UnwindOperation::SaveXmm128(xmm()?, immediate_u32()?), 3),
        UnwindOpcode::PushMachframe => match info {
            0 | 1 => (
                UnwindOperation::PushMachframe {
                    error_code: info == 1,
                },
                1,
            ),
            _ => return Err(invalid),
        },
    };
    Ok((code.prolog_offset, operation, consumed))
}

/// An iterator over the operations of an unwind code array.
///
/// Operations are variable-length, so the array can only be walked front to
/// back. After the first error the iterator is exhausted.
#[derive(Clone, Debug)]
pub struct UnwindOperations<'data> {
    slots: &'data [UnwindCode],
    version: u8,
}

impl<'data> UnwindOperations<'data> {
    pub fn new(slots: &'data [UnwindCode], version: u8) -> Self {
        Self { slots, version }
    }
}

impl Iterator for UnwindOperations<'_> {
    type Item = Result<(u8, UnwindOperation), UnwindError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.slots.is_empty() {
            return None;
        }
        match decode(self.slots, self.version) {
            Ok((prolog_offset, operation, consumed)) => {
                self.slots = &self.slots[consumed..];
                Some(Ok((prolog_offset, operation)))
            }
            Err(e) => {
                tracing::debug!(error = %e, "stopping at undecodable unwind code");
                self.slots = &[];
                Some(Err(e))
            }
        }
    }
}

impl core::iter::FusedIterator for UnwindOperations<'_> {}
