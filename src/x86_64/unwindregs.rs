use core::fmt::Debug;

use crate::display_utils::HexNum;

/// A logical x86_64 register as understood by the unwinder.
///
/// The first sixteen variants are the general-purpose registers in the
/// order used by instruction encodings and by the op-info bits of unwind
/// codes. The remaining ones only appear in machine frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    RIP,
    CS,
    RFLAGS,
    SS,
}

impl Reg {
    const GENERAL_PURPOSE: [Reg; 16] = [
        Reg::RAX,
        Reg::RCX,
        Reg::RDX,
        Reg::RBX,
        Reg::RSP,
        Reg::RBP,
        Reg::RSI,
        Reg::RDI,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// The general-purpose register with the given 4-bit encoding.
    pub fn from_gpr_index(index: u8) -> Option<Reg> {
        Self::GENERAL_PURPOSE.get(index as usize).copied()
    }

    pub fn is_general_purpose(self) -> bool {
        (self as u8) < 16
    }
}

/// A 128-bit XMM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XmmReg(u8);

impl XmmReg {
    pub fn new(index: u8) -> Option<XmmReg> {
        (index < 16).then_some(XmmReg(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

/// A plain in-memory register file.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterContext {
    gpr: [u64; 16],
    xmm: [u128; 16],
    rip: u64,
    cs: u64,
    rflags: u64,
    ss: u64,
}

impl RegisterContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: Reg) -> u64 {
        match reg {
            Reg::RIP => self.rip,
            Reg::CS => self.cs,
            Reg::RFLAGS => self.rflags,
            Reg::SS => self.ss,
            gpr => self.gpr[gpr as usize],
        }
    }

    pub fn set(&mut self, reg: Reg, value: u64) {
        *self.get_mut(reg) = value;
    }

    pub fn get_mut(&mut self, reg: Reg) -> &mut u64 {
        match reg {
            Reg::RIP => &mut self.rip,
            Reg::CS => &mut self.cs,
            Reg::RFLAGS => &mut self.rflags,
            Reg::SS => &mut self.ss,
            gpr => &mut self.gpr[gpr as usize],
        }
    }

    pub fn xmm(&self, reg: XmmReg) -> u128 {
        self.xmm[reg.index() as usize]
    }

    pub fn set_xmm(&mut self, reg: XmmReg, value: u128) {
        self.xmm[reg.index() as usize] = value;
    }

    pub fn xmm_mut(&mut self, reg: XmmReg) -> &mut u128 {
        &mut self.xmm[reg.index() as usize]
    }

    #[inline(always)]
    pub fn ip(&self) -> u64 {
        self.rip
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.gpr[Reg::RSP as usize]
    }

    #[inline(always)]
    pub fn set_sp(&mut self, sp: u64) {
        self.gpr[Reg::RSP as usize] = sp
    }
}

impl Debug for RegisterContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("RegisterContext");
        s.field("rip", &HexNum(self.rip));
        for reg in Reg::GENERAL_PURPOSE {
            s.field(reg.name(), &HexNum(self.get(reg)));
        }
        s.field("rflags", &HexNum(self.rflags)).finish()
    }
}

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Reg::RAX => "rax",
            Reg::RCX => "rcx",
            Reg::RDX => "rdx",
            Reg::RBX => "rbx",
            Reg::RSP => "rsp",
            Reg::RBP => "rbp",
            Reg::RSI => "rsi",
            Reg::RDI => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::RIP => "rip",
            Reg::CS => "cs",
            Reg::RFLAGS => "rflags",
            Reg::SS => "ss",
        }
    }
}
