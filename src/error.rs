/// A structure didn't fit its buffer or failed validation. The message
/// names what was being read.
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(not(feature = "std"), derive(thiserror_no_std::Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    Generic(&'static str),
}

/// Errors reported while interpreting unwind codes.
///
/// Any of these leaves the [`UnwindState`](crate::x86_64::UnwindState) partially
/// updated; the caller should no longer trust it.
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(not(feature = "std"), derive(thiserror_no_std::Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    #[error("Could not read stack memory at 0x{0:x}")]
    CouldNotReadStack(u64),

    #[error("Could not write stack memory at 0x{0:x}")]
    CouldNotWriteStack(u64),

    #[error("Invalid unwind opcode {0}")]
    InvalidOpcode(u8),

    #[error("Unwind code array ended in the middle of an operation")]
    TruncatedOpcode,

    #[error("Machine frames can only be unwound, not rewound")]
    MachineFrameRewind,

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,

    #[error("Unsupported unwind info version {0}")]
    UnsupportedVersion(u8),

    #[error("Could not read unwind info at RVA 0x{0:x}")]
    MissingUnwindInfo(u32),

    #[error("Chained unwind info nests too deeply")]
    ChainTooDeep,
}
