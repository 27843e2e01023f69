use super::unwindregs::{Reg, RegisterContext, XmmReg};

/// The mutable context the unwind interpreter operates on.
///
/// Implementations decide where registers live and how stack memory is
/// reached: an in-memory register file for tests, a live thread context, or
/// a debugger reading another process.
pub trait UnwindState {
    /// Storage for the given register.
    fn register(&mut self, reg: Reg) -> &mut u64;

    /// Storage for the given XMM register.
    fn xmm_register(&mut self, reg: XmmReg) -> &mut u128;

    /// Fill `buf` from memory at `address`.
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(), ()>;

    /// Copy `data` to memory at `address`.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), ()>;
}

/// A window of stack memory starting at `base`.
///
/// Every access is bounds-checked against the window; addresses outside of
/// it fail the way a faulting read in a foreign process would.
#[derive(Debug)]
pub struct StackMemory<'a> {
    base: u64,
    bytes: &'a mut [u8],
}

impl<'a> StackMemory<'a> {
    pub fn new(base: u64, bytes: &'a mut [u8]) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    fn range(&self, address: u64, len: usize) -> Option<core::ops::Range<usize>> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), ()> {
        let range = self.range(address, buf.len()).ok_or(())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), ()> {
        let range = self.range(address, data.len()).ok_or(())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, ()> {
        let mut buf = [0; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), ()> {
        self.write(address, &value.to_le_bytes())
    }
}

/// Registers plus a stack window: the stock [`UnwindState`].
#[derive(Debug)]
pub struct UnwindContext<'a> {
    pub regs: RegisterContext,
    pub stack: StackMemory<'a>,
}

impl<'a> UnwindContext<'a> {
    pub fn new(regs: RegisterContext, stack: StackMemory<'a>) -> Self {
        Self { regs, stack }
    }
}

impl UnwindState for UnwindContext<'_> {
    fn register(&mut self, reg: Reg) -> &mut u64 {
        self.regs.get_mut(reg)
    }

    fn xmm_register(&mut self, reg: XmmReg) -> &mut u128 {
        self.regs.xmm_mut(reg)
    }

    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(), ()> {
        self.stack.read(address, buf)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), ()> {
        self.stack.write(address, data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stack_bounds() {
        let mut bytes = [0u8; 32];
        let mut stack = StackMemory::new(0x1000, &mut bytes);
        assert_eq!(stack.write_u64(0x1008, 0xdead_beef), Ok(()));
        assert_eq!(stack.read_u64(0x1008), Ok(0xdead_beef));
        assert_eq!(stack.read_u64(0x1018), Ok(0));
        assert_eq!(stack.read_u64(0x1019), Err(()));
        assert_eq!(stack.read_u64(0xfff), Err(()));
        assert_eq!(stack.write_u64(u64::MAX - 2, 1), Err(()));
        assert_eq!(stack.bytes()[8..12], [0xef, 0xbe, 0xad, 0xde]);
    }
}
