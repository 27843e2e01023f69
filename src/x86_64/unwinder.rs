use arrayvec::ArrayVec;

use super::state::UnwindState;
use super::unwind_code::{UnwindOpcode, UnwindOperation};
use super::unwind_info::{UnwindInfo, UnwindInfoHeader};
use super::unwindregs::Reg;
use crate::error::UnwindError;
use crate::exception::ExceptionDirectory;

/// Chained records deeper than this are treated as a loop.
const MAX_CHAIN_DEPTH: usize = 32;

fn read_u64<S: UnwindState>(state: &mut S, address: u64) -> Result<u64, UnwindError> {
    let mut buf = [0; 8];
    state
        .read_memory(address, &mut buf)
        .map_err(|()| UnwindError::CouldNotReadStack(address))?;
    Ok(u64::from_le_bytes(buf))
}

fn write_u64<S: UnwindState>(state: &mut S, address: u64, value: u64) -> Result<(), UnwindError> {
    state
        .write_memory(address, &value.to_le_bytes())
        .map_err(|()| UnwindError::CouldNotWriteStack(address))
}

fn read_u128<S: UnwindState>(state: &mut S, address: u64) -> Result<u128, UnwindError> {
    let mut buf = [0; 16];
    state
        .read_memory(address, &mut buf)
        .map_err(|()| UnwindError::CouldNotReadStack(address))?;
    Ok(u128::from_le_bytes(buf))
}

fn write_u128<S: UnwindState>(
    state: &mut S,
    address: u64,
    value: u128,
) -> Result<(), UnwindError> {
    state
        .write_memory(address, &value.to_le_bytes())
        .map_err(|()| UnwindError::CouldNotWriteStack(address))
}

fn offset_sp<S: UnwindState>(state: &mut S, offset: u64) -> Result<u64, UnwindError> {
    state
        .register(Reg::RSP)
        .checked_add(offset)
        .ok_or(UnwindError::IntegerOverflow)
}

fn frame_register(header: &UnwindInfoHeader) -> Result<Reg, UnwindError> {
    header
        .frame_register()
        .ok_or(UnwindError::InvalidOpcode(UnwindOpcode::SetFpreg as u8))
}

/// Undo the effect of one prolog operation.
pub fn unwind_operation<S: UnwindState>(
    header: &UnwindInfoHeader,
    operation: UnwindOperation,
    state: &mut S,
) -> Result<(), UnwindError> {
    tracing::trace!(%operation, "unwind");
    match operation {
        UnwindOperation::PushNonvol(reg) => {
            let rsp = *state.register(Reg::RSP);
            let value = read_u64(state, rsp)?;
            *state.register(reg) = value;
            *state.register(Reg::RSP) = rsp.checked_add(8).ok_or(UnwindError::IntegerOverflow)?;
        }
        UnwindOperation::Alloc(size) => {
            *state.register(Reg::RSP) = offset_sp(state, size as u64)?;
        }
        UnwindOperation::SetFpreg => {
            let fp = *state.register(frame_register(header)?);
            *state.register(Reg::RSP) = fp
                .checked_sub(header.frame_offset())
                .ok_or(UnwindError::IntegerOverflow)?;
        }
        UnwindOperation::SaveNonvol(reg, offset) => {
            let address = offset_sp(state, offset as u64)?;
            *state.register(reg) = read_u64(state, address)?;
        }
        UnwindOperation::SaveXmm128(reg, offset) => {
            let address = offset_sp(state, offset as u64)?;
            *state.xmm_register(reg) = read_u128(state, address)?;
        }
        UnwindOperation::PushMachframe { error_code } => {
            let base = offset_sp(state, if error_code { 8 } else { 0 })?;
            let mut frame = [0u64; 5];
            for (i, slot) in frame.iter_mut().enumerate() {
                let address = base
                    .checked_add(8 * i as u64)
                    .ok_or(UnwindError::IntegerOverflow)?;
                *slot = read_u64(state, address)?;
            }
            let [rip, cs, rflags, rsp, ss] = frame;
            *state.register(Reg::RIP) = rip;
            *state.register(Reg::CS) = cs;
            *state.register(Reg::RFLAGS) = rflags;
            *state.register(Reg::RSP) = rsp;
            *state.register(Reg::SS) = ss;
        }
        UnwindOperation::Epilog | UnwindOperation::Spare => {}
    }
    Ok(())
}

/// Replay the effect of one prolog operation.
pub fn rewind_operation<S: UnwindState>(
    header: &UnwindInfoHeader,
    operation: UnwindOperation,
    state: &mut S,
) -> Result<(), UnwindError> {
    tracing::trace!(%operation, "rewind");
    match operation {
        UnwindOperation::PushNonvol(reg) => {
            let rsp = state
                .register(Reg::RSP)
                .checked_sub(8)
                .ok_or(UnwindError::IntegerOverflow)?;
            let value = *state.register(reg);
            write_u64(state, rsp, value)?;
            *state.register(Reg::RSP) = rsp;
        }
        UnwindOperation::Alloc(size) => {
            let rsp = state.register(Reg::RSP);
            *rsp = rsp
                .checked_sub(size as u64)
                .ok_or(UnwindError::IntegerOverflow)?;
        }
        UnwindOperation::SetFpreg => {
            let fp = frame_register(header)?;
            *state.register(fp) = offset_sp(state, header.frame_offset())?;
        }
        UnwindOperation::SaveNonvol(reg, offset) => {
            let address = offset_sp(state, offset as u64)?;
            let value = *state.register(reg);
            write_u64(state, address, value)?;
        }
        UnwindOperation::SaveXmm128(reg, offset) => {
            let address = offset_sp(state, offset as u64)?;
            let value = *state.xmm_register(reg);
            write_u128(state, address, value)?;
        }
        UnwindOperation::PushMachframe { .. } => return Err(UnwindError::MachineFrameRewind),
        UnwindOperation::Epilog | UnwindOperation::Spare => {}
    }
    Ok(())
}

/// Undo the whole prolog described by `info`, leaving `state` as it was on
/// entry to the function (RSP pointing at the return address).
///
/// Operations are applied in stored order. On error the state has been
/// partially updated.
pub fn unwind<S: UnwindState>(info: &UnwindInfo, state: &mut S) -> Result<(), UnwindError> {
    for operation in info.operations() {
        let (_, operation) = operation?;
        unwind_operation(info.header(), operation, state)?;
    }
    Ok(())
}

/// Replay the whole prolog described by `info`, as if the function had just
/// been entered with `state`.
///
/// The code array is decoded up front, so an undecodable record fails
/// before anything is written.
pub fn rewind<S: UnwindState>(info: &UnwindInfo, state: &mut S) -> Result<(), UnwindError> {
    // Every operation takes at least one slot and there are at most 255 slots.
    let mut operations = ArrayVec::<UnwindOperation, 255>::new();
    for operation in info.operations() {
        let (_, operation) = operation?;
        operations.push(operation);
    }
    for operation in operations.into_iter().rev() {
        rewind_operation(info.header(), operation, state)?;
    }
    Ok(())
}

fn parse_unwind_info(data: Option<&[u8]>, rva: u32) -> Result<UnwindInfo, UnwindError> {
    let data = data.ok_or(UnwindError::MissingUnwindInfo(rva))?;
    UnwindInfo::parse(data).map_err(|_| match data.first() {
        Some(&b) if !matches!(b & 0x7, 1 | 2) => UnwindError::UnsupportedVersion(b & 0x7),
        _ => UnwindError::MissingUnwindInfo(rva),
    })
}

/// Whether an operation ending at `prolog_offset` has executed once the
/// function has run `executed_until` bytes. `None` means all of it has.
fn has_executed(
    prolog_offset: u8,
    operation: UnwindOperation,
    executed_until: Option<u32>,
) -> bool {
    match executed_until {
        Some(offset) => {
            !matches!(operation, UnwindOperation::Epilog | UnwindOperation::Spare)
                && prolog_offset as u32 <= offset
        }
        None => true,
    }
}

/// Unwind one stack frame of the function containing `rva`.
///
/// `unwind_info_at` maps an RVA to the image bytes starting there. Prolog
/// operations that haven't executed yet at `rva` are skipped, chained
/// records are followed, and finally the return address is popped into
/// RIP. Once a record's frame register has been set, its saved registers
/// are read relative to that frame instead of the current RSP. Functions
/// without an entry in `directory` are treated as leaf functions. Returns
/// the new RIP.
pub fn unwind_frame<'data, S, F>(
    directory: &ExceptionDirectory<'data>,
    rva: u32,
    state: &mut S,
    mut unwind_info_at: F,
) -> Result<u64, UnwindError>
where
    S: UnwindState,
    F: FnMut(u32) -> Option<&'data [u8]>,
{
    if let Some(mut function) = directory.find_overlapping(rva) {
        let offset = rva - function.begin_address();
        let mut depth = 0;
        loop {
            let info_address = function.unwind_info_address();
            let info = parse_unwind_info(unwind_info_at(info_address), info_address)?;
            // The prolog of a chained record has always run to completion.
            let executed_until = (depth == 0).then_some(offset);

            // Once the frame register is set, saves are addressed from the
            // frame and not from RSP, which the body may have moved.
            let mut sets_frame = false;
            for operation in info.operations() {
                let (prolog_offset, operation) = operation?;
                sets_frame |= operation == UnwindOperation::SetFpreg
                    && has_executed(prolog_offset, operation, executed_until);
            }
            if sets_frame {
                unwind_operation(info.header(), UnwindOperation::SetFpreg, state)?;
            }

            for operation in info.operations() {
                let (prolog_offset, operation) = operation?;
                if !has_executed(prolog_offset, operation, executed_until) {
                    continue;
                }
                unwind_operation(info.header(), operation, state)?;
                if let UnwindOperation::PushMachframe { .. } = operation {
                    return Ok(*state.register(Reg::RIP));
                }
            }

            match info.chained_function() {
                Some(chained) => {
                    depth += 1;
                    if depth > MAX_CHAIN_DEPTH {
                        return Err(UnwindError::ChainTooDeep);
                    }
                    function = chained;
                }
                None => break,
            }
        }
    }

    let rsp = *state.register(Reg::RSP);
    let rip = read_u64(state, rsp)?;
    *state.register(Reg::RSP) = rsp.checked_add(8).ok_or(UnwindError::IntegerOverflow)?;
    *state.register(Reg::RIP) = rip;
    Ok(rip)
}
