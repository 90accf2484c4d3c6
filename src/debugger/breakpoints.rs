//! Software and hardware breakpoint management.
//!
//! The software table is the only owner of the mapping between live 0xCC
//! bytes and the instruction bytes they replaced; restoring through it is
//! the sole way a clobbered instruction can be correctly re-executed. The
//! hardware manager programs DR0-DR3/DR7 through per-thread contexts and
//! keeps a process-global record of what it installed.

use log::warn;

use winapi::um::winnt::{CONTEXT, CONTEXT_DEBUG_REGISTERS};

use crate::arch::debugreg::{self, DrSlot, HwAccess, HwLength};
use crate::common::{Address, RawHandle};
use crate::error::Error;

use super::registers::{get_context, set_context, Suspended};
use super::{memory, Debugger};

/// The INT3 opcode.
pub(crate) const INT3: u8 = 0xCC;

/// A hardware breakpoint programmed into one thread's debug registers.
#[derive(Debug, Clone, Copy)]
pub struct HwBreakpoint {
    /// Handle of the thread the slot was programmed on.
    pub thread: RawHandle,
    /// The watched address.
    pub address: Address,
    /// The DR0-DR3 slot holding the address.
    pub slot: DrSlot,
    /// The access kind that fires the breakpoint.
    pub access: HwAccess,
    /// The watched length.
    pub length: HwLength,
}

fn dr(ctx: &CONTEXT, slot: DrSlot) -> Address {
    (match slot {
        DrSlot::Dr0 => ctx.Dr0,
        DrSlot::Dr1 => ctx.Dr1,
        DrSlot::Dr2 => ctx.Dr2,
        DrSlot::Dr3 => ctx.Dr3,
    }) as Address
}

fn set_dr(ctx: &mut CONTEXT, slot: DrSlot, value: Address) {
    match slot {
        DrSlot::Dr0 => ctx.Dr0 = value as _,
        DrSlot::Dr1 => ctx.Dr1 = value as _,
        DrSlot::Dr2 => ctx.Dr2 = value as _,
        DrSlot::Dr3 => ctx.Dr3 = value as _,
    }
}

fn decode_slot(ctx: &CONTEXT, thread: RawHandle, slot: DrSlot) -> Option<HwBreakpoint> {
    let dr7 = ctx.Dr7 as usize;
    if !debugreg::is_enabled(dr7, slot) {
        return None;
    }
    let (access, length) = debugreg::decode_slot(dr7, slot);
    Some(HwBreakpoint {
        thread,
        address: dr(ctx, slot),
        slot,
        access,
        length,
    })
}

impl Debugger {
    /// Install a software (INT3) breakpoint at `address`.
    ///
    /// The original instruction byte is recorded so the breakpoint can be
    /// transparently stepped over and re-armed. Installing on top of an
    /// existing 0xCC is a no-op; nothing is overwritten or double-recorded.
    pub fn set_breakpoint(&mut self, address: Address) -> Result<(), Error> {
        let process = self.process_handle();
        let original: u8 = memory::read_value(process, address)?;
        if original == INT3 {
            return Ok(());
        }
        memory::write(process, address, &[INT3])?;
        self.sw_breakpoints.insert(address, original);
        Ok(())
    }

    /// Put the recorded original byte back at `address`.
    ///
    /// The table entry stays; the dispatch loop uses this to briefly lift a
    /// breakpoint while stepping over it. A missing entry is a bookkeeping
    /// bug worth a warning, but not fatal.
    pub(crate) fn restore_breakpoint(&mut self, address: Address) {
        let process = self.process_handle();
        match self.sw_breakpoints.get(&address) {
            Some(&original) => {
                if let Err(err) = memory::write(process, address, &[original]) {
                    warn!("failed to restore instruction at {:#x}: {}", address, err);
                }
            }
            None => warn!("no software breakpoint recorded at {:#x}", address),
        }
    }

    /// Remove the software breakpoint at `address`, restoring the original
    /// instruction byte.
    pub fn clear_breakpoint(&mut self, address: Address) -> Result<(), Error> {
        let process = self.process_handle();
        if let Some(original) = self.sw_breakpoints.remove(&address) {
            memory::write(process, address, &[original])?;
        }
        Ok(())
    }

    /// The addresses currently carrying a software breakpoint, with the
    /// instruction bytes they replaced.
    pub fn software_breakpoints(&self) -> impl Iterator<Item = (Address, u8)> + '_ {
        self.sw_breakpoints.iter().map(|(&a, &b)| (a, b))
    }

    /// Program a hardware breakpoint into one thread's debug registers.
    ///
    /// Execute breakpoints must watch exactly one byte; anything else is
    /// rejected before any thread is touched.
    pub fn set_hardware_breakpoint_on_thread(
        &mut self,
        thread: RawHandle,
        address: Address,
        slot: DrSlot,
        access: HwAccess,
        length: HwLength,
    ) -> Result<(), Error> {
        if access == HwAccess::Execute && length != HwLength::Byte {
            return Err(Error::ExecuteLengthNotByte);
        }

        {
            let _suspended = Suspended::new(thread)?;
            let mut ctx = get_context(thread, CONTEXT_DEBUG_REGISTERS)?;
            set_dr(&mut ctx, slot, address);
            ctx.Dr7 = debugreg::encode_slot(ctx.Dr7 as usize, slot, access, length) as _;
            set_context(thread, &ctx)?;
        }

        self.hw_breakpoints.insert(
            address,
            HwBreakpoint {
                thread,
                address,
                slot,
                access,
                length,
            },
        );
        Ok(())
    }

    /// Program a hardware breakpoint on every live thread of the target.
    ///
    /// The registry is refreshed first so the broadcast reaches threads the
    /// loop has not seen an event for. Per-thread failures are logged and
    /// the remaining threads are still programmed; the first error is
    /// returned once the sweep is complete.
    pub fn set_hardware_breakpoint(
        &mut self,
        address: Address,
        slot: DrSlot,
        access: HwAccess,
        length: HwLength,
    ) -> Result<(), Error> {
        if access == HwAccess::Execute && length != HwLength::Byte {
            return Err(Error::ExecuteLengthNotByte);
        }

        self.refresh_threads()?;
        let handles: Vec<RawHandle> = self.threads.iter().map(|t| t.handle.raw()).collect();

        let mut first_err = None;
        for thread in handles {
            if let Err(err) =
                self.set_hardware_breakpoint_on_thread(thread, address, slot, access, length)
            {
                warn!("failed to program {:?} on thread {:?}: {}", slot, thread, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Clear the given slot on one thread and drop the matching record.
    pub fn clear_hardware_breakpoint_on_thread(
        &mut self,
        thread: RawHandle,
        slot: DrSlot,
    ) -> Result<(), Error> {
        let old_address;
        {
            let _suspended = Suspended::new(thread)?;
            let mut ctx = get_context(thread, CONTEXT_DEBUG_REGISTERS)?;
            old_address = dr(&ctx, slot);
            set_dr(&mut ctx, slot, 0);
            ctx.Dr7 = debugreg::clear_slot(ctx.Dr7 as usize, slot) as _;
            set_context(thread, &ctx)?;
        }

        if let Some(bp) = self.hw_breakpoints.get(&old_address) {
            if bp.thread == thread && bp.slot == slot {
                self.hw_breakpoints.remove(&old_address);
            }
        }
        Ok(())
    }

    /// Clear the given slot on every live thread of the target.
    pub fn clear_hardware_breakpoint(&mut self, slot: DrSlot) -> Result<(), Error> {
        self.refresh_threads()?;
        let handles: Vec<RawHandle> = self.threads.iter().map(|t| t.handle.raw()).collect();

        let mut first_err = None;
        for thread in handles {
            if let Err(err) = self.clear_hardware_breakpoint_on_thread(thread, slot) {
                warn!("failed to clear {:?} on thread {:?}: {}", slot, thread, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Decode every enabled DR0-DR3 slot across all registry threads.
    pub fn hardware_breakpoints(&self) -> Vec<HwBreakpoint> {
        let mut result = Vec::new();
        for record in &self.threads {
            let thread = record.handle.raw();
            let ctx = match get_context(thread, CONTEXT_DEBUG_REGISTERS) {
                Ok(ctx) => ctx,
                Err(_) => continue,
            };
            for slot in DrSlot::ALL {
                if let Some(bp) = decode_slot(&ctx, thread, slot) {
                    result.push(bp);
                }
            }
        }
        result
    }

    /// The breakpoint currently programmed in `slot`, read back from the
    /// first thread where the slot is enabled.
    pub fn hardware_breakpoint_by_slot(&self, slot: DrSlot) -> Option<HwBreakpoint> {
        for record in &self.threads {
            let thread = record.handle.raw();
            let ctx = match get_context(thread, CONTEXT_DEBUG_REGISTERS) {
                Ok(ctx) => ctx,
                Err(_) => continue,
            };
            if let Some(bp) = decode_slot(&ctx, thread, slot) {
                return Some(bp);
            }
        }
        None
    }

    /// The first slot watching `address` on any thread, if one is enabled.
    pub fn hardware_breakpoint_at(&self, address: Address) -> Option<DrSlot> {
        for record in &self.threads {
            let ctx = match get_context(record.handle.raw(), CONTEXT_DEBUG_REGISTERS) {
                Ok(ctx) => ctx,
                Err(_) => continue,
            };
            let dr7 = ctx.Dr7 as usize;
            for slot in DrSlot::ALL {
                if debugreg::is_enabled(dr7, slot) && dr(&ctx, slot) == address {
                    return Some(slot);
                }
            }
        }
        None
    }
}
