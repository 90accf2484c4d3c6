//! Per-thread CPU context access: registers, EFLAGS bits, the trap flag,
//! and the instruction-pointer rewind.
//!
//! Anything that exchanges a thread context with the OS while the thread
//! may be scheduled runs inside a [`Suspended`] envelope; the guard resumes
//! the thread on every exit path. The two exceptions are register reads/
//! writes and trap-flag arming, which the dispatch loop only performs at
//! points where the target is already held by the debug subsystem.

use core::mem;

use winapi::um::processthreadsapi::{
    GetThreadContext, ResumeThread, SetThreadContext, SuspendThread,
};
use winapi::um::winnt::{CONTEXT, CONTEXT_ALL, CONTEXT_CONTROL, CONTEXT_FULL};

use crate::arch::{Eflags, RegValue, Register};
use crate::common::{Address, RawHandle};
use crate::error::{last_os_error, Error};

/// Keeps a thread suspended for the guard's lifetime.
///
/// Resuming happens in `drop`, so early returns and `?` cannot leave the
/// target thread frozen.
pub(crate) struct Suspended(RawHandle);

impl Suspended {
    pub(crate) fn new(thread: RawHandle) -> Result<Suspended, Error> {
        if unsafe { SuspendThread(thread) } == u32::MAX {
            return Err(last_os_error("SuspendThread"));
        }
        Ok(Suspended(thread))
    }
}

impl Drop for Suspended {
    fn drop(&mut self) {
        if unsafe { ResumeThread(self.0) } == u32::MAX {
            log::warn!("ResumeThread failed; target thread may stay suspended");
        }
    }
}

pub(crate) fn get_context(thread: RawHandle, flags: u32) -> Result<CONTEXT, Error> {
    let mut ctx: CONTEXT = unsafe { mem::zeroed() };
    ctx.ContextFlags = flags;
    if unsafe { GetThreadContext(thread, &mut ctx) } == 0 {
        return Err(last_os_error("GetThreadContext"));
    }
    Ok(ctx)
}

pub(crate) fn set_context(thread: RawHandle, ctx: &CONTEXT) -> Result<(), Error> {
    if unsafe { SetThreadContext(thread, ctx) } == 0 {
        return Err(last_os_error("SetThreadContext"));
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        fn context_register(ctx: &CONTEXT, reg: Register) -> RegValue {
            match reg {
                Register::Eax => ctx.Eax,
                Register::Ebx => ctx.Ebx,
                Register::Ecx => ctx.Ecx,
                Register::Edx => ctx.Edx,
                Register::Esi => ctx.Esi,
                Register::Edi => ctx.Edi,
                Register::Ebp => ctx.Ebp,
                Register::Esp => ctx.Esp,
                Register::Eip => ctx.Eip,
            }
        }

        fn context_register_mut(ctx: &mut CONTEXT, reg: Register) -> &mut RegValue {
            match reg {
                Register::Eax => &mut ctx.Eax,
                Register::Ebx => &mut ctx.Ebx,
                Register::Ecx => &mut ctx.Ecx,
                Register::Edx => &mut ctx.Edx,
                Register::Esi => &mut ctx.Esi,
                Register::Edi => &mut ctx.Edi,
                Register::Ebp => &mut ctx.Ebp,
                Register::Esp => &mut ctx.Esp,
                Register::Eip => &mut ctx.Eip,
            }
        }

        fn ip(ctx: &CONTEXT) -> Address {
            ctx.Eip as Address
        }

        fn ip_mut(ctx: &mut CONTEXT) -> &mut u32 {
            &mut ctx.Eip
        }
    } else {
        fn context_register(ctx: &CONTEXT, reg: Register) -> RegValue {
            match reg {
                Register::Rax => ctx.Rax,
                Register::Rbx => ctx.Rbx,
                Register::Rcx => ctx.Rcx,
                Register::Rdx => ctx.Rdx,
                Register::Rsi => ctx.Rsi,
                Register::Rdi => ctx.Rdi,
                Register::Rbp => ctx.Rbp,
                Register::Rsp => ctx.Rsp,
                Register::R8 => ctx.R8,
                Register::R9 => ctx.R9,
                Register::R10 => ctx.R10,
                Register::R11 => ctx.R11,
                Register::R12 => ctx.R12,
                Register::R13 => ctx.R13,
                Register::R14 => ctx.R14,
                Register::R15 => ctx.R15,
                Register::Rip => ctx.Rip,
            }
        }

        fn context_register_mut(ctx: &mut CONTEXT, reg: Register) -> &mut RegValue {
            match reg {
                Register::Rax => &mut ctx.Rax,
                Register::Rbx => &mut ctx.Rbx,
                Register::Rcx => &mut ctx.Rcx,
                Register::Rdx => &mut ctx.Rdx,
                Register::Rsi => &mut ctx.Rsi,
                Register::Rdi => &mut ctx.Rdi,
                Register::Rbp => &mut ctx.Rbp,
                Register::Rsp => &mut ctx.Rsp,
                Register::R8 => &mut ctx.R8,
                Register::R9 => &mut ctx.R9,
                Register::R10 => &mut ctx.R10,
                Register::R11 => &mut ctx.R11,
                Register::R12 => &mut ctx.R12,
                Register::R13 => &mut ctx.R13,
                Register::R14 => &mut ctx.R14,
                Register::R15 => &mut ctx.R15,
                Register::Rip => &mut ctx.Rip,
            }
        }

        fn ip(ctx: &CONTEXT) -> Address {
            ctx.Rip as Address
        }

        fn ip_mut(ctx: &mut CONTEXT) -> &mut u64 {
            &mut ctx.Rip
        }
    }
}

/// Fetch a general-purpose register of the given thread.
pub(crate) fn register(thread: RawHandle, reg: Register) -> Result<RegValue, Error> {
    let ctx = get_context(thread, CONTEXT_ALL)?;
    Ok(context_register(&ctx, reg))
}

/// Overwrite a general-purpose register of the given thread.
pub(crate) fn set_register(thread: RawHandle, reg: Register, value: RegValue) -> Result<(), Error> {
    let mut ctx = get_context(thread, CONTEXT_ALL)?;
    *context_register_mut(&mut ctx, reg) = value;
    set_context(thread, &ctx)
}

/// Test one EFLAGS bit of the given thread.
pub(crate) fn flag(thread: RawHandle, flag: Eflags) -> Result<bool, Error> {
    let _suspended = Suspended::new(thread)?;
    let ctx = get_context(thread, CONTEXT_FULL)?;
    Ok(ctx.EFlags & flag.bits() != 0)
}

/// Set or clear one EFLAGS bit of the given thread.
pub(crate) fn set_flag(thread: RawHandle, flag: Eflags, enabled: bool) -> Result<(), Error> {
    let _suspended = Suspended::new(thread)?;
    let mut ctx = get_context(thread, CONTEXT_FULL)?;
    if enabled {
        ctx.EFlags |= flag.bits();
    } else {
        ctx.EFlags &= !flag.bits();
    }
    set_context(thread, &ctx)
}

/// Arm the trap flag so the thread raises a single-step exception after its
/// next instruction.
///
/// Only called while the target is held by the debug subsystem, so no
/// suspend envelope is needed.
pub(crate) fn enable_single_step(thread: RawHandle) -> Result<(), Error> {
    let mut ctx = get_context(thread, CONTEXT_CONTROL)?;
    ctx.EFlags |= Eflags::TF.bits();
    set_context(thread, &ctx)
}

/// Move the instruction pointer one byte backwards.
///
/// After an INT3 the reported exception address is the breakpoint itself
/// but the thread's IP already points past the 0xCC byte; this puts it back
/// so the restored instruction re-executes.
pub(crate) fn rewind_ip(thread: RawHandle) -> Result<(), Error> {
    let _suspended = Suspended::new(thread)?;
    let mut ctx = get_context(thread, CONTEXT_CONTROL)?;
    *ip_mut(&mut ctx) -= 1;
    set_context(thread, &ctx)
}

/// The thread's current instruction pointer.
pub(crate) fn instruction_pointer(thread: RawHandle) -> Result<Address, Error> {
    let ctx = get_context(thread, CONTEXT_CONTROL)?;
    Ok(ip(&ctx))
}
