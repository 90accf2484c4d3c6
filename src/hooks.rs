//! The callback surface of the engine.
//!
//! [`DebugEventHandler`] is the primary extension point of `wdbg`: the
//! dispatch loop invokes exactly one of its methods per debug event, and the
//! value returned by the breakpoint callbacks drives the restoration state
//! machine. Every method has a default body, so a handler only overrides the
//! events it cares about. The defaults emit a `debug!` line when the
//! debugger was constructed verbose, and the breakpoint callbacks default to
//! [`BreakpointAction::Restore`].
//!
//! Handlers receive `&mut Debugger` and may call any public memory,
//! register, thread, or breakpoint operation from inside a callback. They
//! must not re-enter the event wait; there is exactly one dispatch loop per
//! session.

use log::debug;

use crate::arch::debugreg::DrSlot;
use crate::common::{Address, Pid, RawHandle, Tid};
use crate::debugger::Debugger;
use crate::event::AccessKind;

/// What the engine should do after a breakpoint callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointAction {
    /// Leave the breakpoint disarmed and let the target run on.
    Break,
    /// Re-arm the breakpoint after single-stepping over the restored
    /// instruction.
    Restore,
    /// Keep single-stepping; the breakpoint callback is invoked again for
    /// every step until it returns [`BreakpointAction::Break`].
    SingleStep,
}

/// Receives every debug event of a session.
#[allow(unused_variables)]
pub trait DebugEventHandler {
    /// The debuggee process came up.
    ///
    /// This is the first event of a freshly started process and the earliest
    /// point at which [`Debugger::aslr`] uses the real image base.
    fn on_start(&mut self, dbg: &mut Debugger, image_base: Address, entry_point: Address) {
        if dbg.is_verbose() {
            debug!(
                "process started: image base {:#x}, entry point {:#x}",
                image_base, entry_point
            );
        }
    }

    /// The debuggee exited; the dispatch loop returns after this callback.
    fn on_end(&mut self, dbg: &mut Debugger, exit_code: u32, pid: Pid) {
        if dbg.is_verbose() {
            debug!("process {} exited with code {:#x}", pid, exit_code);
        }
    }

    /// The engine attached to an already running process.
    fn on_attach(&mut self, dbg: &mut Debugger) {
        if dbg.is_verbose() {
            debug!("attached to process {}", dbg.pid());
        }
    }

    /// A thread started in the debuggee.
    fn on_thread_create(
        &mut self,
        dbg: &mut Debugger,
        thread: RawHandle,
        tid: Tid,
        teb_base: Address,
        start_address: Address,
    ) {
        if dbg.is_verbose() {
            debug!(
                "thread {} created: teb {:#x}, start {:#x}",
                tid, teb_base, start_address
            );
        }
    }

    /// A thread of the debuggee exited.
    fn on_thread_exit(&mut self, dbg: &mut Debugger, tid: Tid) {
        if dbg.is_verbose() {
            debug!("thread {} exited", tid);
        }
    }

    /// A module was mapped into the debuggee.
    ///
    /// The return value is reserved; the dispatch loop currently ignores it.
    fn on_dll_load(
        &mut self,
        dbg: &mut Debugger,
        base: Address,
        name: &str,
        entry_point: Address,
    ) -> bool {
        if dbg.is_verbose() {
            debug!("dll loaded at {:#x}: {} (entry {:#x})", base, name, entry_point);
        }
        false
    }

    /// A module was unmapped from the debuggee.
    fn on_dll_unload(&mut self, dbg: &mut Debugger, base: Address, name: &str) {
        if dbg.is_verbose() {
            debug!("dll unloaded from {:#x}: {}", base, name);
        }
    }

    /// A software breakpoint installed through
    /// [`Debugger::set_breakpoint`] was hit.
    ///
    /// By the time this runs the original byte is back in place and the
    /// thread's instruction pointer has been rewound to re-execute it.
    fn on_breakpoint(
        &mut self,
        dbg: &mut Debugger,
        address: Address,
        thread: RawHandle,
    ) -> BreakpointAction {
        if dbg.is_verbose() {
            debug!("breakpoint hit at {:#x}", address);
        }
        BreakpointAction::Restore
    }

    /// A hardware breakpoint fired on `slot`.
    fn on_hardware_breakpoint(
        &mut self,
        dbg: &mut Debugger,
        address: Address,
        thread: RawHandle,
        slot: DrSlot,
    ) -> BreakpointAction {
        if dbg.is_verbose() {
            debug!("hardware breakpoint {:?} hit at {:#x}", slot, address);
        }
        BreakpointAction::Restore
    }

    /// Reserved for user-driven stepping flows.
    ///
    /// Note that the dispatch loop reports breakpoint-driven stepping
    /// through [`DebugEventHandler::on_breakpoint`], not through this
    /// method.
    fn on_single_step(&mut self, dbg: &mut Debugger, address: Address, thread: RawHandle) {
        if dbg.is_verbose() {
            debug!("single step at {:#x}", address);
        }
    }

    /// The debuggee called `OutputDebugString`.
    fn on_debug_string(&mut self, dbg: &mut Debugger, message: &str) {
        if dbg.is_verbose() {
            debug!("debug string: {:?}", message);
        }
    }

    /// The debuggee raised an access violation.
    fn on_access_violation(
        &mut self,
        dbg: &mut Debugger,
        address: Address,
        faulting_address: Address,
        access: AccessKind,
    ) {
        if dbg.is_verbose() {
            debug!(
                "access violation at {:#x} touching {:#x} ({:?})",
                address, faulting_address, access
            );
        }
    }

    /// The debug port reported an internal error.
    fn on_rip_error(&mut self, dbg: &mut Debugger, error: u32, kind: u32) {
        if dbg.is_verbose() {
            debug!("RIP error {:#x} (type {})", error, kind);
        }
    }

    /// An exception no other callback claims.
    fn on_unknown_exception(&mut self, dbg: &mut Debugger, address: Address, code: u32) {
        if dbg.is_verbose() {
            debug!("unknown exception {:#x} at {:#x}", code, address);
        }
    }

    /// A debug event this engine does not know about.
    fn on_unknown_debug_event(&mut self, dbg: &mut Debugger, code: u32) {
        if dbg.is_verbose() {
            debug!("unknown debug event {}", code);
        }
    }
}
