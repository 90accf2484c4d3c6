//! The debug-event dispatch loop and the breakpoint restoration state
//! machine.
//!
//! One loop iteration is one OS debug event: wait, translate, mutate the
//! tables, invoke exactly one handler callback, continue. The exception
//! sub-machine weaves together the software-breakpoint restore (lift the
//! 0xCC, rewind the instruction pointer, trap-flag one instruction, re-arm)
//! and the hardware equivalent (clear the slot for one instruction, then
//! re-program it). A single restoration slot suffices: this loop is the
//! only driver of the target, so at most one instruction is ever executing
//! under trap-flag control.

use core::mem;

use log::{debug, trace, warn};

use winapi::um::winbase::INFINITE;

use crate::common::{Address, Tid};
use crate::error::Error;
use crate::event::{self, DebugEvent, EventKind, ExceptionInfo};
use crate::handle::Handle;
use crate::hooks::{BreakpointAction, DebugEventHandler};
use crate::port::{self, Continuation};
use crate::util;

use super::breakpoints::HwBreakpoint;
use super::threads::ThreadRecord;
use super::{memory, registers, threads, Debugger};

/// The breakpoint the machine intends to re-arm after the next single
/// step.
///
/// Non-empty only between a breakpoint hit whose action asked for
/// restoration and the single-step exception that follows it. The hardware
/// variant owns the faulting thread's handle so the re-arm still has a live
/// handle one event later.
enum PendingRestoration {
    None,
    Software { address: Address },
    Hardware { bp: HwBreakpoint, thread: Handle },
}

impl Debugger {
    /// Drive the session to completion.
    ///
    /// Blocks on the debug port and dispatches every event to `handler`.
    /// Returns when the debuggee exits or the wait fails; either way all
    /// session-owned handles are released before returning.
    pub fn run(&mut self, handler: &mut impl DebugEventHandler) -> Result<(), Error> {
        let mut stepping = false;
        let mut last_action = BreakpointAction::Break;
        let mut pending = PendingRestoration::None;

        loop {
            let DebugEvent { pid, tid, kind } = match port::wait_for_event(INFINITE) {
                Ok(event) => event,
                Err(err) => {
                    debug!("debug port closed: {}", err);
                    break;
                }
            };

            match kind {
                EventKind::ProcessCreated { image_base } => {
                    self.record_image_base(image_base);
                    let entry =
                        util::entry_point(self.process_handle(), image_base).unwrap_or_default();
                    handler.on_start(self, image_base, entry);
                }

                EventKind::ProcessExited { exit_code } => {
                    handler.on_end(self, exit_code, pid);
                    if let Err(err) = port::continue_event(pid, tid, Continuation::Handled) {
                        warn!("failed to continue final event: {}", err);
                    }
                    break;
                }

                EventKind::ThreadCreated {
                    teb_base,
                    start_address,
                } => match threads::open_thread(tid) {
                    Ok(handle) => {
                        handler.on_thread_create(self, handle.raw(), tid, teb_base, start_address);
                        // At most one record per live id; attach replays
                        // synthetic create events for threads the snapshot
                        // already found.
                        self.threads.retain(|t| t.id != tid);
                        self.threads.push(ThreadRecord {
                            handle,
                            id: tid,
                            teb_base,
                            start_address,
                        });
                    }
                    Err(err) => warn!("failed to open thread {}: {}", tid, err),
                },

                EventKind::ThreadExited => {
                    handler.on_thread_exit(self, tid);
                    if let Some(pos) = self.threads.iter().position(|t| t.id == tid) {
                        let record = self.threads.remove(pos);
                        let raw = record.handle.raw();
                        self.hw_breakpoints.retain(|_, bp| bp.thread != raw);
                    }
                }

                EventKind::DllLoaded {
                    base,
                    image_name_ptr,
                    unicode,
                } => {
                    let name =
                        util::remote_image_name(self.process_handle(), image_name_ptr, unicode);
                    let entry =
                        util::entry_point(self.process_handle(), base).unwrap_or_default();
                    self.dll_names.insert(base, name.clone());
                    // The return value is reserved; dispatch ignores it.
                    let _ = handler.on_dll_load(self, base, &name, entry);
                }

                EventKind::DllUnloaded { base } => {
                    let name = self
                        .dll_names
                        .remove(&base)
                        .unwrap_or_else(|| "<unknown>".to_owned());
                    handler.on_dll_unload(self, base, &name);
                }

                EventKind::DebugString {
                    data,
                    unicode,
                    length,
                } => {
                    let message = self.read_debug_string(data, unicode, length);
                    handler.on_debug_string(self, &message);
                }

                EventKind::Exception(exc) => {
                    self.dispatch_exception(
                        handler,
                        exc,
                        tid,
                        &mut stepping,
                        &mut last_action,
                        &mut pending,
                    );
                }

                EventKind::RipError { error, kind } => {
                    handler.on_rip_error(self, error, kind);
                }

                EventKind::Unknown { code } => {
                    handler.on_unknown_debug_event(self, code);
                }
            }

            if let Err(err) = port::continue_event(pid, tid, Continuation::Handled) {
                warn!("failed to continue debug event: {}", err);
                break;
            }
        }

        self.end_session();
        Ok(())
    }

    fn dispatch_exception(
        &mut self,
        handler: &mut impl DebugEventHandler,
        exc: ExceptionInfo,
        tid: Tid,
        stepping: &mut bool,
        last_action: &mut BreakpointAction,
        pending: &mut PendingRestoration,
    ) {
        let thread = match threads::open_thread(tid) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("failed to open faulting thread {}: {}", tid, err);
                return;
            }
        };

        if exc.code == event::EXCEPTION_BREAKPOINT && self.sw_breakpoints.contains_key(&exc.address)
        {
            trace!("software breakpoint hit at {:#x}", exc.address);

            // The instruction under the 0xCC must be re-executable before
            // the callback runs: put the byte back and point the thread at
            // it again.
            self.restore_breakpoint(exc.address);
            if let Err(err) = registers::rewind_ip(thread.raw()) {
                warn!("failed to rewind instruction pointer: {}", err);
            }

            let action = handler.on_breakpoint(self, exc.address, thread.raw());
            if action == BreakpointAction::Break {
                *stepping = false;
            } else {
                if let Err(err) = registers::enable_single_step(thread.raw()) {
                    warn!("failed to arm single step: {}", err);
                }
                *stepping = true;
                *pending = PendingRestoration::Software {
                    address: exc.address,
                };
                *last_action = action;
            }
        } else if exc.code == event::EXCEPTION_SINGLE_STEP && *stepping {
            // The one-instruction window after a breakpoint hit: re-arm
            // whatever was lifted for the step.
            match mem::replace(pending, PendingRestoration::None) {
                PendingRestoration::None => {}
                PendingRestoration::Software { address } => {
                    trace!("re-arming software breakpoint at {:#x}", address);
                    if let Err(err) = self.set_breakpoint(address) {
                        warn!("failed to re-arm breakpoint at {:#x}: {}", address, err);
                    }
                }
                PendingRestoration::Hardware { bp, thread: saved } => {
                    trace!("re-arming hardware breakpoint {:?} at {:#x}", bp.slot, bp.address);
                    if let Err(err) = self.set_hardware_breakpoint_on_thread(
                        saved.raw(),
                        bp.address,
                        bp.slot,
                        bp.access,
                        bp.length,
                    ) {
                        warn!("failed to re-arm {:?}: {}", bp.slot, err);
                    }
                }
            }

            if *last_action == BreakpointAction::SingleStep {
                // The handler asked to keep stepping; it hears about every
                // step through on_breakpoint until it returns Break.
                let action = handler.on_breakpoint(self, exc.address, thread.raw());
                if action == BreakpointAction::Break {
                    *stepping = false;
                } else {
                    *pending = PendingRestoration::Software {
                        address: exc.address,
                    };
                    *last_action = action;
                    if let Err(err) = registers::enable_single_step(thread.raw()) {
                        warn!("failed to arm single step: {}", err);
                    }
                    *stepping = true;
                }
            } else {
                *stepping = false;
            }
        } else if exc.code == event::EXCEPTION_SINGLE_STEP {
            // Not one of ours: a DR0-DR3 watch, or a stray trap.
            match self.hardware_breakpoint_at(exc.address) {
                Some(slot) => {
                    let action =
                        handler.on_hardware_breakpoint(self, exc.address, thread.raw(), slot);
                    match action {
                        BreakpointAction::Break => {
                            if let Err(err) = self.clear_hardware_breakpoint(slot) {
                                warn!("failed to clear {:?}: {}", slot, err);
                            }
                        }
                        BreakpointAction::SingleStep => {
                            if let Err(err) = registers::enable_single_step(thread.raw()) {
                                warn!("failed to arm single step: {}", err);
                            }
                            *stepping = true;
                            if let Err(err) = self.clear_hardware_breakpoint(slot) {
                                warn!("failed to clear {:?}: {}", slot, err);
                            }
                        }
                        BreakpointAction::Restore => match self.hardware_breakpoint_by_slot(slot) {
                            Some(bp) => {
                                // The slot must be silent for exactly one
                                // instruction: clear it on the faulting
                                // thread, step, and re-program it on the
                                // following single-step event.
                                if let Err(err) =
                                    self.clear_hardware_breakpoint_on_thread(thread.raw(), slot)
                                {
                                    warn!("failed to lift {:?} for stepping: {}", slot, err);
                                }
                                if let Err(err) = registers::enable_single_step(thread.raw()) {
                                    warn!("failed to arm single step: {}", err);
                                }
                                *stepping = true;
                                *last_action = BreakpointAction::Restore;
                                *pending = PendingRestoration::Hardware { bp, thread };
                            }
                            None => {
                                warn!("{:?} fired but no descriptor is programmed", slot);
                            }
                        },
                    }
                }
                None => handler.on_unknown_exception(self, exc.address, exc.code),
            }
        } else if let Some((faulting_address, access)) = exc.access_violation() {
            handler.on_access_violation(self, exc.address, faulting_address, access);
        } else {
            handler.on_unknown_exception(self, exc.address, exc.code);
        }
    }

    /// Read an `OutputDebugString` payload, capped at 1024 characters, and
    /// convert it to UTF-8. Read failures yield an empty message.
    fn read_debug_string(&self, data: Address, unicode: bool, length: u16) -> String {
        const CAP: usize = 1024;
        let process = self.process_handle();

        if unicode {
            let units = (length as usize).min(CAP);
            let mut bytes = vec![0u8; units * 2];
            if memory::read(process, data, &mut bytes).is_err() {
                return String::new();
            }
            let mut units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            if let Some(nul) = units.iter().position(|&u| u == 0) {
                units.truncate(nul);
            }
            String::from_utf16_lossy(&units)
        } else {
            let mut bytes = vec![0u8; (length as usize).min(CAP)];
            if memory::read(process, data, &mut bytes).is_err() {
                return String::new();
            }
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                bytes.truncate(nul);
            }
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }
}
