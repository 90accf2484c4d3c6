//! Blocking adapter over the Win32 debug port.
//!
//! This module owns every call that talks to the debug subsystem itself:
//! waiting for the next event, continuing it, and putting processes under
//! (or releasing them from) debug control. The raw `DEBUG_EVENT` structure
//! is translated into [`crate::event::DebugEvent`] records here, so nothing
//! above this layer handles OS unions.

use core::mem;

use winapi::shared::minwindef::FALSE;
use winapi::um::debugapi::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, WaitForDebugEvent,
};
use winapi::um::handleapi::CloseHandle;
use winapi::um::minwinbase::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use winapi::um::processthreadsapi::{CreateProcessA, PROCESS_INFORMATION, STARTUPINFOA};
use winapi::um::winbase::DEBUG_ONLY_THIS_PROCESS;
use winapi::um::winnt::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED};

use crate::common::{Pid, Tid};
use crate::error::{last_os_error, Error};
use crate::event::{DebugEvent, EventKind, ExceptionInfo};
use crate::handle::Handle;

/// How a continued event is reported back to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continuation {
    /// The debugger swallowed the exception.
    Handled,
    /// Pass the exception on to the target's own handler chain.
    #[allow(dead_code)]
    NotHandled,
}

/// Block until the target raises the next debug event.
///
/// A failing wait means the debug port is gone and maps to
/// [`Error::WaitFailed`], the dispatch loop's only terminal error.
pub(crate) fn wait_for_event(timeout_ms: u32) -> Result<DebugEvent, Error> {
    let mut raw: DEBUG_EVENT = unsafe { mem::zeroed() };
    if unsafe { WaitForDebugEvent(&mut raw, timeout_ms) } == FALSE {
        return Err(Error::WaitFailed(unsafe {
            winapi::um::errhandlingapi::GetLastError()
        }));
    }
    Ok(translate(&raw))
}

/// Resume the target after an event has been processed.
pub(crate) fn continue_event(pid: Pid, tid: Tid, cont: Continuation) -> Result<(), Error> {
    let status = match cont {
        Continuation::Handled => DBG_CONTINUE,
        Continuation::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
    };
    if unsafe { ContinueDebugEvent(pid, tid, status as u32) } == FALSE {
        return Err(last_os_error("ContinueDebugEvent"));
    }
    Ok(())
}

/// Spawn `exe` under debug control of the calling thread.
///
/// `args` are appended to a quoted image path; an empty slice passes the
/// path through as the whole command line. Returns the process handle, the
/// initial thread handle, and the new pid.
pub(crate) fn create_process(exe: &str, args: &[String]) -> Result<(Handle, Handle, Pid), Error> {
    let mut cmdline = if args.is_empty() {
        exe.to_owned()
    } else {
        let mut line = format!("\"{}\"", exe);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    };
    cmdline.push('\0');
    // CreateProcessA may scribble on the command line; hand it a buffer of
    // our own rather than the &str's.
    let mut cmdline: Vec<u8> = cmdline.into_bytes();

    let mut si: STARTUPINFOA = unsafe { mem::zeroed() };
    si.cb = mem::size_of::<STARTUPINFOA>() as u32;
    let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };

    let ok = unsafe {
        CreateProcessA(
            core::ptr::null(),
            cmdline.as_mut_ptr() as *mut i8,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
            FALSE,
            DEBUG_ONLY_THIS_PROCESS,
            core::ptr::null_mut(),
            core::ptr::null(),
            &mut si,
            &mut pi,
        )
    };
    if ok == FALSE {
        return Err(last_os_error("CreateProcessA"));
    }

    Ok((Handle::new(pi.hProcess), Handle::new(pi.hThread), pi.dwProcessId))
}

/// Attach the calling thread's debug port to a running process.
pub(crate) fn attach(pid: Pid) -> Result<(), Error> {
    if unsafe { DebugActiveProcess(pid) } == FALSE {
        return Err(last_os_error("DebugActiveProcess"));
    }
    Ok(())
}

/// Release the given process from debug control and let it run on.
pub(crate) fn detach(pid: Pid) -> Result<(), Error> {
    if unsafe { DebugActiveProcessStop(pid) } == FALSE {
        return Err(last_os_error("DebugActiveProcessStop"));
    }
    Ok(())
}

fn translate(raw: &DEBUG_EVENT) -> DebugEvent {
    let kind = match raw.dwDebugEventCode {
        CREATE_PROCESS_DEBUG_EVENT => {
            let info = unsafe { raw.u.CreateProcessInfo() };
            // The kernel hands the debugger an open handle to the image
            // file with every process-create and dll-load event; it is the
            // debugger's job to close it.
            if !info.hFile.is_null() {
                unsafe { CloseHandle(info.hFile) };
            }
            EventKind::ProcessCreated {
                image_base: info.lpBaseOfImage as usize,
            }
        }
        EXIT_PROCESS_DEBUG_EVENT => EventKind::ProcessExited {
            exit_code: unsafe { raw.u.ExitProcess() }.dwExitCode,
        },
        CREATE_THREAD_DEBUG_EVENT => {
            let info = unsafe { raw.u.CreateThread() };
            EventKind::ThreadCreated {
                teb_base: info.lpThreadLocalBase as usize,
                start_address: info.lpStartAddress.map_or(0, |f| f as usize),
            }
        }
        EXIT_THREAD_DEBUG_EVENT => EventKind::ThreadExited,
        LOAD_DLL_DEBUG_EVENT => {
            let info = unsafe { raw.u.LoadDll() };
            if !info.hFile.is_null() {
                unsafe { CloseHandle(info.hFile) };
            }
            EventKind::DllLoaded {
                base: info.lpBaseOfDll as usize,
                image_name_ptr: info.lpImageName as usize,
                unicode: info.fUnicode != 0,
            }
        }
        UNLOAD_DLL_DEBUG_EVENT => EventKind::DllUnloaded {
            base: unsafe { raw.u.UnloadDll() }.lpBaseOfDll as usize,
        },
        OUTPUT_DEBUG_STRING_EVENT => {
            let info = unsafe { raw.u.DebugString() };
            EventKind::DebugString {
                data: info.lpDebugStringData as usize,
                unicode: info.fUnicode != 0,
                length: info.nDebugStringLength,
            }
        }
        EXCEPTION_DEBUG_EVENT => {
            let info = unsafe { raw.u.Exception() };
            let record = &info.ExceptionRecord;
            let mut words = [0usize; 2];
            for (slot, value) in words
                .iter_mut()
                .zip(&record.ExceptionInformation[..record.NumberParameters.min(2) as usize])
            {
                *slot = *value;
            }
            EventKind::Exception(ExceptionInfo {
                code: record.ExceptionCode,
                address: record.ExceptionAddress as usize,
                first_chance: info.dwFirstChance != 0,
                info: words,
            })
        }
        RIP_EVENT => {
            let info = unsafe { raw.u.RipInfo() };
            EventKind::RipError {
                error: info.dwError,
                kind: info.dwType,
            }
        }
        code => EventKind::Unknown { code },
    };

    DebugEvent {
        pid: raw.dwProcessId,
        tid: raw.dwThreadId,
        kind,
    }
}
