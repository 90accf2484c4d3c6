//! Typed debug events delivered by the OS debug port.
//!
//! The port adapter translates the raw `DEBUG_EVENT` structure into these
//! records before the dispatch loop ever sees it, so the state machine only
//! deals with plain addresses and ids.

use crate::common::{Address, Pid, Tid};

/// `EXCEPTION_BREAKPOINT`: an INT3 was executed.
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
/// `EXCEPTION_SINGLE_STEP`: the trap flag fired, or a DR0-DR3 watch matched.
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
/// `EXCEPTION_ACCESS_VIOLATION`: the target touched inaccessible memory.
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;

/// One debug event, together with the process and thread that raised it.
#[derive(Debug)]
pub struct DebugEvent {
    /// Id of the process the event originated in.
    pub pid: Pid,
    /// Id of the thread the event originated in.
    pub tid: Tid,
    /// What happened.
    pub kind: EventKind,
}

/// The payload of a debug event.
#[derive(Debug)]
pub enum EventKind {
    /// The debuggee process came up. Carries the runtime image base.
    ProcessCreated {
        /// Base address the main image was mapped at (the ASLR slide).
        image_base: Address,
    },
    /// The debuggee exited; the session is over.
    ProcessExited {
        /// The process exit code.
        exit_code: u32,
    },
    /// A new thread started in the debuggee.
    ThreadCreated {
        /// Base of the thread environment block.
        teb_base: Address,
        /// The thread's start routine.
        start_address: Address,
    },
    /// A thread of the debuggee exited.
    ThreadExited,
    /// A module was mapped into the debuggee.
    DllLoaded {
        /// Base address the module was mapped at.
        base: Address,
        /// Remote pointer-to-pointer to the image name, possibly null.
        image_name_ptr: Address,
        /// Whether the remote name string is UTF-16.
        unicode: bool,
    },
    /// A module was unmapped from the debuggee.
    DllUnloaded {
        /// Base address the module was mapped at.
        base: Address,
    },
    /// The debuggee called `OutputDebugString`.
    DebugString {
        /// Remote address of the string payload.
        data: Address,
        /// Whether the payload is UTF-16.
        unicode: bool,
        /// Payload length in characters, including the terminating NUL.
        length: u16,
    },
    /// The debuggee raised an exception.
    Exception(ExceptionInfo),
    /// The debug port reported an internal error.
    RipError {
        /// The `dwError` value of the RIP record.
        error: u32,
        /// The `dwType` value of the RIP record.
        kind: u32,
    },
    /// An event code this engine does not know about.
    Unknown {
        /// The raw `dwDebugEventCode`.
        code: u32,
    },
}

/// Details of an exception debug event.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    /// The NTSTATUS exception code.
    pub code: u32,
    /// Address of the faulting instruction as reported by the OS.
    ///
    /// For software breakpoints this points one byte *past* the INT3.
    pub address: Address,
    /// Whether this is the first delivery of the exception.
    pub first_chance: bool,
    /// The first two ancillary exception-information words.
    pub info: [usize; 2],
}

impl ExceptionInfo {
    /// For access violations, the faulting data address and the kind of
    /// access that caused the fault. `None` for any other exception code.
    pub fn access_violation(&self) -> Option<(Address, AccessKind)> {
        if self.code != EXCEPTION_ACCESS_VIOLATION {
            return None;
        }
        Some((self.info[1], AccessKind::from_raw(self.info[0])))
    }
}

/// How the faulting instruction touched memory in an access violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// The instruction read the location.
    Read,
    /// The instruction wrote the location.
    Write,
    /// DEP fault: the location was executed.
    Execute,
    /// An ancillary value outside the documented set.
    Other(usize),
}

impl AccessKind {
    /// Decode the first exception-information word of an access violation.
    pub fn from_raw(raw: usize) -> AccessKind {
        match raw {
            0 => AccessKind::Read,
            1 => AccessKind::Write,
            8 => AccessKind::Execute,
            other => AccessKind::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_violation_decodes_ancillary_words() {
        let exc = ExceptionInfo {
            code: EXCEPTION_ACCESS_VIOLATION,
            address: 0x40_1000,
            first_chance: true,
            info: [1, 0xdead_0000],
        };
        assert_eq!(
            exc.access_violation(),
            Some((0xdead_0000, AccessKind::Write))
        );
    }

    #[test]
    fn access_violation_is_none_for_other_codes() {
        let exc = ExceptionInfo {
            code: EXCEPTION_BREAKPOINT,
            address: 0x40_1000,
            first_chance: true,
            info: [0, 0],
        };
        assert!(exc.access_violation().is_none());
    }

    #[test]
    fn access_kind_covers_the_documented_values() {
        assert_eq!(AccessKind::from_raw(0), AccessKind::Read);
        assert_eq!(AccessKind::from_raw(1), AccessKind::Write);
        assert_eq!(AccessKind::from_raw(8), AccessKind::Execute);
        assert_eq!(AccessKind::from_raw(4), AccessKind::Other(4));
    }
}
