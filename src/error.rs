use core::fmt::{self, Display};

use crate::common::Address;

/// An error which may occur while driving a debuggee.
///
/// Failures of individual operations never abort the dispatch loop: the loop
/// logs them and keeps processing events. The only terminal condition is
/// [`Error::WaitFailed`], raised when the debug port itself goes away.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A Win32/NT call failed with the given `GetLastError` code.
    Os {
        /// Name of the failing call, e.g. `"GetThreadContext"`.
        call: &'static str,
        /// The `GetLastError` (or NTSTATUS) value reported for the failure.
        code: u32,
    },
    /// Fewer bytes than requested could be read from target memory.
    ShortRead {
        /// Source address in the target.
        address: Address,
        /// Requested transfer size.
        wanted: usize,
        /// Bytes actually transferred.
        got: usize,
    },
    /// Fewer bytes than requested could be written to target memory.
    ShortWrite {
        /// Destination address in the target.
        address: Address,
        /// Requested transfer size.
        wanted: usize,
        /// Bytes actually transferred.
        got: usize,
    },
    /// No running process matched the given executable name.
    ProcessNotFound(String),
    /// Execute hardware breakpoints must watch exactly one byte.
    ExecuteLengthNotByte,
    /// The module at the given base does not carry a valid PE header.
    BadImage(Address),
    /// The blocking debug-event wait failed; the session is over.
    WaitFailed(u32),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;
        match self {
            Os { call, code } => write!(f, "{} failed with error {}", call, code),
            ShortRead {
                address,
                wanted,
                got,
            } => write!(
                f,
                "short read at {:#x}: wanted {} bytes, got {}",
                address, wanted, got
            ),
            ShortWrite {
                address,
                wanted,
                got,
            } => write!(
                f,
                "short write at {:#x}: wanted {} bytes, got {}",
                address, wanted, got
            ),
            ProcessNotFound(name) => write!(f, "no running process named {:?}", name),
            ExecuteLengthNotByte => {
                write!(f, "execute hardware breakpoints must have a length of 1")
            }
            BadImage(base) => write!(f, "no valid PE image at base {:#x}", base),
            WaitFailed(code) => write!(f, "debug-event wait failed with error {}", code),
        }
    }
}

impl std::error::Error for Error {}

/// Shorthand for `Error::Os` carrying the calling thread's last OS error.
#[cfg(windows)]
pub(crate) fn last_os_error(call: &'static str) -> Error {
    Error::Os {
        call,
        code: unsafe { winapi::um::errhandlingapi::GetLastError() },
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_names_the_failing_call() {
        let e = Error::Os {
            call: "GetThreadContext",
            code: 5,
        };
        assert_eq!(e.to_string(), "GetThreadContext failed with error 5");
    }

    #[test]
    fn display_reports_short_transfers() {
        let e = Error::ShortRead {
            address: 0x1000,
            wanted: 8,
            got: 3,
        };
        assert_eq!(e.to_string(), "short read at 0x1000: wanted 8 bytes, got 3");
    }
}
