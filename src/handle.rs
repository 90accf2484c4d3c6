//! Scoped ownership of Win32 handles.

use winapi::um::handleapi::{CloseHandle, DuplicateHandle};
use winapi::um::processthreadsapi::GetCurrentProcess;

use crate::common::RawHandle;
use crate::error::{last_os_error, Error};

/// An owned Win32 handle, closed on drop.
///
/// Every handle the engine opens is wrapped in one of these so that early
/// returns from suspend/resume envelopes and error paths can never leak it.
#[derive(Debug)]
pub struct Handle(RawHandle);

impl Handle {
    /// Take ownership of a raw handle. A null handle is accepted and simply
    /// never closed.
    pub fn new(raw: RawHandle) -> Handle {
        Handle(raw)
    }

    /// The underlying raw handle.
    pub fn raw(&self) -> RawHandle {
        self.0
    }

    /// Duplicate `source` into a new non-owning view of the same object,
    /// restricted to `access` rights.
    ///
    /// This is how plugins get their process handle: the duplicate is theirs
    /// to close, while the debugger keeps sole ownership of the original.
    pub fn duplicate(source: RawHandle, access: u32) -> Result<Handle, Error> {
        let mut dup: RawHandle = core::ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                source,
                GetCurrentProcess(),
                &mut dup,
                access,
                0,
                0,
            )
        };
        if ok == 0 {
            return Err(last_os_error("DuplicateHandle"));
        }
        Ok(Handle(dup))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { CloseHandle(self.0) };
        }
    }
}
