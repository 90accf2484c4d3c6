//! The live-thread registry.

use core::mem;

use log::warn;

use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::processthreadsapi::OpenThread;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::THREAD_ALL_ACCESS;

use crate::common::{Address, Pid, RawHandle, Tid};
use crate::error::{last_os_error, Error};
use crate::handle::Handle;

/// A live thread of the debuggee.
///
/// Records are created from thread-create events (with TEB and start
/// address resolved) or by a snapshot refresh (with both left zero). The
/// registry holds at most one record per live thread id, and the record
/// owns its handle for the thread's whole lifetime.
#[derive(Debug)]
pub struct ThreadRecord {
    pub(crate) handle: Handle,
    pub(crate) id: Tid,
    pub(crate) teb_base: Address,
    pub(crate) start_address: Address,
}

impl ThreadRecord {
    /// The thread's raw handle, opened with full access.
    pub fn raw_handle(&self) -> RawHandle {
        self.handle.raw()
    }

    /// The thread id.
    pub fn id(&self) -> Tid {
        self.id
    }

    /// Base of the thread environment block, or 0 if unresolved.
    pub fn teb_base(&self) -> Address {
        self.teb_base
    }

    /// The thread's start routine, or 0 if unresolved.
    pub fn start_address(&self) -> Address {
        self.start_address
    }
}

/// Open a full-access handle to the given thread.
pub(crate) fn open_thread(tid: Tid) -> Result<Handle, Error> {
    let raw = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, tid) };
    if raw.is_null() {
        return Err(last_os_error("OpenThread"));
    }
    Ok(Handle::new(raw))
}

/// Enumerate all threads currently belonging to `pid` and open a handle to
/// each. TEB and start address are left unresolved; the toolhelp snapshot
/// does not carry them.
pub(crate) fn snapshot(pid: Pid) -> Result<Vec<ThreadRecord>, Error> {
    let snap = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snap == INVALID_HANDLE_VALUE {
        return Err(last_os_error("CreateToolhelp32Snapshot"));
    }
    let snap = Handle::new(snap);

    let mut records = Vec::new();
    let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;

    let mut ok = unsafe { Thread32First(snap.raw(), &mut entry) };
    while ok != 0 {
        if entry.th32OwnerProcessID == pid {
            match open_thread(entry.th32ThreadID) {
                Ok(handle) => records.push(ThreadRecord {
                    handle,
                    id: entry.th32ThreadID,
                    teb_base: 0,
                    start_address: 0,
                }),
                Err(err) => {
                    warn!("skipping thread {}: {}", entry.th32ThreadID, err);
                }
            }
        }
        ok = unsafe { Thread32Next(snap.raw(), &mut entry) };
    }

    Ok(records)
}
