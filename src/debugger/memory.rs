//! Target-memory access.
//!
//! These helpers operate on a raw process handle so that both the
//! [`Debugger`](super::Debugger) methods and the plugins can share them.
//! Writes always flush the target's instruction cache over the written
//! range; a patched byte must never keep executing from a stale cache line.

use core::mem::{self, MaybeUninit};

use winapi::um::memoryapi::{ReadProcessMemory, VirtualProtectEx, VirtualQueryEx, WriteProcessMemory};
use winapi::um::processthreadsapi::FlushInstructionCache;
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_GUARD, PAGE_NOACCESS};

use crate::common::{Address, RawHandle};
use crate::error::{last_os_error, Error};

/// A region of the target's virtual address space, as reported by the OS
/// region walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base address of the region.
    pub base: Address,
    /// Region size in bytes.
    pub size: usize,
    /// Allocation state (`MEM_COMMIT`, `MEM_RESERVE`, `MEM_FREE`).
    pub state: u32,
    /// Protection flags (`PAGE_*`).
    pub protect: u32,
    /// Region type (`MEM_IMAGE`, `MEM_MAPPED`, `MEM_PRIVATE`).
    pub kind: u32,
}

impl MemoryRegion {
    /// Whether `address` falls inside `[base, base + size)`.
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    fn from_raw(mbi: &MEMORY_BASIC_INFORMATION) -> MemoryRegion {
        MemoryRegion {
            base: mbi.BaseAddress as usize,
            size: mbi.RegionSize,
            state: mbi.State,
            protect: mbi.Protect,
            kind: mbi.Type,
        }
    }
}

/// Read `buf.len()` bytes from `address` in the target.
pub(crate) fn read(process: RawHandle, address: Address, buf: &mut [u8]) -> Result<(), Error> {
    let mut got = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            address as *const _,
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            &mut got,
        )
    };
    if ok == 0 {
        return Err(last_os_error("ReadProcessMemory"));
    }
    if got != buf.len() {
        return Err(Error::ShortRead {
            address,
            wanted: buf.len(),
            got,
        });
    }
    Ok(())
}

/// Write `buf` to `address` in the target and flush the instruction cache
/// over the range.
pub(crate) fn write(process: RawHandle, address: Address, buf: &[u8]) -> Result<(), Error> {
    let mut put = 0usize;
    let ok = unsafe {
        WriteProcessMemory(
            process,
            address as *mut _,
            buf.as_ptr() as *const _,
            buf.len(),
            &mut put,
        )
    };
    if ok == 0 {
        return Err(last_os_error("WriteProcessMemory"));
    }
    if put != buf.len() {
        return Err(Error::ShortWrite {
            address,
            wanted: buf.len(),
            got: put,
        });
    }
    unsafe { FlushInstructionCache(process, address as *const _, buf.len()) };
    Ok(())
}

/// Read one value of a plain-data type from the target.
pub(crate) fn read_value<T: Copy>(process: RawHandle, address: Address) -> Result<T, Error> {
    let mut value = MaybeUninit::<T>::uninit();
    let mut got = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            address as *const _,
            value.as_mut_ptr() as *mut _,
            mem::size_of::<T>(),
            &mut got,
        )
    };
    if ok == 0 {
        return Err(last_os_error("ReadProcessMemory"));
    }
    if got != mem::size_of::<T>() {
        return Err(Error::ShortRead {
            address,
            wanted: mem::size_of::<T>(),
            got,
        });
    }
    Ok(unsafe { value.assume_init() })
}

/// Write one value of a plain-data type to the target.
pub(crate) fn write_value<T: Copy>(process: RawHandle, address: Address, value: &T) -> Result<(), Error> {
    let bytes =
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) };
    write(process, address, bytes)
}

/// Walk the target's regions and return the one containing `address`, or a
/// zero-filled descriptor if no region does.
pub(crate) fn page_by_address(process: RawHandle, address: Address) -> MemoryRegion {
    for region in pages(process) {
        if region.contains(address) {
            return region;
        }
    }
    MemoryRegion::default()
}

/// Sweep the whole application address range and collect every region
/// descriptor.
pub(crate) fn pages(process: RawHandle) -> Vec<MemoryRegion> {
    let mut sysinfo: SYSTEM_INFO = unsafe { mem::zeroed() };
    unsafe { GetSystemInfo(&mut sysinfo) };

    let mut regions = Vec::new();
    let mut addr = sysinfo.lpMinimumApplicationAddress as usize;
    let max = sysinfo.lpMaximumApplicationAddress as usize;

    while addr < max {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let got = unsafe {
            VirtualQueryEx(
                process,
                addr as *const _,
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if got == 0 {
            break;
        }
        regions.push(MemoryRegion::from_raw(&mbi));
        addr = mbi.BaseAddress as usize + mbi.RegionSize;
    }

    regions
}

/// Change the protection of `[base, base + size)`, returning the previous
/// protection flags.
pub(crate) fn protect(
    process: RawHandle,
    base: Address,
    size: usize,
    new_protect: u32,
) -> Result<u32, Error> {
    let mut old = 0u32;
    let ok = unsafe { VirtualProtectEx(process, base as *mut _, size, new_protect, &mut old) };
    if ok == 0 {
        return Err(last_os_error("VirtualProtectEx"));
    }
    Ok(old)
}

/// Scan every committed, accessible region for an exact byte pattern and
/// return all absolute match addresses.
pub(crate) fn search(process: RawHandle, pattern: &[u8]) -> Vec<Address> {
    let mut matches = Vec::new();
    if pattern.is_empty() {
        return matches;
    }

    for region in pages(process) {
        if region.state != MEM_COMMIT
            || region.protect & PAGE_GUARD != 0
            || region.protect == PAGE_NOACCESS
        {
            continue;
        }

        let mut buf = vec![0u8; region.size];
        // A region can shrink or vanish between the walk and the read;
        // partial reads are fine here, errors just skip the region.
        let mut got = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                process,
                region.base as *const _,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
                &mut got,
            )
        };
        if ok == 0 {
            continue;
        }

        for (offset, window) in buf[..got].windows(pattern.len()).enumerate() {
            if window == pattern {
                matches.push(region.base + offset);
            }
        }
    }

    matches
}
