//! Standalone helpers around the debugger core: PE entry-point resolution,
//! remote string reading, process lookup, privilege elevation, and remote
//! code execution.

use core::mem;
use core::ptr;

use winapi::shared::minwindef::{FALSE, MAX_PATH};
use winapi::shared::ntdef::LUID;
use winapi::shared::winerror::ERROR_NOT_ALL_ASSIGNED;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress};
use winapi::um::memoryapi::{VirtualAllocEx, VirtualFreeEx};
use winapi::um::processthreadsapi::{CreateRemoteThread, GetCurrentProcess, OpenProcessToken};
use winapi::um::securitybaseapi::AdjustTokenPrivileges;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Process32First, Process32Next, PROCESSENTRY32, TH32CS_SNAPPROCESS,
};
use winapi::um::winbase::LookupPrivilegeValueA;
use winapi::um::winnt::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
    SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};

use crate::common::{Address, Pid, RawHandle};
use crate::debugger::memory;
use crate::error::{last_os_error, Error};
use crate::handle::Handle;

/// Resolve a module's entry point by parsing its PE headers in the target.
///
/// Reads the header page at `base` and returns
/// `base + AddressOfEntryPoint`.
pub fn entry_point(process: RawHandle, base: Address) -> Result<Address, Error> {
    let mut header_page = vec![0u8; 0x1000];
    memory::read(process, base, &mut header_page)?;

    let header =
        goblin::pe::header::Header::parse(&header_page).map_err(|_| Error::BadImage(base))?;
    let optional = header.optional_header.ok_or(Error::BadImage(base))?;

    Ok(base + optional.standard_fields.address_of_entry_point as Address)
}

/// Read the image name attached to a dll-load event.
///
/// `image_name_ptr` is the event's remote pointer-to-pointer; the actual
/// string is read out of the target, up to `MAX_PATH` characters, in
/// either ANSI or UTF-16. Failures yield a placeholder rather than an
/// error; a missing name never matters more than the event itself.
pub fn remote_image_name(process: RawHandle, image_name_ptr: Address, unicode: bool) -> String {
    if image_name_ptr == 0 {
        return "<unknown>".to_owned();
    }

    let string_ptr: Address = match memory::read_value(process, image_name_ptr) {
        Ok(ptr) => ptr,
        Err(_) => return "<read error>".to_owned(),
    };
    if string_ptr == 0 {
        return "<null pointer>".to_owned();
    }

    if unicode {
        let mut bytes = vec![0u8; MAX_PATH * 2];
        if memory::read(process, string_ptr, &mut bytes).is_err() {
            return "<unicode read error>".to_owned();
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
        let mut bytes = vec![0u8; MAX_PATH];
        if memory::read(process, string_ptr, &mut bytes).is_err() {
            return "<ansi read error>".to_owned();
        }
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(nul);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Find a process id by executable name.
///
/// The comparison against the snapshot's `szExeFile` is case-sensitive.
pub fn process_id_by_name(exe_name: &str) -> Result<Pid, Error> {
    let snap = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snap == INVALID_HANDLE_VALUE {
        return Err(last_os_error("CreateToolhelp32Snapshot"));
    }
    let snap = Handle::new(snap);

    let mut entry: PROCESSENTRY32 = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32>() as u32;

    let mut ok = unsafe { Process32First(snap.raw(), &mut entry) };
    while ok != 0 {
        let len = entry
            .szExeFile
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(entry.szExeFile.len());
        let name: Vec<u8> = entry.szExeFile[..len].iter().map(|&c| c as u8).collect();
        if name == exe_name.as_bytes() {
            return Ok(entry.th32ProcessID);
        }
        ok = unsafe { Process32Next(snap.raw(), &mut entry) };
    }

    Err(Error::ProcessNotFound(exe_name.to_owned()))
}

/// Enable `SeDebugPrivilege` on the calling process' token.
///
/// Required to debug processes owned by other users or the system.
pub fn enable_debug_privilege() -> Result<(), Error> {
    let mut token: RawHandle = ptr::null_mut();
    let ok = unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )
    };
    if ok == 0 {
        return Err(last_os_error("OpenProcessToken"));
    }
    let token = Handle::new(token);

    let mut luid: LUID = unsafe { mem::zeroed() };
    let ok = unsafe {
        LookupPrivilegeValueA(
            ptr::null(),
            b"SeDebugPrivilege\0".as_ptr() as *const i8,
            &mut luid,
        )
    };
    if ok == 0 {
        return Err(last_os_error("LookupPrivilegeValue"));
    }

    let mut privileges: TOKEN_PRIVILEGES = unsafe { mem::zeroed() };
    privileges.PrivilegeCount = 1;
    privileges.Privileges[0].Luid = luid;
    privileges.Privileges[0].Attributes = SE_PRIVILEGE_ENABLED;

    let ok = unsafe {
        AdjustTokenPrivileges(
            token.raw(),
            FALSE,
            &mut privileges,
            mem::size_of::<TOKEN_PRIVILEGES>() as u32,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(last_os_error("AdjustTokenPrivileges"));
    }
    // AdjustTokenPrivileges succeeds even when the privilege was not
    // actually granted.
    let code = unsafe { GetLastError() };
    if code == ERROR_NOT_ALL_ASSIGNED {
        return Err(Error::Os {
            call: "AdjustTokenPrivileges",
            code,
        });
    }
    Ok(())
}

/// Inject a DLL into the target by remote-threading `LoadLibraryA`.
///
/// Returns the remote address the path buffer was written to.
pub fn inject_dll(process: RawHandle, dll_path: &str) -> Result<Address, Error> {
    let mut path = dll_path.as_bytes().to_vec();
    path.push(0);

    let remote =
        unsafe { VirtualAllocEx(process, ptr::null_mut(), path.len(), MEM_COMMIT, PAGE_READWRITE) };
    if remote.is_null() {
        return Err(last_os_error("VirtualAllocEx"));
    }

    let release = |err: Error| {
        unsafe { VirtualFreeEx(process, remote, 0, MEM_RELEASE) };
        err
    };

    memory::write(process, remote as Address, &path).map_err(release)?;

    let load_library = unsafe {
        GetProcAddress(
            GetModuleHandleA(b"kernel32.dll\0".as_ptr() as *const i8),
            b"LoadLibraryA\0".as_ptr() as *const i8,
        )
    };
    if load_library.is_null() {
        return Err(release(last_os_error("GetProcAddress")));
    }

    let thread = unsafe {
        CreateRemoteThread(
            process,
            ptr::null_mut(),
            0,
            Some(mem::transmute(load_library)),
            remote,
            0,
            ptr::null_mut(),
        )
    };
    if thread.is_null() {
        return Err(release(last_os_error("CreateRemoteThread")));
    }
    drop(Handle::new(thread));

    Ok(remote as Address)
}

/// Execute a blob of shellcode in the target on a fresh remote thread.
///
/// An empty blob is a no-op.
pub fn execute_remote(process: RawHandle, shellcode: &[u8]) -> Result<(), Error> {
    if shellcode.is_empty() {
        return Ok(());
    }

    let remote = unsafe {
        VirtualAllocEx(
            process,
            ptr::null_mut(),
            shellcode.len(),
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if remote.is_null() {
        return Err(last_os_error("VirtualAllocEx"));
    }

    let release = |err: Error| {
        unsafe { VirtualFreeEx(process, remote, 0, MEM_RELEASE) };
        err
    };

    memory::write(process, remote as Address, shellcode).map_err(release)?;

    let thread = unsafe {
        CreateRemoteThread(
            process,
            ptr::null_mut(),
            0,
            Some(mem::transmute(remote)),
            ptr::null_mut(),
            0,
            ptr::null_mut(),
        )
    };
    if thread.is_null() {
        return Err(release(last_os_error("CreateRemoteThread")));
    }
    drop(Handle::new(thread));

    Ok(())
}
