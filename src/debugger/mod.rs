//! The [`Debugger`] type: session lifecycle and the operations handlers
//! call from inside callbacks.

use std::collections::BTreeMap;

use log::warn;

use winapi::shared::minwindef::FALSE;
use winapi::um::processthreadsapi::OpenProcess;
use winapi::um::winnt::PROCESS_ALL_ACCESS;
use winapi::um::winternl::{
    NtQueryInformationProcess, ProcessBasicInformation, PROCESS_BASIC_INFORMATION,
};

mod breakpoints;
mod dispatch;
pub(crate) mod memory;
pub(crate) mod registers;
mod threads;

pub use breakpoints::HwBreakpoint;
pub use memory::MemoryRegion;
pub use threads::ThreadRecord;

use crate::arch::{Eflags, RegValue, Register};
use crate::common::{Address, Pid, RawHandle};
use crate::error::{last_os_error, Error};
use crate::handle::Handle;
use crate::hooks::DebugEventHandler;
use crate::port;
use crate::util;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        /// Typical image base of a 32-bit executable before ASLR is known.
        const DEFAULT_IMAGE_BASE: Address = 0x0040_0000;
    } else {
        /// Typical image base of a 64-bit executable before ASLR is known.
        const DEFAULT_IMAGE_BASE: Address = 0x0001_4000_0000;
    }
}

/// A user-mode debugging session over one Windows process.
///
/// The debugger owns the process and thread handles of the session, the
/// thread registry, and both breakpoint tables. All of it is mutated only
/// from the dispatch thread; handlers get at it through the `&mut Debugger`
/// passed into every callback.
pub struct Debugger {
    verbose: bool,
    pid: Pid,
    image_base: Address,
    process: Option<Handle>,
    initial_thread: Option<Handle>,
    pub(crate) threads: Vec<ThreadRecord>,
    pub(crate) sw_breakpoints: BTreeMap<Address, u8>,
    pub(crate) hw_breakpoints: BTreeMap<Address, HwBreakpoint>,
    pub(crate) dll_names: BTreeMap<Address, String>,
}

impl Debugger {
    /// Create a debugger with no attached target.
    ///
    /// `verbose` enables the diagnostic output of the default
    /// [`DebugEventHandler`] implementations.
    pub fn new(verbose: bool) -> Debugger {
        Debugger {
            verbose,
            pid: 0,
            image_base: DEFAULT_IMAGE_BASE,
            process: None,
            initial_thread: None,
            threads: Vec::new(),
            sw_breakpoints: BTreeMap::new(),
            hw_breakpoints: BTreeMap::new(),
            dll_names: BTreeMap::new(),
        }
    }

    /// Whether default callbacks emit diagnostics.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Id of the debugged process, or 0 before a session starts.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Raw handle of the debugged process.
    ///
    /// Null before a session starts. The handle stays owned by the
    /// debugger; plugins get their own duplicated view.
    pub fn process_handle(&self) -> RawHandle {
        self.process
            .as_ref()
            .map_or(core::ptr::null_mut(), Handle::raw)
    }

    /// The runtime image base of the main module.
    pub fn image_base(&self) -> Address {
        self.image_base
    }

    /// Translate a file-relative address through the ASLR slide.
    ///
    /// The real image base is captured from the process-create event; calls
    /// made before [`DebugEventHandler::on_start`] fires translate through
    /// the architecture's typical default base instead.
    pub fn aslr(&self, rva: Address) -> Address {
        self.image_base + rva
    }

    /// Spawn `exe` under debug control. The session begins once
    /// [`Debugger::run`] is called.
    pub fn start_process(&mut self, exe: &str) -> Result<(), Error> {
        self.start_process_with_args(exe, &[])
    }

    /// Spawn `exe` with arguments under debug control.
    pub fn start_process_with_args(&mut self, exe: &str, args: &[String]) -> Result<(), Error> {
        let (process, thread, pid) = port::create_process(exe, args)?;
        self.process = Some(process);
        self.initial_thread = Some(thread);
        self.pid = pid;
        Ok(())
    }

    /// Attach to an already running process by id.
    ///
    /// Refreshes the thread registry and fires
    /// [`DebugEventHandler::on_attach`] once the debug port is connected.
    pub fn attach_to_pid(
        &mut self,
        pid: Pid,
        handler: &mut impl DebugEventHandler,
    ) -> Result<(), Error> {
        port::attach(pid)?;

        let raw = unsafe { OpenProcess(PROCESS_ALL_ACCESS, FALSE, pid) };
        if raw.is_null() {
            return Err(last_os_error("OpenProcess"));
        }
        self.process = Some(Handle::new(raw));
        self.pid = pid;

        if let Err(err) = self.refresh_threads() {
            warn!("thread snapshot after attach failed: {}", err);
        }
        handler.on_attach(self);
        Ok(())
    }

    /// Attach to an already running process by executable name.
    pub fn attach_to_process(
        &mut self,
        exe_name: &str,
        handler: &mut impl DebugEventHandler,
    ) -> Result<(), Error> {
        let pid = util::process_id_by_name(exe_name)?;
        self.attach_to_pid(pid, handler)
    }

    /// Release the debuggee from debug control and let it run on.
    pub fn detach(&mut self) -> Result<(), Error> {
        port::detach(self.pid)
    }

    /// The live-thread registry.
    pub fn threads(&self) -> &[ThreadRecord] {
        &self.threads
    }

    /// Discard the registry and repopulate it from a fresh OS thread
    /// snapshot.
    ///
    /// Used after attaching to a running process and before every
    /// hardware-breakpoint broadcast; threads discovered this way have no
    /// TEB or start address resolved.
    pub fn refresh_threads(&mut self) -> Result<(), Error> {
        self.threads = threads::snapshot(self.pid)?;
        Ok(())
    }

    /// Zero the `BeingDebugged` byte in the target's PEB.
    ///
    /// Defuses the cheapest anti-debug check. The PEB base comes from
    /// `NtQueryInformationProcess`; the byte sits at offset +2.
    pub fn hide_debugger(&self) -> Result<(), Error> {
        let mut pbi: PROCESS_BASIC_INFORMATION = unsafe { core::mem::zeroed() };
        let mut ret_len = 0u32;
        let status = unsafe {
            NtQueryInformationProcess(
                self.process_handle(),
                ProcessBasicInformation,
                &mut pbi as *mut _ as *mut _,
                core::mem::size_of::<PROCESS_BASIC_INFORMATION>() as u32,
                &mut ret_len,
            )
        };
        if status != 0 {
            return Err(Error::Os {
                call: "NtQueryInformationProcess",
                code: status as u32,
            });
        }

        let flag_addr = pbi.PebBaseAddress as Address + 2;
        memory::write_value::<u8>(self.process_handle(), flag_addr, &0)
    }

    // ===== Memory accessor =====

    /// Read `buf.len()` bytes from `address` in the target.
    pub fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<(), Error> {
        memory::read(self.process_handle(), address, buf)
    }

    /// Write `buf` to `address` in the target, flushing the instruction
    /// cache over the written range.
    pub fn write_memory(&self, address: Address, buf: &[u8]) -> Result<(), Error> {
        memory::write(self.process_handle(), address, buf)
    }

    /// Read one plain-data value from the target.
    pub fn read_value<T: Copy>(&self, address: Address) -> Result<T, Error> {
        memory::read_value(self.process_handle(), address)
    }

    /// Write one plain-data value to the target.
    pub fn write_value<T: Copy>(&self, address: Address, value: &T) -> Result<(), Error> {
        memory::write_value(self.process_handle(), address, value)
    }

    /// The memory region containing `address`, or a zero-filled descriptor
    /// if no region does.
    pub fn page_by_address(&self, address: Address) -> MemoryRegion {
        memory::page_by_address(self.process_handle(), address)
    }

    /// Every region descriptor of the target's address space.
    pub fn memory_pages(&self) -> Vec<MemoryRegion> {
        memory::pages(self.process_handle())
    }

    /// Change the protection of the region described by `page`, returning
    /// the previous protection flags.
    pub fn change_protection(&self, page: &MemoryRegion, protect: u32) -> Result<u32, Error> {
        memory::protect(self.process_handle(), page.base, page.size, protect)
    }

    /// Change the protection of `[base, base + size)`, returning the
    /// previous protection flags.
    pub fn change_protection_raw(
        &self,
        base: Address,
        size: usize,
        protect: u32,
    ) -> Result<u32, Error> {
        memory::protect(self.process_handle(), base, size, protect)
    }

    /// Scan all committed, accessible memory for `pattern` and return every
    /// absolute match address.
    pub fn search_memory(&self, pattern: &[u8]) -> Vec<Address> {
        memory::search(self.process_handle(), pattern)
    }

    // ===== Register/flag accessor =====

    /// Fetch a general-purpose register of the given thread.
    pub fn register(&self, thread: RawHandle, reg: Register) -> Result<RegValue, Error> {
        registers::register(thread, reg)
    }

    /// Overwrite a general-purpose register of the given thread.
    pub fn set_register(
        &self,
        thread: RawHandle,
        reg: Register,
        value: RegValue,
    ) -> Result<(), Error> {
        registers::set_register(thread, reg, value)
    }

    /// Test one EFLAGS bit of the given thread.
    pub fn flag(&self, thread: RawHandle, flag: Eflags) -> Result<bool, Error> {
        registers::flag(thread, flag)
    }

    /// Set or clear one EFLAGS bit of the given thread.
    pub fn set_flag(&self, thread: RawHandle, flag: Eflags, enabled: bool) -> Result<(), Error> {
        registers::set_flag(thread, flag, enabled)
    }

    /// Arm the trap flag on the given thread so exactly one more
    /// instruction executes before the next single-step exception.
    pub fn enable_single_step(&self, thread: RawHandle) -> Result<(), Error> {
        registers::enable_single_step(thread)
    }

    /// Move the given thread's instruction pointer one byte backwards.
    pub fn rewind_ip(&self, thread: RawHandle) -> Result<(), Error> {
        registers::rewind_ip(thread)
    }

    /// The given thread's current instruction pointer.
    pub fn current_ip(&self, thread: RawHandle) -> Result<Address, Error> {
        registers::instruction_pointer(thread)
    }

    // ===== Plugins =====

    /// Construct a thread-freezer plugin for the current target.
    ///
    /// The plugin holds its own duplicated, query-limited process handle
    /// and outlives neither the debugger nor the session usefully.
    #[cfg(feature = "plugins")]
    pub fn freezer(&self) -> Result<crate::plugins::Freezer, Error> {
        crate::plugins::Freezer::new(self.process_handle())
    }

    /// Construct an IAT-inspector plugin for the current target.
    #[cfg(feature = "plugins")]
    pub fn imports(&self) -> Result<crate::plugins::Imports, Error> {
        crate::plugins::Imports::new(self.process_handle())
    }

    /// Tear down the session: registry, breakpoint records, and owned
    /// handles. Runs when the dispatch loop ends.
    pub(crate) fn end_session(&mut self) {
        self.threads.clear();
        self.sw_breakpoints.clear();
        self.hw_breakpoints.clear();
        self.dll_names.clear();
        drop(self.initial_thread.take());
        drop(self.process.take());
    }

    pub(crate) fn record_image_base(&mut self, image_base: Address) {
        self.image_base = image_base;
    }
}

impl Default for Debugger {
    fn default() -> Debugger {
        Debugger::new(false)
    }
}
