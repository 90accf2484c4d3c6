//! An implementation of a user-mode debugger engine for Windows processes on
//! x86 and x86-64.
//!
//! `wdbg` drives a target process through the operating system's debug port,
//! manages software (INT3) and hardware (DR0-DR3) breakpoints across all of
//! the target's threads, single-steps to restore breakpoints transparently,
//! and exposes read/write access to process memory and per-thread CPU
//! registers and flags. Every debug event is dispatched to an
//! application-defined [`DebugEventHandler`], whose return values decide how
//! execution continues.
//!
//! A minimal session looks like this:
//!
//! ```rust,ignore
//! use wdbg::{BreakpointAction, Debugger, DebugEventHandler};
//! use wdbg::common::{Address, RawHandle};
//!
//! struct Tracer;
//!
//! impl DebugEventHandler for Tracer {
//!     fn on_start(&mut self, dbg: &mut Debugger, _base: Address, entry: Address) {
//!         dbg.set_breakpoint(entry).unwrap();
//!     }
//!
//!     fn on_breakpoint(
//!         &mut self,
//!         _dbg: &mut Debugger,
//!         address: Address,
//!         _thread: RawHandle,
//!     ) -> BreakpointAction {
//!         println!("entry point reached at {address:#x}");
//!         BreakpointAction::Break
//!     }
//! }
//!
//! let mut dbg = Debugger::new(false);
//! dbg.start_process("TestMe.exe")?;
//! dbg.run(&mut Tracer)?;
//! ```
//!
//! ## Scope
//!
//! The engine speaks to exactly one debuggee at a time, from a single thread.
//! It does not disassemble instructions, resolve symbols, or debug remote or
//! kernel-mode targets. The dispatch loop blocks in the OS debug-event wait;
//! while it is blocked the target runs, and between wait and continue the
//! target is fully suspended by the OS debug subsystem. Handler callbacks run
//! synchronously on the dispatch thread and may call any public memory,
//! register, or breakpoint operation, but must never re-enter the event
//! wait.
//!
//! ## Platform support
//!
//! Everything that touches the Win32 API is gated on `cfg(windows)`. On other
//! hosts the crate still builds and exposes the architecture surface
//! ([`arch`], [`event`], [`common`], [`Error`]) so that downstream tooling
//! and the unit-test suite remain portable.
//!
//! ## Features
//!
//! - `plugins` (default): the [`plugins::Freezer`] and [`plugins::Imports`]
//!   plugins, which consume only a duplicated process handle.

pub mod arch;
pub mod common;
mod error;
pub mod event;

pub use error::Error;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod debugger;
        mod handle;
        mod hooks;
        mod port;
        pub mod util;

        #[cfg(feature = "plugins")]
        pub mod plugins;

        pub use debugger::{Debugger, HwBreakpoint, MemoryRegion, ThreadRecord};
        pub use handle::Handle;
        pub use hooks::{BreakpointAction, DebugEventHandler};
    }
}
