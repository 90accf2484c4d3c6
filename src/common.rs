//! Common types and definitions.

/// A location in the target's virtual address space.
pub type Address = usize;

/// Windows process id.
pub type Pid = u32;

/// Windows thread id.
pub type Tid = u32;

/// A raw Win32 handle.
///
/// Handles are untyped pointers on every Windows ABI; keeping the alias here
/// lets the portable modules name them without pulling in `winapi`. The
/// crate's owning wrapper around this type is `Handle`.
pub type RawHandle = *mut core::ffi::c_void;
