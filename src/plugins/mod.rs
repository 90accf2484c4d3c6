//! Optional plugins built beside the debugger core.
//!
//! Plugins never participate in the event loop. Each one holds its own
//! *duplicated* process handle with exactly the access rights it needs, so
//! it neither keeps the debugger's handle alive nor closes it out from
//! under the session. Construct them through [`Debugger::freezer`] /
//! [`Debugger::imports`] or directly from any process handle.
//!
//! [`Debugger::freezer`]: crate::Debugger::freezer
//! [`Debugger::imports`]: crate::Debugger::imports

mod freezer;
mod imports;

pub use freezer::{Freezer, ThreadState};
pub use imports::{FunctionAddress, IatRecord, Imports, ModuleInfo};
