//! Freeze and thaw a whole process by suspending every one of its threads.
//!
//! [`Freezer::suspend`] snapshots each thread's scheduling state before
//! suspending it; [`Freezer::restore`] re-applies the snapshot and resumes.
//! Snapshots can be round-tripped through a small CSV file, so a frozen
//! process can survive the freezing tool itself restarting.

use core::mem;
use core::ptr;
use std::fs;
use std::io;
use std::path::Path;

use log::warn;

use winapi::shared::minwindef::FALSE;
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::processthreadsapi::{
    GetProcessId, GetThreadPriority, GetThreadPriorityBoost, OpenThread, ResumeThread,
    SetThreadPriority, SetThreadPriorityBoost, SuspendThread,
};
use winapi::um::processtopologyapi::{GetThreadGroupAffinity, SetThreadGroupAffinity};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winbase::{THREAD_PRIORITY_ERROR_RETURN, THREAD_PRIORITY_NORMAL};
use winapi::um::winnt::{
    GROUP_AFFINITY, PROCESS_QUERY_LIMITED_INFORMATION, THREAD_QUERY_INFORMATION,
    THREAD_SET_INFORMATION, THREAD_SUSPEND_RESUME,
};

use crate::common::{Pid, RawHandle, Tid};
use crate::error::{last_os_error, Error};
use crate::handle::Handle;

/// One thread's scheduling state at suspension time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadState {
    /// The thread id.
    pub tid: Tid,
    /// Suspend count before our suspension.
    pub prev_suspend_count: u32,
    /// Dynamic priority.
    pub priority: i32,
    /// Whether priority boosting was disabled.
    pub boost_disabled: bool,
    /// Processor group of the thread's affinity.
    pub group: u16,
    /// Affinity mask within the group.
    pub affinity_mask: usize,
    /// Whether the suspension was ours to undo.
    pub we_suspended: bool,
}

/// Suspends and restores every thread of one process.
pub struct Freezer {
    process: Handle,
    pid: Pid,
}

fn open_thread(tid: Tid) -> Option<Handle> {
    let raw = unsafe {
        OpenThread(
            THREAD_SUSPEND_RESUME | THREAD_QUERY_INFORMATION | THREAD_SET_INFORMATION,
            FALSE,
            tid,
        )
    };
    if raw.is_null() {
        None
    } else {
        Some(Handle::new(raw))
    }
}

impl Freezer {
    /// Build a freezer over the process behind `process`.
    ///
    /// The handle is duplicated with query-limited access; the original
    /// stays untouched and unowned.
    pub fn new(process: RawHandle) -> Result<Freezer, Error> {
        let process = Handle::duplicate(process, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let pid = unsafe { GetProcessId(process.raw()) };
        if pid == 0 {
            return Err(last_os_error("GetProcessId"));
        }
        Ok(Freezer { process, pid })
    }

    /// Id of the frozen (or about-to-be-frozen) process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Suspend every thread of the process.
    ///
    /// Returns the per-thread states to hand back to
    /// [`Freezer::restore`], or `None` when no thread could be suspended
    /// cleanly.
    pub fn suspend(&self) -> Option<Vec<ThreadState>> {
        let tids = self.thread_ids();
        if tids.is_empty() {
            return None;
        }

        let mut states = Vec::with_capacity(tids.len());
        let mut ok_all = true;

        for tid in tids {
            let thread = match open_thread(tid) {
                Some(handle) => handle,
                None => {
                    ok_all = false;
                    continue;
                }
            };

            let prev = unsafe { SuspendThread(thread.raw()) };
            if prev == u32::MAX {
                ok_all = false;
                continue;
            }

            let priority = unsafe { GetThreadPriority(thread.raw()) };
            let priority = if priority == THREAD_PRIORITY_ERROR_RETURN as i32 {
                THREAD_PRIORITY_NORMAL as i32
            } else {
                priority
            };

            let mut boost = 0;
            unsafe { GetThreadPriorityBoost(thread.raw(), &mut boost) };

            let mut affinity: GROUP_AFFINITY = unsafe { mem::zeroed() };
            unsafe { GetThreadGroupAffinity(thread.raw(), &mut affinity) };

            states.push(ThreadState {
                tid,
                prev_suspend_count: prev,
                priority,
                boost_disabled: boost != 0,
                group: affinity.Group,
                affinity_mask: affinity.Mask,
                we_suspended: true,
            });
        }

        if !ok_all || states.is_empty() {
            return None;
        }
        Some(states)
    }

    /// Re-apply a suspension snapshot: affinity, priority, and boost first,
    /// then resume each thread we suspended until its count drops back.
    pub fn restore(&self, states: &[ThreadState]) -> bool {
        let mut ok = true;

        for state in states {
            let thread = match open_thread(state.tid) {
                Some(handle) => handle,
                None => {
                    ok = false;
                    continue;
                }
            };

            if state.affinity_mask != 0 {
                let mut affinity: GROUP_AFFINITY = unsafe { mem::zeroed() };
                affinity.Group = state.group;
                affinity.Mask = state.affinity_mask;
                unsafe { SetThreadGroupAffinity(thread.raw(), &affinity, ptr::null_mut()) };
            }
            unsafe { SetThreadPriority(thread.raw(), state.priority) };
            unsafe { SetThreadPriorityBoost(thread.raw(), state.boost_disabled as i32) };

            if !state.we_suspended {
                continue;
            }

            loop {
                let prev = unsafe { ResumeThread(thread.raw()) };
                if prev == u32::MAX {
                    warn!("failed to resume thread {}", state.tid);
                    ok = false;
                    break;
                }
                if prev <= 1 {
                    break;
                }
            }
        }

        ok
    }

    /// Write a snapshot to `path` as CSV.
    pub fn export_csv<P: AsRef<Path>>(states: &[ThreadState], path: P) -> io::Result<()> {
        let mut out = String::from("tid,prevSuspendCount,priority,boostDisabled,group,mask,weSuspended\n");
        for state in states {
            out.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                state.tid,
                state.prev_suspend_count,
                state.priority,
                state.boost_disabled as u8,
                state.group,
                state.affinity_mask,
                state.we_suspended as u8,
            ));
        }
        fs::write(path, out)
    }

    /// Read a snapshot back from a CSV written by
    /// [`Freezer::export_csv`]. Malformed rows are skipped; `None` when
    /// nothing usable was found.
    pub fn import_csv<P: AsRef<Path>>(path: P) -> Option<Vec<ThreadState>> {
        let text = fs::read_to_string(path).ok()?;

        let mut states = Vec::new();
        for line in text.lines().skip(1) {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split(',');
            let mut next = || fields.next().map(str::trim);

            let parsed = (|| {
                Some(ThreadState {
                    tid: next()?.parse().ok()?,
                    prev_suspend_count: next()?.parse().ok()?,
                    priority: next()?.parse().ok()?,
                    boost_disabled: next()?.parse::<u8>().ok()? != 0,
                    group: next()?.parse().ok()?,
                    affinity_mask: next()?.parse().ok()?,
                    we_suspended: next()?.parse::<u8>().ok()? != 0,
                })
            })();

            match parsed {
                Some(state) => states.push(state),
                None => warn!("skipping malformed snapshot row: {:?}", line),
            }
        }

        if states.is_empty() {
            None
        } else {
            Some(states)
        }
    }

    fn thread_ids(&self) -> Vec<Tid> {
        let snap = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
        if snap == INVALID_HANDLE_VALUE {
            return Vec::new();
        }
        let snap = Handle::new(snap);

        let mut tids = Vec::new();
        let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;

        let mut ok = unsafe { Thread32First(snap.raw(), &mut entry) };
        while ok != 0 {
            if entry.th32OwnerProcessID == self.pid {
                tids.push(entry.th32ThreadID);
            }
            ok = unsafe { Thread32Next(snap.raw(), &mut entry) };
        }
        tids
    }
}

#[cfg(test)]
mod tests {
    use super::{Freezer, ThreadState};

    fn sample() -> Vec<ThreadState> {
        vec![
            ThreadState {
                tid: 1234,
                prev_suspend_count: 0,
                priority: 2,
                boost_disabled: false,
                group: 0,
                affinity_mask: 0xF,
                we_suspended: true,
            },
            ThreadState {
                tid: 5678,
                prev_suspend_count: 1,
                priority: -1,
                boost_disabled: true,
                group: 1,
                affinity_mask: 0x3,
                we_suspended: false,
            },
        ]
    }

    #[test]
    fn csv_round_trips_a_snapshot() {
        let dir = std::env::temp_dir().join("wdbg-freezer-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshot.csv");

        let states = sample();
        Freezer::export_csv(&states, &path).unwrap();
        let restored = Freezer::import_csv(&path).unwrap();
        assert_eq!(states, restored);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn import_rejects_an_empty_snapshot() {
        let dir = std::env::temp_dir().join("wdbg-freezer-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.csv");
        std::fs::write(
            &path,
            "tid,prevSuspendCount,priority,boostDisabled,group,mask,weSuspended\n",
        )
        .unwrap();

        assert!(Freezer::import_csv(&path).is_none());
        std::fs::remove_file(&path).ok();
    }
}
