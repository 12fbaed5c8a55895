//! Freezing through `SuspendThread` on a toolhelp thread snapshot

use std::io;
use std::mem;

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{
    GetThreadContext, SetThreadContext, CONTEXT, CONTEXT_CONTROL_AMD64,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread,
    THREAD_GET_CONTEXT, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

use super::{relocate, Frozen, Relocation};

/// Ids of every other thread in the process
fn threads() -> io::Result<Vec<u32>> {
    // SAFETY: the snapshot handle is closed before returning and `entry` carries its own size
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0).map_err(io::Error::from)?;
        let (process, me) = (GetCurrentProcessId(), GetCurrentThreadId());

        let mut entry: THREADENTRY32 = mem::zeroed();
        entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;

        let mut threads = Vec::new();
        let mut more = Thread32First(snapshot, &mut entry).is_ok();
        while more {
            if entry.th32OwnerProcessID == process && entry.th32ThreadID != me {
                threads.push(entry.th32ThreadID);
            }
            more = Thread32Next(snapshot, &mut entry).is_ok();
        }
        let _ = CloseHandle(snapshot);
        Ok(threads)
    }
}

/// Suspended threads, resumed and closed on drop
struct Suspended(
    /// Thread handles, each suspended once
    Vec<HANDLE>,
);
impl Drop for Suspended {
    fn drop(&mut self) {
        for &thread in &self.0 {
            // SAFETY: every handle was suspended once and is owned by us
            unsafe {
                ResumeThread(thread);
                let _ = CloseHandle(thread);
            }
        }
    }
}

/// Control registers of a suspended thread. Also waits for the suspension to take effect.
unsafe fn context(thread: HANDLE) -> Option<CONTEXT> {
    let mut context: CONTEXT = mem::zeroed();
    context.ContextFlags = CONTEXT_CONTROL_AMD64;
    GetThreadContext(thread, &mut context).ok()?;
    Some(context)
}

/// See [`super::frozen`]
pub unsafe fn frozen<R>(
    relocations: &[Relocation],
    f: impl FnOnce() -> R,
) -> io::Result<(R, Frozen)> {
    let ids = threads()?;
    let access = THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT;
    let handles: Vec<_> = ids
        .iter()
        .filter_map(|&id| OpenThread(access, false, id).ok())
        .collect();

    // reserved up front; nothing may allocate once the first thread is stopped
    let mut suspended = Suspended(Vec::with_capacity(handles.len()));
    for &thread in &handles {
        if SuspendThread(thread) == u32::MAX {
            let _ = CloseHandle(thread);
        } else {
            suspended.0.push(thread);
        }
    }
    // SuspendThread is asynchronous
    for &thread in &suspended.0 {
        let _ = context(thread);
    }

    let result = f();

    let mut moved = 0;
    for &thread in &suspended.0 {
        let Some(mut registers) = context(thread) else {
            continue;
        };
        if let Some(to) = relocate(registers.Rip as usize, relocations) {
            registers.Rip = to as u64;
            if SetThreadContext(thread, &registers).is_ok() {
                moved += 1;
            }
        }
    }

    let stopped = suspended.0.len();
    drop(suspended);
    Ok((
        result,
        Frozen {
            stopped,
            missed: ids.len() - stopped,
            moved,
        },
    ))
}
