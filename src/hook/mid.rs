//! # Mid Hook
//!
//! Detours placed at an arbitrary instruction boundary rather than a function entry.
//! The callback sees (and may rewrite) the complete register state at that instruction,
//! after which the displaced instructions run from the trampoline and execution continues behind them.
//!
//! The entry jump is written with every other thread stopped (see [`crate::freeze`]), so hooks can go in while the target runs.
//!
//! Hooks are permanent. Trampolines and callbacks are leaked and there is no unhook path.

use std::collections::HashSet;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{Mutex, PoisonError};

use iced_x86::IcedError;
use lazy_static::lazy_static;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::alloc::{allocate_executable, ProximityError};
use crate::code::stub;
use crate::code::x64::{
    jmp_rel32, steal, StealError, JMP_ABS_LEN, JMP_REL32_LEN, MAX_INSTRUCTION_LEN,
};
use crate::error::ErrorKind;
use crate::patcher::{LivePatcher, PermissionError, PermissionWrapper};
use crate::pattern::format_bytes;

use super::context::Context;
use super::jmphook::JmpHook;
use super::Hook;

/// Boxed hook body
pub type Callback = Box<dyn Fn(&mut Context) + Send + Sync + 'static>;

/// Bytes reserved per trampoline
const TRAMPOLINE_SIZE: usize = 512;
/// Most bytes instruction stealing can ever need: the longest entry jump, finished by the longest instruction
const STEAL_WINDOW: usize = JMP_ABS_LEN + MAX_INSTRUCTION_LEN - 1;

lazy_static! {
    /// Every address carrying a hook
    static ref HOOKED: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
}

/// Errors while installing a mid hook
#[derive(Debug, Error)]
pub enum HookError {
    /// Target isn't code we can hook
    #[error("cannot hook {address:#x}: {reason}")]
    InvalidAddress {
        /// Requested hook address
        address: usize,
        /// What's wrong with it
        reason: &'static str,
    },
    /// Target already carries a hook
    #[error("{address:#x} is already hooked")]
    AlreadyHooked {
        /// Requested hook address
        address: usize,
    },
    /// Not enough whole instructions at the target to fit the entry jump
    #[error("no room for a detour at {address:#x}: {source}")]
    NoRoom {
        /// Requested hook address
        address: usize,
        /// Why stealing stopped
        source: StealError,
    },
    /// Failed to allocate the trampoline
    #[error("failed to allocate trampoline: {0}")]
    Trampoline(#[from] ProximityError),
    /// Failed to assemble or relocate the trampoline code
    #[error("failed to assemble trampoline: {0}")]
    Assemble(#[from] IcedError),
    /// Assembled trampoline doesn't fit its allocation
    #[error("trampoline needs {needed} bytes, only {capacity} available")]
    TrampolineTooLarge {
        /// Assembled size
        needed: usize,
        /// Allocated size
        capacity: usize,
    },
    /// Failed to write the entry jump, or to stop the threads that might be running it
    #[error("failed to write entry jump: {0}")]
    Write(#[from] PermissionError<io::Error>),
}
impl HookError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            _ => ErrorKind::HookInstallFailed,
        }
    }
}

/// An installed hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    /// Hooked address
    address: usize,
    /// Start of the trampoline
    trampoline: usize,
    /// Length of the instructions moved into the trampoline
    stolen_len: usize,
}
impl HookHandle {
    /// Creates a handle for a hook at `address`
    pub(crate) fn new(address: usize, trampoline: usize, stolen_len: usize) -> Self {
        Self {
            address,
            trampoline,
            stolen_len,
        }
    }

    /// Hooked address
    pub fn address(&self) -> usize {
        self.address
    }

    /// Start of the trampoline
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    /// Bytes overwritten at the hooked address
    pub fn stolen_len(&self) -> usize {
        self.stolen_len
    }
}

/// Installs `callback` to run every time execution reaches `address`.
///
/// `address` must be the start of an instruction. This can't be checked; hooking the middle of an instruction corrupts the host.
pub fn install<F>(address: usize, callback: F) -> Result<HookHandle, HookError>
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    install_boxed(address, Box::new(callback))
}

/// [`install`] for an already boxed callback
pub fn install_boxed(address: usize, callback: Callback) -> Result<HookHandle, HookError> {
    let available = validate(address)?;

    // held for the whole install so two threads can't race on the same address
    let mut hooked = HOOKED.lock().unwrap_or_else(PoisonError::into_inner);
    if hooked.contains(&address) {
        return Err(HookError::AlreadyHooked { address });
    }

    // Safety: `validate` checked that `available` bytes at `address` are mapped executable memory
    let handle = unsafe { build(address, available, callback)? };
    hooked.insert(address);

    info!(
        "Hooked {:#x} (trampoline @ {:#x}, {} bytes moved)",
        handle.address(),
        handle.trampoline(),
        handle.stolen_len()
    );
    Ok(handle)
}

/// Checks that `address` is mapped executable memory, returning how many bytes may be decoded there
fn validate(address: usize) -> Result<usize, HookError> {
    let invalid = |reason| HookError::InvalidAddress { address, reason };
    if address == 0 {
        return Err(invalid("null address"));
    }

    let region = region::query(address as *const u8).map_err(|_| invalid("not mapped"))?;
    if !region.is_executable() {
        return Err(invalid("not executable"));
    }

    // instructions may run on into the next mapping
    let mut end = region.as_range().end;
    if end - address < STEAL_WINDOW {
        if let Ok(next) = region::query(end as *const u8) {
            if next.is_executable() {
                end = next.as_range().end;
            }
        }
    }
    Ok((end - address).min(STEAL_WINDOW))
}

/// Builds the trampoline and redirects `address` into it
///
/// # Safety
///
/// `available` bytes at `address` must be readable
unsafe fn build(
    address: usize,
    available: usize,
    callback: Callback,
) -> Result<HookHandle, HookError> {
    let mut trampoline = allocate_executable(address, TRAMPOLINE_SIZE)?;
    let base = trampoline.as_ptr() as usize;

    let entry_len = match jmp_rel32(address, base) {
        Some(_) => JMP_REL32_LEN,
        None => JMP_ABS_LEN,
    };
    let code = slice::from_raw_parts(address as *const u8, available);
    let stolen = steal(code, address as u64, entry_len)
        .map_err(|source| HookError::NoRoom { address, source })?;
    debug!(
        "Moving '{}' from {:#x} to {:#x}",
        format_bytes(&code[..stolen.len]),
        address,
        base
    );

    // box again so the dispatcher gets a thin pointer
    let callback: Box<Callback> = Box::new(callback);
    let stub = stub::assemble(
        base,
        dispatch as *const () as usize,
        &*callback as *const Callback as usize,
        &stolen.instructions,
        address + stolen.len,
    )?;
    if stub.code.len() > trampoline.len() {
        return Err(HookError::TrampolineTooLarge {
            needed: stub.code.len(),
            capacity: trampoline.len(),
        });
    }
    trampoline[..stub.code.len()].copy_from_slice(&stub.code);

    // other threads may be running the stolen instructions right now
    let hook = JmpHook::new(PermissionWrapper::new(LivePatcher::new(&stub.relocations)));
    hook.hook(address as *const u8, base as *const u8, stolen.len)?;

    // both are reachable from live code from here on
    Box::leak(callback);
    mem::forget(trampoline);

    Ok(HookHandle::new(address, base, stolen.len))
}

/// Called from every trampoline with the saved registers and that trampoline's callback
extern "sysv64" fn dispatch(context: *mut Context, callback: *const Callback) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // Safety: the trampoline passes its own stack block and the callback leaked at install time
        let (context, callback) = unsafe { (&mut *context, &*callback) };
        callback(context)
    }));

    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        error!("Hook callback panicked: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::hook::context::{Gpr, Xmm};

    /// Copies `code` into a fresh executable page that is never freed
    fn emit(code: &[u8]) -> usize {
        let mut page = region::alloc(code.len(), region::Protection::READ_WRITE_EXECUTE).unwrap();
        let base = page.as_mut_ptr::<u8>();
        unsafe { base.copy_from_nonoverlapping(code.as_ptr(), code.len()) };
        mem::forget(page);
        base as usize
    }

    #[test]
    /// A value written into rax is what the following instructions see
    fn test_hook_integer_register() {
        let mut code = vec![
            0x48, 0x8D, 0x47, 0x01, // lea rax, [rdi+1]
            0x48, 0x8D, 0x4F, 0x02, // lea rcx, [rdi+2]
            0x48, 0x01, 0xC8, // add rax, rcx
        ];
        code.extend([0x90; 16]);
        code.push(0xC3);
        let base = emit(&code);
        let f: extern "sysv64" fn(u64) -> u64 = unsafe { mem::transmute(base) };
        assert_eq!(f(10), 23);

        let seen_rax = Arc::new(AtomicU64::new(0));
        let seen_rdi = Arc::new(AtomicU64::new(0));
        let (rax, rdi) = (seen_rax.clone(), seen_rdi.clone());
        let handle = install(base + 4, move |ctx: &mut Context| {
            rax.store(ctx.gpr(Gpr::Rax), Ordering::SeqCst);
            rdi.store(ctx.gpr(Gpr::Rdi), Ordering::SeqCst);
            ctx.set_gpr(Gpr::Rax, 100);
        })
        .unwrap();
        assert_eq!(handle.address(), base + 4);
        assert!(handle.stolen_len() >= JMP_REL32_LEN);

        // rcx (10 + 2) is still computed by the moved instructions
        assert_eq!(f(10), 112);
        assert_eq!(seen_rax.load(Ordering::SeqCst), 11);
        assert_eq!(seen_rdi.load(Ordering::SeqCst), 10);
    }

    #[test]
    /// Lane 0 of xmm0 can be replaced mid-function while xmm1 passes through untouched
    fn test_hook_vector_register() {
        let mut code = vec![
            0xF3, 0x0F, 0x58, 0xC0, // addss xmm0, xmm0
            0xF3, 0x0F, 0x58, 0xC1, // addss xmm0, xmm1
        ];
        code.extend([0x90; 16]);
        code.push(0xC3);
        let base = emit(&code);
        let f: extern "sysv64" fn(f32, f32) -> f32 = unsafe { mem::transmute(base) };
        assert_eq!(f(2.0, 0.5), 4.5);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_xmm1 = Arc::new(AtomicU64::new(0));
        let (xmm0, xmm1) = (seen.clone(), seen_xmm1.clone());
        install(base + 4, move |ctx: &mut Context| {
            xmm1.store(ctx.xmm(Xmm::Xmm1).f32(0).to_bits() as u64, Ordering::SeqCst);
            let register = ctx.xmm_mut(Xmm::Xmm0);
            xmm0.store(register.f32(0).to_bits() as u64, Ordering::SeqCst);
            register.set_f32(0, 1.5);
        })
        .unwrap();

        assert_eq!(f(2.0, 0.5), 2.0);
        assert_eq!(f32::from_bits(seen.load(Ordering::SeqCst) as u32), 4.0);
        assert_eq!(f32::from_bits(seen_xmm1.load(Ordering::SeqCst) as u32), 0.5);
        assert_eq!(f(2.0, -3.0), -1.5);
    }

    #[test]
    /// Flags set before the hook are still there for the instruction after it
    fn test_hook_preserves_flags() {
        let mut code = vec![
            0x48, 0x39, 0xF7, // cmp rdi, rsi
            0x0F, 0x92, 0xC0, // setb al
            0x0F, 0xB6, 0xC0, // movzx eax, al
        ];
        code.extend([0x90; 16]);
        code.push(0xC3);
        let base = emit(&code);
        let f: extern "sysv64" fn(u64, u64) -> u64 = unsafe { mem::transmute(base) };

        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        install(base + 3, move |ctx: &mut Context| {
            // arithmetic in here clobbers the live flags
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.set_gpr(Gpr::Rcx, ctx.gpr(Gpr::Rdi).wrapping_sub(ctx.gpr(Gpr::Rsi)));
        })
        .unwrap();

        assert_eq!(f(1, 2), 1);
        assert_eq!(f(2, 1), 0);
        assert_eq!(f(5, 5), 0);
        assert_eq!(f(0, u64::MAX), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    /// Argument registers the callback doesn't write reach the following instructions unchanged
    fn test_hook_preserves_registers() {
        let mut code = vec![
            0x48, 0x89, 0xF8, // mov rax, rdi
            0x48, 0x01, 0xF0, // add rax, rsi
            0x48, 0x01, 0xD0, // add rax, rdx
            0x48, 0x01, 0xC8, // add rax, rcx
            0x4C, 0x01, 0xC0, // add rax, r8
            0x4C, 0x01, 0xC8, // add rax, r9
        ];
        code.extend([0x90; 16]);
        code.push(0xC3);
        let base = emit(&code);
        let f: extern "sysv64" fn(u64, u64, u64, u64, u64, u64) -> u64 =
            unsafe { mem::transmute(base) };
        assert_eq!(f(1, 2, 4, 8, 16, 32), 63);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        install(base, move |ctx: &mut Context| {
            let registers = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];
            *record.lock().unwrap() = registers.iter().map(|r| ctx.gpr(*r)).collect();
            // scratch registers nothing downstream reads
            ctx.set_gpr(Gpr::R10, 0xDEAD);
            ctx.set_gpr(Gpr::R11, 0xBEEF);
        })
        .unwrap();

        assert_eq!(f(1, 2, 4, 8, 16, 32), 63);
        assert_eq!(*seen.lock().unwrap(), [1, 2, 4, 8, 16, 32]);
        assert_eq!(f(100, 200, 300, 400, 500, 600), 2100);
    }

    #[test]
    /// rip-relative loads still read the right address after being moved into the trampoline
    fn test_hook_relocates_rip_relative() {
        // mov rax, [rip+17]
        let mut code = vec![0x48, 0x8B, 0x05, 0x11, 0x00, 0x00, 0x00];
        code.extend([0x90; 16]);
        code.push(0xC3);
        code.extend(0x1122_3344_5566_7788u64.to_le_bytes());
        let base = emit(&code);
        let f: extern "sysv64" fn() -> u64 = unsafe { mem::transmute(base) };

        install(base, |_: &mut Context| {}).unwrap();
        assert_eq!(f(), 0x1122_3344_5566_7788);
    }

    #[test]
    /// A panicking callback is contained and the hooked code carries on
    fn test_hook_callback_panic() {
        let mut code = vec![0x48, 0x89, 0xF8]; // mov rax, rdi
        code.extend([0x90; 16]);
        code.push(0xC3);
        let base = emit(&code);
        let f: extern "sysv64" fn(u64) -> u64 = unsafe { mem::transmute(base) };

        install(base + 3, |_: &mut Context| panic!("boom")).unwrap();
        assert_eq!(f(42), 42);
    }

    #[test]
    fn test_invalid_address() {
        let data = vec![0x90u8; 64];
        let err = install(data.as_ptr() as usize, |_: &mut Context| {}).unwrap_err();
        assert!(matches!(err, HookError::InvalidAddress { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);

        let err = install(0, |_: &mut Context| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
    }

    #[test]
    /// A return right at the target leaves no room for the entry jump
    fn test_no_room() {
        let base = emit(&[0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
        let err = install(base, |_: &mut Context| {}).unwrap_err();
        assert!(matches!(
            err,
            HookError::NoRoom {
                source: StealError::Boundary { .. },
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::HookInstallFailed);
    }

    #[test]
    fn test_already_hooked() {
        let mut code = vec![0x90; 32];
        code.push(0xC3);
        let base = emit(&code);

        install(base, |_: &mut Context| {}).unwrap();
        let err = install(base, |_: &mut Context| {}).unwrap_err();
        assert!(matches!(err, HookError::AlreadyHooked { .. }));
        assert_eq!(err.kind(), ErrorKind::HookInstallFailed);
    }

    #[test]
    /// Threads running the hooked code while the hook goes in see either the old code or the hook, never a torn mix
    fn test_install_while_running() {
        // xor eax, eax; 64 x add eax, 1; ret
        let mut code = vec![0x31, 0xC0];
        for _ in 0..64 {
            code.extend([0x83, 0xC0, 0x01]);
        }
        code.push(0xC3);

        for _ in 0..100 {
            let base = emit(&code);
            let f: extern "sysv64" fn() -> u32 = unsafe { mem::transmute(base) };

            let stop = Arc::new(AtomicBool::new(false));
            let calls = Arc::new(AtomicU64::new(0));
            let workers: Vec<_> = (0..3)
                .map(|_| {
                    let (stop, calls) = (stop.clone(), calls.clone());
                    thread::spawn(move || {
                        while !stop.load(Ordering::SeqCst) {
                            assert_eq!(f(), 64);
                            calls.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            while calls.load(Ordering::SeqCst) < 300 {
                thread::yield_now();
            }

            // between the 20th and 21st add
            let hits = Arc::new(AtomicU64::new(0));
            let counter = hits.clone();
            install(base + 62, move |_: &mut Context| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            while hits.load(Ordering::SeqCst) < 300 {
                thread::yield_now();
            }
            stop.store(true, Ordering::SeqCst);
            for worker in workers {
                worker.join().unwrap();
            }
        }
    }
}
