//! Freezing through a real-time signal.
//!
//! Every other thread is sent a signal whose handler parks it until the write is done.
//! On release the handler rewrites the interrupted `rip` if it points into moved code.

use std::ffi::{c_int, c_void};
use std::fs;
use std::io;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering::SeqCst};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use super::{relocate, Frozen, Relocation};

/// How long to wait for every thread to park
const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Parked threads spin while this is set
static ACTIVE: AtomicBool = AtomicBool::new(false);
/// Set once the write is done
static RELEASED: AtomicBool = AtomicBool::new(false);
/// Handlers entered, ever
static ARRIVED: AtomicUsize = AtomicUsize::new(0);
/// Handlers left, ever
static DEPARTED: AtomicUsize = AtomicUsize::new(0);
/// Threads moved, ever
static MOVED: AtomicUsize = AtomicUsize::new(0);
/// Relocations of the running freeze
static RELOCATIONS: AtomicPtr<Relocation> = AtomicPtr::new(ptr::null_mut());
/// Number of relocations behind [`RELOCATIONS`]
static RELOCATION_COUNT: AtomicUsize = AtomicUsize::new(0);

lazy_static! {
    /// One freeze at a time; also guards installing the handler
    static ref FREEZE_LOCK: Mutex<bool> = Mutex::new(false);
}

/// Signal the handler is installed for
fn signal() -> c_int {
    libc::SIGRTMIN() + 3
}

/// Installs [`park`] for [`signal`]
unsafe fn install_handler() -> io::Result<()> {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = park as *const () as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    if libc::sigaction(signal(), &action, ptr::null_mut()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Ids of every other thread in the process
fn threads() -> io::Result<Vec<libc::pid_t>> {
    // SAFETY: gettid has no preconditions
    let me = unsafe { libc::gettid() };
    let mut threads = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let name = entry?.file_name();
        if let Some(tid) = name.to_str().and_then(|name| name.parse().ok()) {
            if tid != me {
                threads.push(tid);
            }
        }
    }
    Ok(threads)
}

/// Signal handler. Only touches atomics and the interrupted context.
extern "C" fn park(_signal: c_int, _info: *mut libc::siginfo_t, context: *mut c_void) {
    ARRIVED.fetch_add(1, SeqCst);
    if ACTIVE.load(SeqCst) {
        while !RELEASED.load(SeqCst) {
            // SAFETY: sched_yield is async-signal-safe
            unsafe { libc::sched_yield() };
        }

        // SAFETY: the freezing thread keeps the relocations alive until every handler has departed,
        // and the kernel passes a valid ucontext to SA_SIGINFO handlers
        unsafe {
            let relocations =
                slice::from_raw_parts(RELOCATIONS.load(SeqCst), RELOCATION_COUNT.load(SeqCst));
            let context = &mut *(context as *mut libc::ucontext_t);
            let rip = &mut context.uc_mcontext.gregs[libc::REG_RIP as usize];
            if let Some(to) = relocate(*rip as usize, relocations) {
                *rip = to as libc::greg_t;
                MOVED.fetch_add(1, SeqCst);
            }
        }
    }
    DEPARTED.fetch_add(1, SeqCst);
}

/// See [`super::frozen`]
pub unsafe fn frozen<R>(
    relocations: &[Relocation],
    f: impl FnOnce() -> R,
) -> io::Result<(R, Frozen)> {
    let mut installed = FREEZE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if !*installed {
        install_handler()?;
        *installed = true;
    }
    let threads = threads()?;

    RELOCATIONS.store(relocations.as_ptr() as *mut Relocation, SeqCst);
    RELOCATION_COUNT.store(relocations.len(), SeqCst);
    RELEASED.store(false, SeqCst);
    let arrived = ARRIVED.load(SeqCst);
    let moved = MOVED.load(SeqCst);
    ACTIVE.store(true, SeqCst);

    let pid = libc::c_long::from(libc::getpid());
    let signal = libc::c_long::from(signal());
    let sent = threads
        .iter()
        .filter(|&&tid| {
            libc::syscall(libc::SYS_tgkill, pid, libc::c_long::from(tid), signal) == 0
        })
        .count();

    // threads that exit or keep the signal blocked never show up
    let start = Instant::now();
    while ARRIVED.load(SeqCst) - arrived < sent && start.elapsed() < STOP_TIMEOUT {
        thread::yield_now();
    }
    let stopped = (ARRIVED.load(SeqCst) - arrived).min(sent);

    let result = f();

    RELEASED.store(true, SeqCst);
    ACTIVE.store(false, SeqCst);
    while DEPARTED.load(SeqCst) != ARRIVED.load(SeqCst) {
        thread::yield_now();
    }

    Ok((
        result,
        Frozen {
            stopped,
            missed: sent - stopped,
            moved: MOVED.load(SeqCst) - moved,
        },
    ))
}
