//! User-level preemptive threads on a single OS thread.
//!
//! Many logical threads are multiplexed onto the one thread that called
//! [`init`]: a virtual-time interval timer delivers a preemption signal at
//! the end of each quantum, and the scheduler rotates the ready queue in
//! FIFO order by switching CPU contexts directly. Threads can also leave
//! the rotation voluntarily: [`block`]/[`resume`], contending on the
//! library [`mutex_lock`], or [`terminate`].
//!
//! The library is not re-entrant across OS threads: everything after
//! `init` must happen on the thread that initialized it. Public entry
//! points mask the timer signal around their critical sections, which is
//! the sole synchronization primitive. With a single OS thread in play,
//! it is also a sufficient one.
//!
//! ```no_run
//! use uthreads::{get_tid, init, spawn, terminate};
//!
//! fn worker() {
//!     println!("hello from thread {}", get_tid());
//!     let _ = terminate(get_tid());
//! }
//!
//! fn main() {
//!     init(100_000).expect("init");
//!     spawn(worker).expect("spawn");
//!     loop {
//!         std::hint::spin_loop(); // worker preempts us once its quantum starts
//!     }
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("uthreads drives SIGVTALRM and the ucontext family; only Linux hosts are supported");

mod context;
mod error;
mod sync;
mod thread;
mod timer;
mod types;

pub use error::{Result, UthreadError};
pub use types::{EntryPoint, ThreadId};

use log::{debug, info};
use std::cell::UnsafeCell;
use std::process;
use sync::Mutex;
use thread::tcb::ThreadControlBlock;
use thread::ThreadManager;
use timer::{TimerSignalGuard, VirtualTimer};

/// Upper bound on concurrently live threads, the main thread included.
pub const MAX_THREAD_NUM: usize = 100;

/// Stack size, in bytes, of each spawned thread.
pub const STACK_SIZE: usize = 64 * 1024;

struct Runtime {
    threads: ThreadManager,
    mutex: Mutex,
    timer: VirtualTimer,
    /// Quanta started since init, the current one included.
    total_quantums: u64,
    /// Record of a self-terminated thread, parked until execution is off
    /// the stack it owns. Drained at the next switch.
    graveyard: Option<ThreadControlBlock>,
}

struct RuntimeCell {
    inner: UnsafeCell<Option<Runtime>>,
}

// One OS thread, and every access runs either under the timer mask or
// inside the handler, which signal delivery already masks.
unsafe impl Sync for RuntimeCell {}

static RUNTIME: RuntimeCell = RuntimeCell {
    inner: UnsafeCell::new(None),
};

/// Run `f` on the runtime under a borrow scoped to the closure.
///
/// The borrow must never survive into a context switch: switch sites
/// extract raw context pointers inside the closure and transfer control
/// only after it returns.
fn with_runtime<T>(f: impl FnOnce(&mut Runtime) -> T) -> Result<T> {
    let slot = unsafe { &mut *RUNTIME.inner.get() };
    match slot.as_mut() {
        Some(runtime) => Ok(f(runtime)),
        None => Err(UthreadError::NotInitialized),
    }
}

fn flatten<T>(nested: Result<Result<T>>) -> Result<T> {
    nested.and_then(|inner| inner)
}

/// Log a library error as a `thread library error:` line on stderr.
fn report<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        eprintln!("thread library error: {e}");
    }
    result
}

/// What to do with the outgoing thread once its successor is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Preempted: back to the end of the ready queue.
    MarkReady,
    /// Suspended by `block`.
    Block,
    /// Suspended waiting for the mutex.
    WaitMutex,
    /// Destroyed: record to the graveyard, mutex released if held.
    Terminate,
}

enum Transfer {
    Swap(*mut libc::ucontext_t, *const libc::ucontext_t),
    Jump(*const libc::ucontext_t),
}

/// Switch from the current thread to the front of the ready queue.
///
/// All bookkeeping runs on the outgoing thread before the transfer; the
/// incoming thread sees the new counters from its first instruction, and a
/// resumed thread returns straight to its switch site. Returns false,
/// without switching or touching any state, when nothing is ready.
///
/// Callers hold the timer mask or are the signal handler. The handler
/// shares this path, so the closure must not allocate, free, format, or
/// log: the graveyard is drained by [`switch_mid_quantum`] only, the ready
/// queue is pre-sized, and the one free here (the `Terminate` arm) is
/// reached from voluntary call sites alone.
fn switch_threads(disposition: Disposition) -> bool {
    let transfer = match with_runtime(|rt| {
        if !rt.threads.has_ready() {
            return None;
        }
        rt.total_quantums += 1;
        let prev = rt.threads.current_id();
        let next = rt.threads.pop_next_running()?;
        match disposition {
            Disposition::MarkReady => rt.threads.mark_ready(prev),
            Disposition::Block => rt.threads.block(prev),
            Disposition::WaitMutex => rt.threads.wait_for_mutex(prev),
            Disposition::Terminate => {
                rt.graveyard = rt.threads.remove(prev);
                if rt.mutex.holder() == Some(prev) {
                    rt.mutex.release();
                    rt.threads.advance_mutex_line();
                }
            }
        }
        let load = {
            let incoming = rt.threads.get_mut(next)?;
            incoming.quantums += 1;
            incoming.context.as_ptr()
        };
        Some(match rt.threads.get_mut(prev) {
            Some(outgoing) => Transfer::Swap(outgoing.context.as_mut_ptr(), load),
            None => Transfer::Jump(load),
        })
    }) {
        Ok(Some(transfer)) => transfer,
        Ok(None) | Err(_) => return false,
    };

    match transfer {
        Transfer::Swap(save, load) => unsafe { context::swap(save, load) },
        Transfer::Jump(load) => unsafe { context::jump(load) },
    }
    true
}

/// Voluntary switch: reclaim any parked record, restart the timer period
/// so the incoming thread gets a full fresh quantum, then switch.
///
/// This is the masked, non-handler switch site: freeing the graveyard
/// record and the formatted fatal diagnostics are both confined to it.
fn switch_mid_quantum(disposition: Disposition) {
    let armed = with_runtime(|rt| {
        rt.graveyard = None;
        rt.timer.arm();
    });
    if armed.is_err() {
        error::die("context switch before initialization");
    }
    if !switch_threads(disposition) {
        // The current thread must yield but every other thread is
        // suspended: a user-level deadlock with nothing left to run.
        error::die("no runnable thread: all threads are blocked or waiting");
    }
}

/// The preemption entry: runs on every virtual-timer tick, with the timer
/// signal masked by signal delivery. This path must stay free of
/// allocation, formatting and logging.
extern "C" fn on_timer_tick(_signal: libc::c_int) {
    let preempt = with_runtime(|rt| {
        if rt.threads.has_ready() {
            true
        } else {
            // Nobody to run instead; the tick still opens a fresh quantum
            // for the same thread.
            rt.total_quantums += 1;
            let current = rt.threads.current_id();
            if let Some(record) = rt.threads.get_mut(current) {
                record.quantums += 1;
            }
            false
        }
    });
    if let Ok(true) = preempt {
        switch_threads(Disposition::MarkReady);
    }
}

/// First frame of every spawned thread. Fetches the entry function under
/// the mask, runs it unmasked, and folds a plain return into termination.
extern "C" fn thread_trampoline() {
    let entry = {
        let _guard = TimerSignalGuard::new();
        with_runtime(|rt| {
            let current = rt.threads.current_id();
            rt.threads.get(current).and_then(|record| record.entry())
        })
        .ok()
        .flatten()
    };
    if let Some(entry) = entry {
        entry();
    }
    let _ = terminate(get_tid());
    error::die("terminated thread kept running");
}

/// Initialize the library and start the first quantum.
///
/// `quantum_usecs` is the preemption period in micro-seconds of virtual
/// (CPU) time; it must be positive. Must be called once, on the thread
/// that will host the scheduler, before any other operation. The calling
/// thread becomes thread 0 with a quantum count of 1.
pub fn init(quantum_usecs: i32) -> Result<()> {
    let _guard = TimerSignalGuard::new();
    report(init_masked(quantum_usecs))
}

fn init_masked(quantum_usecs: i32) -> Result<()> {
    if quantum_usecs <= 0 {
        return Err(UthreadError::NonPositiveQuantum(quantum_usecs));
    }
    let slot = unsafe { &mut *RUNTIME.inner.get() };
    if slot.is_some() {
        return Err(UthreadError::AlreadyInitialized);
    }

    timer::install_timer_handler(on_timer_tick);
    let runtime = Runtime {
        threads: ThreadManager::new(MAX_THREAD_NUM, STACK_SIZE, thread_trampoline),
        mutex: Mutex::new(),
        timer: VirtualTimer::new(quantum_usecs),
        total_quantums: 1,
        graveyard: None,
    };
    runtime.timer.arm();
    *slot = Some(runtime);

    info!("thread library initialized, quantum = {quantum_usecs} us");
    Ok(())
}

/// Create a thread that will run `entry`, appended to the ready queue.
/// Fails once `MAX_THREAD_NUM` threads are live.
pub fn spawn(entry: EntryPoint) -> Result<ThreadId> {
    let _guard = TimerSignalGuard::new();
    let id = report(flatten(with_runtime(|rt| rt.threads.create_thread(entry))))?;
    debug!("spawned thread {id}");
    Ok(id)
}

/// Destroy the thread `tid`, releasing the mutex if it held it.
///
/// Terminating the main thread (id 0) ends the whole process with a
/// successful status. A thread terminating itself does not return: its
/// quantum ends mid-way and its stack is reclaimed once control is off it.
pub fn terminate(tid: ThreadId) -> Result<()> {
    let _guard = TimerSignalGuard::new();
    if tid == ThreadId::MAIN {
        process::exit(0);
    }
    let is_self = report(flatten(with_runtime(|rt| {
        if !rt.threads.contains(tid) {
            return Err(UthreadError::UnknownThread(tid));
        }
        Ok(rt.threads.current_id() == tid)
    })))?;

    if is_self {
        debug!("thread {tid} terminating itself");
        switch_mid_quantum(Disposition::Terminate);
        error::die("self-terminated thread resumed");
    }

    debug!("terminating thread {tid}");
    let _ = with_runtime(|rt| {
        drop(rt.threads.remove(tid));
        if rt.mutex.holder() == Some(tid) {
            rt.mutex.release();
            rt.threads.advance_mutex_line();
        }
    });
    Ok(())
}

/// Suspend the thread `tid` until [`resume`]. Blocking the main thread is
/// an error; blocking an already-blocked thread is a no-op. A thread
/// blocking itself yields the rest of its quantum.
pub fn block(tid: ThreadId) -> Result<()> {
    let _guard = TimerSignalGuard::new();
    let is_self = report(flatten(with_runtime(|rt| {
        if tid == ThreadId::MAIN {
            return Err(UthreadError::CannotBlockMain);
        }
        if !rt.threads.contains(tid) {
            return Err(UthreadError::UnknownThread(tid));
        }
        Ok(rt.threads.current_id() == tid)
    })))?;

    if is_self {
        debug!("thread {tid} blocking itself");
        switch_mid_quantum(Disposition::Block);
    } else {
        debug!("blocking thread {tid}");
        let _ = with_runtime(|rt| rt.threads.block(tid));
    }
    Ok(())
}

/// Move a blocked thread back to the ready queue. Resuming a thread that
/// is not blocked has no effect; a thread still waiting for the mutex
/// stays suspended until the mutex line advances to it.
pub fn resume(tid: ThreadId) -> Result<()> {
    let _guard = TimerSignalGuard::new();
    report(flatten(with_runtime(|rt| rt.threads.resume(tid))))?;
    debug!("resumed thread {tid}");
    Ok(())
}

/// Acquire the library mutex, suspending the calling thread while another
/// thread holds it. Re-locking by the current holder is an error.
pub fn mutex_lock() -> Result<()> {
    let _guard = TimerSignalGuard::new();
    let me = report(flatten(with_runtime(|rt| {
        let me = rt.threads.current_id();
        if rt.mutex.holder() == Some(me) {
            return Err(UthreadError::MutexAlreadyHeld);
        }
        Ok(me)
    })))?;

    // The wait is a retry loop: being re-admitted by an unlock only means
    // a fresh chance to take the mutex, another thread may have beaten us
    // to it by the time this quantum starts.
    loop {
        let locked = with_runtime(|rt| rt.mutex.is_locked())?;
        if !locked {
            break;
        }
        switch_mid_quantum(Disposition::WaitMutex);
    }
    with_runtime(|rt| rt.mutex.acquire(me))?;
    debug!("thread {me} acquired the mutex");
    Ok(())
}

/// Release the library mutex and re-admit one eligible waiter. Only the
/// holder may unlock; the unlocking thread keeps its quantum.
pub fn mutex_unlock() -> Result<()> {
    let _guard = TimerSignalGuard::new();
    report(flatten(with_runtime(|rt| {
        if rt.mutex.holder() != Some(rt.threads.current_id()) {
            return Err(UthreadError::MutexNotHeld);
        }
        rt.mutex.release();
        rt.threads.advance_mutex_line();
        Ok(())
    })))?;
    debug!("mutex released");
    Ok(())
}

/// Id of the calling thread. Before `init`, the main id.
pub fn get_tid() -> ThreadId {
    let _guard = TimerSignalGuard::new();
    with_runtime(|rt| rt.threads.current_id()).unwrap_or(ThreadId::MAIN)
}

/// Quanta started since `init`, the current one included. 1 right after
/// `init`; 0 before it.
pub fn get_total_quantums() -> u64 {
    let _guard = TimerSignalGuard::new();
    with_runtime(|rt| rt.total_quantums).unwrap_or(0)
}

/// Quanta the thread `tid` has spent running. A thread that is currently
/// running sees its ongoing quantum included.
pub fn get_quantums(tid: ThreadId) -> Result<u64> {
    let _guard = TimerSignalGuard::new();
    report(flatten(with_runtime(|rt| {
        rt.threads
            .get(tid)
            .map(|record| record.quantums)
            .ok_or(UthreadError::UnknownThread(tid))
    })))
}
