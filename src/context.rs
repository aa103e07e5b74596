//! Direct CPU-context switching.
//!
//! Everything non-portable about moving control between stacks is confined
//! to this module: the rest of the crate treats a [`Context`] as an opaque
//! suspension point and transfers control with [`swap`] (save and load) or
//! [`jump`] (load only, for a thread that will never be resumed).
//!
//! Built on the host ucontext family. A saved context carries the stack
//! pointer, the program counter and the blocked-signal mask, so resuming a
//! thread also reinstates the mask it was suspended under.

use crate::error::{die, die_raw};
use std::mem::MaybeUninit;
use std::ptr;

/// A suspended execution context.
///
/// The ucontext record is boxed: the kernel representation is
/// self-referential on this host, and thread records move inside the
/// collection's map, so the record needs a stable address.
pub struct Context {
    ucp: Box<libc::ucontext_t>,
}

impl Context {
    /// An empty save slot. The first `swap` away from the owning thread
    /// fills it; it must not be jumped to before that.
    pub fn empty() -> Self {
        // A zeroed record is a valid save target: the save side overwrites
        // every field the load side reads.
        let ucp = unsafe { Box::new(MaybeUninit::<libc::ucontext_t>::zeroed().assume_init()) };
        Self { ucp }
    }

    /// Synthesize a context that enters `entry` on `stack` when first
    /// loaded, with an empty blocked-signal mask so the thread's first
    /// quantum is preemptible from the start.
    pub fn for_entry(stack: &mut [u8], entry: extern "C" fn()) -> Self {
        let mut ucp =
            unsafe { Box::new(MaybeUninit::<libc::ucontext_t>::zeroed().assume_init()) };
        unsafe {
            if libc::getcontext(&mut *ucp) != 0 {
                die("capturing a template context failed");
            }
            ucp.uc_stack.ss_sp = stack.as_mut_ptr().cast();
            ucp.uc_stack.ss_size = stack.len();
            ucp.uc_stack.ss_flags = 0;
            ucp.uc_link = ptr::null_mut();
            if libc::sigemptyset(&mut ucp.uc_sigmask) != 0 {
                die("clearing a context signal mask failed");
            }
            libc::makecontext(&mut *ucp, entry, 0);
        }
        Self { ucp }
    }

    pub fn as_ptr(&self) -> *const libc::ucontext_t {
        &*self.ucp
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut *self.ucp
    }
}

/// Save the running context into `save` and load `load`; returns when the
/// saved context is resumed.
///
/// Both records must stay at their addresses for the whole suspension,
/// which the `Context` boxes guarantee. Callable from the timer handler,
/// so the failure path is the raw signal-safe one.
pub unsafe fn swap(save: *mut libc::ucontext_t, load: *const libc::ucontext_t) {
    if libc::swapcontext(save, load) != 0 {
        die_raw("system error: context switch failed\n");
    }
}

/// Load `load` without saving the running context. For an outgoing thread
/// that is being destroyed and must never run again.
pub unsafe fn jump(load: *const libc::ucontext_t) -> ! {
    libc::setcontext(load);
    die_raw("system error: context load failed\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicBool, Ordering};

    static ENTERED: AtomicBool = AtomicBool::new(false);

    struct HomeCell(UnsafeCell<Option<Context>>);
    unsafe impl Sync for HomeCell {}
    static HOME: HomeCell = HomeCell(UnsafeCell::new(None));

    extern "C" fn visit_and_return() {
        ENTERED.store(true, Ordering::SeqCst);
        let home = unsafe { (*HOME.0.get()).as_ref().unwrap() };
        unsafe { jump(home.as_ptr()) }
    }

    #[test]
    fn entry_context_runs_on_its_own_stack_and_comes_back() {
        let mut stack = vec![0u8; 32 * 1024].into_boxed_slice();
        let target = Context::for_entry(&mut stack, visit_and_return);
        unsafe { *HOME.0.get() = Some(Context::empty()) };
        let home = unsafe { (*HOME.0.get()).as_mut().unwrap().as_mut_ptr() };

        unsafe { swap(home, target.as_ptr()) };

        assert!(ENTERED.load(Ordering::SeqCst));
    }
}
