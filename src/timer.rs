//! Virtual-timer signal plumbing: handler registration, the periodic
//! interrupt source, and the mask guard that delimits critical sections.
//!
//! The preemption signal is `SIGVTALRM`, fired by an `ITIMER_VIRTUAL`
//! interval timer, so quanta are measured in CPU time consumed by the
//! process rather than wall-clock time.

use crate::error::die;
use std::mem::MaybeUninit;
use std::ptr;

/// The single-signal set containing the timer signal.
fn timer_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        if libc::sigemptyset(set.as_mut_ptr()) != 0
            || libc::sigaddset(set.as_mut_ptr(), libc::SIGVTALRM) != 0
        {
            die("building the timer signal set failed");
        }
        set.assume_init()
    }
}

/// Blocks the timer signal while in scope; restores the previous mask on
/// drop.
///
/// Every public API entry constructs one before touching shared state,
/// which makes mask and unmask symmetric on error paths as well.
pub struct TimerSignalGuard {
    old_mask: libc::sigset_t,
}

impl TimerSignalGuard {
    pub fn new() -> Self {
        let set = timer_sigset();
        unsafe {
            let mut old = MaybeUninit::<libc::sigset_t>::uninit();
            if libc::sigprocmask(libc::SIG_BLOCK, &set, old.as_mut_ptr()) != 0 {
                die("masking the timer signal failed");
            }
            Self {
                old_mask: old.assume_init(),
            }
        }
    }
}

impl Drop for TimerSignalGuard {
    fn drop(&mut self) {
        unsafe {
            if libc::sigprocmask(libc::SIG_SETMASK, &self.old_mask, ptr::null_mut()) != 0 {
                die("restoring the signal mask failed");
            }
        }
    }
}

/// Register `handler` for the timer signal.
///
/// The handler runs with the timer signal blocked by signal delivery, so
/// it cannot re-enter itself. `SA_RESTART` keeps interrupted system calls
/// in user code transparent.
pub fn install_timer_handler(handler: extern "C" fn(libc::c_int)) {
    unsafe {
        let mut sa: libc::sigaction = MaybeUninit::zeroed().assume_init();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        if libc::sigemptyset(&mut sa.sa_mask) != 0 {
            die("building the handler signal mask failed");
        }
        if libc::sigaction(libc::SIGVTALRM, &sa, ptr::null_mut()) != 0 {
            die("registering the timer handler failed");
        }
    }
}

/// The periodic virtual-time interrupt source.
pub struct VirtualTimer {
    interval: libc::itimerval,
}

impl VirtualTimer {
    /// Period of `quantum_usecs` micro-seconds of CPU time. The caller has
    /// already validated that the quantum is positive.
    pub fn new(quantum_usecs: i32) -> Self {
        let period = libc::timeval {
            tv_sec: (quantum_usecs / 1_000_000) as libc::time_t,
            tv_usec: (quantum_usecs % 1_000_000) as libc::suseconds_t,
        };
        Self {
            interval: libc::itimerval {
                it_interval: period,
                it_value: period,
            },
        }
    }

    /// (Re)start the period from now. Called once at init and again on
    /// every mid-quantum switch, so an incoming thread is never billed for
    /// its predecessor's partial quantum.
    pub fn arm(&self) {
        unsafe {
            if libc::setitimer(libc::ITIMER_VIRTUAL, &self.interval, ptr::null_mut()) != 0 {
                die("arming the virtual timer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer_signal_blocked() -> bool {
        unsafe {
            let mut current = MaybeUninit::<libc::sigset_t>::uninit();
            assert_eq!(
                libc::sigprocmask(libc::SIG_BLOCK, ptr::null(), current.as_mut_ptr()),
                0
            );
            libc::sigismember(current.as_ptr(), libc::SIGVTALRM) == 1
        }
    }

    #[test]
    fn guard_masks_for_its_scope_and_restores() {
        assert!(!timer_signal_blocked());
        {
            let _guard = TimerSignalGuard::new();
            assert!(timer_signal_blocked());
        }
        assert!(!timer_signal_blocked());
    }

    #[test]
    fn nested_guards_keep_the_mask_until_the_outermost_drops() {
        let outer = TimerSignalGuard::new();
        {
            let _inner = TimerSignalGuard::new();
            assert!(timer_signal_blocked());
        }
        assert!(timer_signal_blocked());
        drop(outer);
        assert!(!timer_signal_blocked());
    }
}
