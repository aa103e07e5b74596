pub mod scheduler;
pub mod tcb;

use crate::error::{Result, UthreadError};
use crate::types::{EntryPoint, ThreadId};
use scheduler::{RoundRobinScheduler, Scheduler};
use std::collections::{BTreeMap, BTreeSet};
use tcb::ThreadControlBlock;

/// Directory of live threads and their scheduling state.
///
/// A thread's state is encoded by set membership: running (`current`),
/// ready (queued in the scheduler), blocked, or waiting for the mutex.
/// Blocked and mutex-waiting may overlap; every other combination is
/// disjoint. Ids are recycled lowest-first through `free_ids`.
pub struct ThreadManager {
    threads: BTreeMap<ThreadId, ThreadControlBlock>,
    scheduler: Box<dyn Scheduler>,
    blocked: BTreeSet<ThreadId>,
    mutex_waiters: BTreeSet<ThreadId>,
    free_ids: BTreeSet<ThreadId>,
    current: ThreadId,
    stack_size: usize,
    trampoline: extern "C" fn(),
}

impl ThreadManager {
    /// Collection with the main thread installed as running and every
    /// other id in `[1, max_threads)` available.
    pub fn new(max_threads: usize, stack_size: usize, trampoline: extern "C" fn()) -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(ThreadId::MAIN, ThreadControlBlock::main_thread());
        let free_ids = (1..max_threads as u32).map(ThreadId::new).collect();
        Self {
            threads,
            // Pre-sized so enqueueing from the timer handler never grows it.
            scheduler: Box::new(RoundRobinScheduler::new(max_threads)),
            blocked: BTreeSet::new(),
            mutex_waiters: BTreeSet::new(),
            free_ids,
            current: ThreadId::MAIN,
            stack_size,
            trampoline,
        }
    }

    /// Admit a new thread under the lowest free id and queue it as ready.
    pub fn create_thread(&mut self, entry: EntryPoint) -> Result<ThreadId> {
        let Some(id) = self.free_ids.pop_first() else {
            return Err(UthreadError::ThreadLimitReached(self.threads.len()));
        };
        let record = ThreadControlBlock::new(id, self.stack_size, entry, self.trampoline);
        self.threads.insert(id, record);
        self.scheduler.enqueue(id);
        Ok(id)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn current_id(&self) -> ThreadId {
        self.current
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadControlBlock> {
        self.threads.get(&id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadControlBlock> {
        self.threads.get_mut(&id)
    }

    /// Remove every trace of `id` and recycle its id. Returns the record so
    /// the caller decides when the stack is freed; `current` is left alone,
    /// the caller owns the switch semantics when removing the running
    /// thread.
    pub fn remove(&mut self, id: ThreadId) -> Option<ThreadControlBlock> {
        let record = self.threads.remove(&id)?;
        debug_assert_eq!(record.id, id);
        self.scheduler.dequeue(id);
        self.mutex_waiters.remove(&id);
        self.blocked.remove(&id);
        self.free_ids.insert(id);
        Some(record)
    }

    /// Queue `id` unless it is running, already queued, blocked, or
    /// waiting for the mutex. Idempotent otherwise.
    pub fn mark_ready(&mut self, id: ThreadId) {
        if id != self.current
            && !self.scheduler.contains(id)
            && !self.mutex_waiters.contains(&id)
            && !self.blocked.contains(&id)
        {
            self.scheduler.enqueue(id);
        }
    }

    /// Enroll `id` as a mutex waiter. The caller suspends it via a context
    /// switch inside the same critical section.
    pub fn wait_for_mutex(&mut self, id: ThreadId) {
        self.mutex_waiters.insert(id);
    }

    /// Re-admit one mutex waiter after a release.
    ///
    /// Waiters that are also blocked are passed over; the lowest eligible
    /// waiter moves to the ready queue. If every waiter is blocked, one is
    /// dropped from the set without being queued: it re-attempts the lock
    /// from its own retry loop once resumed and rescheduled.
    pub fn advance_mutex_line(&mut self) {
        let eligible = self
            .mutex_waiters
            .iter()
            .copied()
            .find(|id| !self.blocked.contains(id));
        match eligible {
            Some(id) => {
                self.mutex_waiters.remove(&id);
                self.scheduler.enqueue(id);
            }
            None => {
                self.mutex_waiters.pop_first();
            }
        }
    }

    /// Unblock `id` and queue it, unless something else still suspends it.
    pub fn resume(&mut self, id: ThreadId) -> Result<()> {
        if !self.contains(id) {
            return Err(UthreadError::UnknownThread(id));
        }
        self.blocked.remove(&id);
        self.mark_ready(id);
        Ok(())
    }

    /// Move `id` to the blocked set. Mutex-waiter status is untouched.
    pub fn block(&mut self, id: ThreadId) {
        self.blocked.insert(id);
        self.scheduler.dequeue(id);
    }

    /// Crown the front of the ready queue as the running thread.
    ///
    /// Returns `None` and leaves `current` untouched when nothing is
    /// ready; the caller decides whether that means keep running (idle
    /// tick) or a fatal user-level deadlock (mandatory yield).
    pub fn pop_next_running(&mut self) -> Option<ThreadId> {
        let next = self.scheduler.schedule()?;
        self.current = next;
        Some(next)
    }

    pub fn has_ready(&self) -> bool {
        self.scheduler.has_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn unused_trampoline() {}

    fn noop() {}

    fn manager(max_threads: usize) -> ThreadManager {
        ThreadManager::new(max_threads, 16 * 1024, unused_trampoline)
    }

    #[test]
    fn starts_with_main_running_and_the_rest_free() {
        let manager = manager(4);
        assert_eq!(manager.current_id(), ThreadId::MAIN);
        assert!(manager.contains(ThreadId::MAIN));
        assert_eq!(manager.threads.len(), 1);
        assert!(!manager.has_ready());
        assert_eq!(manager.get(ThreadId::MAIN).unwrap().quantums, 1);
    }

    #[test]
    fn pop_next_running_with_nothing_ready_is_none() {
        let mut manager = manager(4);
        assert_eq!(manager.pop_next_running(), None);
        assert_eq!(manager.current_id(), ThreadId::MAIN);
    }

    #[test]
    fn create_assigns_lowest_free_ids_in_order() {
        let mut manager = manager(8);
        assert_eq!(manager.create_thread(noop).unwrap(), ThreadId::new(1));
        assert_eq!(manager.create_thread(noop).unwrap(), ThreadId::new(2));
        assert_eq!(manager.create_thread(noop).unwrap(), ThreadId::new(3));
        assert!(manager.has_ready());
    }

    #[test]
    fn create_fails_once_the_pool_is_exhausted() {
        let mut manager = manager(3);
        manager.create_thread(noop).unwrap();
        manager.create_thread(noop).unwrap();
        assert_eq!(
            manager.create_thread(noop),
            Err(UthreadError::ThreadLimitReached(3))
        );
    }

    #[test]
    fn remove_recycles_the_id_for_the_next_create() {
        let mut manager = manager(8);
        let first = manager.create_thread(noop).unwrap();
        let _second = manager.create_thread(noop).unwrap();

        assert!(manager.remove(first).is_some());
        assert!(!manager.contains(first));
        assert_eq!(manager.create_thread(noop).unwrap(), first);
    }

    #[test]
    fn spawn_terminate_round_trip_restores_pool_cardinality() {
        let mut manager = manager(4);
        for _ in 0..10 {
            let id = manager.create_thread(noop).unwrap();
            assert_eq!(id, ThreadId::new(1));
            assert!(manager.remove(id).is_some());
            assert_eq!(manager.threads.len(), 1);
        }
    }

    #[test]
    fn remove_erases_the_thread_from_every_set() {
        let mut manager = manager(8);
        let id = manager.create_thread(noop).unwrap();
        manager.block(id);
        manager.wait_for_mutex(id);

        let record = manager.remove(id).unwrap();
        assert_eq!(record.id, id);
        assert!(!manager.contains(id));
        assert!(manager.blocked.is_empty());
        assert!(manager.mutex_waiters.is_empty());
        assert!(!manager.scheduler.contains(id));
        assert!(manager.free_ids.contains(&id));
    }

    #[test]
    fn remove_of_unknown_id_is_none() {
        let mut manager = manager(4);
        assert!(manager.remove(ThreadId::new(2)).is_none());
    }

    #[test]
    fn pop_next_running_rotates_in_fifo_order() {
        let mut manager = manager(8);
        let first = manager.create_thread(noop).unwrap();
        let second = manager.create_thread(noop).unwrap();

        assert_eq!(manager.pop_next_running(), Some(first));
        assert_eq!(manager.current_id(), first);
        manager.mark_ready(ThreadId::MAIN);
        assert_eq!(manager.pop_next_running(), Some(second));
        assert_eq!(manager.current_id(), second);
        manager.mark_ready(first);
        assert_eq!(manager.pop_next_running(), Some(ThreadId::MAIN));
        assert_eq!(manager.current_id(), ThreadId::MAIN);
    }

    #[test]
    fn mark_ready_skips_the_running_thread() {
        let mut manager = manager(4);
        manager.mark_ready(ThreadId::MAIN);
        assert!(!manager.has_ready());
    }

    #[test]
    fn mark_ready_does_not_duplicate_a_queued_thread() {
        let mut manager = manager(4);
        let id = manager.create_thread(noop).unwrap();
        manager.mark_ready(id);

        assert_eq!(manager.pop_next_running(), Some(id));
        assert!(!manager.has_ready());
    }

    #[test]
    fn mark_ready_skips_blocked_and_waiting_threads() {
        let mut manager = manager(8);
        let blocked = manager.create_thread(noop).unwrap();
        let waiting = manager.create_thread(noop).unwrap();
        manager.block(blocked);
        manager.scheduler.dequeue(waiting);
        manager.wait_for_mutex(waiting);

        manager.mark_ready(blocked);
        manager.mark_ready(waiting);
        assert!(!manager.scheduler.contains(blocked));
        assert!(!manager.scheduler.contains(waiting));
    }

    #[test]
    fn block_pulls_a_thread_out_of_the_ready_queue() {
        let mut manager = manager(4);
        let id = manager.create_thread(noop).unwrap();
        manager.block(id);

        assert!(!manager.has_ready());
        assert!(manager.blocked.contains(&id));
    }

    #[test]
    fn resume_of_unknown_id_fails() {
        let mut manager = manager(4);
        assert_eq!(
            manager.resume(ThreadId::new(3)),
            Err(UthreadError::UnknownThread(ThreadId::new(3)))
        );
    }

    #[test]
    fn resume_moves_a_blocked_thread_back_to_ready() {
        let mut manager = manager(4);
        let id = manager.create_thread(noop).unwrap();
        manager.block(id);

        manager.resume(id).unwrap();
        assert!(manager.scheduler.contains(id));
        assert!(manager.blocked.is_empty());
    }

    #[test]
    fn resume_of_a_ready_thread_changes_nothing() {
        let mut manager = manager(4);
        let id = manager.create_thread(noop).unwrap();

        manager.resume(id).unwrap();
        assert_eq!(manager.pop_next_running(), Some(id));
        assert_eq!(manager.current_id(), id);
        // Only one queue entry existed.
        assert!(!manager.has_ready());
    }

    #[test]
    fn resume_leaves_a_mutex_waiter_suspended() {
        let mut manager = manager(4);
        let id = manager.create_thread(noop).unwrap();
        manager.scheduler.dequeue(id);
        manager.wait_for_mutex(id);
        manager.block(id);

        manager.resume(id).unwrap();
        assert!(manager.blocked.is_empty());
        assert!(manager.mutex_waiters.contains(&id));
        // Still not ready: only advance_mutex_line re-admits it.
        assert!(!manager.scheduler.contains(id));
    }

    #[test]
    fn advance_with_no_waiters_is_a_noop() {
        let mut manager = manager(4);
        manager.advance_mutex_line();
        assert!(!manager.has_ready());
    }

    #[test]
    fn advance_admits_the_lowest_waiter() {
        let mut manager = manager(8);
        let first = manager.create_thread(noop).unwrap();
        let second = manager.create_thread(noop).unwrap();
        manager.scheduler.dequeue(first);
        manager.scheduler.dequeue(second);
        manager.wait_for_mutex(second);
        manager.wait_for_mutex(first);

        manager.advance_mutex_line();
        assert!(manager.scheduler.contains(first));
        assert!(!manager.scheduler.contains(second));
        assert!(manager.mutex_waiters.contains(&second));
    }

    #[test]
    fn advance_skips_waiters_that_are_also_blocked() {
        let mut manager = manager(8);
        let first = manager.create_thread(noop).unwrap();
        let second = manager.create_thread(noop).unwrap();
        manager.scheduler.dequeue(first);
        manager.scheduler.dequeue(second);
        manager.wait_for_mutex(first);
        manager.wait_for_mutex(second);
        manager.block(first);

        manager.advance_mutex_line();
        assert!(manager.scheduler.contains(second));
        assert!(manager.mutex_waiters.contains(&first));
    }

    #[test]
    fn advance_with_every_waiter_blocked_drops_one_without_queueing() {
        let mut manager = manager(8);
        let id = manager.create_thread(noop).unwrap();
        manager.scheduler.dequeue(id);
        manager.wait_for_mutex(id);
        manager.block(id);

        manager.advance_mutex_line();
        assert!(manager.mutex_waiters.is_empty());
        assert!(!manager.scheduler.contains(id));
        assert!(manager.blocked.contains(&id));
    }

    #[test]
    fn scheduling_sets_stay_disjoint_through_transitions() {
        let mut manager = manager(8);
        let a = manager.create_thread(noop).unwrap();
        let b = manager.create_thread(noop).unwrap();

        manager.block(a);
        manager.scheduler.dequeue(b);
        manager.wait_for_mutex(b);

        // a: blocked only; b: waiting only; main: running.
        assert!(!manager.scheduler.contains(a));
        assert!(!manager.scheduler.contains(b));
        assert!(!manager.mutex_waiters.contains(&a));
        assert!(!manager.blocked.contains(&b));
        assert!(!manager.free_ids.contains(&a));
        assert!(!manager.free_ids.contains(&b));
    }
}
