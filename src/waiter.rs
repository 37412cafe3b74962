use crate::level::LockLevel;
use parking_lot::Condvar;
use std::sync::atomic::{AtomicBool, Ordering};

/// A client currently blocked inside [`crate::manager::LockManager::lock`],
/// represented by the record sitting on a [`crate::file_lock::FileLock`]'s
/// FIFO queue.
///
/// Every `Waiter` has its own condition variable — this avoids thundering-herd
/// wakeups and matches the "signal one specific waiter" pattern the scheduler
/// uses — but all of them ride on the single monitor mutex owned by
/// [`crate::manager::LockManager`]; that's why `wait`/`signal` take it as a
/// parameter rather than owning it themselves.
pub(crate) struct Waiter<C> {
    pub client: C,
    pub target: LockLevel,
    /// The level `client` held immediately before this `lock` call — needed
    /// once the request is granted, to report `old_level` back to the caller
    /// and to seed `FileLock::previous_level` for a possible later rollback.
    pub old_level: LockLevel,
    condvar: Condvar,
    got_lock: AtomicBool,
    timed_out: AtomicBool,
}

impl<C> Waiter<C> {
    pub fn new(client: C, target: LockLevel, old_level: LockLevel) -> Self {
        Self {
            client,
            target,
            old_level,
            condvar: Condvar::new(),
            got_lock: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn got_lock(&self) -> bool {
        self.got_lock.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    /// Signal that this waiter's lock request has been granted. Must be
    /// called while holding the monitor mutex that guards the queue this
    /// waiter sits on, per the monitor pattern. A waiter is signalled at most
    /// once.
    pub fn signal(&self) {
        self.got_lock.store(true, Ordering::SeqCst);
        self.condvar.notify_one();
    }

    /// Block the calling thread on this waiter's condition until it is
    /// signalled or `deadline` elapses, releasing `guard` for the duration
    /// (the monitor-pattern suspension point). Returns the reacquired guard.
    ///
    /// A timeout that races with a concurrent `signal()` never loses the
    /// wakeup: the condition passed to `wait_while_for` re-checks
    /// `got_lock()` under the lock on every wakeup, including the final one,
    /// so a signal delivered right at the deadline is still observed.
    pub fn wait<T>(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, T>,
        deadline: Option<std::time::Duration>,
    ) {
        if self.got_lock() {
            return;
        }
        match deadline {
            None => {
                self.condvar.wait_while(guard, |_| !self.got_lock());
            }
            Some(timeout) => {
                let timed_out = self
                    .condvar
                    .wait_while_for(guard, |_| !self.got_lock(), timeout)
                    .timed_out();
                if timed_out && !self.got_lock() {
                    self.mark_timed_out();
                }
            }
        }
    }
}
