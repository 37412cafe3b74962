use crate::err::{LockError, Result};
use crate::level::LockLevel;
use crate::waiter::Waiter;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`FileLock::begin_lock`]: either the promotion was granted
/// without blocking, or the caller must now wait on the returned [`Waiter`].
pub(crate) enum LockAttempt<C> {
    Granted(LockLevel),
    Blocked(Arc<Waiter<C>>),
}

/// Per-file holder/waiter histogram, for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct FileLockStats {
    pub level_counts: BTreeMap<LockLevel, usize>,
    pub blocked: usize,
}

/// The per-file state machine: current holders, the FIFO of blocked
/// waiters, and the bookkeeping needed to roll back a failed native-lock
/// callback.
///
/// Every method here assumes the caller already holds the single monitor
/// mutex shared with [`crate::manager::LockManager`] — `FileLock` never locks
/// anything itself (reentrant monitors don't map cleanly onto Rust; this is the
/// Rust answer to it: one lock acquired once at the top, state threaded down
/// by `&mut` instead of re-acquired).
pub(crate) struct FileLock<C> {
    holders: HashMap<C, LockLevel>,
    waiters: VecDeque<Arc<Waiter<C>>>,
    previous_level: HashMap<C, LockLevel>,
    timeout: Option<Duration>,
}

impl<C: Eq + Hash + Clone> FileLock<C> {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            holders: HashMap::new(),
            waiters: VecDeque::new(),
            previous_level: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }

    pub fn stats(&self) -> FileLockStats {
        let mut level_counts = BTreeMap::new();
        for level in self.holders.values() {
            *level_counts.entry(*level).or_insert(0) += 1;
        }
        FileLockStats {
            level_counts,
            blocked: self.waiters.len(),
        }
    }

    fn held_level(&self, client: &C) -> LockLevel {
        self.holders.get(client).copied().unwrap_or(LockLevel::None)
    }

    fn max_other_level(&self, exclude: &C) -> LockLevel {
        self.holders
            .iter()
            .filter(|(c, _)| *c != exclude)
            .map(|(_, level)| *level)
            .max()
            .unwrap_or(LockLevel::None)
    }

    /// Begin a `lock(level, client)` request. Returns immediately with the
    /// previously held level if already satisfied, refuses synchronously with
    /// [`LockError::Deadlock`] if the promotion is the one unsafe cycle this
    /// engine preempts, or enqueues the client and runs one scheduler pass —
    /// returning either a synchronous grant or a [`Waiter`] the caller must
    /// now block on.
    pub fn begin_lock(&mut self, level: LockLevel, client: C) -> Result<LockAttempt<C>> {
        level.require_requestable()?;

        let old_level = self.held_level(&client);
        if level <= old_level {
            return Ok(LockAttempt::Granted(old_level));
        }

        // Deadlock avoidance: a SHARED holder promoting to RESERVED/EXCLUSIVE
        // while someone else already holds >= RESERVED would wait on a client
        // that, symmetrically, waits on it. Refuse before ever enqueuing, per
        // deliberate design choice — this is the only deadlock check in the
        // engine. A SHARED holder promoting straight to EXCLUSIVE while the
        // only other holders are themselves SHARED is not this cycle — it is
        // handled by the scheduler's EXCLUSIVE arm, which parks the waiter at
        // PENDING until those readers drain.
        if level > LockLevel::Shared && old_level == LockLevel::Shared {
            let max_level = self.holders.values().copied().max().unwrap_or(LockLevel::None);
            if max_level > LockLevel::Shared {
                return Err(LockError::Deadlock);
            }
        }

        let waiter = Arc::new(Waiter::new(client.clone(), level, old_level));

        // Queue discipline: FIFO, except a RESERVED holder promoting to
        // EXCLUSIVE jumps to the head — it is uniquely privileged to become
        // PENDING/EXCLUSIVE, and letting newer SHARED waiters cut ahead of it
        // would deadlock the promotion.
        if level == LockLevel::Exclusive && old_level == LockLevel::Reserved {
            self.waiters.push_front(waiter.clone());
        } else {
            self.waiters.push_back(waiter.clone());
        }

        self.drain_waiters()?;

        if waiter.got_lock() {
            return Ok(LockAttempt::Granted(old_level));
        }
        Ok(LockAttempt::Blocked(waiter))
    }

    /// Downgrade-only. Called both by a client voluntarily releasing/lowering
    /// its lock and, with a nonzero result code, by [`Self::lock_result`]
    /// rolling back a failed native-lock callback.
    pub fn unlock(&mut self, level: LockLevel, client: &C) -> Result<()> {
        self.previous_level.remove(client);

        let old_level = self.held_level(client);
        if level >= old_level {
            return Ok(());
        }

        if level == LockLevel::None {
            self.holders.remove(client);
        } else {
            self.holders.insert(client.clone(), level);
        }

        self.drain_waiters()
    }

    /// Called by the manager after it has run the host's native-lock
    /// callback for every intermediate level. `resultcode == 0` commits the
    /// promotion (the saved pre-call level is simply discarded); any other
    /// value rolls back to the level held before the `lock` call.
    pub fn lock_result(&mut self, client: &C, resultcode: i32) -> Result<()> {
        if resultcode == 0 {
            self.previous_level.remove(client);
            Ok(())
        } else {
            let previous = self.previous_level.remove(client).unwrap_or(LockLevel::None);
            self.unlock(previous, client)
        }
    }

    /// Called when a blocked waiter's timeout elapsed without being signalled.
    /// Splices it out of the queue and re-runs the scheduler, since removing
    /// a blocker can unblock whoever was queued behind it.
    pub fn handle_timeout(&mut self, waiter: &Arc<Waiter<C>>) -> Result<()> {
        if waiter.got_lock() {
            return Ok(());
        }
        self.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        self.drain_waiters()
    }

    fn grant(&mut self, waiter: &Arc<Waiter<C>>, level: LockLevel) {
        self.previous_level.insert(waiter.client.clone(), waiter.old_level);
        self.holders.insert(waiter.client.clone(), level);
        waiter.signal();
    }

    /// Walk the queue from the head, granting every waiter the scheduler
    /// table allows, stopping at the first one that must
    /// keep waiting. Run after every state change.
    fn drain_waiters(&mut self) -> Result<()> {
        const ITERATION_CAP: usize = 100;
        let mut iterations = 0;

        loop {
            let Some(front) = self.waiters.front().cloned() else {
                break;
            };

            iterations += 1;
            if iterations > ITERATION_CAP {
                return Err(LockError::InvariantViolation(
                    "scheduler exceeded its iteration cap; this indicates a logic error, not a \
                     legitimate queue depth"
                        .to_string(),
                ));
            }

            let max_other = self.max_other_level(&front.client);

            match front.target {
                LockLevel::Shared => {
                    if max_other <= LockLevel::Reserved {
                        self.waiters.pop_front();
                        self.grant(&front, LockLevel::Shared);
                    } else {
                        break;
                    }
                }
                LockLevel::Reserved => {
                    if max_other <= LockLevel::Shared {
                        self.waiters.pop_front();
                        self.grant(&front, LockLevel::Reserved);
                    } else {
                        break;
                    }
                }
                LockLevel::Exclusive => {
                    let held = self.holders.get(&front.client).copied();
                    let sole_holder = held.is_some() && self.holders.len() == 1;

                    if self.holders.is_empty() || sole_holder {
                        self.waiters.pop_front();
                        self.grant(&front, LockLevel::Exclusive);
                    } else {
                        match held {
                            Some(LockLevel::Reserved) | Some(LockLevel::Pending) => {
                                // Already RESERVED: become PENDING and wait for
                                // the remaining SHARED readers to drain. Not
                                // signalled — the waiter stays blocked.
                                self.holders.insert(front.client.clone(), LockLevel::Pending);
                            }
                            Some(LockLevel::Shared) => {
                                // W holds SHARED itself and asks for EXCLUSIVE
                                // directly (no intervening RESERVED). Other
                                // holders here are guaranteed to be SHARED too:
                                // `begin_lock`'s synchronous deadlock check
                                // already refused this promotion if any other
                                // client held >= RESERVED at enqueue time, and
                                // invariant 4 (at most one holder above SHARED)
                                // rules it out since. Park at PENDING and wait
                                // for the other readers to drain, same as a
                                // non-holding waiter racing the same readers.
                                if max_other <= LockLevel::Shared {
                                    self.holders.insert(front.client.clone(), LockLevel::Pending);
                                }
                            }
                            Some(LockLevel::Exclusive) | Some(LockLevel::None) => {
                                unreachable!(
                                    "holders never stores NONE, and a client already holding \
                                     EXCLUSIVE is satisfied before it is ever enqueued"
                                )
                            }
                            None => {
                                if max_other <= LockLevel::Shared {
                                    // All other holders are SHARED: block new
                                    // SHARED arrivals behind this PENDING marker.
                                    self.holders.insert(front.client.clone(), LockLevel::Pending);
                                }
                                // else: someone else already holds >= RESERVED;
                                // just keep waiting, no PENDING marker needed.
                            }
                        }
                    }
                    break;
                }
                LockLevel::None | LockLevel::Pending => {
                    return Err(LockError::InvariantViolation(format!(
                        "waiter enqueued with non-requestable target level {:?}",
                        front.target
                    )));
                }
            }
        }

        self.check_invariants()
    }

    fn check_invariants(&self) -> Result<()> {
        let levels: Vec<LockLevel> = self.holders.values().copied().collect();
        let max_level = levels.iter().copied().max().unwrap_or(LockLevel::None);

        if !self.waiters.is_empty() && self.holders.is_empty() {
            return Err(LockError::InvariantViolation(
                "clients are waiting but nobody holds a lock".to_string(),
            ));
        }

        if let Some(front) = self.waiters.front() {
            if front.target == LockLevel::Shared && max_level < LockLevel::Pending {
                return Err(LockError::InvariantViolation(
                    "head waiter wants SHARED but the max holder level is below PENDING; it \
                     should have been granted already"
                        .to_string(),
                ));
            }
        }

        if levels.iter().filter(|&&level| level > LockLevel::Shared).count() > 1 {
            return Err(LockError::InvariantViolation(
                "more than one client holds a level above SHARED".to_string(),
            ));
        }

        if levels.contains(&LockLevel::Exclusive) && self.holders.len() != 1 {
            return Err(LockError::InvariantViolation(
                "an EXCLUSIVE holder is not the sole holder".to_string(),
            ));
        }

        if levels.contains(&LockLevel::Pending) && self.holders.len() <= 1 {
            return Err(LockError::InvariantViolation(
                "a PENDING holder exists with no other holder to wait for".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt_granted<C>(attempt: Result<LockAttempt<C>>) -> LockLevel {
        match attempt.expect("begin_lock should not error") {
            LockAttempt::Granted(old) => old,
            LockAttempt::Blocked(_) => panic!("expected an immediate grant"),
        }
    }

    #[test]
    fn many_shared_locks_grant_without_blocking() {
        let mut lock: FileLock<&'static str> = FileLock::new(Some(Duration::from_secs(1)));
        for client in ["a", "b", "c"] {
            attempt_granted(lock.begin_lock(LockLevel::Shared, client));
        }
        assert_eq!(lock.stats().level_counts.get(&LockLevel::Shared), Some(&3));
    }

    #[test]
    fn repeated_lock_at_same_level_is_a_no_op() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        attempt_granted(lock.begin_lock(LockLevel::Shared, "a"));
        let old = attempt_granted(lock.begin_lock(LockLevel::Shared, "a"));
        assert_eq!(old, LockLevel::Shared);
    }

    #[test]
    fn shared_to_reserved_promotion_is_refused_when_another_holds_reserved() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        attempt_granted(lock.begin_lock(LockLevel::Reserved, "a"));
        attempt_granted(lock.begin_lock(LockLevel::Shared, "b"));

        let err = lock.begin_lock(LockLevel::Reserved, "b").unwrap_err();
        assert!(err.is_deadlock());
        let err = lock.begin_lock(LockLevel::Exclusive, "b").unwrap_err();
        assert!(err.is_deadlock());
    }

    #[test]
    fn exclusive_blocks_behind_existing_exclusive_holder() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        attempt_granted(lock.begin_lock(LockLevel::Exclusive, "writer"));

        match lock.begin_lock(LockLevel::Shared, "reader").unwrap() {
            LockAttempt::Blocked(waiter) => assert!(!waiter.got_lock()),
            LockAttempt::Granted(_) => panic!("reader should have blocked"),
        }
    }

    #[test]
    fn unlock_without_a_prior_lock_is_harmless() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        lock.unlock(LockLevel::None, &"nobody").unwrap();
        assert!(lock.is_idle());
    }

    #[test]
    fn lock_result_failure_rolls_back_to_previous_level() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        attempt_granted(lock.begin_lock(LockLevel::Shared, "a"));
        attempt_granted(lock.begin_lock(LockLevel::Reserved, "a"));

        lock.lock_result(&"a", 1).unwrap();
        assert_eq!(lock.held_level(&"a"), LockLevel::Shared);
    }

    #[test]
    fn lock_result_success_discards_previous_level() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        attempt_granted(lock.begin_lock(LockLevel::Shared, "a"));
        lock.lock_result(&"a", 0).unwrap();
        assert_eq!(lock.held_level(&"a"), LockLevel::Shared);
    }

    #[test]
    fn shared_holder_promoting_straight_to_exclusive_parks_instead_of_asserting() {
        let mut lock: FileLock<&'static str> = FileLock::new(None);
        attempt_granted(lock.begin_lock(LockLevel::Shared, "a"));
        attempt_granted(lock.begin_lock(LockLevel::Shared, "b"));

        // "a" already holds SHARED and asks for EXCLUSIVE directly, with no
        // other holder above SHARED — this is not the deadlock the
        // synchronous check refuses, and must not panic the scheduler.
        let waiter = match lock.begin_lock(LockLevel::Exclusive, "a").unwrap() {
            LockAttempt::Blocked(waiter) => waiter,
            LockAttempt::Granted(_) => panic!("should block behind the other SHARED reader"),
        };
        assert!(!waiter.got_lock());
        assert_eq!(lock.held_level(&"a"), LockLevel::Pending);

        lock.unlock(LockLevel::None, &"b").unwrap();
        assert!(waiter.got_lock());
        assert_eq!(lock.held_level(&"a"), LockLevel::Exclusive);
    }
}
