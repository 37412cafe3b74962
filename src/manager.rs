use crate::config::LockManagerConfig;
use crate::err::{CallbackResult, LockError, Result};
use crate::file_lock::{FileLock, FileLockStats, LockAttempt};
use crate::level::{ascend_levels, LockLevel};
use crate::logging;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

/// The capability this crate exposes to a host database engine: a small
/// capability interface of `{lock, lock_result, unlock}`, allowing a host to
/// depend on the contract rather than on
/// [`LockManager`] directly and to swap in [`crate::manager::NullLockManager`]
/// for tests that don't want real arbitration.
pub trait LockCoordinator<C> {
    /// Arbitrate a promotion to `level` for `client` on `filename`, then
    /// invoke `callback` once per intermediate native-lock level crossed.
    fn lock(
        &self,
        filename: &str,
        level: LockLevel,
        client: C,
        callback: impl FnMut(LockLevel) -> CallbackResult<()>,
    ) -> Result<()>;

    fn unlock(&self, filename: &str, level: LockLevel, client: &C) -> Result<()>;

    fn lock_result(&self, filename: &str, client: &C, resultcode: i32) -> Result<()>;

    fn is_idle(&self) -> bool;
}

struct ManagerState<C> {
    filelocks: HashMap<String, FileLock<C>>,
}

/// Map from filename to [`FileLock`], routing `lock`/`lock_result`/`unlock`
/// calls and owning the single monitor mutex shared by every `FileLock` it
/// creates.
///
/// A `FileLock` is created the first time a filename is mentioned and
/// dropped from the map the moment it becomes idle at the end of any
/// top-level call — mirroring the teacher's per-path registry in spirit,
/// though here the registry and the mutex are one and the same, not a
/// separate `OnceLock<Mutex<HashMap<..>>>` plus per-entry locks, since every
/// `FileLock` must share exactly one mutex with the manager, since the whole
/// scheduler assumes a single reentrant-in-spirit monitor.
pub struct LockManager<C> {
    state: Mutex<ManagerState<C>>,
    timeout: Option<Duration>,
}

impl<C: Eq + Hash + Clone> LockManager<C> {
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    pub fn with_config(config: LockManagerConfig) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                filelocks: HashMap::new(),
            }),
            timeout: config.timeout(),
        }
    }

    /// Arbitrate in memory, then drive the host's native-lock `callback`
    /// outside the mutex (it may perform real file I/O), rolling back on
    /// failure — the exact two-phase protocol a host's native locking layer
    /// expects.
    pub fn lock(
        &self,
        filename: &str,
        level: LockLevel,
        client: C,
        mut callback: impl FnMut(LockLevel) -> CallbackResult<()>,
    ) -> Result<()> {
        level.require_requestable()?;

        let old_level = self.begin_lock(filename, level, client.clone())?;

        let mut failure: Option<CallbackResult<()>> = None;
        for step in ascend_levels(old_level, level) {
            if let Err(err) = callback(step) {
                failure = Some(Err(err));
                break;
            }
        }

        match failure {
            None => {
                self.lock_result(filename, &client, 0)?;
                Ok(())
            }
            Some(Err(err)) => {
                // Best-effort rollback; a roll-back failure would indicate a
                // logic error in this crate, not a host failure, so it is not
                // swallowed — it replaces the callback error as the more
                // actionable one.
                self.lock_result(filename, &client, 1)?;
                logging::logger().warn(format!(
                    "native lock callback failed for client on {filename:?}: {err}"
                ));
                Err(LockError::Callback(err))
            }
        }
    }

    fn begin_lock(&self, filename: &str, level: LockLevel, client: C) -> Result<LockLevel> {
        let mut state = self.state.lock();
        let file_lock = state
            .filelocks
            .entry(filename.to_string())
            .or_insert_with(|| FileLock::new(self.timeout));

        let attempt = match file_lock.begin_lock(level, client) {
            Ok(attempt) => attempt,
            Err(err) => {
                Self::evict_if_idle(&mut state, filename);
                return Err(err);
            }
        };

        let waiter = match attempt {
            LockAttempt::Granted(old_level) => return Ok(old_level),
            LockAttempt::Blocked(waiter) => waiter,
        };

        let old_level = waiter.old_level;
        let timeout = file_lock.timeout();

        loop {
            waiter.wait(&mut state, timeout);

            if waiter.got_lock() {
                return Ok(old_level);
            }

            if waiter.timed_out() {
                let file_lock = state
                    .filelocks
                    .get_mut(filename)
                    .expect("FileLock must still exist while a waiter of ours is registered on it");
                file_lock.handle_timeout(&waiter)?;

                if waiter.got_lock() {
                    return Ok(old_level);
                }

                Self::evict_if_idle(&mut state, filename);
                return Err(LockError::Deadlock);
            }
            // Spurious wakeup with neither flag set: loop and wait again.
        }
    }

    pub fn unlock(&self, filename: &str, level: LockLevel, client: &C) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file_lock) = state.filelocks.get_mut(filename) {
            file_lock.unlock(level, client)?;
        }
        Self::evict_if_idle(&mut state, filename);
        Ok(())
    }

    pub fn lock_result(&self, filename: &str, client: &C, resultcode: i32) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file_lock) = state.filelocks.get_mut(filename) {
            file_lock.lock_result(client, resultcode)?;
        }
        Self::evict_if_idle(&mut state, filename);
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().filelocks.is_empty()
    }

    /// Per-file holder/waiter counts, for diagnostics. Returns `None`
    /// if no `FileLock` is currently registered for `filename`.
    pub fn stats(&self, filename: &str) -> Option<FileLockStats> {
        self.state.lock().filelocks.get(filename).map(FileLock::stats)
    }

    fn evict_if_idle(state: &mut ManagerState<C>, filename: &str) {
        if state.filelocks.get(filename).is_some_and(FileLock::is_idle) {
            state.filelocks.remove(filename);
        }
    }
}

impl<C: Eq + Hash + Clone> Default for LockManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Eq + Hash + Clone> fmt::Display for LockManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        if state.filelocks.is_empty() {
            return write!(f, "LockManager {{ idle }}");
        }
        write!(f, "LockManager {{ ")?;
        for (name, file_lock) in &state.filelocks {
            let stats = file_lock.stats();
            write!(
                f,
                "{name:?}: {{ holders: {:?}, blocked: {} }}, ",
                stats.level_counts, stats.blocked
            )?;
        }
        write!(f, "}}")
    }
}

impl<C: Eq + Hash + Clone> LockCoordinator<C> for LockManager<C> {
    fn lock(
        &self,
        filename: &str,
        level: LockLevel,
        client: C,
        callback: impl FnMut(LockLevel) -> CallbackResult<()>,
    ) -> Result<()> {
        LockManager::lock(self, filename, level, client, callback)
    }

    fn unlock(&self, filename: &str, level: LockLevel, client: &C) -> Result<()> {
        LockManager::unlock(self, filename, level, client)
    }

    fn lock_result(&self, filename: &str, client: &C, resultcode: i32) -> Result<()> {
        LockManager::lock_result(self, filename, client, resultcode)
    }

    fn is_idle(&self) -> bool {
        LockManager::is_idle(self)
    }
}

/// A pass-through [`LockCoordinator`] that never arbitrates: every `lock`
/// call runs the native callback for the full span from `NONE` to `level`
/// and never blocks. Useful
/// for hosts or tests that want the native-lock callback sequencing without
/// paying for fairness bookkeeping.
#[derive(Debug, Default)]
pub struct NullLockManager;

impl<C> LockCoordinator<C> for NullLockManager {
    fn lock(
        &self,
        _filename: &str,
        level: LockLevel,
        _client: C,
        mut callback: impl FnMut(LockLevel) -> CallbackResult<()>,
    ) -> Result<()> {
        level.require_requestable()?;
        for step in ascend_levels(LockLevel::None, level) {
            callback(step).map_err(LockError::Callback)?;
        }
        Ok(())
    }

    fn unlock(&self, _filename: &str, _level: LockLevel, _client: &C) -> Result<()> {
        Ok(())
    }

    fn lock_result(&self, _filename: &str, _client: &C, _resultcode: i32) -> Result<()> {
        Ok(())
    }

    fn is_idle(&self) -> bool {
        true
    }
}
