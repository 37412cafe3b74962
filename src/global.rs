//! Process-wide default [`LockManager`], for hosts that want a single
//! shared instance rather than threading one through explicitly.
//!
//! The original source kept the "current lock manager" in a mutable
//! module-level slot with a getter/setter pair that tests would overwrite
//! between runs. In a systems
//! language this becomes "a process-wide atomically-initialised singleton
//! behind a function-style accessor — not a mutable variable that tests
//! rewrite". `OnceLock` is that accessor: first caller wins, no
//! reassignment afterwards.

use crate::config::LockManagerConfig;
use crate::manager::LockManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// An opaque, hashable client identity — the concrete type the global
/// singleton is keyed on. Each value should identify one connection or
/// thread; [`ClientId::next`] mints a fresh one for callers that don't
/// already have a natural identity to reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Mint a process-unique id from a shared counter. Never reuses a value
    /// within the process's lifetime.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

static DEFAULT_MANAGER: OnceLock<LockManager<ClientId>> = OnceLock::new();

/// Install the process-wide default manager with a specific configuration.
/// Returns `Err(config)` if a default manager was already installed (by this
/// call or by an earlier [`default_manager`] access) — the first caller
/// wins, matching the singleton discipline above.
pub fn install_default_manager(config: LockManagerConfig) -> std::result::Result<(), LockManagerConfig> {
    DEFAULT_MANAGER
        .set(LockManager::with_config(config))
        .map_err(|_| config)
}

/// The process-wide default [`LockManager`]. Lazily installed with
/// [`LockManagerConfig::default`] on first access if nothing has called
/// [`install_default_manager`] yet.
pub fn default_manager() -> &'static LockManager<ClientId> {
    DEFAULT_MANAGER.get_or_init(|| LockManager::with_config(LockManagerConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::LockLevel;
    use serial_test::serial;
    use std::time::Duration;

    // The singleton is process-global, so these tests serialize against each
    // other to avoid one test's installation racing another's first access.

    #[test]
    #[serial]
    fn install_before_first_access_takes_effect() {
        let config = LockManagerConfig::new().with_timeout(Some(Duration::from_millis(1)));
        let _ = install_default_manager(config);
        // We cannot inspect the installed timeout directly (LockManager does
        // not expose it), but a second install attempt must be refused,
        // proving the slot cannot be silently rewritten.
        let second = install_default_manager(LockManagerConfig::new());
        assert!(second.is_err());
    }

    #[test]
    #[serial]
    fn default_manager_is_usable_once_installed() {
        let _ = install_default_manager(LockManagerConfig::default());
        let manager = default_manager();
        manager
            .lock("global-test-file", LockLevel::Shared, ClientId::next(), |_| Ok(()))
            .unwrap();
        assert!(!manager.is_idle());
    }

    #[test]
    fn client_ids_are_never_reused() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
    }
}
