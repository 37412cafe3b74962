use crate::level::LockLevel;
use std::fmt::{self, Debug, Display, Formatter};

/// Error raised by the native-lock callback the host supplies to [`crate::manager::LockManager::lock`].
///
/// Boxed and type-erased so `fairlock` never needs to know the host's concrete
/// error type; the original error is preserved and reachable via
/// [`std::error::Error::source`] on [`LockError::Callback`].
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type CallbackResult<T> = std::result::Result<T, CallbackError>;

pub type Result<T> = std::result::Result<T, LockError>;

/// The error taxonomy described by the lock manager's contract.
///
/// `Deadlock` is the only variant the host is expected to special-case (it
/// maps to the host's "busy, retry later" response); the others indicate a
/// programmer error in how the manager was called, or a failure raised by the
/// host's own native-lock callback.
pub enum LockError {
    /// A promotion was refused because it could not be granted without risking
    /// a cycle, or a waiter's timeout expired before it reached the head of
    /// the queue and was granted. Both cases are reported identically, as
    /// specified.
    Deadlock,

    /// `lock` was called with a level outside `{Shared, Reserved, Exclusive}`.
    InvalidLevel(LockLevel),

    /// The host's native-lock callback returned an error. In-memory state has
    /// already been rolled back to the level held before the call by the time
    /// this is returned to the caller.
    Callback(CallbackError),

    /// An internal invariant did not hold where it must.
    /// Surfaced rather than panicking so test suites can assert on it.
    InvariantViolation(String),
}

impl Debug for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Deadlock => write!(f, "Deadlock"),
            LockError::InvalidLevel(level) => write!(f, "InvalidLevel({level:?})"),
            LockError::Callback(err) => write!(f, "Callback({err})"),
            LockError::InvariantViolation(msg) => write!(f, "InvariantViolation({msg})"),
        }
    }
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Deadlock => write!(f, "lock refused: deadlock avoidance or timeout"),
            LockError::InvalidLevel(level) => {
                write!(f, "invalid lock level requested: {level:?}")
            }
            LockError::Callback(err) => write!(f, "native lock callback failed: {err}"),
            LockError::InvariantViolation(msg) => write!(f, "lock manager invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Callback(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl LockError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::Deadlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_display_is_stable() {
        let err = LockError::Deadlock;
        assert!(err.is_deadlock());
        assert_eq!(err.to_string(), "lock refused: deadlock avoidance or timeout");
    }

    #[test]
    fn callback_error_exposes_source() {
        let inner: CallbackError = "disk is on fire".into();
        let err = LockError::Callback(inner);
        let source = std::error::Error::source(&err).expect("callback error has a source");
        assert_eq!(source.to_string(), "disk is on fire");
    }
}
