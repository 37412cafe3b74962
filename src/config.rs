use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for a [`crate::manager::LockManager`]. Unlike the rest of the
/// teacher's config layer this has no file on disk to load — callers build
/// one in code — but it derives `serde` anyway so a host embedding `fairlock`
/// can fold it into its own config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockManagerConfig {
    /// How long a blocked `lock` call waits before giving up with
    /// [`crate::err::LockError::Deadlock`]. `None` waits forever.
    #[serde(default = "default_timeout", with = "duration_secs_opt")]
    timeout: Option<Duration>,
}

impl LockManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_five_seconds() {
        assert_eq!(LockManagerConfig::default().timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn with_timeout_none_waits_forever() {
        let config = LockManagerConfig::new().with_timeout(None);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn builder_is_independent_of_default() {
        let custom = LockManagerConfig::new().with_timeout(Some(Duration::from_millis(250)));
        assert_ne!(custom.timeout(), LockManagerConfig::default().timeout());
    }
}
