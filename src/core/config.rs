//! Routing table parameters.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::id::Kuid;

/// Rejected parameter combinations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the replication parameter k must be at least 1")]
    ZeroReplication,
    #[error("the replacement cache must hold at least one contact")]
    ZeroCache,
    #[error("a contact must be allowed at least one failure")]
    ZeroFailures,
    #[error("max_unknown_failures ({unknown}) exceeds max_alive_failures ({alive})")]
    FailureThresholds { unknown: u32, alive: u32 },
    #[error("depth limit {0} exceeds the identifier size")]
    DepthLimit(usize),
    #[error("min_timeout {min:?} exceeds timeout {max:?}")]
    Timeouts { min: Duration, max: Duration },
}

/// The numeric parameters the routing table runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// The replication parameter: maximum number of live contacts per bucket.
    pub k: usize,
    /// Maximum number of contacts in a bucket's replacement cache.
    pub cache_size: usize,
    /// Failures a contact that has been alive at least once may accumulate before it's dead.
    pub max_alive_failures: u32,
    /// Failures a never-alive contact may accumulate before it's dead.
    pub max_unknown_failures: u32,
    /// Idle time after which a bucket wants a refresh lookup.
    pub refresh_period: Duration,
    /// A contact seen within this window counts as recently alive.
    pub min_reconnection_window: Duration,
    /// Consecutive failure reports after which further reports are ignored until a contact is
    /// heard from again.
    pub max_consecutive_failures: usize,
    /// Minimum idle time of a bucket before an update may trigger a cache promotion ping.
    pub bucket_ping_cooldown: Duration,
    /// Buckets deeper than this only split if they're on the local node's path.
    pub depth_limit: usize,
    /// Upper bound on a contact's adaptive timeout, used as is when the RTT is unknown.
    pub timeout: Duration,
    /// Lower bound on a contact's adaptive timeout.
    pub min_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 20,
            cache_size: 16,
            max_alive_failures: 4,
            max_unknown_failures: 2,
            refresh_period: Duration::from_secs(30 * 60),
            min_reconnection_window: Duration::from_secs(30),
            max_consecutive_failures: 100,
            bucket_ping_cooldown: Duration::from_secs(30),
            depth_limit: 4,
            timeout: Duration::from_secs(10),
            min_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Checks the parameters are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 {
            return Err(ConfigError::ZeroReplication);
        }

        if self.cache_size == 0 {
            return Err(ConfigError::ZeroCache);
        }

        if self.max_unknown_failures == 0 {
            return Err(ConfigError::ZeroFailures);
        }

        if self.max_unknown_failures > self.max_alive_failures {
            return Err(ConfigError::FailureThresholds {
                unknown: self.max_unknown_failures,
                alive: self.max_alive_failures,
            });
        }

        if self.depth_limit > Kuid::BITS {
            return Err(ConfigError::DepthLimit(self.depth_limit));
        }

        if self.min_timeout > self.timeout {
            return Err(ConfigError::Timeouts {
                min: self.min_timeout,
                max: self.timeout,
            });
        }

        Ok(())
    }
}
