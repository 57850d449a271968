use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::bus::DEFAULT_REVOKE_CAPACITY;
use crate::machine::AllFailedPolicy;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Buffer size of the revoke bus before slow subscribers lag
    pub revoke_capacity: usize,
    /// Behaviour when every member of a joint watch is FAILED
    pub all_failed_policy: AllFailedPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            revoke_capacity: DEFAULT_REVOKE_CAPACITY,
            all_failed_policy: AllFailedPolicy::default(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let revoke_capacity = match lookup("ASK_WATCH_REVOKE_CAPACITY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .context("ASK_WATCH_REVOKE_CAPACITY must be a valid number")?,
            None => defaults.revoke_capacity,
        };
        if revoke_capacity == 0 {
            return Err(anyhow!("ASK_WATCH_REVOKE_CAPACITY must be greater than 0"));
        }

        let all_failed_policy = match lookup("ASK_WATCH_ALL_FAILED_POLICY") {
            Some(raw) => raw
                .parse::<AllFailedPolicy>()
                .map_err(|e: String| anyhow!(e))
                .context("ASK_WATCH_ALL_FAILED_POLICY is invalid")?,
            None => defaults.all_failed_policy,
        };

        Ok(Self {
            revoke_capacity,
            all_failed_policy,
        })
    }
}
