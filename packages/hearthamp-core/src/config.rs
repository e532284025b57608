//! Daemon-level tunables, distinct from the persisted [`crate::state::State`].
//!
//! These are process configuration (rate limits, cadences, buffer sizes),
//! not user data; they come from CLI flags and environment overrides in the
//! binary crate and are validated once at startup.

/// Daemon-wide tunables. Defaults are conservative and match the values
/// named throughout the design: 500 ops/s bus rate limit, 500ms
/// persistence debounce, bounded subscriber buffers of 8.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum hardware bus operations per second.
    pub bus_rate_limit_per_sec: u32,
    /// Debounce window before a config-store save hits disk, in milliseconds.
    pub save_debounce_ms: u64,
    /// Size of the virtual audio slot pool.
    pub virtual_slot_count: usize,
    /// Supervisor: failures within this many seconds count toward fast-fail.
    pub supervisor_fast_fail_secs: u64,
    /// Supervisor: consecutive fast failures before giving up permanently.
    pub supervisor_max_fails: u32,
    /// Supervisor: initial restart backoff, in milliseconds.
    pub supervisor_initial_backoff_ms: u64,
    /// Supervisor: backoff cap, in milliseconds.
    pub supervisor_max_backoff_ms: u64,
    /// Interval between online-reachability probes, in seconds.
    pub online_probe_interval_secs: u64,
    /// Interval between release-update checks, in seconds.
    pub release_probe_interval_secs: u64,
    /// Interval between periodic config backups, in seconds.
    pub backup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_rate_limit_per_sec: 500,
            save_debounce_ms: 500,
            virtual_slot_count: 12,
            supervisor_fast_fail_secs: 10,
            supervisor_max_fails: 5,
            supervisor_initial_backoff_ms: 500,
            supervisor_max_backoff_ms: 30_000,
            online_probe_interval_secs: 10,
            release_probe_interval_secs: 6 * 3600,
            backup_interval_secs: 24 * 3600,
        }
    }
}

impl Config {
    /// Validates the tunables, returning a human-readable error on the
    /// first inconsistency found.
    pub fn validate(&self) -> Result<(), String> {
        if self.bus_rate_limit_per_sec == 0 {
            return Err("bus_rate_limit_per_sec must be > 0".to_string());
        }
        if self.virtual_slot_count == 0 {
            return Err("virtual_slot_count must be > 0".to_string());
        }
        if self.supervisor_max_backoff_ms < self.supervisor_initial_backoff_ms {
            return Err("supervisor_max_backoff_ms must be >= supervisor_initial_backoff_ms".to_string());
        }
        if self.supervisor_max_fails == 0 {
            return Err("supervisor_max_fails must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_rate_limit_rejected() {
        let mut cfg = Config::default();
        cfg.bus_rate_limit_per_sec = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_cap_below_initial_rejected() {
        let mut cfg = Config::default();
        cfg.supervisor_max_backoff_ms = 10;
        cfg.supervisor_initial_backoff_ms = 500;
        assert!(cfg.validate().is_err());
    }
}
