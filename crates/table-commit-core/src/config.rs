//! Engine configuration.
//!
//! All knobs are plain values handed to constructors; nothing is read from
//! process-wide state. [`CommitConfig::from_properties`] layers table
//! properties on top of the defaults.
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use snafu::prelude::*;

/// Table property: number of CAS retries after the first attempt.
pub const COMMIT_NUM_RETRIES: &str = "commit.retry.num-retries";
/// Table property: initial backoff in milliseconds.
pub const COMMIT_MIN_WAIT_MS: &str = "commit.retry.min-wait-ms";
/// Table property: backoff ceiling in milliseconds.
pub const COMMIT_MAX_WAIT_MS: &str = "commit.retry.max-wait-ms";
/// Table property: total time budget for one commit in milliseconds.
pub const COMMIT_TOTAL_TIMEOUT_MS: &str = "commit.retry.total-timeout-ms";
/// Table property: size of the commit-file reader pool.
pub const COMMIT_THREAD_POOL_SIZE: &str = "commit.thread-pool.size";
/// Table property: enable partial-progress rewrites.
pub const PARTIAL_PROGRESS_ENABLED: &str = "rewrite.partial-progress.enabled";
/// Table property: maximum number of commits in a partial-progress rewrite.
pub const PARTIAL_PROGRESS_MAX_COMMITS: &str = "rewrite.partial-progress.max-commits";
/// Table property: pin rewritten files to the starting sequence number.
pub const USE_STARTING_SEQUENCE_NUMBER: &str = "rewrite.use-starting-sequence-number";

/// Errors raised while reading configuration from properties.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ConfigError {
    /// A property value could not be parsed.
    #[snafu(display("Invalid value {value:?} for property {key}: {reason}"))]
    InvalidValue {
        /// Property key.
        key: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// A property value parsed but is out of range.
    #[snafu(display("Property {key} must be at least {min}, got {value}"))]
    OutOfRange {
        /// Property key.
        key: String,
        /// Parsed value.
        value: u64,
        /// Smallest accepted value.
        min: u64,
    },
}

/// Retry policy of the snapshot commit loop.
///
/// Backoff after the `n`-th conflict (0-based) is `min_wait * 2^n`, clamped
/// to `max_wait`. The loop stops after `num_retries` retries or once
/// `total_timeout` has elapsed, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRetryPolicy {
    /// Retries after the first attempt.
    pub num_retries: u32,
    /// First backoff.
    pub min_wait: Duration,
    /// Backoff ceiling.
    pub max_wait: Duration,
    /// Time budget for the whole commit.
    pub total_timeout: Duration,
}

impl Default for CommitRetryPolicy {
    fn default() -> Self {
        Self {
            num_retries: 4,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
            total_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl CommitRetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            num_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.min_wait
            .checked_mul(factor)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }
}

/// Settings of the partial-progress commit service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitServiceConfig {
    /// How long `close` waits for the queue to drain.
    pub close_timeout: Duration,
    /// How long the committer waits for new groups before re-checking state.
    pub idle_poll_interval: Duration,
}

impl Default for CommitServiceConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(120 * 60),
            idle_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Partial-progress mode of a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialProgressConfig {
    /// Commit groups incrementally through the commit service.
    pub enabled: bool,
    /// Upper bound on the number of commits a rewrite produces.
    pub max_commits: usize,
}

impl Default for PartialProgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_commits: 10,
        }
    }
}

/// Configuration of the commit engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitConfig {
    /// CAS retry policy.
    pub retry: CommitRetryPolicy,
    /// Parallel readers used to collect commit files.
    pub commit_file_pool_size: usize,
    /// Attempts per commit-file read.
    pub commit_file_read_attempts: usize,
    /// Attempts per best-effort cleanup delete.
    pub cleanup_delete_attempts: usize,
    /// Commit service settings.
    pub service: CommitServiceConfig,
    /// Partial-progress rewrite settings.
    pub partial_progress: PartialProgressConfig,
    /// Rewrites keep the data sequence number of their starting snapshot.
    pub use_starting_sequence_number: bool,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            retry: CommitRetryPolicy::default(),
            commit_file_pool_size: 10,
            commit_file_read_attempts: 3,
            cleanup_delete_attempts: 3,
            service: CommitServiceConfig::default(),
            partial_progress: PartialProgressConfig::default(),
            use_starting_sequence_number: true,
        }
    }
}

impl CommitConfig {
    /// Defaults overridden by any recognized key in `properties`.
    ///
    /// Unknown keys are ignored.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse::<u32>(properties, COMMIT_NUM_RETRIES)? {
            config.retry.num_retries = v;
        }
        if let Some(v) = parse::<u64>(properties, COMMIT_MIN_WAIT_MS)? {
            config.retry.min_wait = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(properties, COMMIT_MAX_WAIT_MS)? {
            config.retry.max_wait = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(properties, COMMIT_TOTAL_TIMEOUT_MS)? {
            config.retry.total_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_at_least(properties, COMMIT_THREAD_POOL_SIZE, 1)? {
            config.commit_file_pool_size = v;
        }
        if let Some(v) = parse::<bool>(properties, PARTIAL_PROGRESS_ENABLED)? {
            config.partial_progress.enabled = v;
        }
        if let Some(v) = parse_at_least(properties, PARTIAL_PROGRESS_MAX_COMMITS, 1)? {
            config.partial_progress.max_commits = v;
        }
        if let Some(v) = parse::<bool>(properties, USE_STARTING_SEQUENCE_NUMBER)? {
            config.use_starting_sequence_number = v;
        }

        Ok(config)
    }
}

fn parse<T>(properties: &BTreeMap<String, String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = properties.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_at_least(
    properties: &BTreeMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>, ConfigError> {
    let Some(value) = parse::<usize>(properties, key)? else {
        return Ok(None);
    };
    ensure!(
        value >= min,
        OutOfRangeSnafu {
            key,
            value: value as u64,
            min: min as u64,
        }
    );
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CommitConfig::default();
        assert_eq!(config.retry.num_retries, 4);
        assert_eq!(config.retry.min_wait, Duration::from_millis(100));
        assert_eq!(config.retry.max_wait, Duration::from_secs(60));
        assert_eq!(config.retry.total_timeout, Duration::from_secs(1800));
        assert_eq!(config.commit_file_pool_size, 10);
        assert_eq!(config.commit_file_read_attempts, 3);
        assert_eq!(config.service.close_timeout, Duration::from_secs(7200));
        assert!(!config.partial_progress.enabled);
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let policy = CommitRetryPolicy {
            num_retries: 10,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_millis(500),
            total_timeout: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(64), Duration::from_millis(500));
    }

    #[test]
    fn from_properties_overrides_defaults() -> Result<(), ConfigError> {
        let config = CommitConfig::from_properties(&props(&[
            (COMMIT_NUM_RETRIES, "7"),
            (COMMIT_MIN_WAIT_MS, "5"),
            (COMMIT_THREAD_POOL_SIZE, "2"),
            (PARTIAL_PROGRESS_ENABLED, "true"),
            (PARTIAL_PROGRESS_MAX_COMMITS, "3"),
            (USE_STARTING_SEQUENCE_NUMBER, "false"),
            ("unrelated.key", "x"),
        ]))?;

        assert_eq!(config.retry.num_retries, 7);
        assert_eq!(config.retry.min_wait, Duration::from_millis(5));
        assert_eq!(config.commit_file_pool_size, 2);
        assert!(config.partial_progress.enabled);
        assert_eq!(config.partial_progress.max_commits, 3);
        assert!(!config.use_starting_sequence_number);
        Ok(())
    }

    #[test]
    fn from_properties_rejects_bad_values() {
        let err = CommitConfig::from_properties(&props(&[(COMMIT_NUM_RETRIES, "many")]))
            .expect_err("not a number");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == COMMIT_NUM_RETRIES));

        let err = CommitConfig::from_properties(&props(&[(PARTIAL_PROGRESS_MAX_COMMITS, "0")]))
            .expect_err("zero commits");
        assert_eq!(
            err,
            ConfigError::OutOfRange {
                key: PARTIAL_PROGRESS_MAX_COMMITS.to_string(),
                value: 0,
                min: 1,
            }
        );
    }
}
