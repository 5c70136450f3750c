use std::fmt;
use std::time::Duration;

use crate::Error;
use crate::Result;

const DEFAULT_SHARD_COUNT: u16 = 4;
const DEFAULT_RETENTION_SECS: u64 = 600;
const DEFAULT_CHANNEL_SIZE: usize = 500;
const DEFAULT_RETRY_BASE_INTERVAL_MILLIS: u64 = 100;
const DEFAULT_RETRY_MAX_INTERVAL_MILLIS: u64 = 10_000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.5;
const DEFAULT_MAX_RETRIES: u16 = 5;

/// Configuration of a dedup pipeline. Validated once at construction; a pipeline is
/// never built from an invalid config.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// number of shards the key space is split into. Changing this between runs
    /// reassigns keys to different shards, so state recorded by a previous run no
    /// longer applies.
    pub shard_count: u16,
    /// how long a first sighting is remembered, measured against the watermark. A
    /// key reappearing within retention is a duplicate; after the watermark passes
    /// first-seen + retention the entry is purged and the key counts as new again.
    pub retention: Duration,
    /// buffer size of the channels between the pipeline stages
    pub channel_size: usize,
    /// configuration of the default in-memory store
    pub store: StoreConfig,
    /// retry behavior for transient store failures
    pub retry: RetryConfig,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            channel_size: DEFAULT_CHANNEL_SIZE,
            store: Default::default(),
            retry: Default::default(),
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be at least 1".to_string()));
        }
        if self.retention.is_zero() {
            return Err(Error::Config("retention must be non-zero".to_string()));
        }
        if self.channel_size == 0 {
            return Err(Error::Config("channel_size must be at least 1".to_string()));
        }
        self.store.validate()?;
        self.retry.validate()
    }
}

/// Configuration of the built-in in-memory store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// maximum number of keys tracked per shard, unbounded when None
    pub capacity: Option<usize>,
    /// what to do when a shard hits its capacity
    pub policy: CapacityPolicy,
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity == Some(0) {
            return Err(Error::Config(
                "store capacity must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a capacity-bounded store does when a new key arrives and the store is full.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum CapacityPolicy {
    /// shed the entry with the oldest first-seen time to make room. The shed key is
    /// no longer deduplicated, trading accuracy for bounded memory.
    #[default]
    EvictOldest,
    /// refuse the new key; the owning shard halts with a capacity error
    FailFast,
}

impl fmt::Display for CapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityPolicy::EvictOldest => write!(f, "evictOldest"),
            CapacityPolicy::FailFast => write!(f, "failFast"),
        }
    }
}

/// Capped exponential backoff applied to transient store failures. `max_retries`
/// bounds the number of pauses, so a shard makes at most `max_retries + 1` attempts
/// before halting.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_retries: u16,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(DEFAULT_RETRY_BASE_INTERVAL_MILLIS),
            max_interval: Duration::from_millis(DEFAULT_RETRY_MAX_INTERVAL_MILLIS),
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.factor < 1.0 {
            return Err(Error::Config(
                "retry factor must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config(
                "retry jitter must be within [0.0, 1.0)".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DedupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.retention, Duration::from_secs(600));
    }

    #[test]
    fn zero_shard_count_is_rejected() {
        let config = DedupConfig {
            shard_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_retention_is_rejected() {
        let config = DedupConfig {
            retention: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_channel_size_is_rejected() {
        let config = DedupConfig {
            channel_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_store_capacity_is_rejected() {
        let config = DedupConfig {
            store: StoreConfig {
                capacity: Some(0),
                policy: CapacityPolicy::FailFast,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn bad_retry_tuning_is_rejected() {
        let config = DedupConfig {
            retry: RetryConfig {
                factor: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = DedupConfig {
            retry: RetryConfig {
                jitter: 1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn capacity_policy_display() {
        assert_eq!(CapacityPolicy::EvictOldest.to_string(), "evictOldest");
        assert_eq!(CapacityPolicy::FailFast.to_string(), "failFast");
    }
}
