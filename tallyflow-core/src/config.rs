//! Configuration of the aggregation stage
use std::{collections::HashMap, str::FromStr, time::Duration};

use backon::ConstantBuilder;
use bon::Builder;
use envconfig::Envconfig;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messaging::EgressDestination;

const DEFAULT_BATCH_SIZE: usize = 1024;
const DEFAULT_FLUSH_MAX_RETRIES: usize = 5;
const DEFAULT_FLUSH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration of one aggregation stage, shared by all of its replicas
///
/// # Example
/// ```rust
/// use tallyflow::config::StageConfig;
///
/// let config = StageConfig::builder()
///     .replica_count(4)
///     .egress_destinations(vec!["counts".into(), "audit".into()])
///     .batch_size(64)
///     .build();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StageConfig {
    /// Maximum number of records delivered to a replica at once.
    /// Only affects latency and throughput, never results.
    #[builder(default = DEFAULT_BATCH_SIZE)]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of parallel replicas. This is the divisor used by the key partitioner.
    pub replica_count: u64,
    /// Destinations which must each receive every replica's flushed state
    pub egress_destinations: Vec<EgressDestination>,
    /// How often a failed flush is retried before the job fails
    #[builder(default = DEFAULT_FLUSH_MAX_RETRIES)]
    #[serde(default = "default_flush_max_retries")]
    pub flush_max_retries: usize,
    /// Pause between flush attempts
    #[builder(default = DEFAULT_FLUSH_RETRY_DELAY)]
    #[serde(default = "default_flush_retry_delay")]
    pub flush_retry_delay: Duration,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_flush_max_retries() -> usize {
    DEFAULT_FLUSH_MAX_RETRIES
}
fn default_flush_retry_delay() -> Duration {
    DEFAULT_FLUSH_RETRY_DELAY
}

impl StageConfig {
    /// Load the config from `TALLYFLOW_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(EnvStageConfig::init_from_env()?.into())
    }

    /// Load the config from a map of `TALLYFLOW_*` variables
    pub fn from_hashmap(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(EnvStageConfig::init_from_hashmap(vars)?.into())
    }

    /// Check the config describes a runnable stage
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.replica_count == 0 {
            return Err(ConfigError::ZeroReplicas);
        }
        if self.egress_destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }
        let mut seen = IndexSet::with_capacity(self.egress_destinations.len());
        for dest in self.egress_destinations.iter() {
            if !seen.insert(dest) {
                return Err(ConfigError::DuplicateDestination(dest.clone()));
            }
        }
        Ok(())
    }

    /// Backoff used when retrying a failed flush
    pub fn flush_retry(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.flush_retry_delay)
            .with_max_times(self.flush_max_retries)
    }
}

#[derive(Envconfig)]
struct EnvStageConfig {
    #[envconfig(from = "TALLYFLOW_BATCH_SIZE", default = "1024")]
    batch_size: usize,
    #[envconfig(from = "TALLYFLOW_REPLICA_COUNT")]
    replica_count: u64,
    /// Comma separated list of destinations
    #[envconfig(from = "TALLYFLOW_EGRESS_DESTINATIONS")]
    egress_destinations: DestinationList,
    #[envconfig(from = "TALLYFLOW_FLUSH_MAX_RETRIES", default = "5")]
    flush_max_retries: usize,
    #[envconfig(from = "TALLYFLOW_FLUSH_RETRY_DELAY_MS", default = "100")]
    flush_retry_delay_ms: u64,
}

impl From<EnvStageConfig> for StageConfig {
    fn from(value: EnvStageConfig) -> Self {
        StageConfig {
            batch_size: value.batch_size,
            replica_count: value.replica_count,
            egress_destinations: value.egress_destinations.0,
            flush_max_retries: value.flush_max_retries,
            flush_retry_delay: Duration::from_millis(value.flush_retry_delay_ms),
        }
    }
}

/// Just a wrapper around a Vec to allow us to do custom FromStr
struct DestinationList(Vec<EgressDestination>);
impl FromStr for DestinationList {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(EgressDestination::from)
                .collect(),
        ))
    }
}

/// Invalid stage configurations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Batch size of 0
    #[error("batch-size must be at least 1")]
    ZeroBatchSize,
    /// Replica count of 0
    #[error("replica-count must be at least 1")]
    ZeroReplicas,
    /// No egress destination
    #[error("At least one egress destination is required")]
    NoDestinations,
    /// The same destination was given twice
    #[error("Egress destination '{0}' is configured more than once")]
    DuplicateDestination(EgressDestination),
    /// Reading the environment failed
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envconfig::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builder_defaults() {
        let config = StageConfig::builder()
            .replica_count(2)
            .egress_destinations(vec!["a".into()])
            .build();
        assert_eq!(config.batch_size, 1024);
        assert_eq!(config.flush_max_retries, 5);
        assert_eq!(config.flush_retry_delay, Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn from_hashmap() {
        let config = StageConfig::from_hashmap(&vars(&[
            ("TALLYFLOW_REPLICA_COUNT", "3"),
            ("TALLYFLOW_EGRESS_DESTINATIONS", "counts, audit,"),
            ("TALLYFLOW_BATCH_SIZE", "10"),
            ("TALLYFLOW_FLUSH_RETRY_DELAY_MS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.replica_count, 3);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_max_retries, 5);
        assert_eq!(config.flush_retry_delay, Duration::from_millis(5));
        assert_eq!(
            config.egress_destinations,
            vec![EgressDestination::from("counts"), EgressDestination::from("audit")]
        );
    }

    #[test]
    fn from_hashmap_missing_replicas() {
        let res = StageConfig::from_hashmap(&vars(&[("TALLYFLOW_EGRESS_DESTINATIONS", "a")]));
        assert!(matches!(res, Err(ConfigError::Env(_))));
    }

    #[test]
    fn rejects_invalid() {
        let base = StageConfig::builder()
            .replica_count(1)
            .egress_destinations(vec!["a".into()])
            .build();

        let mut config = base.clone();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBatchSize)));

        let mut config = base.clone();
        config.replica_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroReplicas)));

        let mut config = base.clone();
        config.egress_destinations.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoDestinations)));

        let mut config = base;
        config.egress_destinations.push("a".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateDestination(_))
        ));
    }
}
