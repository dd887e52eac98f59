use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    cluster::ResourceBucket,
    error::{BackendError, Result},
};

/// How long workers get to report ready unless overridden.
pub const DEFAULT_COORDINATION_TIMEOUT_SECONDS: u64 = 30;

/// Options recognized by the backend.
///
/// Every resource field left unset is taken from the resource bucket selected out of the
/// cluster, set fields take precedence one by one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub num_slots: Option<usize>,
    pub num_hosts: Option<usize>,
    pub use_gpu: Option<bool>,
    pub coordination_timeout_seconds: Option<u64>,
    /// Bypasses the processed dataset cache, delegated to the cache layer.
    pub skip_save_processed_input: bool,
    /// Fails training when a worker's weights differ from the canonical worker's.
    pub check_replica_consistency: bool,
}

impl BackendConfig {
    /// Parses a config out of a JSON document.
    ///
    /// # Args
    /// * `json` - The document.
    ///
    /// # Returns
    /// The validated config, or `InvalidConfig` if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Rejects overrides that can't describe a worker group.
    pub fn validate(&self) -> Result<()> {
        if self.num_slots == Some(0) {
            return Err(BackendError::InvalidConfig("num_slots must be positive".into()));
        }
        if self.num_hosts == Some(0) {
            return Err(BackendError::InvalidConfig("num_hosts must be positive".into()));
        }
        if self.coordination_timeout_seconds == Some(0) {
            return Err(BackendError::InvalidConfig(
                "coordination_timeout_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// The shape of a worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerGroupConfig {
    pub num_slots: usize,
    pub num_hosts: usize,
    pub use_gpu: bool,
    pub coordination_timeout: Duration,
}

impl WorkerGroupConfig {
    /// Derives the group's shape from a resource bucket and the caller's overrides.
    ///
    /// # Args
    /// * `bucket` - The bucket selected out of the cluster.
    /// * `overrides` - The caller's configuration.
    ///
    /// # Returns
    /// The validated group config.
    pub fn resolve(bucket: &ResourceBucket, overrides: &BackendConfig) -> Result<Self> {
        let timeout = overrides
            .coordination_timeout_seconds
            .unwrap_or(DEFAULT_COORDINATION_TIMEOUT_SECONDS);

        let config = Self {
            num_slots: overrides.num_slots.unwrap_or(bucket.slots_per_node),
            num_hosts: overrides.num_hosts.unwrap_or(bucket.node_count),
            use_gpu: overrides.use_gpu.unwrap_or_else(|| bucket.use_gpu()),
            coordination_timeout: Duration::from_secs(timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// The amount of workers in the group, saturating at `usize::MAX`.
    pub fn world_size(&self) -> usize {
        self.num_slots.saturating_mul(self.num_hosts)
    }

    /// Rejects shapes without workers, with more workers than can be counted or without a
    /// deadline.
    pub fn validate(&self) -> Result<()> {
        if self.num_slots.checked_mul(self.num_hosts).is_none() {
            return Err(BackendError::InvalidConfig(format!(
                "worker group of {} slot(s) on {} host(s) is too large",
                self.num_slots, self.num_hosts
            )));
        }
        if self.world_size() == 0 {
            return Err(BackendError::InvalidConfig(format!(
                "worker group needs at least one worker, got {} slot(s) on {} host(s)",
                self.num_slots, self.num_hosts
            )));
        }
        if self.coordination_timeout.is_zero() {
            return Err(BackendError::InvalidConfig(
                "coordination timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ResourceKind;

    fn bucket() -> ResourceBucket {
        ResourceBucket {
            kind: ResourceKind::Gpu,
            slots_per_node: 2,
            node_count: 3,
            node_ids: vec!["a".into(), "b".into(), "c".into()],
        }
    }

    #[test]
    fn bucket_fills_unset_fields() {
        let config = WorkerGroupConfig::resolve(&bucket(), &BackendConfig::default()).unwrap();

        assert_eq!(config.num_slots, 2);
        assert_eq!(config.num_hosts, 3);
        assert!(config.use_gpu);
        assert_eq!(config.coordination_timeout, Duration::from_secs(30));
        assert_eq!(config.world_size(), 6);
    }

    #[test]
    fn overrides_take_precedence_field_by_field() {
        let overrides = BackendConfig {
            num_hosts: Some(1),
            use_gpu: Some(false),
            coordination_timeout_seconds: Some(5),
            ..Default::default()
        };

        let config = WorkerGroupConfig::resolve(&bucket(), &overrides).unwrap();
        assert_eq!(config.num_slots, 2);
        assert_eq!(config.num_hosts, 1);
        assert!(!config.use_gpu);
        assert_eq!(config.coordination_timeout, Duration::from_secs(5));
    }

    #[test]
    fn empty_group_is_rejected() {
        let mut empty = bucket();
        empty.slots_per_node = 0;

        let err = WorkerGroupConfig::resolve(&empty, &BackendConfig::default()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn oversized_group_is_rejected() {
        let mut huge = bucket();
        huge.slots_per_node = usize::MAX;

        let err = WorkerGroupConfig::resolve(&huge, &BackendConfig::default()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn parses_json_with_defaults() {
        let config = BackendConfig::from_json(r#"{"num_slots": 4, "use_gpu": true}"#).unwrap();

        assert_eq!(config.num_slots, Some(4));
        assert_eq!(config.use_gpu, Some(true));
        assert_eq!(config.num_hosts, None);
        assert!(!config.skip_save_processed_input);
    }

    #[test]
    fn rejects_unknown_and_zero_options() {
        assert!(BackendConfig::from_json(r#"{"num_gpus": 4}"#).is_err());
        assert!(BackendConfig::from_json(r#"{"num_hosts": 0}"#).is_err());
    }
}
