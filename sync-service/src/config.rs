use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::{
    engine::{ConflictResolution, EngineConfig},
    error::SyncError,
    executor::BatchConfig,
    reconcile::{ReconcileConfig, UnparseableTimestamps, DEFAULT_READING_TOLERANCE},
};

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// JSON file backing the in-process document store. Without it the
    /// remote side lives only for the duration of the process.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub max_workers: usize,
    pub batch_delay_ms: u64,
    pub reading_tolerance: f64,
    pub unparseable_timestamps: UnparseableTimestamps,
    pub conflict_resolution: ConflictResolution,
    pub dedupe_before_compare: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_workers: 2,
            batch_delay_ms: 3000,
            reading_tolerance: DEFAULT_READING_TOLERANCE,
            unparseable_timestamps: UnparseableTimestamps::default(),
            conflict_resolution: ConflictResolution::default(),
            dedupe_before_compare: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub owner_id: String,
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    pub metrics: Option<MetricsConfig>,
}

fn default_page_size() -> usize {
    1000
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METERBOOK_CONFIG").unwrap_or_else(|_| "meterbook.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg = Self::from_toml_str(&contents)?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.owner_id.trim().is_empty() {
            return Err(SyncError::Config("owner_id must not be empty".into()));
        }
        if self.sync.batch_size == 0 || self.sync.max_workers == 0 {
            return Err(SyncError::Config("sync.batch_size and sync.max_workers must be at least 1".into()));
        }
        if self.remote.page_size == 0 {
            return Err(SyncError::Config("remote.page_size must be at least 1".into()));
        }
        if self.sync.reading_tolerance.is_nan() || self.sync.reading_tolerance < 0.0 {
            return Err(SyncError::Config(format!(
                "sync.reading_tolerance must be non-negative, got {}",
                self.sync.reading_tolerance
            )));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reconcile: ReconcileConfig {
                owner_id: self.owner_id.clone(),
                reading_tolerance: self.sync.reading_tolerance,
                unparseable_timestamps: self.sync.unparseable_timestamps,
            },
            batch: BatchConfig {
                batch_size: self.sync.batch_size,
                max_workers: self.sync.max_workers,
                batch_delay: Duration::from_millis(self.sync.batch_delay_ms),
            },
            conflict_resolution: self.sync.conflict_resolution,
            dedupe_before_compare: self.sync.dedupe_before_compare,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            owner_id = "u-1"

            [local]
            database_path = "meterbook.db"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.remote.page_size, 1000);
        assert!(cfg.remote.snapshot_path.is_none());
        assert!(cfg.metrics.is_none());

        let engine = cfg.engine_config();
        assert_eq!(engine.reconcile.owner_id, "u-1");
        assert_eq!(engine.batch, BatchConfig::default());
        assert_eq!(engine.reconcile.reading_tolerance, 0.01);
        assert_eq!(engine.conflict_resolution, ConflictResolution::PreferLocal);
        assert!(!engine.dedupe_before_compare);
    }

    #[test]
    fn full_config_round_trips_into_engine_settings() {
        let cfg = AppConfig::from_toml_str(
            r#"
            owner_id = "u-2"

            [local]
            database_path = "/tmp/m.db"

            [remote]
            snapshot_path = "/tmp/remote.json"
            page_size = 50

            [sync]
            batch_size = 10
            max_workers = 4
            batch_delay_ms = 0
            reading_tolerance = 0.5
            unparseable_timestamps = "conflicting"
            conflict_resolution = "prefer_remote"
            dedupe_before_compare = true

            [metrics]
            bind_addr = "127.0.0.1:9100"
            "#,
        )
        .unwrap();

        let engine = cfg.engine_config();
        assert_eq!(engine.batch.batch_size, 10);
        assert_eq!(engine.batch.max_workers, 4);
        assert!(engine.batch.batch_delay.is_zero());
        assert_eq!(engine.reconcile.unparseable_timestamps, UnparseableTimestamps::Conflicting);
        assert_eq!(engine.conflict_resolution, ConflictResolution::PreferRemote);
        assert!(engine.dedupe_before_compare);
        assert_eq!(cfg.remote.page_size, 50);
        assert_eq!(cfg.metrics.unwrap().bind_addr, "127.0.0.1:9100");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = |sync: &str| {
            format!(
                "owner_id = \"u-1\"\n[local]\ndatabase_path = \"x.db\"\n[sync]\n{sync}\n"
            )
        };

        assert!(AppConfig::from_toml_str(&base("batch_size = 0")).is_err());
        assert!(AppConfig::from_toml_str(&base("reading_tolerance = -1.0")).is_err());
        assert!(AppConfig::from_toml_str(&base("conflict_resolution = \"coin_flip\"")).is_err());
        assert!(AppConfig::from_toml_str("owner_id = \"\"\n[local]\ndatabase_path = \"x.db\"\n").is_err());
    }
}
