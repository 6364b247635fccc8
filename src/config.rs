//! Unified Configuration Module
//!
//! This module consolidates all configuration types into a single, coherent
//! system with proper validation and defaults. Configuration is ingested once
//! at coordinator initialization; nothing is persisted across restarts.

use crate::error::{ConvoyError, ConvoyResult};
use crate::regions::types::Region;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Unified configuration for all Convoy components
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConvoyConfig {
    /// Multi-region coordination configuration
    pub multi_region: MultiRegionConfig,

    /// Adaptive transfer configuration
    pub adaptation: AdaptationConfig,

    /// Chunk staging configuration
    pub staging: StagingConfig,
}

impl ConvoyConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ConvoyResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConvoyError::InvalidConfig {
            field: path.display().to_string(),
            reason: format!("failed to read configuration file: {e}"),
        })?;
        Self::from_json(&raw)
    }

    /// Parse a configuration from a JSON document.
    pub fn from_json(raw: &str) -> ConvoyResult<Self> {
        serde_json::from_str(raw).map_err(|e| ConvoyError::InvalidConfig {
            field: "configuration".to_string(),
            reason: format!("failed to parse configuration JSON: {e}"),
        })
    }

    /// Render the configuration as a pretty-printed JSON document.
    pub fn to_json(&self) -> ConvoyResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConvoyError::Internal(e.to_string()))
    }
}

/// Load-balancing strategy for region selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Weighted,
    LatencyBased,
    /// Reserved; currently falls back to priority ordering
    Geographic,
    PriorityBased,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Region selection strategy
    pub strategy: LoadBalancingStrategy,

    /// Pin requests from the same session to one region
    pub sticky_sessions: bool,

    /// Sticky-session lifetime
    pub session_ttl: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::PriorityBased,
            sticky_sessions: false,
            session_ttl: Duration::from_secs(600),
        }
    }
}

/// Strategy applied when a failover is executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailoverStrategy {
    /// Cut traffic over immediately
    Immediate,
    /// Drain in-flight work before switching
    Graceful,
    /// Require operator intervention
    Manual,
}

/// Failover detection and execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Strategy used by executed failovers
    pub strategy: FailoverStrategy,

    /// Interval between failure-detection sweeps
    pub detection_interval: Duration,

    /// Upper bound on a single failover execution
    pub failover_timeout: Duration,

    /// Consecutive failures before a region is considered failed
    pub retry_attempts: u32,

    /// Automatically retry uploads in alternative regions
    pub auto_failover: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::Graceful,
            detection_interval: Duration::from_secs(15),
            failover_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            auto_failover: true,
        }
    }
}

/// Alert thresholds evaluated by the monitoring service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Error-rate percentage above which a region is demoted
    pub error_rate_percent: f64,

    /// Latency above which a region is flagged
    pub latency_ms: f64,

    /// Utilization percentage above which a region stops receiving traffic
    pub utilization_percent: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate_percent: 25.0,
            latency_ms: 1000.0,
            utilization_percent: 95.0,
        }
    }
}

/// Background monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether background metrics collection runs
    pub enabled: bool,

    /// Interval between metrics sweeps
    pub metrics_interval: Duration,

    /// Alert thresholds
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval: Duration::from_secs(60),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Cross-region replication mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicationMode {
    /// No replication beyond the routed upload
    None,
    /// Redundant copies are written asynchronously, best effort
    Async,
    /// Redundant copies are written in the request path
    Sync,
}

/// Conflict resolution for redundant copies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConflictResolution {
    LastWriterWins,
    PreferPrimary,
}

/// Replication configuration consumed by redundant uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication mode
    pub mode: ReplicationMode,

    /// Acceptable replication lag for async mode
    pub acceptable_lag: Duration,

    /// Conflict resolution policy
    pub conflict_resolution: ConflictResolution,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Async,
            acceptable_lag: Duration::from_secs(300),
            conflict_resolution: ConflictResolution::PreferPrimary,
        }
    }
}

/// Multi-region coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRegionConfig {
    /// Master switch; initialization fails when disabled
    pub enabled: bool,

    /// Name of the primary region; must appear in `regions`
    pub primary_region: String,

    /// Configured regions
    pub regions: Vec<Region>,

    /// Load balancing configuration
    pub load_balancing: LoadBalancingConfig,

    /// Failover configuration
    pub failover: FailoverConfig,

    /// Monitoring configuration
    pub monitoring: MonitoringConfig,

    /// Replication configuration
    pub replication: ReplicationConfig,
}

impl Default for MultiRegionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_region: String::new(),
            regions: Vec::new(),
            load_balancing: LoadBalancingConfig::default(),
            failover: FailoverConfig::default(),
            monitoring: MonitoringConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl MultiRegionConfig {
    /// Validate the configuration the way the coordinator requires it.
    pub fn validate(&self) -> ConvoyResult<()> {
        if !self.enabled {
            return Err(ConvoyError::InvalidConfig {
                field: "multi_region.enabled".to_string(),
                reason: "multi-region support is disabled".to_string(),
            });
        }
        if self.regions.is_empty() {
            return Err(ConvoyError::InvalidConfig {
                field: "multi_region.regions".to_string(),
                reason: "at least one region must be configured".to_string(),
            });
        }
        if self.primary_region.is_empty() {
            return Err(ConvoyError::InvalidConfig {
                field: "multi_region.primary_region".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if !self.regions.iter().any(|r| r.name == self.primary_region) {
            return Err(ConvoyError::InvalidConfig {
                field: "multi_region.primary_region".to_string(),
                reason: format!(
                    "region '{}' is not present in the regions list",
                    self.primary_region
                ),
            });
        }
        for region in &self.regions {
            region.validate()?;
        }
        Ok(())
    }
}

/// Adaptive transfer tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// Network sampling interval
    pub monitoring_interval: Duration,

    /// Per-session evaluation interval
    pub adaptation_interval: Duration,

    /// Relative bandwidth change considered significant
    pub bandwidth_change_threshold: f64,

    /// Relative latency change considered significant
    pub latency_change_threshold: f64,

    /// Absolute packet-loss change considered significant
    pub loss_change_threshold: f64,

    /// Minimum chunk size in MB
    pub min_chunk_size_mb: u64,

    /// Maximum chunk size in MB
    pub max_chunk_size_mb: u64,

    /// Minimum upload concurrency
    pub min_concurrency: u32,

    /// Maximum upload concurrency
    pub max_concurrency: u32,

    /// Prefer throughput over stability when tuning
    pub aggressive: bool,

    /// Prefer stability over throughput when tuning
    pub conservative: bool,

    /// Scaling factor applied to adaptation step sizes
    pub sensitivity: f64,

    /// Target throughput in MBps
    pub target_throughput_mbps: f64,

    /// Target latency in milliseconds
    pub target_latency_ms: f64,

    /// Target packet-loss rate (0.0 to 1.0)
    pub target_loss_rate: f64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(5),
            adaptation_interval: Duration::from_secs(10),
            bandwidth_change_threshold: 0.1,
            latency_change_threshold: 0.2,
            loss_change_threshold: 0.001,
            min_chunk_size_mb: 5,
            max_chunk_size_mb: 100,
            min_concurrency: 1,
            max_concurrency: 16,
            aggressive: false,
            conservative: false,
            sensitivity: 1.0,
            target_throughput_mbps: 50.0,
            target_latency_ms: 50.0,
            target_loss_rate: 0.01,
        }
    }
}

/// Chunk staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Maximum staging buffer in MB
    pub max_buffer_mb: u64,

    /// Target chunk size in MB
    pub target_chunk_mb: u64,

    /// Maximum concurrent staging workers
    pub max_concurrent_staging: u32,

    /// Staging queue depth
    pub queue_depth: u32,

    /// Bytes sampled when analyzing chunk compressibility
    pub analysis_window_bytes: u64,

    /// Horizon for chunk-level performance predictions
    pub prediction_window: Duration,

    /// Chunks staged ahead of the upload cursor
    pub lookahead_chunks: u32,

    /// Memory pressure ratio that pauses staging
    pub memory_pressure_threshold: f64,

    /// Memory pressure ratio that forces buffer reclamation
    pub gc_trigger_threshold: f64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_buffer_mb: 256,
            target_chunk_mb: 32,
            max_concurrent_staging: 4,
            queue_depth: 8,
            analysis_window_bytes: 16 * 1024,
            prediction_window: Duration::from_secs(30),
            lookahead_chunks: 3,
            memory_pressure_threshold: 0.8,
            gc_trigger_threshold: 0.9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_region_config() -> MultiRegionConfig {
        MultiRegionConfig {
            primary_region: "us-east-1".to_string(),
            regions: vec![Region::new("us-east-1", 1, 50), Region::new("us-west-2", 2, 30)],
            ..Default::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(two_region_config().validate().is_ok());
    }

    #[test]
    fn disabled_multi_region_is_rejected() {
        let mut config = two_region_config();
        config.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_regions_are_rejected() {
        let mut config = two_region_config();
        config.regions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_primary_is_rejected() {
        let mut config = two_region_config();
        config.primary_region = "eu-central-1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn per_region_validation_is_applied() {
        let mut config = two_region_config();
        config.regions[1].weight = 250;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_the_configuration() {
        let mut config = ConvoyConfig::default();
        config.multi_region = two_region_config();
        config.staging.target_chunk_mb = 48;

        let raw = config.to_json().unwrap();
        let parsed = ConvoyConfig::from_json(&raw).unwrap();

        assert_eq!(parsed.multi_region.primary_region, "us-east-1");
        assert_eq!(parsed.multi_region.regions.len(), 2);
        assert_eq!(parsed.staging.target_chunk_mb, 48);
        assert!(parsed.multi_region.validate().is_ok());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let result = ConvoyConfig::from_json("{ not json");
        assert!(matches!(result, Err(ConvoyError::InvalidConfig { .. })));
    }

    #[test]
    fn configuration_loads_from_a_file() {
        let mut config = ConvoyConfig::default();
        config.multi_region = two_region_config();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.json");
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        let loaded = ConvoyConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.multi_region.primary_region, "us-east-1");

        let missing = ConvoyConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ConvoyError::InvalidConfig { .. })));
    }

    #[test]
    fn defaults_are_reasonable() {
        let adaptation = AdaptationConfig::default();
        assert!(adaptation.min_chunk_size_mb < adaptation.max_chunk_size_mb);
        assert!(adaptation.min_concurrency < adaptation.max_concurrency);
        assert!(adaptation.monitoring_interval.as_secs() > 0);

        let staging = StagingConfig::default();
        assert_eq!(staging.target_chunk_mb, 32);
        assert!(staging.memory_pressure_threshold < staging.gc_trigger_threshold);
    }
}
