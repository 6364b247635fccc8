//! Region Data Model
//!
//! Core types shared by the region selector, load balancer, failover
//! manager, and coordinator: regions with health and capacity, upload
//! requests, and upload results.

use crate::error::{ConvoyError, ConvoyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Operational status of a storage region
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RegionStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl RegionStatus {
    /// Regions in this status accept routed traffic
    pub fn is_available(&self) -> bool {
        matches!(self, RegionStatus::Healthy | RegionStatus::Degraded)
    }
}

/// Capacity limits and current load for a region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionCapacity {
    /// Maximum concurrent uploads (>= 1)
    pub max_concurrent_uploads: u32,

    /// Maximum bandwidth in Mbps
    pub max_bandwidth_mbps: f64,

    /// Current utilization percentage (0.0 to 100.0)
    pub current_utilization: f64,
}

impl Default for RegionCapacity {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 10,
            max_bandwidth_mbps: 1000.0,
            current_utilization: 0.0,
        }
    }
}

/// Health-check parameters for a region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    /// Whether active health checking is enabled
    pub enabled: bool,

    /// Interval between checks
    pub interval: Duration,

    /// Per-check timeout
    pub timeout: Duration,

    /// Consecutive failures before a region is considered unhealthy
    pub failure_threshold: u32,

    /// Consecutive successes before a region is considered recovered
    pub success_threshold: u32,

    /// Endpoint probed by the health check
    pub probe_endpoint: String,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 2,
            probe_endpoint: "/health".to_string(),
        }
    }
}

/// In-memory transfer metrics for a region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMetrics {
    /// Average upload latency in milliseconds
    pub avg_latency_ms: f64,

    /// Observed throughput in Mbps
    pub throughput_mbps: f64,

    /// Error rate percentage (0.0 to 100.0), derived from the counters
    pub error_rate: f64,

    /// Successful upload counter
    pub successful_uploads: u64,

    /// Failed upload counter
    pub failed_uploads: u64,

    /// Last metrics update timestamp
    pub last_updated: DateTime<Utc>,
}

impl Default for RegionMetrics {
    fn default() -> Self {
        Self {
            avg_latency_ms: 0.0,
            throughput_mbps: 0.0,
            error_rate: 0.0,
            successful_uploads: 0,
            failed_uploads: 0,
            last_updated: Utc::now(),
        }
    }
}

impl RegionMetrics {
    /// Recompute the error rate from the counters.
    ///
    /// error_rate = failed / (successful + failed) * 100 when the sum is
    /// positive, otherwise 0.
    pub fn recompute_error_rate(&mut self) {
        let total = self.successful_uploads + self.failed_uploads;
        self.error_rate = if total > 0 {
            (self.failed_uploads as f64 / total as f64) * 100.0
        } else {
            0.0
        };
    }

    /// Record one completed upload against the counters
    pub fn record_upload(&mut self, success: bool, latency_ms: f64, throughput_mbps: f64) {
        if success {
            self.successful_uploads += 1;
        } else {
            self.failed_uploads += 1;
        }
        self.avg_latency_ms = latency_ms;
        if throughput_mbps > 0.0 {
            self.throughput_mbps = throughput_mbps;
        }
        self.recompute_error_rate();
        self.last_updated = Utc::now();
    }
}

/// A configured storage region with independent health and capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// Stable region identifier (e.g. "us-east-1")
    pub name: String,

    /// Human-readable name
    pub display_name: String,

    /// Routing priority; smaller is preferred (>= 1)
    pub priority: u32,

    /// Weight for weighted routing (0 to 100)
    pub weight: u32,

    /// Current status
    pub status: RegionStatus,

    /// Capacity limits and load
    pub capacity: RegionCapacity,

    /// Health-check parameters
    pub health_check: HealthCheckSettings,

    /// In-memory transfer metrics
    pub metrics: RegionMetrics,
}

impl Region {
    /// Create a Healthy region with default capacity and health checks
    pub fn new(name: impl Into<String>, priority: u32, weight: u32) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            priority,
            weight,
            status: RegionStatus::Healthy,
            capacity: RegionCapacity::default(),
            health_check: HealthCheckSettings::default(),
            metrics: RegionMetrics::default(),
        }
    }

    /// Validate the region's configuration invariants
    pub fn validate(&self) -> ConvoyResult<()> {
        if self.name.is_empty() {
            return Err(ConvoyError::InvalidConfig {
                field: "region.name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.priority < 1 {
            return Err(ConvoyError::InvalidConfig {
                field: format!("region.{}.priority", self.name),
                reason: "must be >= 1".to_string(),
            });
        }
        if self.weight > 100 {
            return Err(ConvoyError::InvalidConfig {
                field: format!("region.{}.weight", self.name),
                reason: "must be in [0, 100]".to_string(),
            });
        }
        if self.capacity.max_concurrent_uploads < 1 {
            return Err(ConvoyError::InvalidConfig {
                field: format!("region.{}.capacity.max_concurrent_uploads", self.name),
                reason: "must be >= 1".to_string(),
            });
        }
        if self.health_check.enabled {
            if self.health_check.interval.is_zero() {
                return Err(ConvoyError::InvalidConfig {
                    field: format!("region.{}.health_check.interval", self.name),
                    reason: "must be positive when health checks are enabled".to_string(),
                });
            }
            if self.health_check.timeout.is_zero() {
                return Err(ConvoyError::InvalidConfig {
                    field: format!("region.{}.health_check.timeout", self.name),
                    reason: "must be positive when health checks are enabled".to_string(),
                });
            }
            if self.health_check.failure_threshold < 1 {
                return Err(ConvoyError::InvalidConfig {
                    field: format!("region.{}.health_check.failure_threshold", self.name),
                    reason: "must be >= 1".to_string(),
                });
            }
            if self.health_check.success_threshold < 1 {
                return Err(ConvoyError::InvalidConfig {
                    field: format!("region.{}.health_check.success_threshold", self.name),
                    reason: "must be >= 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A single upload request routed through the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Unique request id; auto-assigned when empty
    pub id: String,

    /// Source descriptor (path or logical name of the archive)
    pub source: String,

    /// Destination object key
    pub destination_key: String,

    /// Payload size in bytes
    pub size_bytes: u64,

    /// Preferred region, honored only while that region is Healthy
    pub preferred_region: Option<String>,

    /// Request priority (1 to 10)
    pub priority: u8,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Free-form request metadata
    pub metadata: HashMap<String, String>,
}

impl UploadRequest {
    pub fn new(
        source: impl Into<String>,
        destination_key: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            destination_key: destination_key.into(),
            size_bytes,
            preferred_region: None,
            priority: 5,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_preferred_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }
}

/// The outcome of one upload attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    /// Id of the originating request
    pub request_id: String,

    /// Region that executed the upload ("multi-region" for redundant uploads)
    pub region: String,

    /// Whether the upload succeeded
    pub success: bool,

    /// Error description; None exactly when success is true
    pub error: Option<String>,

    /// Wall-clock duration of the upload
    pub duration: Duration,

    /// Bytes actually transferred (<= request size)
    pub bytes_transferred: u64,

    /// Multipart upload id when the storage backend used one
    pub multipart_upload_id: Option<String>,

    /// Entity tag reported by the storage backend
    pub etag: Option<String>,

    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}
