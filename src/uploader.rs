//! Uploader Capability
//!
//! The coordinator drives every region through the minimal `Uploader`
//! capability. Real storage clients implement it; the simulated
//! transport here stands in for them so coordination logic can be
//! exercised without live network traffic, and remains swappable.

use crate::adaptive::TransferParams;
use crate::error::{ConvoyError, ConvoyResult};
use crate::regions::types::Region;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Assumed payload size for duration calculations on zero-size uploads
const DEFAULT_ASSUMED_SIZE_BYTES: u64 = 1024 * 1024;

/// Error rate above which the simulated transport injects failures
const FAILURE_INJECTION_THRESHOLD: f64 = 10.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// An archive handed to a per-region uploader
#[derive(Debug, Clone)]
pub struct Archive {
    /// Source descriptor (path or logical name)
    pub name: String,

    /// Destination object key
    pub key: String,

    /// Payload size in bytes
    pub size_bytes: u64,
}

/// What a per-region uploader reports back
#[derive(Debug, Clone)]
pub struct TransportResult {
    /// Storage location of the uploaded object
    pub location: String,

    /// Object key written
    pub key: String,

    /// Entity tag reported by the backend
    pub etag: String,

    /// Wall-clock upload duration
    pub duration: Duration,

    /// Effective throughput in MBps
    pub throughput_mbps: f64,
}

/// The minimal capability the core consumes from a storage uploader.
///
/// Richer adaptive uploaders implement `apply_parameters` to honor the
/// parameter bundles broadcast by the transfer controller.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload one archive to this uploader's region.
    async fn upload(&self, archive: &Archive) -> ConvoyResult<TransportResult>;

    /// Accept an updated transfer parameter bundle. Default: ignored.
    async fn apply_parameters(&self, _params: &TransferParams) -> ConvoyResult<()> {
        Ok(())
    }
}

/// A stand-in transport that models a region's behavior from its
/// configuration: priority-scaled connection setup, throughput-derived
/// transfer time, and failure injection when the region's error rate is
/// already high.
pub struct SimulatedTransport {
    region: String,
    priority: u32,
    throughput_mbps: f64,
    failure_probability: f64,
}

impl SimulatedTransport {
    pub fn from_region(region: &Region) -> Self {
        let throughput_mbps = if region.metrics.throughput_mbps > 0.0 {
            region.metrics.throughput_mbps
        } else {
            // Megabits configured, megabytes simulated.
            region.capacity.max_bandwidth_mbps / 8.0
        };
        let failure_probability = if region.metrics.error_rate > FAILURE_INJECTION_THRESHOLD {
            region.metrics.error_rate / 100.0
        } else {
            0.0
        };
        Self {
            region: region.name.clone(),
            priority: region.priority,
            throughput_mbps,
            failure_probability,
        }
    }
}

#[async_trait]
impl Uploader for SimulatedTransport {
    async fn upload(&self, archive: &Archive) -> ConvoyResult<TransportResult> {
        let started = Instant::now();

        // Connection setup scales with priority plus a little jitter.
        let jitter_ms = rand::rng().random_range(0..20);
        let setup = Duration::from_millis(10 + 5 * self.priority as u64 + jitter_ms);
        tokio::time::sleep(setup).await;

        if self.failure_probability > 0.0 && rand::rng().random::<f64>() < self.failure_probability
        {
            return Err(ConvoyError::UploadFailed {
                region: self.region.clone(),
                reason: "simulated transport failure".to_string(),
            });
        }

        let assumed_bytes = if archive.size_bytes == 0 {
            DEFAULT_ASSUMED_SIZE_BYTES
        } else {
            archive.size_bytes
        };
        let size_mb = assumed_bytes as f64 / BYTES_PER_MB;
        let effective_throughput = self.throughput_mbps.max(100.0);
        tokio::time::sleep(Duration::from_secs_f64(size_mb / effective_throughput)).await;

        let duration = started.elapsed();
        Ok(TransportResult {
            location: format!("s3://{}/{}", self.region, archive.key),
            key: archive.key.clone(),
            etag: Uuid::new_v4().simple().to_string(),
            duration,
            throughput_mbps: effective_throughput,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_upload_reports_location_and_etag() {
        let region = Region::new("us-east-1", 1, 50);
        let transport = SimulatedTransport::from_region(&region);

        let archive = Archive {
            name: "backup.tar.zst".to_string(),
            key: "archives/backup.tar.zst".to_string(),
            size_bytes: 1024 * 1024,
        };
        let result = transport.upload(&archive).await.unwrap();
        assert_eq!(result.location, "s3://us-east-1/archives/backup.tar.zst");
        assert_eq!(result.key, archive.key);
        assert!(!result.etag.is_empty());
        assert!(result.duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn zero_size_upload_succeeds() {
        let region = Region::new("us-east-1", 1, 50);
        let transport = SimulatedTransport::from_region(&region);

        let archive = Archive {
            name: "empty".to_string(),
            key: "archives/empty".to_string(),
            size_bytes: 0,
        };
        assert!(transport.upload(&archive).await.is_ok());
    }

    #[tokio::test]
    async fn saturated_error_rate_injects_failures() {
        let mut region = Region::new("us-east-1", 1, 50);
        region.metrics.successful_uploads = 0;
        region.metrics.failed_uploads = 100;
        region.metrics.recompute_error_rate();

        let transport = SimulatedTransport::from_region(&region);
        let archive = Archive {
            name: "doomed".to_string(),
            key: "archives/doomed".to_string(),
            size_bytes: 1024,
        };
        // error_rate is 100%, so every attempt fails.
        assert!(transport.upload(&archive).await.is_err());
    }
}
