//! Multi-Region Upload Facade
//!
//! Wraps the coordinator with an archive-level request that carries a
//! destination bucket, preferred regions, and a redundancy level. Single
//! mode delegates to the coordinator with cross-region retries; redundant
//! mode fans the upload out to several regions in parallel and accepts
//! the result on a majority quorum.

use crate::error::{ConvoyError, ConvoyResult};
use crate::regions::coordinator::MultiRegionCoordinator;
use crate::regions::types::{RegionStatus, UploadRequest, UploadResult};
use crate::uploader::{Archive, Uploader};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Region label carried by aggregated redundant-upload results
const MULTI_REGION: &str = "multi-region";

/// Retry and redundancy policy for archive uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPolicy {
    /// Cross-region retries after a failed single-mode upload
    pub cross_region_retries: u32,

    /// Delay between cross-region retries
    pub failover_delay: Duration,

    /// Whether redundant (multi-region) uploads are enabled
    pub redundant_uploads: bool,

    /// Accept a redundant upload with any success instead of a majority
    pub allow_degraded_upload: bool,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            cross_region_retries: 2,
            failover_delay: Duration::from_secs(1),
            redundant_uploads: true,
            allow_degraded_upload: false,
        }
    }
}

/// An archive-level upload request
#[derive(Debug, Clone)]
pub struct ArchiveUploadRequest {
    /// The archive to upload
    pub archive: Archive,

    /// Destination bucket
    pub bucket: String,

    /// Regions to prefer, most preferred first
    pub preferred_regions: Vec<String>,

    /// Number of regions to write in redundant mode; <= 1 means single
    pub redundancy_level: u32,

    /// Request priority (1 to 10)
    pub priority: u8,

    /// Free-form request metadata
    pub metadata: HashMap<String, String>,
}

impl ArchiveUploadRequest {
    pub fn new(archive: Archive, bucket: impl Into<String>) -> Self {
        Self {
            archive,
            bucket: bucket.into(),
            preferred_regions: Vec::new(),
            redundancy_level: 1,
            priority: 5,
            metadata: HashMap::new(),
        }
    }
}

/// The outcome of an archive upload
#[derive(Debug, Clone)]
pub struct ArchiveUploadResult {
    /// Request id
    pub request_id: String,

    /// Overall success
    pub success: bool,

    /// Executing region, or "multi-region" for redundant uploads
    pub region: String,

    /// Location of the first successful copy
    pub primary_location: String,

    /// Number of regions holding a copy
    pub redundant_copies: usize,

    /// Per-region results for successful copies
    pub region_results: HashMap<String, UploadResult>,

    /// Regions that failed to accept a copy
    pub failed_regions: Vec<String>,

    /// Slowest branch duration (redundant) or upload duration (single)
    pub total_duration: Duration,
}

/// Archive-level upload surface over the multi-region coordinator.
pub struct MultiRegionUploader {
    coordinator: Arc<MultiRegionCoordinator>,
    policy: UploadPolicy,

    /// One pre-built uploader per region, shared with the coordinator
    transports: HashMap<String, Arc<dyn Uploader>>,
}

impl MultiRegionUploader {
    /// Build the facade over an initialized coordinator.
    pub async fn new(
        coordinator: Arc<MultiRegionCoordinator>,
        policy: UploadPolicy,
    ) -> ConvoyResult<Self> {
        let transports = coordinator.transports().await?;
        Ok(Self {
            coordinator,
            policy,
            transports,
        })
    }

    /// The pre-built uploader for one region.
    pub fn region_transporter(&self, region: &str) -> ConvoyResult<Arc<dyn Uploader>> {
        self.transports
            .get(region)
            .cloned()
            .ok_or_else(|| ConvoyError::RegionNotFound {
                region: region.to_string(),
            })
    }

    /// Upload an archive, redundantly when the request asks for it.
    pub async fn upload_archive(
        &self,
        request: ArchiveUploadRequest,
    ) -> ConvoyResult<ArchiveUploadResult> {
        if request.redundancy_level > 1 && self.policy.redundant_uploads {
            self.upload_redundant(request).await
        } else {
            self.upload_single(request).await
        }
    }

    /// Single mode: delegate to the coordinator, then retry across
    /// regions on failure, avoiding regions that already failed.
    async fn upload_single(
        &self,
        request: ArchiveUploadRequest,
    ) -> ConvoyResult<ArchiveUploadResult> {
        let key = object_key(&request);
        let preferred = request.preferred_regions.first().cloned();
        let upload_request = build_upload_request(&request, key.clone(), preferred);

        let mut avoided: HashSet<String> = HashSet::new();
        let mut last_error = match self.coordinator.upload(upload_request).await {
            Ok(result) => return Ok(wrap_single(result, &key)),
            Err(error) => {
                if let ConvoyError::UploadFailed { ref region, .. } = error {
                    avoided.insert(region.clone());
                }
                error
            }
        };

        for attempt in 1..=self.policy.cross_region_retries {
            tokio::time::sleep(self.policy.failover_delay).await;

            let preferred = self.pick_retry_region(&avoided).await?;
            tracing::info!(
                attempt,
                preferred = preferred.as_deref().unwrap_or("any"),
                "cross-region retry"
            );

            let retry_request = build_upload_request(&request, key.clone(), preferred);
            match self.coordinator.upload(retry_request).await {
                Ok(result) => return Ok(wrap_single(result, &key)),
                Err(error) => {
                    if let ConvoyError::UploadFailed { ref region, .. } = error {
                        avoided.insert(region.clone());
                    }
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Redundant mode: fan the upload out to N regions and accept on a
    /// majority quorum (or any success when degraded uploads are allowed).
    async fn upload_redundant(
        &self,
        request: ArchiveUploadRequest,
    ) -> ConvoyResult<ArchiveUploadResult> {
        let preferred = request.preferred_regions.first().map(String::as_str);
        let regions = self
            .coordinator
            .select_upload_regions(request.redundancy_level as usize, preferred)
            .await?;
        let attempted = regions.len();
        let quorum = (attempted + 1).div_ceil(2);

        let key = object_key(&request);
        let request_id = Uuid::new_v4().to_string();
        let mut branches = JoinSet::new();
        for region in regions {
            let transporter = self.region_transporter(&region)?;
            let mut archive = request.archive.clone();
            archive.key = key.clone();
            branches.spawn(async move {
                let started = Instant::now();
                let outcome = transporter.upload(&archive).await;
                (region, outcome, started.elapsed())
            });
        }

        let mut region_results: HashMap<String, UploadResult> = HashMap::new();
        let mut failed_regions: Vec<String> = Vec::new();
        let mut primary_location: Option<String> = None;
        let mut total_duration = Duration::ZERO;

        // join_next yields branches in completion order, so the first
        // success observed here is the earliest one.
        while let Some(joined) = branches.join_next().await {
            let Ok((region, outcome, duration)) = joined else {
                continue;
            };
            total_duration = total_duration.max(duration);
            let latency_ms = duration.as_secs_f64() * 1000.0;

            match outcome {
                Ok(transport_result) => {
                    self.coordinator
                        .record_upload_outcome(
                            &region,
                            true,
                            latency_ms,
                            transport_result.throughput_mbps,
                        )
                        .await
                        .ok();
                    primary_location.get_or_insert_with(|| transport_result.location.clone());
                    region_results.insert(
                        region.clone(),
                        UploadResult {
                            request_id: request_id.clone(),
                            region,
                            success: true,
                            error: None,
                            duration,
                            bytes_transferred: request.archive.size_bytes,
                            multipart_upload_id: None,
                            etag: Some(transport_result.etag),
                            completed_at: Utc::now(),
                        },
                    );
                }
                Err(error) => {
                    self.coordinator
                        .record_upload_outcome(&region, false, latency_ms, 0.0)
                        .await
                        .ok();
                    tracing::warn!(region = %region, error = %error, "redundant branch failed");
                    failed_regions.push(region);
                }
            }
        }

        let successes = region_results.len();
        let accepted =
            successes >= quorum || (self.policy.allow_degraded_upload && successes >= 1);
        if !accepted {
            return Err(ConvoyError::QuorumNotMet {
                successes,
                required: quorum,
            });
        }

        tracing::info!(
            request = %request_id,
            copies = successes,
            attempted,
            "redundant upload accepted"
        );
        Ok(ArchiveUploadResult {
            request_id,
            success: true,
            region: MULTI_REGION.to_string(),
            primary_location: primary_location.unwrap_or_default(),
            redundant_copies: successes,
            region_results,
            failed_regions,
            total_duration,
        })
    }

    /// Best healthy region outside the avoided set, by priority.
    async fn pick_retry_region(&self, avoided: &HashSet<String>) -> ConvoyResult<Option<String>> {
        let snapshot = self.coordinator.regions_snapshot().await?;
        Ok(snapshot
            .iter()
            .filter(|r| r.status == RegionStatus::Healthy && !avoided.contains(&r.name))
            .min_by_key(|r| r.priority)
            .map(|r| r.name.clone()))
    }
}

fn object_key(request: &ArchiveUploadRequest) -> String {
    format!("{}/{}", request.bucket, request.archive.key)
}

fn build_upload_request(
    request: &ArchiveUploadRequest,
    key: String,
    preferred: Option<String>,
) -> UploadRequest {
    UploadRequest {
        id: String::new(),
        source: request.archive.name.clone(),
        destination_key: key,
        size_bytes: request.archive.size_bytes,
        preferred_region: preferred,
        priority: request.priority,
        created_at: Utc::now(),
        metadata: request.metadata.clone(),
    }
}

fn wrap_single(result: UploadResult, key: &str) -> ArchiveUploadResult {
    ArchiveUploadResult {
        request_id: result.request_id.clone(),
        success: result.success,
        region: result.region.clone(),
        primary_location: format!("s3://{}/{}", result.region, key),
        redundant_copies: 1,
        total_duration: result.duration,
        failed_regions: Vec::new(),
        region_results: HashMap::from([(result.region.clone(), result)]),
    }
}
