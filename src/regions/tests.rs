//! Unit tests for the multi-region coordinator.
//!
//! Exercises configuration validation, routing, metric updates, and the
//! auto-failover path using scripted transports instead of live traffic.

use crate::config::{FailoverConfig, LoadBalancingConfig, LoadBalancingStrategy, MultiRegionConfig};
use crate::error::ConvoyError;
use crate::regions::coordinator::MultiRegionCoordinator;
use crate::regions::types::{Region, RegionStatus, UploadRequest};
use crate::uploader::{Archive, TransportResult, Uploader};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A transport that fails in scripted regions and counts every call.
struct ScriptedTransport {
    region: String,
    fail_regions: Arc<HashSet<String>>,
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl Uploader for ScriptedTransport {
    async fn upload(&self, archive: &Archive) -> Result<TransportResult, ConvoyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_regions.contains(&self.region) {
            return Err(ConvoyError::UploadFailed {
                region: self.region.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(TransportResult {
            location: format!("s3://{}/{}", self.region, archive.key),
            key: archive.key.clone(),
            etag: "etag".to_string(),
            duration: Duration::from_millis(5),
            throughput_mbps: 120.0,
        })
    }
}

fn two_region_config() -> MultiRegionConfig {
    MultiRegionConfig {
        primary_region: "us-east-1".to_string(),
        regions: vec![
            Region::new("us-east-1", 1, 50),
            Region::new("us-west-2", 2, 30),
        ],
        load_balancing: LoadBalancingConfig {
            strategy: LoadBalancingStrategy::PriorityBased,
            sticky_sessions: false,
            session_ttl: Duration::from_secs(600),
        },
        failover: FailoverConfig {
            detection_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn scripted_coordinator(
    fail_regions: &[&str],
) -> (MultiRegionCoordinator, Arc<AtomicU64>) {
    let fail_regions = Arc::new(
        fail_regions
            .iter()
            .map(|s| s.to_string())
            .collect::<HashSet<_>>(),
    );
    let calls = Arc::new(AtomicU64::new(0));
    let calls_clone = Arc::clone(&calls);
    let coordinator = MultiRegionCoordinator::with_transport_factory(Arc::new(move |region: &Region| {
        Arc::new(ScriptedTransport {
            region: region.name.clone(),
            fail_regions: Arc::clone(&fail_regions),
            calls: Arc::clone(&calls_clone),
        }) as Arc<dyn Uploader>
    }));
    (coordinator, calls)
}

#[tokio::test]
async fn double_initialize_is_rejected_without_mutation() {
    let (coordinator, _) = scripted_coordinator(&[]);
    coordinator.initialize(two_region_config()).await.unwrap();

    let mut second = two_region_config();
    second.regions.push(Region::new("eu-central-1", 3, 20));
    assert!(matches!(
        coordinator.initialize(second).await,
        Err(ConvoyError::AlreadyInitialized)
    ));

    // The original region set is untouched.
    assert_eq!(coordinator.region_status().await.unwrap().len(), 2);
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn operations_require_initialization() {
    let (coordinator, _) = scripted_coordinator(&[]);
    let request = UploadRequest::new("a.tar", "k", 1024);
    assert!(matches!(
        coordinator.upload(request).await,
        Err(ConvoyError::NotInitialized)
    ));
    assert!(matches!(
        coordinator.shutdown(Duration::from_secs(1)).await,
        Err(ConvoyError::NotInitialized)
    ));
}

#[tokio::test]
async fn upload_lands_in_preferred_region() {
    let (coordinator, calls) = scripted_coordinator(&[]);
    coordinator.initialize(two_region_config()).await.unwrap();

    let request =
        UploadRequest::new("archive.tar.zst", "archives/archive.tar.zst", 1024 * 1024)
            .with_preferred_region("us-east-1");
    let result = coordinator.upload(request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.region, "us-east-1");
    assert_eq!(result.bytes_transferred, 1024 * 1024);
    assert!(result.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let metrics = coordinator.region_metrics().await.unwrap();
    assert_eq!(metrics["us-east-1"].successful_uploads, 1);
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn unhealthy_preferred_region_is_excluded() {
    let (coordinator, _) = scripted_coordinator(&[]);
    let mut config = two_region_config();
    config.regions[0].status = RegionStatus::Unhealthy;
    coordinator.initialize(config).await.unwrap();

    let request = UploadRequest::new("archive.tar.zst", "k", 1024)
        .with_preferred_region("us-east-1");
    let result = coordinator.upload(request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.region, "us-west-2");
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn failed_upload_fails_over_to_healthy_region() {
    let (coordinator, calls) = scripted_coordinator(&["us-east-1"]);
    coordinator.initialize(two_region_config()).await.unwrap();

    let request = UploadRequest::new("archive.tar.zst", "k", 1024);
    let result = coordinator.upload(request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.region, "us-west-2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = coordinator.stats().await.unwrap();
    assert_eq!(stats.successful_uploads, 1);
    assert_eq!(stats.failover_uploads, 1);

    let metrics = coordinator.region_metrics().await.unwrap();
    assert_eq!(metrics["us-east-1"].failed_uploads, 1);
    assert_eq!(metrics["us-west-2"].successful_uploads, 1);
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn disabled_auto_failover_surfaces_the_error() {
    let (coordinator, calls) = scripted_coordinator(&["us-east-1"]);
    let mut config = two_region_config();
    config.failover.auto_failover = false;
    coordinator.initialize(config).await.unwrap();

    let request = UploadRequest::new("archive.tar.zst", "k", 1024);
    assert!(matches!(
        coordinator.upload(request).await,
        Err(ConvoyError::UploadFailed { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = coordinator.stats().await.unwrap();
    assert_eq!(stats.failed_uploads, 1);
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn repeated_failures_demote_a_region() {
    let (coordinator, _) = scripted_coordinator(&["us-east-1"]);
    coordinator.initialize(two_region_config()).await.unwrap();

    for _ in 0..3 {
        let request =
            UploadRequest::new("archive.tar.zst", "k", 1024).with_preferred_region("us-east-1");
        let _ = coordinator.upload(request).await;
    }

    // Every us-east-1 attempt failed, so its error rate is far past the
    // demotion threshold.
    let status = coordinator.region_status().await.unwrap();
    assert_ne!(status["us-east-1"], RegionStatus::Healthy);
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_inflight_failover_retries() {
    // Both regions fail, so the upload sits in the retry pause when the
    // shutdown broadcast arrives.
    let (coordinator, calls) = scripted_coordinator(&["us-east-1", "us-west-2"]);
    let mut config = two_region_config();
    config.failover.detection_interval = Duration::from_secs(10);
    coordinator.initialize(config).await.unwrap();

    let coordinator = Arc::new(coordinator);
    let upload_task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let request = UploadRequest::new("archive.tar.zst", "k", 1024);
            coordinator.upload(request).await
        })
    };

    // Let the upload fail in the routed region and enter the retry pause.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();

    let outcome = upload_task.await.unwrap();
    assert!(matches!(outcome, Err(ConvoyError::Canceled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_allows_reinitialization() {
    let (coordinator, _) = scripted_coordinator(&[]);
    coordinator.initialize(two_region_config()).await.unwrap();
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();

    assert!(!coordinator.is_initialized().await);
    coordinator.initialize(two_region_config()).await.unwrap();
    assert!(coordinator.is_initialized().await);
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn transporter_lookup_validates_the_region() {
    let (coordinator, _) = scripted_coordinator(&[]);
    coordinator.initialize(two_region_config()).await.unwrap();

    assert!(coordinator.region_transporter("us-east-1").await.is_ok());
    assert!(matches!(
        coordinator.region_transporter("mars-north-1").await,
        Err(ConvoyError::RegionNotFound { .. })
    ));
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();
}
