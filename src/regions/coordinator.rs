//! Multi-Region Coordinator
//!
//! Top-level orchestrator for multi-region uploads: validates the
//! configuration, composes the region selector, load balancer, and
//! failover manager, executes uploads with automatic cross-region
//! failover, tracks per-region metrics, and runs the background health,
//! metrics, and failover-detection services.

use crate::config::MultiRegionConfig;
use crate::error::{ConvoyError, ConvoyResult};
use crate::regions::failover::FailoverManager;
use crate::regions::load_balancer::{LoadBalancer, LoadBalancerStats};
use crate::regions::selector::RegionSelector;
use crate::regions::types::{Region, RegionMetrics, RegionStatus, UploadRequest, UploadResult};
use crate::uploader::{Archive, SimulatedTransport, Uploader};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Total time budget for retrying one upload across regions
const FAILOVER_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Fallback interval for the health service
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Fallback interval for the metrics service
const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Fallback interval for the failover-detection service
const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(15);

/// Builds a per-region uploader at initialization time. The default
/// factory produces the simulated transport; production deployments
/// inject real storage clients here.
pub type TransportFactory = Arc<dyn Fn(&Region) -> Arc<dyn Uploader> + Send + Sync>;

/// Coordinator-level counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Upload requests accepted
    pub total_uploads: u64,

    /// Uploads that completed successfully
    pub successful_uploads: u64,

    /// Uploads that failed in every attempted region
    pub failed_uploads: u64,

    /// Uploads that succeeded only after cross-region retry
    pub failover_uploads: u64,

    /// Primary-region failovers executed by the detection service
    pub failovers_executed: u64,
}

struct CoordinatorInner {
    config: MultiRegionConfig,

    /// Region map; the coordinator owns it, the balancer reads it
    regions: Arc<RwLock<HashMap<String, Region>>>,

    selector: Arc<RegionSelector>,
    load_balancer: Arc<LoadBalancer>,
    failover: Arc<FailoverManager>,

    /// One pre-built uploader per region
    transports: HashMap<String, Arc<dyn Uploader>>,

    /// The region currently treated as primary; failovers move it
    current_primary: Arc<RwLock<String>>,

    stats: Arc<RwLock<CoordinatorStats>>,

    /// Effective failover-detection interval (defaults applied)
    detection_interval: Duration,

    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Coordinates uploads across the configured regions.
pub struct MultiRegionCoordinator {
    inner: RwLock<Option<Arc<CoordinatorInner>>>,
    transport_factory: TransportFactory,
}

impl Default for MultiRegionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiRegionCoordinator {
    /// Coordinator backed by the simulated per-region transport.
    pub fn new() -> Self {
        Self::with_transport_factory(Arc::new(|region: &Region| {
            Arc::new(SimulatedTransport::from_region(region)) as Arc<dyn Uploader>
        }))
    }

    /// Coordinator with injected per-region uploaders.
    pub fn with_transport_factory(factory: TransportFactory) -> Self {
        Self {
            inner: RwLock::new(None),
            transport_factory: factory,
        }
    }

    /// Validate the configuration, build all subsystems, and start the
    /// background services. Fails without mutating state when already
    /// initialized or when the configuration is invalid.
    pub async fn initialize(&self, config: MultiRegionConfig) -> ConvoyResult<()> {
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Err(ConvoyError::AlreadyInitialized);
        }
        config.validate()?;

        let mut region_map = HashMap::new();
        let mut transports: HashMap<String, Arc<dyn Uploader>> = HashMap::new();
        for region in &config.regions {
            region_map.insert(region.name.clone(), region.clone());
            transports.insert(region.name.clone(), (self.transport_factory)(region));
        }

        let regions = Arc::new(RwLock::new(region_map));
        let selector = Arc::new(RegionSelector::new(config.load_balancing.strategy));
        let load_balancer = Arc::new(LoadBalancer::new(
            config.load_balancing.clone(),
            Arc::clone(&regions),
            Arc::clone(&selector),
        ));
        let failover = Arc::new(FailoverManager::new(config.failover.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        let detection_interval = effective_interval(
            config.failover.detection_interval,
            DEFAULT_DETECTION_INTERVAL,
        );

        let inner = Arc::new(CoordinatorInner {
            current_primary: Arc::new(RwLock::new(config.primary_region.clone())),
            config,
            regions,
            selector,
            load_balancer,
            failover,
            transports,
            stats: Arc::new(RwLock::new(CoordinatorStats::default())),
            detection_interval,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        });

        inner.load_balancer.start().await;
        Self::start_background_services(&inner).await;

        tracing::info!(
            regions = inner.config.regions.len(),
            primary = %inner.config.primary_region,
            "multi-region coordinator initialized"
        );
        *guard = Some(inner);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Execute one upload, failing over to alternative regions when the
    /// routed region fails and auto-failover is enabled.
    pub async fn upload(&self, mut request: UploadRequest) -> ConvoyResult<UploadResult> {
        let inner = self.inner_handle().await?;

        if request.id.is_empty() {
            request.id = Uuid::new_v4().to_string();
            request.created_at = Utc::now();
        }
        inner.stats.write().await.total_uploads += 1;

        let region = inner.load_balancer.route(&request).await?;
        match Self::execute_region_upload(&inner, &region, &request).await {
            Ok(result) => {
                inner.failover.record_success(&region).await;
                inner.stats.write().await.successful_uploads += 1;
                Ok(result)
            }
            Err(first_error) => {
                tracing::warn!(
                    request = %request.id,
                    region = %region,
                    error = %first_error,
                    "upload failed in routed region"
                );
                inner.failover.record_failure(&region).await;

                if !inner.config.failover.auto_failover {
                    inner.stats.write().await.failed_uploads += 1;
                    return Err(first_error);
                }

                match Self::retry_in_alternative_regions(&inner, &region, &request, first_error)
                    .await
                {
                    Ok(result) => {
                        let mut stats = inner.stats.write().await;
                        stats.successful_uploads += 1;
                        stats.failover_uploads += 1;
                        Ok(result)
                    }
                    Err(error) => {
                        inner.stats.write().await.failed_uploads += 1;
                        Err(error)
                    }
                }
            }
        }
    }

    /// Execute one upload in a specific region, without failover. Used by
    /// the redundant-upload facade.
    pub async fn upload_to_region(
        &self,
        region: &str,
        request: &UploadRequest,
    ) -> ConvoyResult<UploadResult> {
        let inner = self.inner_handle().await?;
        let result = Self::execute_region_upload(&inner, region, request).await;
        match &result {
            Ok(_) => inner.failover.record_success(region).await,
            Err(_) => inner.failover.record_failure(region).await,
        }
        result
    }

    /// Select up to `count` distinct upload regions by the configured
    /// strategy. Used by the redundant-upload facade.
    pub async fn select_upload_regions(
        &self,
        count: usize,
        preferred: Option<&str>,
    ) -> ConvoyResult<Vec<String>> {
        let inner = self.inner_handle().await?;
        let regions: Vec<Region> = inner.regions.read().await.values().cloned().collect();
        let selected = inner.selector.select_regions(&regions, count, preferred)?;
        Ok(selected.into_iter().map(|r| r.name.clone()).collect())
    }

    /// The pre-built uploader for one region.
    pub async fn region_transporter(&self, region: &str) -> ConvoyResult<Arc<dyn Uploader>> {
        let inner = self.inner_handle().await?;
        inner
            .transports
            .get(region)
            .cloned()
            .ok_or_else(|| ConvoyError::RegionNotFound {
                region: region.to_string(),
            })
    }

    /// All pre-built per-region uploaders.
    pub(crate) async fn transports(&self) -> ConvoyResult<HashMap<String, Arc<dyn Uploader>>> {
        let inner = self.inner_handle().await?;
        Ok(inner.transports.clone())
    }

    /// Update one region's status through the load balancer.
    pub async fn update_region_status(
        &self,
        region: &str,
        status: RegionStatus,
    ) -> ConvoyResult<()> {
        let inner = self.inner_handle().await?;
        inner.load_balancer.update_region_status(region, status).await
    }

    /// Status of every region (a copy).
    pub async fn region_status(&self) -> ConvoyResult<HashMap<String, RegionStatus>> {
        let inner = self.inner_handle().await?;
        let regions = inner.regions.read().await;
        Ok(regions
            .iter()
            .map(|(name, region)| (name.clone(), region.status))
            .collect())
    }

    /// Metrics of every region (a copy).
    pub async fn region_metrics(&self) -> ConvoyResult<HashMap<String, RegionMetrics>> {
        let inner = self.inner_handle().await?;
        let regions = inner.regions.read().await;
        Ok(regions
            .iter()
            .map(|(name, region)| (name.clone(), region.metrics.clone()))
            .collect())
    }

    /// Full region snapshots (copies).
    pub async fn regions_snapshot(&self) -> ConvoyResult<Vec<Region>> {
        let inner = self.inner_handle().await?;
        let result = inner.regions.read().await.values().cloned().collect();
        Ok(result)
    }

    /// The region currently treated as primary.
    pub async fn current_primary(&self) -> ConvoyResult<String> {
        let inner = self.inner_handle().await?;
        let result = inner.current_primary.read().await.clone();
        Ok(result)
    }

    /// Coordinator counters (a copy).
    pub async fn stats(&self) -> ConvoyResult<CoordinatorStats> {
        let inner = self.inner_handle().await?;
        let result = inner.stats.read().await.clone();
        Ok(result)
    }

    /// Load balancer counters (a copy).
    pub async fn load_balancer_stats(&self) -> ConvoyResult<LoadBalancerStats> {
        let inner = self.inner_handle().await?;
        Ok(inner.load_balancer.stats().await)
    }

    /// Record an upload outcome executed outside the coordinator (by the
    /// redundant-upload facade) against a region's metrics.
    pub(crate) async fn record_upload_outcome(
        &self,
        region: &str,
        success: bool,
        latency_ms: f64,
        throughput_mbps: f64,
    ) -> ConvoyResult<()> {
        let inner = self.inner_handle().await?;
        Self::apply_metrics(&inner, region, success, latency_ms, throughput_mbps).await;
        if success {
            inner.failover.record_success(region).await;
        } else {
            inner.failover.record_failure(region).await;
        }
        Ok(())
    }

    /// Stop the background services and tear down the coordinator,
    /// honoring the given deadline.
    pub async fn shutdown(&self, timeout: Duration) -> ConvoyResult<()> {
        let inner = self
            .inner
            .write()
            .await
            .take()
            .ok_or(ConvoyError::NotInitialized)?;

        inner.load_balancer.shutdown().await;
        let _ = inner.shutdown_tx.send(true);

        let workers = std::mem::take(&mut *inner.workers.lock().await);
        let join_all = async {
            for handle in workers {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(timeout, join_all)
            .await
            .map_err(|_| ConvoyError::ShutdownTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })?;

        tracing::info!("multi-region coordinator shut down");
        Ok(())
    }

    async fn inner_handle(&self) -> ConvoyResult<Arc<CoordinatorInner>> {
        self.inner
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(ConvoyError::NotInitialized)
    }

    /// Upload to one region and fold the outcome into its metrics.
    async fn execute_region_upload(
        inner: &Arc<CoordinatorInner>,
        region_name: &str,
        request: &UploadRequest,
    ) -> ConvoyResult<UploadResult> {
        let transport = inner
            .transports
            .get(region_name)
            .cloned()
            .ok_or_else(|| ConvoyError::RegionNotFound {
                region: region_name.to_string(),
            })?;

        let archive = Archive {
            name: request.source.clone(),
            key: request.destination_key.clone(),
            size_bytes: request.size_bytes,
        };

        let started = Instant::now();
        let outcome = transport.upload(&archive).await;
        let duration = started.elapsed();
        let latency_ms = duration.as_secs_f64() * 1000.0;

        let (success, throughput) = match &outcome {
            Ok(result) => (true, result.throughput_mbps),
            Err(_) => (false, 0.0),
        };
        Self::apply_metrics(inner, region_name, success, latency_ms, throughput).await;

        let transport_result = outcome?;
        Ok(UploadResult {
            request_id: request.id.clone(),
            region: region_name.to_string(),
            success: true,
            error: None,
            duration,
            bytes_transferred: request.size_bytes,
            multipart_upload_id: None,
            etag: Some(transport_result.etag),
            completed_at: Utc::now(),
        })
    }

    /// Update one region's metrics and demote it when its error rate
    /// crosses the alert threshold.
    async fn apply_metrics(
        inner: &Arc<CoordinatorInner>,
        region_name: &str,
        success: bool,
        latency_ms: f64,
        throughput_mbps: f64,
    ) {
        let threshold = inner.config.monitoring.alert_thresholds.error_rate_percent;
        let mut regions = inner.regions.write().await;
        if let Some(region) = regions.get_mut(region_name) {
            region.metrics.record_upload(success, latency_ms, throughput_mbps);
            if region.metrics.error_rate > threshold && region.status == RegionStatus::Healthy {
                region.status = RegionStatus::Degraded;
                tracing::warn!(
                    region = %region_name,
                    error_rate = region.metrics.error_rate,
                    "region demoted to degraded"
                );
            }
        }
    }

    /// Iterate the remaining Healthy regions until one accepts the
    /// upload, bounded by the failover budget.
    async fn retry_in_alternative_regions(
        inner: &Arc<CoordinatorInner>,
        failed_region: &str,
        request: &UploadRequest,
        mut last_error: ConvoyError,
    ) -> ConvoyResult<UploadResult> {
        let budget_start = Instant::now();
        let pause = inner.detection_interval / 2;
        let mut excluded: HashSet<String> = HashSet::new();
        excluded.insert(failed_region.to_string());
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        loop {
            let candidates: Vec<String> = {
                let regions = inner.regions.read().await;
                let mut healthy: Vec<&Region> = regions
                    .values()
                    .filter(|r| {
                        r.status == RegionStatus::Healthy && !excluded.contains(&r.name)
                    })
                    .collect();
                healthy.sort_by_key(|r| r.priority);
                healthy.iter().map(|r| r.name.clone()).collect()
            };
            if candidates.is_empty() {
                return Err(last_error);
            }

            for candidate in candidates {
                if budget_start.elapsed() > FAILOVER_BUDGET {
                    return Err(ConvoyError::FailoverTimeout {
                        elapsed_ms: budget_start.elapsed().as_millis() as u64,
                    });
                }

                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown_rx.changed() => return Err(ConvoyError::Canceled),
                }

                match Self::execute_region_upload(inner, &candidate, request).await {
                    Ok(result) => {
                        inner.failover.record_success(&candidate).await;
                        tracing::info!(
                            request = %request.id,
                            region = %candidate,
                            "upload recovered via alternative region"
                        );
                        return Ok(result);
                    }
                    Err(error) => {
                        inner.failover.record_failure(&candidate).await;
                        excluded.insert(candidate);
                        last_error = error;
                    }
                }
            }
        }
    }

    async fn start_background_services(inner: &Arc<CoordinatorInner>) {
        let mut workers = inner.workers.lock().await;
        workers.push(Self::spawn_health_service(inner));
        if inner.config.monitoring.enabled {
            workers.push(Self::spawn_metrics_service(inner));
        }
        workers.push(Self::spawn_failover_detection_service(inner));
    }

    /// Demotes regions the failure history marks as failed and promotes
    /// them back once they recover.
    fn spawn_health_service(inner: &Arc<CoordinatorInner>) -> JoinHandle<()> {
        let regions = Arc::clone(&inner.regions);
        let failover = Arc::clone(&inner.failover);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let interval_duration = health_interval(&inner.config);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let names: Vec<String> = regions.read().await.keys().cloned().collect();
                        for name in names {
                            let failed = failover.detect_failure(&name).await;
                            let recovered = !failed
                                && failover
                                    .failure_history(&name)
                                    .await
                                    .map(|h| h.consecutive_failures == 0)
                                    .unwrap_or(false);

                            let mut guard = regions.write().await;
                            let Some(region) = guard.get_mut(&name) else { continue };
                            if failed && region.status.is_available() {
                                tracing::warn!(region = %name, "health check marked region unhealthy");
                                region.status = RegionStatus::Unhealthy;
                            } else if recovered && region.status == RegionStatus::Unhealthy {
                                tracing::info!(region = %name, "region recovered");
                                region.status = RegionStatus::Healthy;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Periodically logs aggregate region metrics. An observability sink;
    /// transient errors never propagate out of it.
    fn spawn_metrics_service(inner: &Arc<CoordinatorInner>) -> JoinHandle<()> {
        let regions = Arc::clone(&inner.regions);
        let stats = Arc::clone(&inner.stats);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let interval_duration = effective_interval(
            inner.config.monitoring.metrics_interval,
            DEFAULT_METRICS_INTERVAL,
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let (successful, failed): (u64, u64) = {
                            let guard = regions.read().await;
                            guard.values().fold((0, 0), |(ok, err), region| {
                                (
                                    ok + region.metrics.successful_uploads,
                                    err + region.metrics.failed_uploads,
                                )
                            })
                        };
                        let stats = stats.read().await.clone();
                        tracing::debug!(
                            region_successes = successful,
                            region_failures = failed,
                            total_uploads = stats.total_uploads,
                            "metrics sweep"
                        );
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Watches the current primary and fails over to the best healthy
    /// alternative when the failure history marks it failed.
    fn spawn_failover_detection_service(inner: &Arc<CoordinatorInner>) -> JoinHandle<()> {
        let regions = Arc::clone(&inner.regions);
        let failover = Arc::clone(&inner.failover);
        let current_primary = Arc::clone(&inner.current_primary);
        let stats = Arc::clone(&inner.stats);
        let auto_failover = inner.config.failover.auto_failover;
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let interval_duration = inner.detection_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !auto_failover {
                            continue;
                        }
                        let primary = current_primary.read().await.clone();
                        if !failover.detect_failure(&primary).await {
                            continue;
                        }

                        let alternative = {
                            let guard = regions.read().await;
                            guard
                                .values()
                                .filter(|r| {
                                    r.status == RegionStatus::Healthy && r.name != primary
                                })
                                .min_by_key(|r| r.priority)
                                .map(|r| r.name.clone())
                        };
                        let Some(alternative) = alternative else {
                            tracing::warn!(
                                primary = %primary,
                                "primary region failed with no healthy alternative"
                            );
                            continue;
                        };

                        match failover.execute_failover(&primary, &alternative).await {
                            Ok(_) => {
                                *current_primary.write().await = alternative.clone();
                                stats.write().await.failovers_executed += 1;
                                tracing::info!(
                                    from = %primary,
                                    to = %alternative,
                                    "primary region failed over"
                                );
                            }
                            Err(ConvoyError::FailoverInProgress { .. }) => {}
                            Err(error) => {
                                tracing::warn!(
                                    from = %primary,
                                    to = %alternative,
                                    error = %error,
                                    "automatic failover failed"
                                );
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }
}

fn effective_interval(configured: Duration, default: Duration) -> Duration {
    if configured.is_zero() {
        default
    } else {
        configured
    }
}

/// The health service runs at the shortest enabled per-region check
/// interval, or the default when none is configured.
fn health_interval(config: &MultiRegionConfig) -> Duration {
    config
        .regions
        .iter()
        .filter(|r| r.health_check.enabled && !r.health_check.interval.is_zero())
        .map(|r| r.health_check.interval)
        .min()
        .unwrap_or(DEFAULT_HEALTH_INTERVAL)
}
