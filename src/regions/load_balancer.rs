//! Load Balancer
//!
//! Routes upload requests across the available regions using the
//! configured selection strategy, with optional sticky sessions that pin
//! a request-derived session key to one region for the session TTL.

use crate::config::LoadBalancingConfig;
use crate::error::{ConvoyError, ConvoyResult};
use crate::regions::selector::RegionSelector;
use crate::regions::types::{Region, RegionStatus, UploadRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Regions at or above this utilization stop receiving routed traffic
const UTILIZATION_CUTOFF_PERCENT: f64 = 95.0;

/// Sticky-session cleanup never runs more often than this
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A sticky binding of one session key to a region
#[derive(Debug, Clone)]
pub struct SessionAffinity {
    /// Request-derived session key
    pub session_key: String,

    /// Region the session is pinned to
    pub region: String,

    /// When the binding was created; expiry counts from here
    pub created_at: Instant,

    /// Last time the binding served a request
    pub last_used: Instant,

    /// Requests served through this binding
    pub request_count: u64,
}

/// Load balancer statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    /// Requests routed
    pub total_routed: u64,

    /// Requests served by an existing sticky binding
    pub sticky_hits: u64,

    /// Expired bindings removed (inline and by the cleanup task)
    pub expired_removed: u64,
}

/// Routes requests over the shared region map.
pub struct LoadBalancer {
    config: LoadBalancingConfig,

    /// Region map owned by the coordinator; the balancer reads it and
    /// mutates only region status.
    regions: Arc<RwLock<HashMap<String, Region>>>,

    selector: Arc<RegionSelector>,

    /// Sticky-session bindings, owned by the balancer
    affinity: Arc<RwLock<HashMap<String, SessionAffinity>>>,

    stats: Arc<RwLock<LoadBalancerStats>>,

    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LoadBalancer {
    pub fn new(
        config: LoadBalancingConfig,
        regions: Arc<RwLock<HashMap<String, Region>>>,
        selector: Arc<RegionSelector>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            regions,
            selector,
            affinity: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(LoadBalancerStats::default())),
            shutdown_tx,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Start the sticky-session cleanup task. Idempotent; a no-op when
    /// sticky sessions are disabled.
    pub async fn start(&self) {
        if !self.config.sticky_sessions {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let affinity = Arc::clone(&self.affinity);
        let stats = Arc::clone(&self.stats);
        let ttl = self.config.session_ttl;
        let cleanup_interval = (ttl / 4).max(MIN_CLEANUP_INTERVAL);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = {
                            let mut bindings = affinity.write().await;
                            let before = bindings.len();
                            bindings.retain(|_, entry| entry.created_at.elapsed() <= ttl);
                            before - bindings.len()
                        };
                        if removed > 0 {
                            stats.write().await.expired_removed += removed as u64;
                            tracing::debug!(removed, "expired sticky sessions cleaned up");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.worker.lock().await = Some(handle);
        tracing::info!("load balancer sticky-session cleanup started");
    }

    /// Stop the cleanup task. Idempotent.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Route a request to a region.
    pub async fn route(&self, request: &UploadRequest) -> ConvoyResult<String> {
        let available: Vec<Region> = {
            let regions = self.regions.read().await;
            regions
                .values()
                .filter(|r| {
                    r.status.is_available()
                        && r.capacity.current_utilization < UTILIZATION_CUTOFF_PERCENT
                })
                .cloned()
                .collect()
        };
        if available.is_empty() {
            return Err(ConvoyError::NoHealthyRegion);
        }

        let session_key = self.config.sticky_sessions.then(|| session_key(request));

        if let Some(ref key) = session_key {
            if let Some(region) = self.lookup_affinity(key, &available).await {
                let mut stats = self.stats.write().await;
                stats.total_routed += 1;
                stats.sticky_hits += 1;
                return Ok(region);
            }
        }

        let selected = self
            .selector
            .select_region(&available, request.preferred_region.as_deref())?
            .name
            .clone();

        if let Some(key) = session_key {
            let now = Instant::now();
            self.affinity.write().await.insert(
                key.clone(),
                SessionAffinity {
                    session_key: key,
                    region: selected.clone(),
                    created_at: now,
                    last_used: now,
                    request_count: 1,
                },
            );
        }

        self.stats.write().await.total_routed += 1;
        tracing::debug!(request = %request.id, region = %selected, "request routed");
        Ok(selected)
    }

    /// Update one region's status. Rejects empty names and unknown regions.
    pub async fn update_region_status(
        &self,
        name: &str,
        status: RegionStatus,
    ) -> ConvoyResult<()> {
        if name.is_empty() {
            return Err(ConvoyError::InvalidArgument(
                "region name must not be empty".to_string(),
            ));
        }
        let mut regions = self.regions.write().await;
        let region = regions.get_mut(name).ok_or_else(|| ConvoyError::RegionNotFound {
            region: name.to_string(),
        })?;
        if region.status != status {
            tracing::info!(region = %name, from = ?region.status, to = ?status, "region status updated");
        }
        region.status = status;
        Ok(())
    }

    /// Load balancer statistics (a copy).
    pub async fn stats(&self) -> LoadBalancerStats {
        self.stats.read().await.clone()
    }

    /// Current sticky bindings (a copy).
    pub async fn session_affinities(&self) -> Vec<SessionAffinity> {
        self.affinity.read().await.values().cloned().collect()
    }

    /// Resolve an unexpired sticky binding whose region is still
    /// available; drops the binding otherwise.
    async fn lookup_affinity(&self, key: &str, available: &[Region]) -> Option<String> {
        let mut bindings = self.affinity.write().await;
        let (expired, region_gone) = {
            let entry = bindings.get(key)?;
            (
                entry.created_at.elapsed() > self.config.session_ttl,
                !available.iter().any(|r| r.name == entry.region),
            )
        };

        if expired {
            bindings.remove(key);
            self.stats.write().await.expired_removed += 1;
            return None;
        }
        if region_gone {
            bindings.remove(key);
            return None;
        }

        let entry = bindings.get_mut(key)?;
        entry.last_used = Instant::now();
        entry.request_count += 1;
        Some(entry.region.clone())
    }
}

/// Derive the sticky-session key for a request: the `session` metadata
/// entry when present, else the source descriptor.
fn session_key(request: &UploadRequest) -> String {
    request
        .metadata
        .get("session")
        .cloned()
        .unwrap_or_else(|| request.source.clone())
}
