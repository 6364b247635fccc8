//! Bandwidth Optimizer
//!
//! Watches bandwidth utilization derived from the network condition
//! monitor and emits optimization recommendations (concurrency, chunk
//! size, compression, flow control) when a trigger condition is met.
//! At most one recommendation is produced per tick.

use crate::adaptive::monitor::{NetworkCondition, NetworkConditionMonitor};
use crate::config::AdaptationConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Interval between optimization passes
const OPTIMIZATION_TICK: Duration = Duration::from_secs(5);

/// Compression codec selection carried by recommendations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Compression {
    /// zstd tuned for speed; used when bandwidth headroom is plentiful
    ZstdFast,
    /// Balanced zstd default
    Zstd,
    /// zstd tuned for ratio; used when the network is the bottleneck
    ZstdHigh,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::ZstdFast => write!(f, "zstd-fast"),
            Compression::Zstd => write!(f, "zstd"),
            Compression::ZstdHigh => write!(f, "zstd-high"),
        }
    }
}

/// Flow-control window posture
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FlowControlWindow {
    Aggressive,
    Balanced,
    Conservative,
    VeryConservative,
}

/// Five-level network health banding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkHealth {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Why a recommendation was produced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptimizationReason {
    Congestion,
    NetworkDegradation,
    Underutilization,
    PoorEfficiency,
}

impl fmt::Display for OptimizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationReason::Congestion => write!(f, "congestion"),
            OptimizationReason::NetworkDegradation => write!(f, "network_degradation"),
            OptimizationReason::Underutilization => write!(f, "underutilization"),
            OptimizationReason::PoorEfficiency => write!(f, "poor_efficiency"),
        }
    }
}

/// Urgency of a recommendation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Current bandwidth utilization snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthUtilization {
    /// Total available bandwidth in MBps
    pub available_mbps: f64,

    /// Bandwidth currently consumed by transfers in MBps
    pub used_mbps: f64,

    /// used / available, 0 when no bandwidth is available
    pub utilization_ratio: f64,

    /// Efficiency score in [0, 1]
    pub efficiency_score: f64,

    /// Congestion carried over from the network condition
    pub congestion: f64,

    /// Health banding after congestion and utilization penalties
    pub health: NetworkHealth,

    /// Snapshot timestamp
    pub timestamp: DateTime<Utc>,
}

/// A parameter bundle recommended by the optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    /// Trigger that produced this recommendation
    pub reason: OptimizationReason,

    /// Urgency
    pub priority: RecommendationPriority,

    /// Recommended upload concurrency
    pub concurrency: u32,

    /// Recommended chunk size in MB
    pub chunk_size_mb: u64,

    /// Recommended compression codec
    pub compression: Compression,

    /// Recommended flow-control posture
    pub flow_control: FlowControlWindow,

    /// Confidence in the recommendation (0.1 to 0.95)
    pub confidence: f64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Optimizer statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerStats {
    /// Optimization passes executed
    pub ticks: u64,

    /// Recommendations emitted
    pub recommendations_emitted: u64,

    /// Reason of the most recent recommendation
    pub last_reason: Option<String>,
}

type RecommendationCallback = Box<dyn Fn(&OptimizationRecommendation) + Send + Sync>;

struct OptimizerState {
    /// Concurrency currently applied by the transfer controller
    current_concurrency: u32,

    /// Chunk size currently applied by the transfer controller
    current_chunk_mb: u64,

    /// Observed aggregate transfer throughput in MBps
    observed_throughput_mbps: f64,

    utilization: Option<BandwidthUtilization>,
    last_recommendation: Option<OptimizationRecommendation>,
    stats: OptimizerStats,
}

/// Produces parameter recommendations from observed bandwidth utilization.
pub struct BandwidthOptimizer {
    config: AdaptationConfig,
    monitor: Arc<NetworkConditionMonitor>,
    state: Arc<RwLock<OptimizerState>>,

    /// Listener registry; a sync lock since callbacks are invoked inline
    /// and the guard never crosses an await point
    callbacks: Arc<SyncRwLock<Vec<RecommendationCallback>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BandwidthOptimizer {
    pub fn new(config: AdaptationConfig, monitor: Arc<NetworkConditionMonitor>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let state = OptimizerState {
            current_concurrency: 4,
            current_chunk_mb: 32,
            observed_throughput_mbps: 0.0,
            utilization: None,
            last_recommendation: None,
            stats: OptimizerStats::default(),
        };
        Self {
            config,
            monitor,
            state: Arc::new(RwLock::new(state)),
            callbacks: Arc::new(SyncRwLock::new(Vec::new())),
            shutdown_tx,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Start the optimization tick loop. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let monitor = Arc::clone(&self.monitor);
        let state = Arc::clone(&self.state);
        let callbacks = Arc::clone(&self.callbacks);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(OPTIMIZATION_TICK);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let condition = monitor.current_condition().await;
                        run_optimization_pass(&config, &state, &callbacks, &condition).await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("bandwidth optimizer tick loop stopping");
                        break;
                    }
                }
            }
        });

        *self.worker.lock().await = Some(handle);
        tracing::info!("bandwidth optimizer started");
    }

    /// Stop the tick loop. Idempotent.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("bandwidth optimizer stopped");
    }

    /// Run one optimization pass on demand.
    pub async fn force_optimization(&self) -> Option<OptimizationRecommendation> {
        let condition = self.monitor.current_condition().await;
        run_optimization_pass(&self.config, &self.state, &self.callbacks, &condition).await
    }

    /// Register a callback invoked with every emitted recommendation.
    pub fn on_recommendation<F>(&self, callback: F)
    where
        F: Fn(&OptimizationRecommendation) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Tell the optimizer which parameters the transfer controller applied.
    pub async fn set_current_parameters(&self, concurrency: u32, chunk_size_mb: u64) {
        let mut state = self.state.write().await;
        state.current_concurrency = concurrency;
        state.current_chunk_mb = chunk_size_mb;
    }

    /// Update the observed aggregate transfer throughput.
    pub async fn record_observed_throughput(&self, throughput_mbps: f64) {
        self.state.write().await.observed_throughput_mbps = throughput_mbps.max(0.0);
    }

    /// Current utilization snapshot (a copy).
    pub async fn current_utilization(&self) -> Option<BandwidthUtilization> {
        self.state.read().await.utilization.clone()
    }

    /// The most recently emitted recommendation (a copy).
    pub async fn last_recommendation(&self) -> Option<OptimizationRecommendation> {
        self.state.read().await.last_recommendation.clone()
    }

    /// Optimizer statistics (a copy).
    pub async fn stats(&self) -> OptimizerStats {
        self.state.read().await.stats.clone()
    }
}

/// One optimization pass: snapshot utilization, evaluate the trigger
/// policy, and emit at most one recommendation.
async fn run_optimization_pass(
    config: &AdaptationConfig,
    state: &Arc<RwLock<OptimizerState>>,
    callbacks: &Arc<SyncRwLock<Vec<RecommendationCallback>>>,
    condition: &NetworkCondition,
) -> Option<OptimizationRecommendation> {
    let recommendation = {
        let mut guard = state.write().await;
        let utilization = compute_utilization(guard.observed_throughput_mbps, condition);
        let trigger = evaluate_trigger(&utilization);
        guard.stats.ticks += 1;

        let recommendation = trigger.map(|(reason, priority)| {
            build_recommendation(
                config,
                &guard,
                &utilization,
                condition,
                reason,
                priority,
            )
        });

        if let Some(ref rec) = recommendation {
            guard.stats.recommendations_emitted += 1;
            guard.stats.last_reason = Some(rec.reason.to_string());
            guard.last_recommendation = Some(rec.clone());
            tracing::debug!(
                reason = %rec.reason,
                concurrency = rec.concurrency,
                chunk_mb = rec.chunk_size_mb,
                "optimization recommendation emitted"
            );
        }
        guard.utilization = Some(utilization);
        recommendation
    };

    if let Some(ref rec) = recommendation {
        let listeners = callbacks.read();
        for listener in listeners.iter() {
            listener(rec);
        }
    }

    recommendation
}

fn compute_utilization(observed_mbps: f64, condition: &NetworkCondition) -> BandwidthUtilization {
    let available = condition.bandwidth_mbps.max(0.0);
    let used = observed_mbps.min(available);
    let ratio = if available > 0.0 { used / available } else { 0.0 };
    let efficiency = efficiency_score(ratio, condition.congestion);
    let health = health_banding(condition.reliability, condition.congestion, ratio);

    BandwidthUtilization {
        available_mbps: available,
        used_mbps: used,
        utilization_ratio: ratio,
        efficiency_score: efficiency,
        congestion: condition.congestion,
        health,
        timestamp: Utc::now(),
    }
}

/// First matching trigger wins.
fn evaluate_trigger(
    utilization: &BandwidthUtilization,
) -> Option<(OptimizationReason, RecommendationPriority)> {
    let headroom = utilization.available_mbps - utilization.used_mbps;

    if utilization.congestion > 0.8 {
        return Some((
            OptimizationReason::Congestion,
            RecommendationPriority::Critical,
        ));
    }
    if utilization.health >= NetworkHealth::Poor {
        return Some((
            OptimizationReason::NetworkDegradation,
            RecommendationPriority::High,
        ));
    }
    if utilization.utilization_ratio < 0.3 && headroom > 20.0 {
        return Some((
            OptimizationReason::Underutilization,
            RecommendationPriority::Medium,
        ));
    }
    if utilization.efficiency_score < 0.5 {
        return Some((
            OptimizationReason::PoorEfficiency,
            RecommendationPriority::Medium,
        ));
    }
    if utilization.congestion > 0.5 {
        return Some((
            OptimizationReason::Congestion,
            RecommendationPriority::Medium,
        ));
    }
    if utilization.utilization_ratio < 0.6 && headroom > 10.0 {
        return Some((
            OptimizationReason::Underutilization,
            RecommendationPriority::Low,
        ));
    }
    None
}

fn build_recommendation(
    config: &AdaptationConfig,
    state: &OptimizerState,
    utilization: &BandwidthUtilization,
    condition: &NetworkCondition,
    reason: OptimizationReason,
    priority: RecommendationPriority,
) -> OptimizationRecommendation {
    let headroom = utilization.available_mbps - utilization.used_mbps;

    let (concurrency, chunk_size_mb, compression, flow_control) = match reason {
        OptimizationReason::Underutilization => (
            (state.current_concurrency + 2).min(config.max_concurrency),
            (state.current_chunk_mb + 10).min(config.max_chunk_size_mb),
            if headroom > 50.0 {
                Compression::ZstdFast
            } else {
                Compression::Zstd
            },
            FlowControlWindow::Aggressive,
        ),
        OptimizationReason::Congestion => (
            state
                .current_concurrency
                .saturating_sub(1)
                .max(config.min_concurrency),
            state
                .current_chunk_mb
                .saturating_sub(5)
                .max(config.min_chunk_size_mb),
            Compression::ZstdHigh,
            FlowControlWindow::Conservative,
        ),
        OptimizationReason::NetworkDegradation => (
            2u32.clamp(config.min_concurrency, config.max_concurrency),
            10u64.clamp(config.min_chunk_size_mb, config.max_chunk_size_mb),
            Compression::ZstdHigh,
            FlowControlWindow::VeryConservative,
        ),
        OptimizationReason::PoorEfficiency => (
            optimal_concurrency(utilization.available_mbps, condition.congestion, config),
            optimal_chunk_size_mb(utilization.available_mbps, condition.congestion, config),
            Compression::Zstd,
            FlowControlWindow::Balanced,
        ),
    };

    let confidence = recommendation_confidence(
        utilization,
        state.stats.recommendations_emitted,
    );

    OptimizationRecommendation {
        reason,
        priority,
        concurrency,
        chunk_size_mb,
        compression,
        flow_control,
        confidence,
        created_at: Utc::now(),
    }
}

/// clip(available / 25, [min, max]) scaled down by congestion.
pub(crate) fn optimal_concurrency(
    available_mbps: f64,
    congestion: f64,
    config: &AdaptationConfig,
) -> u32 {
    let base = (available_mbps / 25.0)
        .clamp(config.min_concurrency as f64, config.max_concurrency as f64);
    let adjusted = base * (1.0 - 0.7 * congestion);
    (adjusted.round() as u32).clamp(config.min_concurrency, config.max_concurrency)
}

/// Bandwidth-delay-product-style chunk sizing, widened under congestion
/// and then scaled down by it.
pub(crate) fn optimal_chunk_size_mb(
    available_mbps: f64,
    congestion: f64,
    config: &AdaptationConfig,
) -> u64 {
    let window_ms = 50.0 + if congestion > 0.3 { 100.0 * congestion } else { 0.0 };
    let base = available_mbps * window_ms / 1000.0;
    let adjusted = base * (1.0 - 0.5 * congestion);
    (adjusted.round() as u64).clamp(config.min_chunk_size_mb, config.max_chunk_size_mb)
}

/// ratio - 0.5 * congestion, with a bonus inside the 0.7..0.8 sweet spot,
/// clipped to [0, 1].
fn efficiency_score(ratio: f64, congestion: f64) -> f64 {
    let sweet_spot = if (0.7..=0.8).contains(&ratio) { 0.1 } else { 0.0 };
    (ratio - 0.5 * congestion + sweet_spot).clamp(0.0, 1.0)
}

/// Five-level banding of link quality after congestion and saturation
/// penalties. Utilization only penalizes health when the link is pinned;
/// an idle link reports the quality of the network, not of our usage.
fn health_banding(reliability: f64, congestion: f64, ratio: f64) -> NetworkHealth {
    let saturation_penalty = if ratio > 0.95 { 0.05 } else { 0.0 };
    let score = reliability * (1.0 - 0.5 * congestion) - saturation_penalty;
    if score >= 0.85 {
        NetworkHealth::Excellent
    } else if score >= 0.65 {
        NetworkHealth::Good
    } else if score >= 0.45 {
        NetworkHealth::Fair
    } else if score >= 0.25 {
        NetworkHealth::Poor
    } else {
        NetworkHealth::Critical
    }
}

fn recommendation_confidence(utilization: &BandwidthUtilization, history_len: u64) -> f64 {
    let mut confidence = 0.5;
    if utilization.congestion > 0.7 {
        confidence += 0.3;
    }
    if utilization.utilization_ratio < 0.4 {
        confidence += 0.2;
    }
    if utilization.efficiency_score > 0.7 {
        confidence -= 0.1;
    }
    confidence += (history_len as f64 * 0.01).min(0.2);
    confidence.clamp(0.1, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utilization(ratio: f64, available: f64, congestion: f64) -> BandwidthUtilization {
        let efficiency = efficiency_score(ratio, congestion);
        let reliability = (1.0 - 0.3 * congestion).max(0.1);
        BandwidthUtilization {
            available_mbps: available,
            used_mbps: ratio * available,
            utilization_ratio: ratio,
            efficiency_score: efficiency,
            congestion,
            health: health_banding(reliability, congestion, ratio),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn heavy_congestion_is_critical() {
        let trigger = evaluate_trigger(&utilization(0.75, 100.0, 0.9));
        assert_eq!(
            trigger,
            Some((
                OptimizationReason::Congestion,
                RecommendationPriority::Critical
            ))
        );
    }

    #[test]
    fn idle_link_with_headroom_is_underutilized() {
        let trigger = evaluate_trigger(&utilization(0.2, 200.0, 0.0));
        assert_eq!(
            trigger,
            Some((
                OptimizationReason::Underutilization,
                RecommendationPriority::Medium
            ))
        );
    }

    #[test]
    fn healthy_saturated_link_needs_no_recommendation() {
        let trigger = evaluate_trigger(&utilization(0.75, 100.0, 0.0));
        assert_eq!(trigger, None);
    }

    #[test]
    fn efficiency_sweet_spot_bonus() {
        assert!(efficiency_score(0.75, 0.0) > efficiency_score(0.69, 0.0) + 0.05);
        assert_eq!(efficiency_score(0.0, 1.0), 0.0);
        assert_eq!(efficiency_score(1.0, 0.0), 1.0);
    }

    #[test]
    fn optimal_values_respect_bounds() {
        let config = AdaptationConfig::default();
        for available in [1.0, 50.0, 500.0, 5000.0] {
            for congestion in [0.0, 0.5, 1.0] {
                let concurrency = optimal_concurrency(available, congestion, &config);
                assert!(concurrency >= config.min_concurrency);
                assert!(concurrency <= config.max_concurrency);

                let chunk = optimal_chunk_size_mb(available, congestion, &config);
                assert!(chunk >= config.min_chunk_size_mb);
                assert!(chunk <= config.max_chunk_size_mb);
            }
        }
    }

    #[test]
    fn confidence_stays_in_range() {
        for ratio in [0.1, 0.5, 0.9] {
            for congestion in [0.0, 0.8] {
                let confidence =
                    recommendation_confidence(&utilization(ratio, 100.0, congestion), 50);
                assert!((0.1..=0.95).contains(&confidence));
            }
        }
    }

    #[tokio::test]
    async fn force_optimization_emits_for_underutilized_link() {
        let monitor = Arc::new(NetworkConditionMonitor::new(AdaptationConfig::default()));
        // Plenty of bandwidth, nothing transferring.
        monitor.record_transfer_metrics(200.0, 30.0).await;

        let optimizer = BandwidthOptimizer::new(AdaptationConfig::default(), monitor);
        optimizer.record_observed_throughput(10.0).await;

        let recommendation = optimizer.force_optimization().await;
        let recommendation = recommendation.expect("underutilized link should trigger");
        assert_eq!(recommendation.reason, OptimizationReason::Underutilization);
        assert!(recommendation.concurrency > 4);

        let stats = optimizer.stats().await;
        assert_eq!(stats.recommendations_emitted, 1);
        assert_eq!(stats.last_reason.as_deref(), Some("underutilization"));
    }

    #[tokio::test]
    async fn callbacks_receive_recommendations() {
        let monitor = Arc::new(NetworkConditionMonitor::new(AdaptationConfig::default()));
        monitor.record_transfer_metrics(200.0, 30.0).await;

        let optimizer = BandwidthOptimizer::new(AdaptationConfig::default(), monitor);
        optimizer.record_observed_throughput(5.0).await;

        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        optimizer.on_recommendation(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        optimizer.force_optimization().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let monitor = Arc::new(NetworkConditionMonitor::new(AdaptationConfig::default()));
        let optimizer = BandwidthOptimizer::new(AdaptationConfig::default(), monitor);
        optimizer.start().await;
        optimizer.start().await;
        optimizer.shutdown().await;
        optimizer.shutdown().await;
    }
}
