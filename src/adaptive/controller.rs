//! Adaptive Transfer Controller
//!
//! Owns active transfer sessions and their runtime parameters. A
//! monitoring loop evaluates each session against the current network
//! condition and adapts chunk size, concurrency, compression, and retry
//! behavior when performance degrades. Sessions never adapt more than
//! once per minute.

use crate::adaptive::monitor::{mean, normalized_slope, NetworkCondition, NetworkConditionMonitor};
use crate::adaptive::optimizer::{
    optimal_chunk_size_mb, Compression, FlowControlWindow, OptimizationRecommendation,
};
use crate::adaptive::ring::Ring;
use crate::config::AdaptationConfig;
use crate::error::{ConvoyError, ConvoyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Minimum spacing between adaptations of one session
const ADAPTATION_COOLDOWN: Duration = Duration::from_secs(60);

/// Snapshots and network samples retained per session
const SESSION_HISTORY_CAPACITY: usize = 100;

/// Ended sessions retained for inspection
const ENDED_SESSION_CAPACITY: usize = 100;

/// Throughput samples considered when evaluating a session
const EVALUATION_WINDOW: usize = 5;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Retry behavior for chunk uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts per chunk
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry
    pub backoff_multiplier: f64,

    /// Upper bound on the retry delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Timeout settings for chunk uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// The tunable parameter bundle of a transfer session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferParams {
    /// Chunk size in MB
    pub chunk_size_mb: u64,

    /// Concurrent chunk uploads
    pub concurrency: u32,

    /// Compression codec
    pub compression: Compression,

    /// Staging buffer size in MB
    pub buffer_size_mb: u64,

    /// Retry behavior
    pub retry: RetryPolicy,

    /// Timeout settings
    pub timeouts: TimeoutSettings,

    /// Flow-control posture
    pub flow_control: FlowControlWindow,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            chunk_size_mb: 32,
            concurrency: 4,
            compression: Compression::Zstd,
            buffer_size_mb: 64,
            retry: RetryPolicy::default(),
            timeouts: TimeoutSettings::default(),
            flow_control: FlowControlWindow::Balanced,
        }
    }
}

impl TransferParams {
    /// Seed parameters from the staging configuration: sessions start at
    /// the staging target chunk size with a quarter of the staging buffer.
    pub fn from_staging(staging: &crate::config::StagingConfig) -> Self {
        Self {
            chunk_size_mb: staging.target_chunk_mb,
            buffer_size_mb: (staging.max_buffer_mb / 4).max(1),
            ..Self::default()
        }
    }
}

/// A parameter bundle broadcast to every active session
#[derive(Debug, Clone)]
pub struct AdaptationState {
    pub params: TransferParams,
}

impl AdaptationState {
    /// Build a broadcast bundle from an optimizer recommendation,
    /// overlaying it on a base parameter set.
    pub fn from_recommendation(
        recommendation: &OptimizationRecommendation,
        base: &TransferParams,
    ) -> Self {
        let mut params = base.clone();
        params.chunk_size_mb = recommendation.chunk_size_mb;
        params.concurrency = recommendation.concurrency;
        params.compression = recommendation.compression;
        params.flow_control = recommendation.flow_control;
        Self { params }
    }
}

/// Why a session was adapted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationReason {
    PoorPerformance,
    DecliningPerformance,
    HighErrorRate,
}

/// One observed progress point of a session
#[derive(Debug, Clone)]
pub struct PerformanceSnapshot {
    /// Monotonic sample time
    pub timestamp: Instant,

    /// Observed throughput in MBps
    pub throughput_mbps: f64,

    /// Total bytes transferred at sample time
    pub transferred_bytes: u64,
}

/// An active (or recently ended) transfer session
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Session identifier
    pub id: String,

    /// Monotonic session start
    pub started_at: Instant,

    /// Current transfer parameters
    pub params: TransferParams,

    /// Bounded throughput history
    pub performance: Ring<PerformanceSnapshot>,

    /// Bounded network-condition history
    pub network: Ring<NetworkCondition>,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Total bytes to transfer
    pub total_bytes: u64,

    /// Whether the session is still running
    pub active: bool,

    /// Number of adaptations applied
    pub adaptation_count: u32,

    /// Time of the most recent adaptation
    pub last_adaptation: Option<Instant>,

    /// Progress updates observed
    pub update_count: u64,

    /// Transfer errors observed
    pub error_count: u64,
}

impl TransferSession {
    fn new(id: String, total_bytes: u64, params: TransferParams) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            params,
            performance: Ring::new(SESSION_HISTORY_CAPACITY),
            network: Ring::new(SESSION_HISTORY_CAPACITY),
            transferred_bytes: 0,
            total_bytes,
            active: true,
            adaptation_count: 0,
            last_adaptation: None,
            update_count: 0,
            error_count: 0,
        }
    }

    /// Observed error rate over progress updates and errors.
    pub fn error_rate(&self) -> f64 {
        let total = self.update_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }

    /// Fraction of the transfer completed (0.0 to 1.0).
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.transferred_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Owns per-session transfer parameters and applies adaptations.
pub struct AdaptiveTransferController {
    config: AdaptationConfig,
    monitor: Arc<NetworkConditionMonitor>,

    /// Parameters given to sessions started without an explicit bundle
    default_params: TransferParams,

    sessions: Arc<RwLock<HashMap<String, TransferSession>>>,
    ended: Arc<RwLock<Ring<TransferSession>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AdaptiveTransferController {
    pub fn new(config: AdaptationConfig, monitor: Arc<NetworkConditionMonitor>) -> Self {
        Self::with_default_params(config, monitor, TransferParams::default())
    }

    /// Controller whose new sessions start from the given parameters.
    pub fn with_default_params(
        config: AdaptationConfig,
        monitor: Arc<NetworkConditionMonitor>,
        default_params: TransferParams,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            monitor,
            default_params,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ended: Arc::new(RwLock::new(Ring::new(ENDED_SESSION_CAPACITY))),
            shutdown_tx,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Start the session monitoring loop. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let monitor = Arc::clone(&self.monitor);
        let sessions = Arc::clone(&self.sessions);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.adaptation_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let fallback = monitor.current_condition().await;
                        let mut guard = sessions.write().await;
                        for session in guard.values_mut().filter(|s| s.active) {
                            evaluate_session(session, &fallback, &config);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("adaptive controller monitoring loop stopping");
                        break;
                    }
                }
            }
        });

        *self.worker.lock().await = Some(handle);
        tracing::info!(
            interval_secs = self.config.adaptation_interval.as_secs(),
            "adaptive transfer controller started"
        );
    }

    /// Stop the monitoring loop. Idempotent.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("adaptive transfer controller stopped");
    }

    /// Create and register a transfer session. Missing parameters default.
    pub async fn start_transfer_session(
        &self,
        id: impl Into<String>,
        total_bytes: u64,
        initial_params: Option<TransferParams>,
    ) -> ConvoyResult<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConvoyError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }

        let mut params = initial_params.unwrap_or_else(|| self.default_params.clone());
        snap_to_bounds(&mut params, &self.config);

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(ConvoyError::InvalidArgument(format!(
                "session '{id}' already exists"
            )));
        }
        tracing::info!(session = %id, total_bytes, "transfer session started");
        sessions.insert(id.clone(), TransferSession::new(id, total_bytes, params));
        Ok(())
    }

    /// Update session bookkeeping and append a bounded snapshot.
    pub async fn update_transfer_progress(
        &self,
        id: &str,
        transferred_bytes: u64,
        current_throughput_mbps: f64,
        condition: &NetworkCondition,
    ) -> ConvoyResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ConvoyError::SessionNotFound {
                session: id.to_string(),
            })?;

        session.transferred_bytes = transferred_bytes.min(session.total_bytes);
        session.update_count += 1;
        session.performance.push(PerformanceSnapshot {
            timestamp: Instant::now(),
            throughput_mbps: current_throughput_mbps.max(0.0),
            transferred_bytes: session.transferred_bytes,
        });
        session.network.push(condition.clone());
        Ok(())
    }

    /// Record a transfer error against a session.
    pub async fn record_transfer_error(&self, id: &str) -> ConvoyResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ConvoyError::SessionNotFound {
                session: id.to_string(),
            })?;
        session.error_count += 1;
        Ok(())
    }

    /// Broadcast a parameter bundle to every active session.
    ///
    /// Each session validates the bundle against its own progress before
    /// applying it; a rejected bundle leaves that session unchanged.
    pub async fn apply_adaptation(&self, state: &AdaptationState) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut().filter(|s| s.active) {
            let mut params = state.params.clone();
            validate_for_session(&mut params, session, &self.config);
            session.params = params;
            session.adaptation_count += 1;
            session.last_adaptation = Some(Instant::now());
            tracing::debug!(
                session = %session.id,
                chunk_mb = session.params.chunk_size_mb,
                concurrency = session.params.concurrency,
                "adaptation applied"
            );
        }
    }

    /// Deactivate a session and move it into the bounded history.
    pub async fn end_transfer_session(&self, id: &str) -> ConvoyResult<TransferSession> {
        let mut sessions = self.sessions.write().await;
        let mut session = sessions
            .remove(id)
            .ok_or_else(|| ConvoyError::SessionNotFound {
                session: id.to_string(),
            })?;
        session.active = false;
        self.ended.write().await.push(session.clone());
        tracing::info!(session = %id, adaptations = session.adaptation_count, "transfer session ended");
        Ok(session)
    }

    /// Deep copy of all active sessions. The returned map shares no
    /// storage with the controller's internal state.
    pub async fn active_transfers(&self) -> HashMap<String, TransferSession> {
        self.sessions.read().await.clone()
    }

    /// Copies of recently ended sessions, oldest first.
    pub async fn session_history(&self) -> Vec<TransferSession> {
        self.ended.read().await.to_vec()
    }

    /// Evaluate every active session immediately, outside the loop cadence.
    pub async fn evaluate_now(&self) {
        let fallback = self.monitor.current_condition().await;
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut().filter(|s| s.active) {
            evaluate_session(session, &fallback, &self.config);
        }
    }
}

/// Evaluate one session and adapt it when a trigger fires.
fn evaluate_session(
    session: &mut TransferSession,
    fallback_condition: &NetworkCondition,
    config: &AdaptationConfig,
) {
    if session.performance.len() < 2 {
        return;
    }
    if let Some(last) = session.last_adaptation {
        if last.elapsed() < ADAPTATION_COOLDOWN {
            return;
        }
    }

    let condition = session
        .network
        .latest()
        .cloned()
        .unwrap_or_else(|| fallback_condition.clone());

    let throughputs: Vec<f64> = session
        .performance
        .tail(EVALUATION_WINDOW)
        .map(|s| s.throughput_mbps)
        .collect();
    let average = mean(&throughputs);
    let trend = normalized_slope(&throughputs);
    let expected = expected_throughput(&condition, session.params.concurrency);

    let reason = if average < 0.7 * expected {
        Some(AdaptationReason::PoorPerformance)
    } else if trend < -0.1 {
        Some(AdaptationReason::DecliningPerformance)
    } else if session.error_rate() > 0.05 {
        Some(AdaptationReason::HighErrorRate)
    } else {
        None
    };

    let Some(reason) = reason else { return };

    let mut params = session.params.clone();
    match reason {
        AdaptationReason::PoorPerformance => {
            if condition.congestion < 0.3 && params.concurrency < config.max_concurrency {
                params.concurrency += 1;
            }
            params.chunk_size_mb =
                optimal_chunk_size_mb(condition.bandwidth_mbps, condition.congestion, config);
            if condition.bandwidth_mbps > 50.0 {
                params.compression = Compression::ZstdFast;
            }
        }
        AdaptationReason::DecliningPerformance => {
            params.concurrency = params.concurrency.saturating_sub(1).max(1);
            params.chunk_size_mb = params
                .chunk_size_mb
                .saturating_sub(5)
                .max(config.min_chunk_size_mb);
            params.retry.max_retries = (params.retry.max_retries + 1).min(5);
            params.retry.initial_delay =
                (params.retry.initial_delay / 2).max(Duration::from_millis(100));
        }
        AdaptationReason::HighErrorRate => {
            params.concurrency = (params.concurrency / 2).max(1);
            params.chunk_size_mb = (params.chunk_size_mb / 2).max(config.min_chunk_size_mb);
            params.timeouts.connect *= 2;
            params.timeouts.read *= 2;
            params.timeouts.write *= 2;
            params.retry.max_retries = 5;
            params.retry.backoff_multiplier = 2.0;
            params.retry.max_delay = Duration::from_secs(300);
        }
    }

    validate_for_session(&mut params, session, config);
    session.params = params;
    session.adaptation_count += 1;
    session.last_adaptation = Some(Instant::now());

    tracing::info!(
        session = %session.id,
        ?reason,
        avg_throughput = average,
        expected_throughput = expected,
        trend,
        chunk_mb = session.params.chunk_size_mb,
        concurrency = session.params.concurrency,
        "session adapted"
    );
}

/// Expected throughput given the current condition and concurrency.
///
/// Each stream contributes a quarter of link saturation up to four
/// streams; congestion and loss discount the remainder. Floored at 10%
/// of bandwidth so a noisy sample cannot zero the expectation.
fn expected_throughput(condition: &NetworkCondition, concurrency: u32) -> f64 {
    let concurrency_efficiency = (concurrency as f64 / 4.0).min(1.0);
    let expected = condition.bandwidth_mbps
        * concurrency_efficiency
        * (1.0 - 0.5 * condition.congestion)
        * (1.0 - 10.0 * condition.packet_loss).max(0.0);
    expected.max(0.1 * condition.bandwidth_mbps)
}

/// Snap parameters into the configured bounds.
fn snap_to_bounds(params: &mut TransferParams, config: &AdaptationConfig) {
    params.chunk_size_mb = params
        .chunk_size_mb
        .clamp(config.min_chunk_size_mb, config.max_chunk_size_mb);
    params.concurrency = params
        .concurrency
        .clamp(config.min_concurrency, config.max_concurrency);
}

/// Validate a parameter bundle against one session's progress.
///
/// Near the end of a transfer the chunk size is bounded by the remaining
/// bytes and concurrency is halved for stability; everything then snaps
/// into the configured bounds.
fn validate_for_session(
    params: &mut TransferParams,
    session: &TransferSession,
    config: &AdaptationConfig,
) {
    let remaining_bytes = session.total_bytes.saturating_sub(session.transferred_bytes);
    let remaining_mb = remaining_bytes / BYTES_PER_MB;
    if remaining_mb > 0 {
        params.chunk_size_mb = params.chunk_size_mb.min((remaining_mb / 10).max(1));
    }

    if session.progress() > 0.9 {
        params.concurrency = (params.concurrency / 2).max(config.min_concurrency);
    }

    snap_to_bounds(params, config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::monitor::NetworkTrend;
    use chrono::Utc;

    fn condition(bandwidth: f64, congestion: f64, loss: f64) -> NetworkCondition {
        NetworkCondition {
            timestamp: Utc::now(),
            bandwidth_mbps: bandwidth,
            latency_ms: 40.0,
            packet_loss: loss,
            jitter_ms: 1.0,
            congestion,
            reliability: 0.95,
            trend: NetworkTrend::Stable,
        }
    }

    fn controller() -> AdaptiveTransferController {
        let config = AdaptationConfig::default();
        let monitor = Arc::new(NetworkConditionMonitor::new(config.clone()));
        AdaptiveTransferController::new(config, monitor)
    }

    const MB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn poor_performance_triggers_adaptation() {
        let controller = controller();
        controller
            .start_transfer_session("slow", 100 * MB, None)
            .await
            .unwrap();

        // 5 MBps observed against a 50 MBps link at concurrency 4.
        let network = condition(50.0, 0.0, 0.0);
        for i in 1..=5u64 {
            controller
                .update_transfer_progress("slow", i * 2 * MB, 5.0, &network)
                .await
                .unwrap();
        }

        controller.evaluate_now().await;

        let sessions = controller.active_transfers().await;
        let session = &sessions["slow"];
        assert!(session.adaptation_count >= 1);
        assert_ne!(session.params.chunk_size_mb, 32);
        assert_ne!(session.params.concurrency, 4);
    }

    #[tokio::test]
    async fn adaptation_respects_cooldown() {
        let controller = controller();
        controller
            .start_transfer_session("slow", 100 * MB, None)
            .await
            .unwrap();

        let network = condition(50.0, 0.0, 0.0);
        for i in 1..=5u64 {
            controller
                .update_transfer_progress("slow", i * 2 * MB, 5.0, &network)
                .await
                .unwrap();
        }

        controller.evaluate_now().await;
        controller.evaluate_now().await;
        controller.evaluate_now().await;

        let sessions = controller.active_transfers().await;
        assert_eq!(sessions["slow"].adaptation_count, 1);
    }

    #[tokio::test]
    async fn healthy_session_is_left_alone() {
        let controller = controller();
        controller
            .start_transfer_session("steady", 100 * MB, None)
            .await
            .unwrap();

        let network = condition(50.0, 0.0, 0.0);
        for i in 1..=5u64 {
            controller
                .update_transfer_progress("steady", i * 10 * MB, 48.0, &network)
                .await
                .unwrap();
        }

        controller.evaluate_now().await;

        let sessions = controller.active_transfers().await;
        assert_eq!(sessions["steady"].adaptation_count, 0);
    }

    #[tokio::test]
    async fn parameters_stay_within_bounds_after_adaptation() {
        let config = AdaptationConfig::default();
        let controller = controller();
        controller
            .start_transfer_session("bounded", 500 * MB, None)
            .await
            .unwrap();

        let network = condition(2.0, 0.9, 0.05);
        for i in 1..=5u64 {
            controller
                .update_transfer_progress("bounded", i * MB, 0.1, &network)
                .await
                .unwrap();
        }

        controller.evaluate_now().await;

        let sessions = controller.active_transfers().await;
        let params = &sessions["bounded"].params;
        assert!(params.chunk_size_mb >= config.min_chunk_size_mb);
        assert!(params.chunk_size_mb <= config.max_chunk_size_mb);
        assert!(params.concurrency >= config.min_concurrency);
        assert!(params.concurrency <= config.max_concurrency);
    }

    #[tokio::test]
    async fn late_transfer_halves_concurrency() {
        let controller = controller();
        let mut params = TransferParams::default();
        params.concurrency = 8;
        controller
            .start_transfer_session("tail", 100 * MB, Some(params))
            .await
            .unwrap();

        let network = condition(50.0, 0.0, 0.0);
        // 95% complete, then a broadcast adaptation arrives.
        controller
            .update_transfer_progress("tail", 95 * MB, 40.0, &network)
            .await
            .unwrap();

        let mut broadcast = TransferParams::default();
        broadcast.concurrency = 8;
        controller
            .apply_adaptation(&AdaptationState { params: broadcast })
            .await;

        let sessions = controller.active_transfers().await;
        assert!(sessions["tail"].params.concurrency <= 4);
    }

    #[tokio::test]
    async fn active_transfers_returns_a_deep_copy() {
        let controller = controller();
        controller
            .start_transfer_session("copy", 10 * MB, None)
            .await
            .unwrap();

        let mut copied = controller.active_transfers().await;
        copied.get_mut("copy").unwrap().transferred_bytes = 999;
        copied.get_mut("copy").unwrap().params.concurrency = 99;

        let internal = controller.active_transfers().await;
        assert_eq!(internal["copy"].transferred_bytes, 0);
        assert_eq!(internal["copy"].params.concurrency, 4);
    }

    #[tokio::test]
    async fn ended_sessions_move_to_history() {
        let controller = controller();
        controller
            .start_transfer_session("done", 10 * MB, None)
            .await
            .unwrap();

        let ended = controller.end_transfer_session("done").await.unwrap();
        assert!(!ended.active);
        assert!(controller.active_transfers().await.is_empty());
        assert_eq!(controller.session_history().await.len(), 1);

        let missing = controller.end_transfer_session("done").await;
        assert!(matches!(missing, Err(ConvoyError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn transferred_bytes_never_exceed_total() {
        let controller = controller();
        controller
            .start_transfer_session("clamped", 10 * MB, None)
            .await
            .unwrap();

        let network = condition(50.0, 0.0, 0.0);
        controller
            .update_transfer_progress("clamped", 500 * MB, 40.0, &network)
            .await
            .unwrap();

        let sessions = controller.active_transfers().await;
        assert_eq!(sessions["clamped"].transferred_bytes, 10 * MB);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let controller = controller();
        controller.start().await;
        controller.start().await;
        controller.shutdown().await;
        controller.shutdown().await;
    }
}
