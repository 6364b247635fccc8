//! Network Condition Monitor
//!
//! Samples or estimates network characteristics on a fixed interval,
//! maintains a bounded ring of observed conditions, and produces
//! per-metric forecasts consumed by the bandwidth optimizer and the
//! performance predictor.

use crate::adaptive::ring::Ring;
use crate::config::AdaptationConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Capacity of the condition history ring
const CONDITION_HISTORY_CAPACITY: usize = 100;

/// Rolling window used for estimation and trend analysis
const ANALYSIS_WINDOW: usize = 10;

/// Predicted direction of network quality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkTrend {
    Unknown,
    Improving,
    Degrading,
    Stable,
    Volatile,
}

/// A point-in-time summary of observed network characteristics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCondition {
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,

    /// Bandwidth in megabytes per second
    pub bandwidth_mbps: f64,

    /// Round-trip latency in milliseconds
    pub latency_ms: f64,

    /// Packet loss rate (0.0 to 1.0)
    pub packet_loss: f64,

    /// Latency jitter in milliseconds
    pub jitter_ms: f64,

    /// Congestion estimate (0.0 to 1.0)
    pub congestion: f64,

    /// Reliability estimate (0.0 to 1.0)
    pub reliability: f64,

    /// Predicted trend over the analysis window
    pub trend: NetworkTrend,
}

/// A forecast value for one metric at a future offset
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricPrediction {
    /// Predicted value
    pub value: f64,

    /// Confidence in the prediction (0.1 to 0.95)
    pub confidence: f64,
}

/// Metric selector for forecasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMetric {
    Bandwidth,
    Latency,
    PacketLoss,
    Jitter,
    Congestion,
    Reliability,
}

/// Monitors network conditions and maintains a bounded observation history.
pub struct NetworkConditionMonitor {
    config: AdaptationConfig,

    /// Bounded ring of observed conditions
    conditions: Arc<RwLock<Ring<NetworkCondition>>>,

    /// Shutdown broadcast for the sampling loop
    shutdown_tx: watch::Sender<bool>,

    /// Sampling loop handle, present while started
    worker: Mutex<Option<JoinHandle<()>>>,

    started: AtomicBool,
}

impl NetworkConditionMonitor {
    pub fn new(config: AdaptationConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            conditions: Arc::new(RwLock::new(Ring::new(CONDITION_HISTORY_CAPACITY))),
            shutdown_tx,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Start the background sampling loop. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let conditions = Arc::clone(&self.conditions);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.monitoring_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let sample = {
                            let ring = conditions.read().await;
                            estimate_condition(&ring, &config)
                        };
                        conditions.write().await.push(sample);
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("network monitor sampling loop stopping");
                        break;
                    }
                }
            }
        });

        *self.worker.lock().await = Some(handle);
        tracing::info!(
            interval_secs = self.config.monitoring_interval.as_secs(),
            "network condition monitor started"
        );
    }

    /// Stop the sampling loop. Idempotent.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("network condition monitor stopped");
    }

    /// Current condition (a copy). Estimated from the rolling window when no
    /// sample has been recorded yet.
    pub async fn current_condition(&self) -> NetworkCondition {
        let ring = self.conditions.read().await;
        match ring.latest() {
            Some(condition) => condition.clone(),
            None => estimate_condition(&ring, &self.config),
        }
    }

    /// Copy of the bounded condition history, oldest first.
    pub async fn condition_history(&self) -> Vec<NetworkCondition> {
        self.conditions.read().await.to_vec()
    }

    /// Inject observed transfer metrics into the current condition and ring.
    pub async fn record_transfer_metrics(&self, throughput_mbps: f64, latency_ms: f64) {
        let mut ring = self.conditions.write().await;
        let mut condition = estimate_condition(&ring, &self.config);
        condition.bandwidth_mbps = throughput_mbps.max(0.0);
        condition.latency_ms = latency_ms.max(0.0);
        condition.packet_loss = loss_band(condition.bandwidth_mbps);
        condition.congestion = congestion_estimate(
            condition.bandwidth_mbps,
            condition.latency_ms,
            condition.packet_loss,
        );
        condition.reliability = reliability_estimate(condition.congestion, condition.packet_loss);
        condition.timestamp = Utc::now();
        ring.push(condition);
    }

    /// Re-derive the trend of the latest condition from the analysis window.
    pub async fn update_predictions(&self) {
        let mut ring = self.conditions.write().await;
        let trend = classify_trend(&ring);
        if let Some(latest) = ring.latest_mut() {
            latest.trend = trend;
        }
    }

    /// Forecast one metric at a future offset.
    ///
    /// The forecast extrapolates the analysis-window regression slope;
    /// bandwidth and latency never go negative.
    pub async fn predict_metric(
        &self,
        metric: NetworkMetric,
        horizon: std::time::Duration,
    ) -> MetricPrediction {
        let ring = self.conditions.read().await;
        let values: Vec<f64> = ring
            .tail(ANALYSIS_WINDOW)
            .map(|c| metric_value(c, metric))
            .collect();

        if values.len() < 2 {
            let latest = values.last().copied().unwrap_or(0.0);
            return MetricPrediction {
                value: latest,
                confidence: 0.1,
            };
        }

        let latest = *values.last().unwrap();
        let mean = mean(&values);
        let slope_per_step = regression_slope(&values);
        let steps_per_minute = 60.0 / self.config.monitoring_interval.as_secs_f64().max(1.0);
        let slope_per_minute = slope_per_step * steps_per_minute;
        let horizon_minutes = horizon.as_secs_f64() / 60.0;

        let mut value = latest + slope_per_minute * horizon_minutes;
        if matches!(metric, NetworkMetric::Bandwidth | NetworkMetric::Latency) {
            value = value.max(0.0);
        }

        let cv = coefficient_of_variation(&values);
        let mut confidence = (1.0 - cv).clamp(0.1, 0.95);
        if slope_per_step.abs() < 0.1 * mean.abs() {
            confidence = (confidence + 0.1).min(0.95);
        }

        MetricPrediction { value, confidence }
    }
}

fn metric_value(condition: &NetworkCondition, metric: NetworkMetric) -> f64 {
    match metric {
        NetworkMetric::Bandwidth => condition.bandwidth_mbps,
        NetworkMetric::Latency => condition.latency_ms,
        NetworkMetric::PacketLoss => condition.packet_loss,
        NetworkMetric::Jitter => condition.jitter_ms,
        NetworkMetric::Congestion => condition.congestion,
        NetworkMetric::Reliability => condition.reliability,
    }
}

/// Derive a condition from the rolling window when live probes are
/// unavailable. With an empty window the configured targets seed the
/// estimate.
fn estimate_condition(ring: &Ring<NetworkCondition>, config: &AdaptationConfig) -> NetworkCondition {
    let window: Vec<&NetworkCondition> = ring.tail(ANALYSIS_WINDOW).collect();

    let (bandwidth, latency) = if window.is_empty() {
        (config.target_throughput_mbps, config.target_latency_ms)
    } else {
        let bandwidth = mean_of(window.iter().map(|c| c.bandwidth_mbps));
        let latency = mean_of(window.iter().map(|c| c.latency_ms));
        (bandwidth, latency)
    };

    let packet_loss = loss_band(bandwidth);
    let latencies: Vec<f64> = window.iter().map(|c| c.latency_ms).collect();
    let jitter = if latencies.len() >= 2 {
        stddev(&latencies)
    } else {
        0.0
    };
    let congestion = congestion_estimate(bandwidth, latency, packet_loss);
    let reliability = reliability_estimate(congestion, packet_loss);

    NetworkCondition {
        timestamp: Utc::now(),
        bandwidth_mbps: bandwidth,
        latency_ms: latency,
        packet_loss,
        jitter_ms: jitter,
        congestion,
        reliability,
        trend: classify_trend(ring),
    }
}

/// Packet-loss estimate banded from bandwidth.
fn loss_band(bandwidth_mbps: f64) -> f64 {
    if bandwidth_mbps < 10.0 {
        0.05
    } else if bandwidth_mbps < 50.0 {
        0.01
    } else {
        0.001
    }
}

/// Additive congestion estimate combining low bandwidth, high latency,
/// and loss, clipped to [0, 1].
fn congestion_estimate(bandwidth_mbps: f64, latency_ms: f64, packet_loss: f64) -> f64 {
    let bandwidth_term = if bandwidth_mbps < 10.0 {
        0.4
    } else if bandwidth_mbps < 25.0 {
        0.2
    } else if bandwidth_mbps < 50.0 {
        0.1
    } else {
        0.0
    };
    let latency_term = if latency_ms > 500.0 {
        0.3
    } else if latency_ms > 200.0 {
        0.2
    } else if latency_ms > 100.0 {
        0.1
    } else {
        0.0
    };
    let loss_term = (packet_loss * 10.0).min(0.3);

    (bandwidth_term + latency_term + loss_term).clamp(0.0, 1.0)
}

/// reliability = 1 - 0.3 * congestion - 10 * loss, floored at 0.1
fn reliability_estimate(congestion: f64, packet_loss: f64) -> f64 {
    (1.0 - 0.3 * congestion - 10.0 * packet_loss).max(0.1)
}

/// Classify the trend over the most recent analysis window.
///
/// Averages the normalized regression slopes of bandwidth, inverted
/// latency, and inverted congestion. Stable flips to Volatile when the
/// bandwidth coefficient of variation exceeds 0.5.
fn classify_trend(ring: &Ring<NetworkCondition>) -> NetworkTrend {
    let window: Vec<&NetworkCondition> = ring.tail(ANALYSIS_WINDOW).collect();
    if window.len() < 3 {
        return NetworkTrend::Unknown;
    }

    let bandwidths: Vec<f64> = window.iter().map(|c| c.bandwidth_mbps).collect();
    let latencies: Vec<f64> = window.iter().map(|c| c.latency_ms).collect();
    let congestions: Vec<f64> = window.iter().map(|c| c.congestion).collect();

    let combined = (normalized_slope(&bandwidths) - normalized_slope(&latencies)
        - normalized_slope(&congestions))
        / 3.0;

    if combined > 0.1 {
        NetworkTrend::Improving
    } else if combined < -0.1 {
        NetworkTrend::Degrading
    } else if coefficient_of_variation(&bandwidths) > 0.5 {
        NetworkTrend::Volatile
    } else {
        NetworkTrend::Stable
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    mean(&collected)
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.abs() < f64::EPSILON {
        return 0.0;
    }
    stddev(values) / m.abs()
}

/// Least-squares slope of `values` against their indices.
fn regression_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = mean(values);
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, v) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (v - mean_y);
        denominator += dx * dx;
    }
    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

/// Regression slope normalized by the window mean.
pub(crate) fn normalized_slope(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.abs() < 0.01 {
        return 0.0;
    }
    regression_slope(values) / m.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn condition(bandwidth: f64, latency: f64) -> NetworkCondition {
        let loss = loss_band(bandwidth);
        let congestion = congestion_estimate(bandwidth, latency, loss);
        NetworkCondition {
            timestamp: Utc::now(),
            bandwidth_mbps: bandwidth,
            latency_ms: latency,
            packet_loss: loss,
            jitter_ms: 0.0,
            congestion,
            reliability: reliability_estimate(congestion, loss),
            trend: NetworkTrend::Unknown,
        }
    }

    #[test]
    fn loss_banding_matches_bandwidth() {
        assert_eq!(loss_band(5.0), 0.05);
        assert_eq!(loss_band(30.0), 0.01);
        assert_eq!(loss_band(100.0), 0.001);
    }

    #[test]
    fn reliability_is_floored() {
        assert!((reliability_estimate(0.0, 0.0) - 1.0).abs() < 1e-9);
        assert_eq!(reliability_estimate(1.0, 0.5), 0.1);
    }

    #[test]
    fn trend_detects_improvement() {
        let mut ring = Ring::new(100);
        for i in 0..8 {
            ring.push(condition(20.0 + i as f64 * 10.0, 100.0));
        }
        assert_eq!(classify_trend(&ring), NetworkTrend::Improving);
    }

    #[test]
    fn trend_detects_degradation() {
        let mut ring = Ring::new(100);
        for i in 0..8 {
            ring.push(condition(100.0 - i as f64 * 10.0, 50.0));
        }
        assert_eq!(classify_trend(&ring), NetworkTrend::Degrading);
    }

    #[test]
    fn flat_window_is_stable() {
        let mut ring = Ring::new(100);
        for _ in 0..8 {
            ring.push(condition(80.0, 40.0));
        }
        assert_eq!(classify_trend(&ring), NetworkTrend::Stable);
    }

    #[test]
    fn oscillating_bandwidth_is_volatile() {
        let mut ring = Ring::new(100);
        for i in 0..10 {
            let bandwidth = if i % 2 == 0 { 5.0 } else { 150.0 };
            ring.push(condition(bandwidth, 50.0));
        }
        assert_eq!(classify_trend(&ring), NetworkTrend::Volatile);
    }

    #[tokio::test]
    async fn recorded_metrics_drive_current_condition() {
        let monitor = NetworkConditionMonitor::new(AdaptationConfig::default());
        monitor.record_transfer_metrics(120.0, 35.0).await;

        let condition = monitor.current_condition().await;
        assert!((condition.bandwidth_mbps - 120.0).abs() < 1e-9);
        assert!((condition.latency_ms - 35.0).abs() < 1e-9);
        assert_eq!(condition.packet_loss, 0.001);
    }

    #[tokio::test]
    async fn predictions_never_go_negative() {
        let monitor = NetworkConditionMonitor::new(AdaptationConfig::default());
        for i in 0..10 {
            monitor
                .record_transfer_metrics((100 - i * 10) as f64, 50.0)
                .await;
        }

        let prediction = monitor
            .predict_metric(NetworkMetric::Bandwidth, Duration::from_secs(3600))
            .await;
        assert!(prediction.value >= 0.0);
        assert!(prediction.confidence >= 0.1 && prediction.confidence <= 0.95);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let monitor = NetworkConditionMonitor::new(AdaptationConfig::default());
        for _ in 0..250 {
            monitor.record_transfer_metrics(80.0, 40.0).await;
        }
        assert_eq!(monitor.condition_history().await.len(), 100);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let monitor = NetworkConditionMonitor::new(AdaptationConfig::default());
        monitor.start().await;
        monitor.start().await;
        monitor.shutdown().await;
        monitor.shutdown().await;
    }
}
