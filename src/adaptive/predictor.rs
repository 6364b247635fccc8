//! Performance Predictor
//!
//! Predicts upload time, throughput, and success probability for a
//! candidate chunk boundary under a given network condition. Predictions
//! are cached briefly; model weights are re-fit from recorded transfer
//! outcomes.

use crate::adaptive::monitor::{NetworkCondition, NetworkTrend};
use crate::adaptive::optimizer::{optimal_chunk_size_mb, Compression};
use crate::adaptive::ring::Ring;
use crate::config::AdaptationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Cached predictions expire after this long
const PREDICTION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Capacity of the training-data ring
const TRAINING_CAPACITY: usize = 1000;

/// Minimum samples before the model is re-fit
const MIN_TRAINING_SAMPLES: usize = 10;

/// Fixed staging overhead added to every upload-time estimate, seconds
const STAGING_OVERHEAD_SECS: f64 = 2.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A candidate chunk boundary under evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCandidate {
    /// Chunk size in bytes
    pub size_bytes: u64,

    /// Start offset within the archive
    pub start_offset: u64,

    /// End offset within the archive
    pub end_offset: u64,

    /// Predicted compression score (0.0 incompressible, 1.0 highly compressible)
    pub compression_score: f64,
}

/// Prediction for one candidate chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPrediction {
    /// Estimated upload time including staging overhead
    pub estimated_upload_time: Duration,

    /// Predicted effective throughput in MBps
    pub predicted_throughput_mbps: f64,

    /// Probability the upload succeeds on the first attempt (0.1 to 0.99)
    pub success_probability: f64,

    /// Chunk size the current network would favor, in MB
    pub optimal_chunk_size_mb: u64,

    /// Compression codec the current network would favor
    pub recommended_compression: Compression,

    /// How well the network suits this chunk (0.0 to 1.0)
    pub network_suitability: f64,

    /// Confidence in this prediction (0.1 to 0.95)
    pub confidence: f64,
}

/// One observed transfer outcome used to fit the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    pub size_bytes: u64,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub compression_score: f64,
    pub reliability: f64,
    pub actual_duration: Duration,
    pub success: bool,
}

/// Relative influence of each factor on upload time; sums to 1
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelWeights {
    pub size: f64,
    pub bandwidth: f64,
    pub latency: f64,
    pub compression: f64,
    pub reliability: f64,
}

impl Default for ModelWeights {
    fn default() -> Self {
        Self {
            size: 0.2,
            bandwidth: 0.2,
            latency: 0.2,
            compression: 0.2,
            reliability: 0.2,
        }
    }
}

/// Cache key rounds the continuous inputs so nearby conditions share an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PredictionKey {
    size_bytes: u64,
    compression_centi: i64,
    bandwidth_mbps: i64,
    latency_ms: i64,
    congestion_centi: i64,
}

impl PredictionKey {
    fn new(chunk: &ChunkCandidate, condition: &NetworkCondition) -> Self {
        Self {
            size_bytes: chunk.size_bytes,
            compression_centi: (chunk.compression_score * 100.0).round() as i64,
            bandwidth_mbps: condition.bandwidth_mbps.round() as i64,
            latency_ms: condition.latency_ms.round() as i64,
            congestion_centi: (condition.congestion * 100.0).round() as i64,
        }
    }
}

/// Predicts per-chunk upload performance from network conditions and
/// accumulated transfer history.
pub struct PerformancePredictor {
    config: AdaptationConfig,
    weights: Arc<RwLock<ModelWeights>>,
    training: Arc<RwLock<Ring<TrainingSample>>>,
    cache: Arc<RwLock<HashMap<PredictionKey, (ChunkPrediction, Instant)>>>,
}

impl PerformancePredictor {
    pub fn new(config: AdaptationConfig) -> Self {
        Self {
            config,
            weights: Arc::new(RwLock::new(ModelWeights::default())),
            training: Arc::new(RwLock::new(Ring::new(TRAINING_CAPACITY))),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Predict upload performance for a candidate chunk.
    pub async fn predict(
        &self,
        chunk: &ChunkCandidate,
        condition: &NetworkCondition,
    ) -> ChunkPrediction {
        let key = PredictionKey::new(chunk, condition);

        {
            let cache = self.cache.read().await;
            if let Some((prediction, inserted_at)) = cache.get(&key) {
                if inserted_at.elapsed() < PREDICTION_CACHE_TTL {
                    return prediction.clone();
                }
            }
        }

        let weights = *self.weights.read().await;
        let training_len = self.training.read().await.len();
        let prediction = compute_prediction(&self.config, chunk, condition, &weights, training_len);

        {
            let mut cache = self.cache.write().await;
            cache.retain(|_, (_, inserted_at)| inserted_at.elapsed() < PREDICTION_CACHE_TTL);
            cache.insert(key, (prediction.clone(), Instant::now()));
        }

        prediction
    }

    /// Record an observed outcome and re-fit the model weights.
    pub async fn record_outcome(&self, sample: TrainingSample) {
        {
            let mut training = self.training.write().await;
            training.push(sample);
        }
        self.update_model().await;
    }

    /// Re-fit factor weights from the training ring.
    ///
    /// Each factor's weight is its absolute correlation with observed
    /// upload time, renormalized so the weights sum to 1.
    pub async fn update_model(&self) {
        let samples = self.training.read().await.to_vec();
        if samples.len() < MIN_TRAINING_SAMPLES {
            return;
        }

        let durations: Vec<f64> = samples
            .iter()
            .map(|s| s.actual_duration.as_secs_f64())
            .collect();

        let size: Vec<f64> = samples.iter().map(|s| s.size_bytes as f64).collect();
        let bandwidth: Vec<f64> = samples.iter().map(|s| s.bandwidth_mbps).collect();
        let latency: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
        let compression: Vec<f64> = samples.iter().map(|s| s.compression_score).collect();
        let reliability: Vec<f64> = samples.iter().map(|s| s.reliability).collect();

        let raw = [
            correlation(&size, &durations).abs(),
            correlation(&bandwidth, &durations).abs(),
            correlation(&latency, &durations).abs(),
            correlation(&compression, &durations).abs(),
            correlation(&reliability, &durations).abs(),
        ];
        let total: f64 = raw.iter().sum();

        let mut weights = self.weights.write().await;
        *weights = if total > f64::EPSILON {
            ModelWeights {
                size: raw[0] / total,
                bandwidth: raw[1] / total,
                latency: raw[2] / total,
                compression: raw[3] / total,
                reliability: raw[4] / total,
            }
        } else {
            ModelWeights::default()
        };
        tracing::debug!(samples = samples.len(), "prediction model re-fit");
    }

    /// Current model weights (a copy).
    pub async fn model_weights(&self) -> ModelWeights {
        *self.weights.read().await
    }

    /// Number of training samples currently held.
    pub async fn training_len(&self) -> usize {
        self.training.read().await.len()
    }
}

fn compute_prediction(
    config: &AdaptationConfig,
    chunk: &ChunkCandidate,
    condition: &NetworkCondition,
    weights: &ModelWeights,
    training_len: usize,
) -> ChunkPrediction {
    let size_mb = chunk.size_bytes as f64 / BYTES_PER_MB;
    let bandwidth = condition.bandwidth_mbps.max(0.1);
    let compression_score = chunk.compression_score.clamp(0.0, 1.0);

    // Base transfer time shrinks with compressibility; penalties scale
    // with the fitted factor weights (equal weights leave them unscaled).
    let base = (size_mb / bandwidth) * (1.0 - 0.5 * compression_score);
    let latency_secs = condition.latency_ms / 1000.0;
    let latency_penalty = latency_secs * (weights.latency / 0.2);
    let congestion_penalty = 0.5 * base * condition.congestion;
    let reliability_penalty = 0.3 * base * (1.0 - condition.reliability);
    let total_secs =
        base + latency_penalty + congestion_penalty + reliability_penalty + STAGING_OVERHEAD_SECS;

    let predicted_throughput = if total_secs > 0.0 {
        size_mb / total_secs
    } else {
        bandwidth
    };

    // 5% penalty at 50 MB growing linearly to a 10% cap at 100 MB.
    let size_penalty = (size_mb * 0.001).min(0.10);
    let success_probability = (condition.reliability
        - size_penalty
        - 0.2 * condition.congestion
        - latency_secs.min(0.1))
    .clamp(0.10, 0.99);

    let recommended_compression = if condition.congestion > 0.6 {
        Compression::ZstdHigh
    } else if bandwidth > 50.0 && condition.congestion < 0.3 {
        Compression::ZstdFast
    } else {
        Compression::Zstd
    };

    let network_suitability = (0.4 * (bandwidth / 50.0).min(1.0)
        + 0.3 * (1.0 - condition.congestion)
        + 0.3 * condition.reliability
        - (condition.latency_ms / 1000.0).min(0.2))
    .clamp(0.0, 1.0);

    let mut confidence = 0.5 + ((training_len as f64 / TRAINING_CAPACITY as f64) * 0.3).min(0.3);
    confidence += match condition.trend {
        NetworkTrend::Stable => 0.1,
        NetworkTrend::Volatile => -0.2,
        _ => 0.0,
    };

    ChunkPrediction {
        estimated_upload_time: Duration::from_secs_f64(total_secs),
        predicted_throughput_mbps: predicted_throughput,
        success_probability,
        optimal_chunk_size_mb: optimal_chunk_size_mb(bandwidth, condition.congestion, config),
        recommended_compression,
        network_suitability,
        confidence: confidence.clamp(0.1, 0.95),
    }
}

/// Pearson correlation; 0 when either side is constant.
fn correlation(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;

    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        covariance += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x < f64::EPSILON || var_y < f64::EPSILON {
        return 0.0;
    }
    covariance / (var_x.sqrt() * var_y.sqrt())
}
