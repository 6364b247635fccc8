//! Adaptive Transfer Capabilities
//!
//! This module provides the network condition monitor, bandwidth
//! optimizer, performance predictor, and the adaptive transfer controller
//! that together tune chunk size, concurrency, and compression for
//! active upload sessions.

pub mod controller;
pub mod monitor;
pub mod optimizer;
pub mod predictor;
pub mod ring;

#[cfg(test)]
mod tests;

// Re-export key types for easy access
pub use controller::{
    AdaptationState, AdaptiveTransferController, PerformanceSnapshot, RetryPolicy,
    TimeoutSettings, TransferParams, TransferSession,
};
pub use monitor::{
    MetricPrediction, NetworkCondition, NetworkConditionMonitor, NetworkMetric, NetworkTrend,
};
pub use optimizer::{
    BandwidthOptimizer, BandwidthUtilization, Compression, FlowControlWindow, NetworkHealth,
    OptimizationReason, OptimizationRecommendation, RecommendationPriority,
};
pub use predictor::{
    ChunkCandidate, ChunkPrediction, ModelWeights, PerformancePredictor, TrainingSample,
};
pub use ring::Ring;

use crate::config::{AdaptationConfig, ConvoyConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// High-level orchestrator for the adaptive transfer subsystems.
///
/// Constructs the monitor, optimizer, predictor, and controller with
/// shared configuration and forwards optimizer recommendations to every
/// active transfer session.
pub struct AdaptiveEngine {
    /// Network condition monitor
    pub monitor: Arc<NetworkConditionMonitor>,

    /// Bandwidth optimizer
    pub optimizer: Arc<BandwidthOptimizer>,

    /// Performance predictor
    pub predictor: Arc<PerformancePredictor>,

    /// Adaptive transfer controller
    pub controller: Arc<AdaptiveTransferController>,

    shutdown_tx: watch::Sender<bool>,
    glue_worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AdaptiveEngine {
    pub fn new(config: AdaptationConfig) -> Self {
        Self::with_initial_params(config, TransferParams::default())
    }

    /// Engine whose new sessions are seeded from the staging settings of
    /// a full Convoy configuration.
    pub fn from_config(config: &ConvoyConfig) -> Self {
        Self::with_initial_params(
            config.adaptation.clone(),
            TransferParams::from_staging(&config.staging),
        )
    }

    fn with_initial_params(config: AdaptationConfig, initial_params: TransferParams) -> Self {
        let monitor = Arc::new(NetworkConditionMonitor::new(config.clone()));
        let optimizer = Arc::new(BandwidthOptimizer::new(
            config.clone(),
            Arc::clone(&monitor),
        ));
        let predictor = Arc::new(PerformancePredictor::new(config.clone()));
        let controller = Arc::new(AdaptiveTransferController::with_default_params(
            config,
            Arc::clone(&monitor),
            initial_params,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            monitor,
            optimizer,
            predictor,
            controller,
            shutdown_tx,
            glue_worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Start all subsystems and the recommendation bridge. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.monitor.start().await;
        self.optimizer.start().await;
        self.controller.start().await;

        // Bridge optimizer recommendations into session adaptations.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<OptimizationRecommendation>();
        self.optimizer.on_recommendation(move |recommendation| {
            let _ = tx.send(recommendation.clone());
        });

        let controller = Arc::clone(&self.controller);
        let optimizer = Arc::clone(&self.optimizer);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    recommendation = rx.recv() => {
                        let Some(recommendation) = recommendation else { break };
                        let state = AdaptationState::from_recommendation(
                            &recommendation,
                            &TransferParams::default(),
                        );
                        controller.apply_adaptation(&state).await;
                        optimizer
                            .set_current_parameters(
                                state.params.concurrency,
                                state.params.chunk_size_mb,
                            )
                            .await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.glue_worker.lock().await = Some(handle);

        tracing::info!("adaptive engine started");
    }

    /// Stop all subsystems. Idempotent.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.glue_worker.lock().await.take() {
            let _ = handle.await;
        }
        self.controller.shutdown().await;
        self.optimizer.shutdown().await;
        self.monitor.shutdown().await;

        tracing::info!("adaptive engine stopped");
    }
}
