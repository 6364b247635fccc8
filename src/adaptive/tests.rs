//! Unit tests for the adaptive engine composition.
//!
//! Exercises the engine lifecycle and the flow from recorded transfer
//! metrics through the optimizer to session adaptations, without any
//! live network traffic.

use crate::adaptive::{
    AdaptationState, AdaptiveEngine, ChunkCandidate, NetworkMetric, TransferParams,
};
use crate::config::{AdaptationConfig, ConvoyConfig};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

#[tokio::test]
async fn sessions_start_from_staging_defaults() {
    let mut config = ConvoyConfig::default();
    config.staging.target_chunk_mb = 48;
    config.staging.max_buffer_mb = 512;

    let engine = AdaptiveEngine::from_config(&config);
    engine
        .controller
        .start_transfer_session("staged", 100 * MB, None)
        .await
        .unwrap();

    let sessions = engine.controller.active_transfers().await;
    assert_eq!(sessions["staged"].params.chunk_size_mb, 48);
    assert_eq!(sessions["staged"].params.buffer_size_mb, 128);
}

#[tokio::test]
async fn engine_start_and_shutdown_are_idempotent() {
    let engine = AdaptiveEngine::new(AdaptationConfig::default());

    engine.start().await;
    engine.start().await;
    engine.shutdown().await;
    engine.shutdown().await;

    // A stopped engine can be started again.
    engine.start().await;
    engine.shutdown().await;
}

#[tokio::test]
async fn recorded_metrics_flow_into_predictions() {
    let engine = AdaptiveEngine::new(AdaptationConfig::default());

    for _ in 0..10 {
        engine.monitor.record_transfer_metrics(80.0, 45.0).await;
    }
    engine.monitor.update_predictions().await;

    let prediction = engine
        .monitor
        .predict_metric(NetworkMetric::Bandwidth, Duration::from_secs(30))
        .await;
    assert!(prediction.value > 0.0);

    let chunk = ChunkCandidate {
        size_bytes: 32 * MB,
        start_offset: 0,
        end_offset: 32 * MB,
        compression_score: 0.4,
    };
    let condition = engine.monitor.current_condition().await;
    let chunk_prediction = engine.predictor.predict(&chunk, &condition).await;
    assert!(chunk_prediction.estimated_upload_time > Duration::ZERO);
    assert!(chunk_prediction.success_probability >= 0.1);
}

#[tokio::test]
async fn forced_optimization_adapts_active_sessions() {
    let engine = AdaptiveEngine::new(AdaptationConfig::default());

    // A fast link with almost nothing on it.
    engine.monitor.record_transfer_metrics(200.0, 25.0).await;
    engine.optimizer.record_observed_throughput(5.0).await;

    engine
        .controller
        .start_transfer_session("idle-link", 500 * MB, None)
        .await
        .unwrap();

    let recommendation = engine
        .optimizer
        .force_optimization()
        .await
        .expect("underutilized link should produce a recommendation");

    // Apply directly; the background bridge does the same thing on its
    // own cadence once the engine is started.
    let state = AdaptationState::from_recommendation(&recommendation, &TransferParams::default());
    engine.controller.apply_adaptation(&state).await;

    let sessions = engine.controller.active_transfers().await;
    let session = &sessions["idle-link"];
    assert_eq!(session.adaptation_count, 1);
    assert_eq!(session.params.concurrency, recommendation.concurrency);
}
