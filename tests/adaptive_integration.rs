//! Adaptive Transfer Integration Tests
//!
//! Drives a transfer session through sustained underperformance and
//! verifies the controller re-tunes it, plus the start/stop idempotence
//! laws across the adaptive subsystems.

use convoy::adaptive::{AdaptiveEngine, NetworkCondition, NetworkTrend};
use convoy::config::AdaptationConfig;
use chrono::Utc;

const MB: u64 = 1024 * 1024;

fn steady_condition(bandwidth_mbps: f64) -> NetworkCondition {
    NetworkCondition {
        timestamp: Utc::now(),
        bandwidth_mbps,
        latency_ms: 40.0,
        packet_loss: 0.001,
        jitter_ms: 1.0,
        congestion: 0.0,
        reliability: 0.98,
        trend: NetworkTrend::Stable,
    }
}

/// Scenario: a 100 MB session with default parameters observes 5 MBps
/// against an expected 50 MBps; within one evaluation cycle its chunk
/// size and concurrency move and the adaptation counter advances.
#[tokio::test]
async fn underperforming_session_is_adapted_within_one_cycle() {
    let engine = AdaptiveEngine::new(AdaptationConfig::default());

    engine
        .controller
        .start_transfer_session("bulk-1", 100 * MB, None)
        .await
        .unwrap();

    let network = steady_condition(50.0);
    for i in 1..=5u64 {
        engine
            .controller
            .update_transfer_progress("bulk-1", i * 2 * MB, 5.0, &network)
            .await
            .unwrap();
    }

    engine.controller.evaluate_now().await;

    let sessions = engine.controller.active_transfers().await;
    let session = &sessions["bulk-1"];
    assert!(session.adaptation_count >= 1);
    assert_ne!(session.params.chunk_size_mb, 32);
    assert_ne!(session.params.concurrency, 4);

    engine.controller.end_transfer_session("bulk-1").await.unwrap();
}

/// Law: start and stop are idempotent on the engine and each subsystem.
#[tokio::test]
async fn start_stop_idempotence_laws() {
    let engine = AdaptiveEngine::new(AdaptationConfig::default());

    engine.start().await;
    engine.start().await;

    engine.monitor.start().await;
    engine.optimizer.start().await;
    engine.controller.start().await;

    engine.shutdown().await;
    engine.shutdown().await;

    engine.monitor.shutdown().await;
    engine.optimizer.shutdown().await;
    engine.controller.shutdown().await;
}

/// Sessions survive engine restarts; only the monitoring cadence stops.
#[tokio::test]
async fn sessions_survive_engine_restart() {
    let engine = AdaptiveEngine::new(AdaptationConfig::default());
    engine.start().await;

    engine
        .controller
        .start_transfer_session("persistent", 10 * MB, None)
        .await
        .unwrap();

    engine.shutdown().await;
    engine.start().await;

    let sessions = engine.controller.active_transfers().await;
    assert!(sessions.contains_key("persistent"));

    engine.shutdown().await;
}
