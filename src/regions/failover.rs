//! Failover Manager
//!
//! Tracks per-region failure history, decides when a region has failed,
//! and executes failover operations between regions under the configured
//! strategy and timeout.

use crate::config::{FailoverConfig, FailoverStrategy};
use crate::error::{ConvoyError, ConvoyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// A failure within this window counts as recent
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Without a success for this long, a recently failing region is failed
const SUCCESS_STARVATION_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Failure rate (percent) above which a well-sampled region is failed
const FAILURE_RATE_CUTOFF: f64 = 75.0;

/// Samples required before the failure-rate rule applies
const FAILURE_RATE_MIN_CHECKS: u64 = 10;

/// Simulated traffic cutover time for immediate failovers
const IMMEDIATE_CUTOVER: Duration = Duration::from_secs(2);

/// Upper bound on the graceful drain phase
const MAX_DRAIN: Duration = Duration::from_secs(30);

/// Per-region failure bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RegionFailureHistory {
    /// Failures since the last success
    pub consecutive_failures: u32,

    /// Total failures recorded
    pub total_failures: u64,

    /// Total checks recorded (successes and failures)
    pub total_checks: u64,

    /// Most recent failure
    pub last_failure: Option<Instant>,

    /// Most recent success
    pub last_success: Option<Instant>,

    /// failures / checks, percent
    pub failure_rate: f64,
}

impl RegionFailureHistory {
    fn recompute_rate(&mut self) {
        self.failure_rate = if self.total_checks > 0 {
            (self.total_failures as f64 / self.total_checks as f64) * 100.0
        } else {
            0.0
        };
    }
}

/// Lifecycle of a failover operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailoverState {
    Initiated,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

/// One failover between two regions
#[derive(Debug, Clone)]
pub struct FailoverOperation {
    /// Operation id
    pub id: Uuid,

    /// Region traffic is moving away from
    pub from_region: String,

    /// Region traffic is moving to
    pub to_region: String,

    /// When the operation started
    pub started_at: Instant,

    /// Current state
    pub status: FailoverState,

    /// Error captured when the operation failed
    pub error: Option<String>,
}

/// Detects failed regions and executes failovers.
pub struct FailoverManager {
    config: FailoverConfig,

    /// Failure history per region, owned by this manager
    history: Arc<RwLock<HashMap<String, RegionFailureHistory>>>,

    /// At most one in-progress failover per from-region
    active: Arc<RwLock<HashMap<String, FailoverOperation>>>,

    /// Completed failovers: from-region to to-region
    completed: Arc<RwLock<HashMap<String, String>>>,
}

impl FailoverManager {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            history: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            completed: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a failed operation against a region.
    pub async fn record_failure(&self, region: &str) {
        let mut history = self.history.write().await;
        let entry = history.entry(region.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.total_failures += 1;
        entry.total_checks += 1;
        entry.last_failure = Some(Instant::now());
        entry.recompute_rate();
    }

    /// Record a successful operation against a region.
    pub async fn record_success(&self, region: &str) {
        let mut history = self.history.write().await;
        let entry = history.entry(region.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.total_checks += 1;
        entry.last_success = Some(Instant::now());
        entry.recompute_rate();
    }

    /// Whether a region should be treated as failed.
    ///
    /// True when consecutive failures reach the configured retry attempts,
    /// when a well-sampled region's failure rate exceeds 75%, or when a
    /// region failed recently and has not succeeded for 15 minutes.
    /// Unknown regions are not failed.
    pub async fn detect_failure(&self, region: &str) -> bool {
        let history = self.history.read().await;
        let Some(entry) = history.get(region) else {
            return false;
        };

        if entry.consecutive_failures >= self.config.retry_attempts {
            return true;
        }
        if entry.failure_rate > FAILURE_RATE_CUTOFF && entry.total_checks > FAILURE_RATE_MIN_CHECKS
        {
            return true;
        }
        if let Some(last_failure) = entry.last_failure {
            if last_failure.elapsed() < RECENT_FAILURE_WINDOW {
                let starved = match entry.last_success {
                    Some(last_success) => last_success.elapsed() > SUCCESS_STARVATION_WINDOW,
                    None => true,
                };
                if starved {
                    return true;
                }
            }
        }
        false
    }

    /// Execute a failover from one region to another.
    ///
    /// Atomic from the caller's view: either the completed failover was
    /// recorded or an error is returned, and the active-operation slot is
    /// always released.
    pub async fn execute_failover(
        &self,
        from_region: &str,
        to_region: &str,
    ) -> ConvoyResult<FailoverOperation> {
        if from_region.is_empty() || to_region.is_empty() {
            return Err(ConvoyError::InvalidArgument(
                "failover regions must not be empty".to_string(),
            ));
        }
        if from_region == to_region {
            return Err(ConvoyError::InvalidArgument(
                "failover source and target must differ".to_string(),
            ));
        }

        {
            let mut active = self.active.write().await;
            if active.contains_key(from_region) {
                return Err(ConvoyError::FailoverInProgress {
                    region: from_region.to_string(),
                });
            }
            active.insert(
                from_region.to_string(),
                FailoverOperation {
                    id: Uuid::new_v4(),
                    from_region: from_region.to_string(),
                    to_region: to_region.to_string(),
                    started_at: Instant::now(),
                    status: FailoverState::Initiated,
                    error: None,
                },
            );
        }
        tracing::info!(from = %from_region, to = %to_region, "failover initiated");

        let started = Instant::now();
        if let Some(op) = self.active.write().await.get_mut(from_region) {
            op.status = FailoverState::InProgress;
        }

        let outcome = match tokio::time::timeout(
            self.config.failover_timeout,
            self.run_strategy(from_region),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConvoyError::FailoverTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        let mut operation = self
            .active
            .write()
            .await
            .remove(from_region)
            .unwrap_or_else(|| FailoverOperation {
                id: Uuid::new_v4(),
                from_region: from_region.to_string(),
                to_region: to_region.to_string(),
                started_at: started,
                status: FailoverState::InProgress,
                error: None,
            });

        match outcome {
            Ok(()) => {
                operation.status = FailoverState::Completed;
                self.completed
                    .write()
                    .await
                    .insert(from_region.to_string(), to_region.to_string());
                tracing::info!(from = %from_region, to = %to_region, "failover completed");
                Ok(operation)
            }
            Err(err) => {
                operation.status = FailoverState::Failed;
                operation.error = Some(err.to_string());
                tracing::warn!(from = %from_region, to = %to_region, error = %err, "failover failed");
                Err(err)
            }
        }
    }

    async fn run_strategy(&self, from_region: &str) -> ConvoyResult<()> {
        match self.config.strategy {
            FailoverStrategy::Immediate => {
                tokio::time::sleep(IMMEDIATE_CUTOVER).await;
                Ok(())
            }
            FailoverStrategy::Graceful => {
                let drain = MAX_DRAIN.min(self.config.failover_timeout / 2);
                tokio::time::sleep(drain).await;
                Ok(())
            }
            FailoverStrategy::Manual => Err(ConvoyError::ManualInterventionRequired {
                region: from_region.to_string(),
            }),
        }
    }

    /// Failure history for one region (a copy).
    pub async fn failure_history(&self, region: &str) -> Option<RegionFailureHistory> {
        self.history.read().await.get(region).cloned()
    }

    /// Completed failovers, from-region to to-region (a copy).
    pub async fn failover_status(&self) -> HashMap<String, String> {
        self.completed.read().await.clone()
    }

    /// Number of failovers currently in flight.
    pub async fn active_failovers(&self) -> usize {
        self.active.read().await.len()
    }
}
