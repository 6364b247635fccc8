//! Unified Error Handling System
//!
//! This module provides a comprehensive, type-safe error handling system
//! using thiserror for all Convoy components.

use thiserror::Error;

/// Main error type for all Convoy operations
#[derive(Error, Debug)]
pub enum ConvoyError {
    // Lifecycle Errors
    #[error("coordinator is not initialized")]
    NotInitialized,

    #[error("coordinator is already initialized")]
    AlreadyInitialized,

    #[error("shutdown did not complete within {timeout_ms}ms")]
    ShutdownTimeout { timeout_ms: u64 },

    // Configuration and Validation Errors
    #[error("invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Routing Errors
    #[error("no healthy region available")]
    NoHealthyRegion,

    #[error("region not found: {region}")]
    RegionNotFound { region: String },

    // Failover Errors
    #[error("failover already in progress from region: {region}")]
    FailoverInProgress { region: String },

    #[error("failover timed out after {elapsed_ms}ms")]
    FailoverTimeout { elapsed_ms: u64 },

    #[error("manual failover from {region} requires operator intervention")]
    ManualInterventionRequired { region: String },

    // Upload Errors
    #[error("upload failed in region {region}: {reason}")]
    UploadFailed { region: String, reason: String },

    #[error("quorum not met: {successes} of {required} required region successes")]
    QuorumNotMet { successes: usize, required: usize },

    // Cancellation
    #[error("operation canceled")]
    Canceled,

    // Adaptive Transfer Errors
    #[error("transfer session not found: {session}")]
    SessionNotFound { session: String },

    #[error("adaptation rejected for session {session}: {reason}")]
    AdaptationRejected { session: String, reason: String },

    // Internal and Unknown Errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for Convoy operations
pub type ConvoyResult<T> = Result<T, ConvoyError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    Lifecycle,
    Configuration,
    Routing,
    Failover,
    Upload,
    Adaptation,
    Internal,
}

impl ConvoyError {
    /// Get the category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConvoyError::NotInitialized
            | ConvoyError::AlreadyInitialized
            | ConvoyError::ShutdownTimeout { .. }
            | ConvoyError::Canceled => ErrorCategory::Lifecycle,

            ConvoyError::InvalidConfig { .. } | ConvoyError::InvalidArgument(_) => {
                ErrorCategory::Configuration
            }

            ConvoyError::NoHealthyRegion | ConvoyError::RegionNotFound { .. } => {
                ErrorCategory::Routing
            }

            ConvoyError::FailoverInProgress { .. }
            | ConvoyError::FailoverTimeout { .. }
            | ConvoyError::ManualInterventionRequired { .. } => ErrorCategory::Failover,

            ConvoyError::UploadFailed { .. } | ConvoyError::QuorumNotMet { .. } => {
                ErrorCategory::Upload
            }

            ConvoyError::SessionNotFound { .. } | ConvoyError::AdaptationRejected { .. } => {
                ErrorCategory::Adaptation
            }

            ConvoyError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            // A failed upload may succeed in another region; a saturated
            // routing table may recover on the next health pass.
            ConvoyError::UploadFailed { .. }
            | ConvoyError::NoHealthyRegion
            | ConvoyError::FailoverTimeout { .. } => true,

            // A duplicate failover resolves once the active one completes.
            ConvoyError::FailoverInProgress { .. } => true,

            // Config, lookup, and protocol errors are fatal for the call.
            ConvoyError::NotInitialized
            | ConvoyError::AlreadyInitialized
            | ConvoyError::InvalidConfig { .. }
            | ConvoyError::InvalidArgument(_)
            | ConvoyError::RegionNotFound { .. }
            | ConvoyError::ManualInterventionRequired { .. }
            | ConvoyError::QuorumNotMet { .. }
            | ConvoyError::SessionNotFound { .. }
            | ConvoyError::AdaptationRejected { .. }
            | ConvoyError::Canceled
            | ConvoyError::ShutdownTimeout { .. }
            | ConvoyError::Internal(_) => false,
        }
    }
}
