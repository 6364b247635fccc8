//! Convoy - Multi-Region Adaptive Bulk Upload Engine
//!
//! Convoy distributes large-archive uploads across geographically
//! distributed storage regions, continuously adjusts its own transfer
//! parameters (chunk size, parallelism, compression level) in response to
//! observed network conditions, and survives regional or transient
//! failures through automatic failover.
//!
//! # Architecture
//!
//! 1. **Adaptive Layer**: network condition monitor, bandwidth optimizer,
//!    performance predictor, and the adaptive transfer controller that
//!    tunes active sessions
//! 2. **Region Layer**: region selector, load balancer with sticky
//!    sessions, failover manager, and the multi-region coordinator
//! 3. **Upload Facade**: archive-level uploads with cross-region retries
//!    and redundant (quorum) uploads
//!
//! The storage client itself is outside the crate; every region is driven
//! through the minimal [`Uploader`] capability, with a simulated transport
//! standing in for real backends.
//!
//! # Quick Start
//!
//! ```rust
//! use convoy::config::MultiRegionConfig;
//! use convoy::regions::{MultiRegionCoordinator, Region, UploadRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MultiRegionConfig {
//!         primary_region: "us-east-1".to_string(),
//!         regions: vec![
//!             Region::new("us-east-1", 1, 50),
//!             Region::new("us-west-2", 2, 30),
//!         ],
//!         ..Default::default()
//!     };
//!
//!     let coordinator = MultiRegionCoordinator::new();
//!     coordinator.initialize(config).await?;
//!
//!     let request = UploadRequest::new("backup.tar.zst", "archives/backup.tar.zst", 1024 * 1024);
//!     let result = coordinator.upload(request).await?;
//!     println!("uploaded to {} in {:?}", result.region, result.duration);
//!
//!     coordinator.shutdown(std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod adaptive;

pub mod config;

pub mod error;

pub mod regions;

pub mod uploader;

pub use config::{AdaptationConfig, ConvoyConfig, MultiRegionConfig, StagingConfig};

pub use error::{ConvoyError, ConvoyResult, ErrorCategory};

pub use adaptive::{
    AdaptiveEngine, AdaptiveTransferController, BandwidthOptimizer, NetworkCondition,
    NetworkConditionMonitor, PerformancePredictor, TransferParams,
};

pub use regions::{
    ArchiveUploadRequest, ArchiveUploadResult, MultiRegionCoordinator, MultiRegionUploader,
    Region, RegionStatus, UploadRequest, UploadResult,
};

pub use uploader::{Archive, SimulatedTransport, TransportResult, Uploader};
