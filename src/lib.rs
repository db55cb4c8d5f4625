//! # Asset Publish
//!
//! Versioned, multi-resolution asset publishing. One publish exports an
//! artist scene into layered scene-description fragments, composes them into
//! a strength-ordered package with level-of-detail variants and rebound
//! materials, and runs the work locally or as a dependency-chained farm job
//! graph.
//!
//! ## Features
//!
//! - **Versioning**: Race-safe `vNNN` allocation per publish root
//! - **LOD**: Geometric reduction targets and texture tiers with UDIM expansion
//! - **Composition**: Payload stacks, variant sets, interface documents
//! - **Material Rebinding**: Per-asset material copies with forced binding strength
//! - **Build Graph**: Local execution or farm submission of one task per fragment
//! - **Review**: Thumbnail, scene archive and review record once a publish is assembled
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use asset_publish::{PublishConfig, PublishOrchestrator, PublishRequest};
//!
//! #[tokio::main]
//! async fn main() -> asset_publish::Result<()> {
//!     let config = PublishConfig::from_env()?;
//!     let outcome = PublishOrchestrator::new(config)
//!         .publish(PublishRequest::new("/work/chair.ma", "chair"))
//!         .await?;
//!     println!("published {}", outcome.version.label);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod assemble;
pub mod composer;
pub mod config;
pub mod error;
pub mod external;
pub mod farm;
pub mod finalize;
pub mod graph;
pub mod layer;
pub mod lod;
pub mod orchestrator;
pub mod rebind;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod stage;
pub mod version;
pub mod worker;

// Re-exports for ergonomic API
pub use assemble::{Assembler, AssemblyReport};
pub use composer::{LayerComposer, VariantEntry, VariantScope};
pub use config::{ExecutionMode, Identity, PublishConfig, PublishOptions};
pub use error::{PublishError, Result};
pub use external::{ExportProfile, ExportRequest, Exporter, TextureConverter, Thumbnailer};
pub use farm::{FarmClient, FarmJob, FarmSubmitter, Submission};
pub use finalize::{Finalization, Finalizer};
pub use graph::{BuildGraph, BuildTask, TaskKind, TaskStatus};
pub use layer::{Layer, PrimSpec};
pub use lod::{LodLevel, LodPlanner, TextureManifest, TextureTier, TEXTURE_TIERS};
pub use orchestrator::{PublishOrchestrator, PublishOutcome, PublishRequest, PublishRun};
pub use rebind::{MaterialRebinder, RebindReport};
pub use retry::{RetryConfig, RetryPolicy};
pub use review::{ReviewClient, ReviewContext};
pub use scheduler::{LocalScheduler, RunReport, TaskRunner};
pub use stage::Stage;
pub use version::{AssetVersion, VersionAllocator};
pub use worker::{PublishWorker, WorkerConfig};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{PublishConfig, PublishOptions};
    pub use crate::error::Result;
    pub use crate::external::{Exporter, TextureConverter, Thumbnailer};
    pub use crate::graph::{BuildGraph, TaskKind};
    pub use crate::orchestrator::{PublishOrchestrator, PublishRequest};
    pub use crate::version::{AssetVersion, VersionAllocator};
}
