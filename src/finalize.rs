//! Post-assemble publish steps
//!
//! ## Table of Contents
//! - **Finalizer**: Thumbnail, scene archive and review record for one version
//! - **Finalization**: What those steps produced
//! - **archive_name**: `{asset}_{task}_{version}_{user}{ext}`
//!
//! Runs after a successful `assemble`: at the end of a local publish, and
//! inside the farm's `assemble` job for distributed publishes.

use crate::config::Identity;
use crate::external::{ensure_thumbnail, CommandThumbnailer, Thumbnailer};
use crate::retry::RetryPolicy;
use crate::review::{client_from_settings, submit_review, BoxedReviewClient, ReviewContext, ReviewSubmission};
use crate::version::artifacts;
use crate::worker::WorkerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// `{asset}_{task}_{version}_{user}{ext}`
pub fn archive_name(identity: &Identity, top_name: &str, label: &str, scene: &Path) -> String {
    let ext = scene
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!(
        "{}_{}_{}_{}{}",
        identity.asset.as_deref().unwrap_or(top_name),
        identity.task.as_deref().unwrap_or("task"),
        label,
        identity.user,
        ext
    )
}

/// Outputs of the post-assemble steps; each is absent when its step failed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Finalization {
    /// Thumbnail used for review
    pub thumbnail: Option<PathBuf>,
    /// Copy of the source scene in the version directory
    pub archive: Option<PathBuf>,
    /// Review record, when one was created
    pub review: Option<ReviewSubmission>,
}

/// Runs the steps that follow a successful assemble.
///
/// None of them fails the publish: every failure is logged and leaves its
/// output empty.
pub struct Finalizer {
    thumbnailer: Arc<dyn Thumbnailer>,
    review: Option<(BoxedReviewClient, ReviewContext)>,
    status: String,
    retry: RetryPolicy,
}

impl Finalizer {
    /// Finalizer capturing thumbnails with `thumbnailer` and filing no review
    pub fn new(thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        Self {
            thumbnailer,
            review: None,
            status: "rev".into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Finalizer for a farm worker, built from the worker config.
    ///
    /// The review context recorded at submission wins over the worker's
    /// environment. A review target that cannot be built is logged and
    /// skipped.
    pub fn for_worker(config: &WorkerConfig) -> Self {
        let finalizer = Self::new(Arc::new(CommandThumbnailer::new(config.export.thumbnail.clone())))
            .with_status(config.review.status.clone());
        if !config.review.enabled {
            return finalizer;
        }

        let context = match &config.review_context {
            Some(context) => Ok(context.clone()),
            None => ReviewContext::from_env(&config.identity),
        };
        match context.and_then(|ctx| client_from_settings(&config.review).map(|client| (client, ctx))) {
            Ok((client, context)) => finalizer.with_review(client, context),
            Err(e) => {
                warn!(error = %e, "Review target unavailable, no record will be filed");
                finalizer
            }
        }
    }

    /// File a review record with `client` under `context`
    pub fn with_review(mut self, client: BoxedReviewClient, context: ReviewContext) -> Self {
        self.review = Some((client, context));
        self
    }

    /// Set the status given to new review records
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the retry policy for review requests
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Capture the thumbnail and archive the scene concurrently, then file the review record
    pub async fn run(&self, config: &WorkerConfig) -> Finalization {
        let (thumbnail, archive) = futures::join!(self.capture_thumbnail(config), archive_scene(config));
        let mut finalization = Finalization {
            thumbnail,
            archive,
            review: None,
        };

        if let Some((client, context)) = &self.review {
            let interface = config
                .artifacts
                .get(artifacts::TOP)
                .cloned()
                .unwrap_or_else(|| config.version_dir.join(format!("{}.json", config.top_name)));
            match submit_review(
                client.as_ref(),
                context,
                &interface,
                finalization.thumbnail.as_deref(),
                &self.status,
                &self.retry,
            )
            .await
            {
                Ok(record) => finalization.review = Some(record),
                Err(e) => error!(version = %config.version, error = %e, "Review submission failed"),
            }
        }

        info!(
            version = %config.version,
            thumbnail = finalization.thumbnail.is_some(),
            archive = finalization.archive.is_some(),
            review = finalization.review.is_some(),
            "Publish finalized"
        );
        finalization
    }

    async fn capture_thumbnail(&self, config: &WorkerConfig) -> Option<PathBuf> {
        let Some(task_root) = config.task_root.clone() else {
            warn!("No task root in worker config, thumbnail skipped");
            return None;
        };
        let thumbnailer = self.thumbnailer.clone();
        let scene = config.scene.clone();
        let top = config.top_name.clone();

        let result = tokio::task::spawn_blocking(move || {
            ensure_thumbnail(thumbnailer.as_ref(), &scene, &task_root, &top)
        })
        .await;
        match result {
            Ok(Ok(path)) => Some(path),
            Ok(Err(e)) => {
                warn!(error = %e, "Thumbnail unavailable");
                None
            }
            Err(e) => {
                warn!(error = %e, "Thumbnail capture did not finish");
                None
            }
        }
    }
}

async fn archive_scene(config: &WorkerConfig) -> Option<PathBuf> {
    let name = archive_name(&config.identity, &config.top_name, &config.version, &config.scene);
    let target = config.version_dir.join(name);
    match tokio::fs::copy(&config.scene, &target).await {
        Ok(_) => {
            info!(archive = %target.display(), "Scene archived");
            Some(target)
        }
        Err(e) => {
            warn!(scene = %config.scene.display(), error = %e, "Scene archive failed");
            None
        }
    }
}
