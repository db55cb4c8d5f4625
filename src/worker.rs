//! Task execution
//!
//! ## Table of Contents
//! - **WorkerConfig**: Serialized publish state handed to every worker
//! - **PublishWorker**: Runs one build task against a worker config
//!
//! The local scheduler and farm workers share this code path; a farm job is
//! `asset-publish worker <config> <kind> [<n>]`, run through
//! [`PublishWorker::run_job`].

use crate::assemble::Assembler;
use crate::config::{
    ExportSettings, Identity, PublishConfig, PublishOptions, ReviewSettings, TextureSettings,
};
use crate::error::{PublishError, Result};
use crate::external::{
    export_with_fallback, CommandExporter, ExportRequest, Exporter, OiioConverter, TextureConverter,
};
use crate::finalize::{Finalization, Finalizer};
use crate::graph::{BuildTask, TaskKind};
use crate::layer::write_atomic;
use crate::lod::texture::convert_jobs;
use crate::lod::{LodPlanner, TextureManifest};
use crate::retry::RetryPolicy;
use crate::review::ReviewContext;
use crate::scheduler::TaskRunner;
use crate::version::{artifacts, AssetVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

fn default_chunk_size() -> usize {
    50
}

/// Everything a worker needs to run one task of a publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Source scene
    pub scene: PathBuf,
    /// Top prim name
    pub top_name: String,
    /// Version label
    pub version: String,
    /// Version directory
    pub version_dir: PathBuf,
    /// Artifact name to path
    pub artifacts: BTreeMap<String, PathBuf>,
    /// Feature switches
    pub options: PublishOptions,
    /// Exporter command and profiles
    #[serde(default)]
    pub export: ExportSettings,
    /// Texture tool and pool size
    #[serde(default)]
    pub texture: TextureSettings,
    /// Texture manifest entries per conversion task
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Task root, for the shared thumbnail
    #[serde(default)]
    pub task_root: Option<PathBuf>,
    /// Who and what is being published
    #[serde(default)]
    pub identity: Identity,
    /// Review service settings
    #[serde(default)]
    pub review: ReviewSettings,
    /// Review target resolved at submission
    #[serde(default)]
    pub review_context: Option<ReviewContext>,
}

impl WorkerConfig {
    /// Worker config for one allocated version
    pub fn new(scene: impl Into<PathBuf>, version: &AssetVersion, config: &PublishConfig) -> Self {
        Self {
            scene: scene.into(),
            top_name: version.top_name.clone(),
            version: version.label.clone(),
            version_dir: version.dir.clone(),
            artifacts: version.artifacts.clone(),
            options: config.options.clone(),
            export: config.export.clone(),
            texture: config.texture.clone(),
            chunk_size: config.farm.chunk_size,
            task_root: config.paths.task_root.clone(),
            identity: config.identity.clone(),
            review: config.review.clone(),
            review_context: None,
        }
    }

    /// Record the review target so the farm `assemble` job files the same record
    pub fn with_review_context(mut self, context: Option<ReviewContext>) -> Self {
        self.review_context = context;
        self
    }

    /// The version this config describes
    pub fn asset_version(&self) -> AssetVersion {
        AssetVersion {
            top_name: self.top_name.clone(),
            label: self.version.clone(),
            dir: self.version_dir.clone(),
            artifacts: self.artifacts.clone(),
        }
    }

    /// Write as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    /// Read a worker config
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PublishError::config(format!("cannot read worker config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            PublishError::config(format!("invalid worker config {}: {}", path.display(), e))
        })
    }
}

/// Executes build tasks for one publish
pub struct PublishWorker {
    config: WorkerConfig,
    version: AssetVersion,
    exporter: Arc<dyn Exporter>,
    converter: Arc<dyn TextureConverter>,
    retry: RetryPolicy,
}

impl PublishWorker {
    /// Worker using the given collaborators
    pub fn new(
        config: WorkerConfig,
        exporter: Arc<dyn Exporter>,
        converter: Arc<dyn TextureConverter>,
    ) -> Self {
        let version = config.asset_version();
        Self {
            config,
            version,
            exporter,
            converter,
            retry: RetryPolicy::default(),
        }
    }

    /// Worker driving the command-line tools named in `config`
    pub fn with_commands(config: WorkerConfig) -> Self {
        let exporter = Arc::new(CommandExporter::new(config.export.command.clone()));
        let converter = Arc::new(OiioConverter::new(config.texture.tool.clone()));
        Self::new(config, exporter, converter)
    }

    /// Set the retry policy for external tools
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Worker config
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one task kind
    pub fn run_kind(&self, kind: TaskKind) -> Result<()> {
        info!(task = %kind, version = %self.version.label, top = %self.version.top_name, "Worker task");
        match kind {
            TaskKind::ExportBase => {
                let output = self.version.artifact(artifacts::RENDER)?;
                self.export(ExportRequest::new(&self.config.scene, &self.config.top_name, output))
            }
            TaskKind::Proxy => {
                let proxy = &self.config.options.proxy;
                if !proxy.enabled {
                    return Err(PublishError::input_missing("proxy is disabled for this publish"));
                }
                let output = self.version.artifact(artifacts::PROXY)?;
                self.export(
                    ExportRequest::new(&self.config.scene, &self.config.top_name, output)
                        .with_reduction(proxy.percent)
                        .with_purpose("proxy"),
                )
            }
            TaskKind::Lod(level) => {
                if level == 0 || level > self.config.options.lod_levels() {
                    return Err(PublishError::config(format!(
                        "LOD{} was not requested for this publish",
                        level
                    )));
                }
                let plan = LodPlanner::new(self.config.options.lods.percent).level(level);
                info!(level, remove_percent = plan.remove_percent, "Reducing from original");
                self.export(
                    ExportRequest::new(
                        &self.config.scene,
                        &self.config.top_name,
                        self.version.lod_fragment(level),
                    )
                    .with_reduction(plan.remove_percent),
                )
            }
            TaskKind::TextureConvert(chunk) => self.convert_chunk(chunk),
            TaskKind::Assemble => {
                Assembler::new(&self.version, &self.config.options).run()?;
                Ok(())
            }
        }
    }

    /// Run one task as a farm job.
    ///
    /// A failed optional task is logged and reported as done, so the chain
    /// still reaches `assemble`, which composes without it. A successful
    /// `assemble` is followed by `finalizer`.
    pub async fn run_job(
        self: Arc<Self>,
        kind: TaskKind,
        finalizer: Option<&Finalizer>,
    ) -> Result<Option<Finalization>> {
        let worker = self.clone();
        let result = tokio::task::spawn_blocking(move || worker.run_kind(kind))
            .await
            .map_err(|e| PublishError::external(format!("task {} did not finish: {}", kind, e)))?;
        match result {
            Ok(()) => {}
            Err(e) if !kind.is_required() => {
                warn!(task = %kind, error = %e, absorbed = e.is_absorbed(), "Optional task failed, assemble proceeds without it");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        match (kind, finalizer) {
            (TaskKind::Assemble, Some(finalizer)) => Ok(Some(finalizer.run(&self.config).await)),
            _ => Ok(None),
        }
    }

    fn export(&self, request: ExportRequest) -> Result<()> {
        let profile = export_with_fallback(
            self.exporter.as_ref(),
            &request,
            &self.config.export.profiles,
            &self.retry,
        )?;
        info!(output = %request.output.display(), profile = %profile, "Fragment exported");
        Ok(())
    }

    fn convert_chunk(&self, chunk: usize) -> Result<()> {
        let manifest = TextureManifest::load(self.version.artifact(artifacts::MANIFEST)?)?;
        let jobs = manifest.chunk(chunk, self.config.chunk_size);
        if jobs.is_empty() {
            warn!(chunk, jobs = manifest.len(), "Texture chunk is empty");
            return Ok(());
        }
        let summary = convert_jobs(
            jobs,
            self.converter.as_ref(),
            self.config.texture.workers,
            &self.retry,
        )?;
        for (src, reason) in &summary.failed {
            warn!(src = %src.display(), reason = %reason, "Tile left at full resolution");
        }
        Ok(())
    }
}

impl TaskRunner for PublishWorker {
    fn run(&self, task: &BuildTask) -> Result<()> {
        self.run_kind(task.kind)
    }
}
