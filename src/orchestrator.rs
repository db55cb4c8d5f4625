//! Publish orchestration
//!
//! ## Table of Contents
//! - **PublishOrchestrator**: Allocates a version, plans the graph, runs or submits it
//! - **PublishRequest**: Scene and top prim of one publish
//! - **PublishOutcome**: Version plus the local report or farm submission
//!
//! Everything that can be misconfigured is checked before the version
//! directory is created.

use crate::config::{ExecutionMode, PublishConfig};
use crate::error::{PublishError, Result};
use crate::external::{CommandExporter, CommandThumbnailer, Exporter, OiioConverter, TextureConverter, Thumbnailer};
use crate::farm::{client_from_settings, BoxedFarmClient, FarmSubmitter, Submission};
use crate::finalize::Finalizer;
use crate::graph::BuildGraph;
use crate::lod::{TextureManifest, TEXTURE_TIERS};
use crate::retry::RetryPolicy;
use crate::review::{self, BoxedReviewClient, ReviewContext, ReviewSubmission};
use crate::scheduler::{LocalScheduler, RunReport};
use crate::version::{artifacts, publish_root, AssetVersion, VersionAllocator};
use crate::worker::{PublishWorker, WorkerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// One publish of one scene
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    /// Source scene
    pub scene: PathBuf,
    /// Top prim name
    pub top_name: String,
}

impl PublishRequest {
    /// Request for `scene` published under `/<top_name>`
    pub fn new(scene: impl Into<PathBuf>, top_name: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            top_name: top_name.into(),
        }
    }
}

/// How the build graph was executed
#[derive(Debug, Clone)]
pub enum PublishRun {
    /// Ran in this process
    Local(RunReport),
    /// Handed to the farm
    Farm(Submission),
}

/// Result of one publish
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// Publish id
    pub id: Uuid,
    /// Allocated version
    pub version: AssetVersion,
    /// Local report or farm submission
    pub run: PublishRun,
    /// Thumbnail used for review
    pub thumbnail: Option<PathBuf>,
    /// Copy of the source scene next to the publish
    pub archive: Option<PathBuf>,
    /// Review record, when one was created
    pub review: Option<ReviewSubmission>,
}

impl PublishOutcome {
    /// Whether every required step finished (or was accepted by the farm)
    pub fn is_success(&self) -> bool {
        match &self.run {
            PublishRun::Local(report) => report.is_success(),
            PublishRun::Farm(_) => true,
        }
    }
}

/// Top-level publish driver
pub struct PublishOrchestrator {
    config: PublishConfig,
    allocator: VersionAllocator,
    exporter: Arc<dyn Exporter>,
    converter: Arc<dyn TextureConverter>,
    thumbnailer: Arc<dyn Thumbnailer>,
    farm: Option<BoxedFarmClient>,
    review: Option<BoxedReviewClient>,
    review_context: Option<ReviewContext>,
    retry: RetryPolicy,
}

impl PublishOrchestrator {
    /// Orchestrator driving the command-line tools named in `config`
    pub fn new(config: PublishConfig) -> Self {
        let exporter = Arc::new(CommandExporter::new(config.export.command.clone()));
        let converter = Arc::new(OiioConverter::new(config.texture.tool.clone()));
        let thumbnailer = Arc::new(CommandThumbnailer::new(config.export.thumbnail.clone()));
        Self {
            config,
            allocator: VersionAllocator::new(),
            exporter,
            converter,
            thumbnailer,
            farm: None,
            review: None,
            review_context: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the exporter
    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// Set the texture converter
    pub fn with_converter(mut self, converter: Arc<dyn TextureConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Set the thumbnailer
    pub fn with_thumbnailer(mut self, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        self.thumbnailer = thumbnailer;
        self
    }

    /// Set the farm client instead of building one from the farm settings
    pub fn with_farm_client(mut self, client: BoxedFarmClient) -> Self {
        self.farm = Some(client);
        self
    }

    /// Set the review client instead of building one from the review settings
    pub fn with_review_client(mut self, client: BoxedReviewClient) -> Self {
        self.review = Some(client);
        self
    }

    /// Set the review context instead of reading it from the environment
    pub fn with_review_context(mut self, context: ReviewContext) -> Self {
        self.review_context = Some(context);
        self
    }

    /// Set the version allocator
    pub fn with_allocator(mut self, allocator: VersionAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Set the retry policy for external tools
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Configuration
    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Graph the next publish would run, without allocating anything
    pub fn preview(&self, request: &PublishRequest) -> Result<(AssetVersion, BuildGraph)> {
        self.config.validate()?;
        let root = publish_root(self.config.task_root()?, &self.config.paths.domain);
        let label = self.allocator.next_label(&root)?;
        let version = AssetVersion::new(&request.top_name, &label, root.join(&label));
        let manifest = self.texture_manifest(&request.scene)?;
        let graph = BuildGraph::plan(
            &version,
            &self.config.options,
            manifest.chunk_count(self.config.farm.chunk_size),
        )?;
        Ok((version, graph))
    }

    /// Publish one scene.
    ///
    /// Local mode runs the graph here, then captures the thumbnail, archives
    /// the scene and files the review record. Distributed mode submits the
    /// graph and returns once the farm has accepted every job; the farm's
    /// `assemble` job runs those last steps.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishOutcome> {
        let id = Uuid::new_v4();
        self.config.validate()?;
        if !request.scene.is_file() {
            return Err(PublishError::config(format!(
                "scene not found: {}",
                request.scene.display()
            )));
        }
        let farm = match self.config.farm.mode {
            ExecutionMode::Distributed => Some(match &self.farm {
                Some(client) => client.clone(),
                None => client_from_settings(&self.config.farm)?,
            }),
            ExecutionMode::Local => None,
        };
        let review = self.review_target()?;

        let task_root = self.config.task_root()?;
        let root = publish_root(task_root, &self.config.paths.domain);
        let version = self.allocator.allocate_version(&root, &request.top_name)?;
        info!(id = %id, version = %version.label, scene = %request.scene.display(), "Publish started");

        let manifest = self.texture_manifest(&request.scene)?;
        manifest.save(version.artifact(artifacts::MANIFEST)?)?;
        let worker_config = WorkerConfig::new(&request.scene, &version, &self.config)
            .with_review_context(review.as_ref().map(|(_, context)| context.clone()));
        let config_path = version.artifact(artifacts::WORKER_CONFIG)?.to_path_buf();
        worker_config.save(&config_path)?;

        let mut graph = BuildGraph::plan(
            &version,
            &self.config.options,
            manifest.chunk_count(self.config.farm.chunk_size),
        )?;

        if let Some(client) = farm {
            let scene_file = request
                .scene
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let batch = format!("{} - {} ({})", scene_file, version.label, id);
            let submission = FarmSubmitter::new(client, self.config.farm.clone())
                .submit_graph(&graph, &request.scene, &config_path, &batch)
                .await?;
            return Ok(PublishOutcome {
                id,
                version,
                run: PublishRun::Farm(submission),
                thumbnail: None,
                archive: None,
                review: None,
            });
        }

        let worker = Arc::new(
            PublishWorker::new(worker_config, self.exporter.clone(), self.converter.clone())
                .with_retry(self.retry.clone()),
        );
        let runner = worker.clone();
        let report = tokio::task::spawn_blocking(move || LocalScheduler::new(runner).run(&mut graph))
            .await
            .map_err(|e| PublishError::external(format!("local run did not finish: {}", e)))??;
        info!(id = %id, "{}", report);

        let mut outcome = PublishOutcome {
            id,
            version,
            run: PublishRun::Local(report),
            thumbnail: None,
            archive: None,
            review: None,
        };
        if !outcome.is_success() {
            return Ok(outcome);
        }

        let finalization = self.finalizer(review).run(worker.config()).await;
        outcome.thumbnail = finalization.thumbnail;
        outcome.archive = finalization.archive;
        outcome.review = finalization.review;

        info!(id = %id, version = %outcome.version.label, "Publish finished");
        Ok(outcome)
    }

    fn finalizer(&self, review: Option<(BoxedReviewClient, ReviewContext)>) -> Finalizer {
        let finalizer = Finalizer::new(self.thumbnailer.clone())
            .with_status(self.config.review.status.clone())
            .with_retry(self.retry.clone());
        match review {
            Some((client, context)) => finalizer.with_review(client, context),
            None => finalizer,
        }
    }

    fn texture_manifest(&self, scene: &Path) -> Result<TextureManifest> {
        if !self.config.options.texture_lod {
            return Ok(TextureManifest::default());
        }
        match self.exporter.textures(scene) {
            Ok(textures) => TextureManifest::plan(&textures, &TEXTURE_TIERS),
            Err(e) if e.is_retryable() || e.is_absorbed() => {
                warn!(scene = %scene.display(), error = %e, "Texture listing failed, no tiers planned");
                Ok(TextureManifest::default())
            }
            Err(e) => Err(e),
        }
    }

    fn review_target(&self) -> Result<Option<(BoxedReviewClient, ReviewContext)>> {
        if !self.config.review.enabled {
            return Ok(None);
        }
        let client = match &self.review {
            Some(client) => client.clone(),
            None => review::client_from_settings(&self.config.review)?,
        };
        let context = match &self.review_context {
            Some(context) => context.clone(),
            None => ReviewContext::from_env(&self.config.identity)?,
        };
        Ok(Some((client, context)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Identity, PublishOptions};
    use crate::external::{ExportProfile, ExportRequest};
    use crate::farm::{FarmJob, MockFarmClient};
    use crate::graph::{TaskKind, TaskStatus, SINK};
    use crate::layer::{Layer, BINDING_REL};
    use crate::lod::TextureJob;
    use crate::review::{EntityLink, ReviewClient, ReviewRecord};
    use crate::stage::Stage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct SceneExporter {
        textures: Vec<String>,
        fail_proxy: bool,
    }

    impl Exporter for SceneExporter {
        fn export(&self, request: &ExportRequest, _profile: &ExportProfile) -> Result<()> {
            if self.fail_proxy && request.purpose.as_deref() == Some("proxy") {
                return Err(PublishError::external("reduce crashed"));
            }
            let top = format!("/{}", request.node);
            let mut layer = Layer::new(&request.output);
            layer.default_prim = Some(request.node.clone());
            layer.define_prim(&top, "Xform");
            let mesh = match request.purpose.as_deref() {
                Some("proxy") => "seat_proxy",
                _ => "seat",
            };
            layer
                .define_prim(&format!("{}/{}", top, mesh), "Mesh")
                .relationships
                .insert(BINDING_REL.into(), vec!["/looks/wood".into()]);
            layer.define_prim("/looks/wood", "Material");
            layer.save()
        }

        fn textures(&self, _scene: &Path) -> Result<Vec<String>> {
            Ok(self.textures.clone())
        }
    }

    struct CopyConverter;

    impl TextureConverter for CopyConverter {
        fn convert(&self, job: &TextureJob) -> Result<()> {
            if let Some(dir) = job.dst.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::copy(&job.src, &job.dst)?;
            Ok(())
        }
    }

    struct FileThumbnailer;

    impl Thumbnailer for FileThumbnailer {
        fn capture(&self, _scene: &Path, output: &Path) -> Result<()> {
            std::fs::write(output, b"png")?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReview {
        created: Mutex<Vec<ReviewRecord>>,
    }

    #[async_trait]
    impl ReviewClient for FakeReview {
        async fn version_codes(&self, _ctx: &ReviewContext) -> Result<Vec<String>> {
            Ok(vec!["chair_model_v004_abc".into()])
        }

        async fn create_version(&self, record: &ReviewRecord) -> Result<u64> {
            self.created.lock().push(record.clone());
            Ok(9)
        }

        async fn upload_thumbnail(&self, _version_id: u64, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn setup(options: PublishOptions) -> (tempfile::TempDir, PublishConfig, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("work").join("chair.ma");
        std::fs::create_dir_all(scene.parent().unwrap()).unwrap();
        std::fs::write(&scene, b"//Maya ASCII").unwrap();
        let config = PublishConfig::new()
            .with_task_root(dir.path())
            .with_options(options)
            .with_identity(Identity {
                asset: Some("chair".into()),
                task: Some("model".into()),
                user: "abc".into(),
                ..Default::default()
            });
        (dir, config, scene)
    }

    fn orchestrator(config: PublishConfig, exporter: SceneExporter) -> PublishOrchestrator {
        PublishOrchestrator::new(config)
            .with_exporter(Arc::new(exporter))
            .with_converter(Arc::new(CopyConverter))
            .with_thumbnailer(Arc::new(FileThumbnailer))
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_local_publish_end_to_end() {
        let options = PublishOptions::default()
            .with_lods(true, 2, 50.0)
            .with_texture_lod(true);
        let (dir, config, scene) = setup(options);
        let tex = dir.path().join("tex");
        std::fs::create_dir_all(&tex).unwrap();
        std::fs::write(tex.join("wood.1001.exr"), b"px").unwrap();
        let exporter = SceneExporter {
            textures: vec![format!("{}/wood.<UDIM>.exr", tex.display())],
            fail_proxy: false,
        };

        let outcome = orchestrator(config, exporter)
            .publish(PublishRequest::new(&scene, "chair"))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.version.label, "v001");
        assert!(outcome.version.dir.ends_with("_publish/maya/v001"));
        assert!(tex.join("LOD10/wood_LOD10.1001.exr").is_file());

        let archive = outcome.archive.unwrap();
        assert_eq!(archive.file_name().unwrap(), "chair_model_v001_abc.ma");
        assert!(outcome.thumbnail.unwrap().ends_with("_publish/_SGthumbnail/chair_temp.1001.png"));

        let top = outcome.version.artifact(artifacts::TOP).unwrap();
        let stage = Stage::open(top).unwrap();
        assert!(stage.prim("/chair/seat_proxy").is_some());
        assert_eq!(
            stage.prim("/chair/seat").unwrap().relationships[BINDING_REL],
            vec!["/chair/mtl/wood".to_string()]
        );
        let variant = Layer::open(outcome.version.artifact(artifacts::VARIANT).unwrap()).unwrap();
        let names: Vec<&str> = variant.prim("/chair").unwrap().variant_sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["mtl", "levels"]);
    }

    #[tokio::test]
    async fn test_failed_proxy_still_publishes() {
        let (_dir, config, scene) = setup(PublishOptions::default());
        let exporter = SceneExporter {
            textures: Vec::new(),
            fail_proxy: true,
        };
        let publisher = orchestrator(config, exporter);

        let first = publisher.publish(PublishRequest::new(&scene, "chair")).await.unwrap();
        let PublishRun::Local(report) = &first.run else {
            panic!("expected a local run");
        };
        assert!(first.is_success());
        assert_eq!(report.outcome("proxy").unwrap().status, TaskStatus::Failed);
        assert_eq!(report.outcome(SINK).unwrap().status, TaskStatus::Succeeded);
        let payload = Layer::open(first.version.artifact(artifacts::PAYLOAD).unwrap()).unwrap();
        assert_eq!(payload.sublayers, vec!["./meta.json", "./geo/chair_render.json"]);

        let second = publisher.publish(PublishRequest::new(&scene, "chair")).await.unwrap();
        assert_eq!(second.version.label, "v002");
    }

    #[tokio::test]
    async fn test_review_record_after_local_publish() {
        let (_dir, mut config, scene) = setup(PublishOptions::default().with_proxy(false, 90.0));
        config.review.enabled = true;
        let review = Arc::new(FakeReview::default());
        let outcome = orchestrator(config, SceneExporter { textures: Vec::new(), fail_proxy: false })
            .with_review_client(review.clone())
            .with_review_context(review_context())
            .publish(PublishRequest::new(&scene, "chair"))
            .await
            .unwrap();
        let record = outcome.review.unwrap();
        assert_eq!(record.code, "chair_model_v005_abc");
        assert!(record.thumbnail);
        assert!(review.created.lock()[0].path.ends_with("v001/chair.json"));
    }

    fn review_context() -> ReviewContext {
        ReviewContext {
            project_id: 1,
            task_id: None,
            entity: EntityLink::Asset(2),
            content: "chair_model".into(),
            user: "abc".into(),
        }
    }

    #[tokio::test]
    async fn test_distributed_publish_submits_chain() {
        let (_dir, mut config, scene) = setup(PublishOptions::default().with_lods(true, 1, 50.0));
        config.farm.mode = ExecutionMode::Distributed;
        config.farm.endpoint = Some("http://farm:8082".into());
        config.review.enabled = true;
        let review = Arc::new(FakeReview::default());

        let mut client = MockFarmClient::new();
        client
            .expect_submit()
            .times(4)
            .returning(|job: &FarmJob| Ok(format!("J-{}", job.task_id)));

        let outcome = orchestrator(config, SceneExporter { textures: Vec::new(), fail_proxy: true })
            .with_farm_client(Arc::new(client))
            .with_review_client(review.clone())
            .with_review_context(review_context())
            .publish(PublishRequest::new(&scene, "chair"))
            .await
            .unwrap();
        let PublishRun::Farm(submission) = &outcome.run else {
            panic!("expected a farm submission");
        };
        assert!(submission.batch_name.starts_with("chair.ma - v001 ("));
        assert_eq!(submission.job_id(SINK), Some("J-assemble"));
        assert!(outcome.thumbnail.is_none() && outcome.review.is_none());
        let top = outcome.version.artifact(artifacts::TOP).unwrap().to_path_buf();
        assert!(!top.exists());

        // What the farm jobs run, in submission order
        let config_path = outcome.version.artifact(artifacts::WORKER_CONFIG).unwrap();
        let worker_config = WorkerConfig::load(config_path).unwrap();
        assert_eq!(worker_config.review_context, Some(review_context()));
        let exporter = SceneExporter {
            textures: Vec::new(),
            fail_proxy: true,
        };
        let worker = Arc::new(
            PublishWorker::new(worker_config, Arc::new(exporter), Arc::new(CopyConverter))
                .with_retry(RetryPolicy::none()),
        );
        let finalizer = Finalizer::new(Arc::new(FileThumbnailer))
            .with_review(review.clone(), review_context())
            .with_retry(RetryPolicy::none());
        for kind in [TaskKind::ExportBase, TaskKind::Proxy, TaskKind::Lod(1)] {
            assert!(worker.clone().run_job(kind, Some(&finalizer)).await.unwrap().is_none());
        }
        let done = worker
            .run_job(TaskKind::Assemble, Some(&finalizer))
            .await
            .unwrap()
            .unwrap();

        assert!(top.is_file());
        assert!(done.thumbnail.unwrap().ends_with("_publish/_SGthumbnail/chair_temp.1001.png"));
        assert_eq!(
            done.archive.unwrap().file_name().unwrap(),
            "chair_model_v001_abc.ma"
        );
        assert_eq!(done.review.unwrap().code, "chair_model_v005_abc");
        assert!(review.created.lock()[0].path.ends_with("v001/chair.json"));
    }

    #[tokio::test]
    async fn test_missing_scene_allocates_nothing() {
        let (dir, config, _scene) = setup(PublishOptions::default());
        let err = orchestrator(config, SceneExporter { textures: Vec::new(), fail_proxy: false })
            .publish(PublishRequest::new(dir.path().join("nope.ma"), "chair"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
        assert!(!dir.path().join("_publish").join("maya").exists());
    }

    #[test]
    fn test_preview_does_not_allocate() {
        let (dir, config, scene) = setup(PublishOptions::default().with_lods(true, 2, 50.0));
        let (version, graph) = orchestrator(config, SceneExporter { textures: Vec::new(), fail_proxy: false })
            .preview(&PublishRequest::new(&scene, "chair"))
            .unwrap();
        assert_eq!(version.label, "v001");
        assert_eq!(graph.len(), 5);
        assert!(!dir.path().join("_publish").exists());
    }
}
