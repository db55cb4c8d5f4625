//! # asset-publish
//!
//! Command-line entry point for publishing and for farm workers.
//!
//! ## Usage
//!
//! ```bash
//! # Publish a scene locally with two LODs and texture tiers
//! asset-publish publish /work/chair.ma --top chair --lods 2 --texture-lod
//!
//! # Submit the same publish to the farm
//! asset-publish publish /work/chair.ma --top chair --distributed
//!
//! # Show the build graph without allocating a version
//! asset-publish plan /work/chair.ma --top chair
//!
//! # Run one task (what every farm job executes)
//! asset-publish worker /show/chair/_publish/maya/v003/publish_config.json lod 1
//! ```

use anyhow::{bail, Context};
use asset_publish::graph::TaskKind;
use asset_publish::{
    ExecutionMode, Finalizer, PublishConfig, PublishOrchestrator, PublishRequest, PublishRun,
    PublishWorker, WorkerConfig,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "asset-publish")]
#[command(about = "Versioned, multi-resolution asset publishing")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "ASSET_PUBLISH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a scene
    Publish(PublishArgs),
    /// Print the build graph of the next publish
    Plan(PublishArgs),
    /// Run one build task from a worker config
    Worker {
        /// Worker config written by the publish
        config: PathBuf,
        /// Task kind: export_base, proxy, lod, texture_convert, assemble
        kind: String,
        /// Level or chunk index
        index: Option<String>,
    },
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// Source scene
    scene: PathBuf,

    /// Top prim name (defaults to the scene file name)
    #[arg(long, env = "HAL_ASSET")]
    top: Option<String>,

    /// Submit to the farm instead of running locally
    #[arg(long)]
    distributed: bool,

    /// Skip the proxy
    #[arg(long)]
    no_proxy: bool,

    /// Number of LOD levels
    #[arg(long)]
    lods: Option<u32>,

    /// Percent of geometry kept per LOD level
    #[arg(long)]
    lod_percent: Option<f64>,

    /// Build texture tiers and the mtl variant set
    #[arg(long)]
    texture_lod: bool,

    /// File a review record once the publish is assembled
    #[arg(long)]
    review: bool,
}

impl PublishArgs {
    fn request(&self) -> PublishRequest {
        let top = self.top.clone().unwrap_or_else(|| {
            self.scene
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "asset".into())
        });
        PublishRequest::new(&self.scene, top)
    }

    fn apply(&self, mut config: PublishConfig) -> PublishConfig {
        let options = &mut config.options;
        if self.no_proxy {
            options.proxy.enabled = false;
        }
        if let Some(count) = self.lods {
            options.lods.enabled = count > 0;
            options.lods.count = count;
        }
        if let Some(percent) = self.lod_percent {
            options.lods.percent = percent;
        }
        if self.texture_lod {
            options.texture_lod = true;
        }
        if self.review {
            config.review.enabled = true;
        }
        if self.distributed {
            config = config.with_mode(ExecutionMode::Distributed);
        }
        config
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PublishConfig> {
    let Some(path) = path else {
        return PublishConfig::from_env().context("Failed to read publish environment");
    };
    let mut config = PublishConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    if let Ok(env) = PublishConfig::from_env() {
        if config.paths.task_root.is_none() {
            config.paths.task_root = env.paths.task_root;
        }
        if config.identity.user.is_empty() {
            config.identity = env.identity;
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Publish(args) => {
            let config = args.apply(load_config(cli.config.as_deref())?);
            let outcome = PublishOrchestrator::new(config)
                .publish(args.request())
                .await
                .context("Publish failed")?;

            match &outcome.run {
                PublishRun::Local(report) => {
                    println!("{}", report);
                    if !report.is_success() {
                        bail!("publish {} failed", outcome.version.label);
                    }
                }
                PublishRun::Farm(submission) => {
                    println!("submitted batch '{}'", submission.batch_name);
                    for (task, job) in &submission.jobs {
                        println!("  {:<20} {}", task, job);
                    }
                }
            }
            if let Some(record) = &outcome.review {
                println!("review record {} ({})", record.code, record.id);
            }
            info!(version = %outcome.version.label, dir = %outcome.version.dir.display(), "Done");
        }
        Command::Plan(args) => {
            let config = args.apply(load_config(cli.config.as_deref())?);
            let (version, graph) = PublishOrchestrator::new(config)
                .preview(&args.request())
                .context("Planning failed")?;

            println!("{} -> {}", version.label, version.dir.display());
            for id in graph.topological_order()? {
                if let Some(task) = graph.get(&id) {
                    let deps: Vec<&str> = task.deps.iter().map(String::as_str).collect();
                    println!("  {:<20} after [{}]", id, deps.join(", "));
                }
            }
        }
        Command::Worker {
            config,
            kind,
            index,
        } => {
            let worker_config = WorkerConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            let kind = TaskKind::parse(&kind, index.as_deref())?;
            let finalizer = match kind {
                TaskKind::Assemble => Some(Finalizer::for_worker(&worker_config)),
                _ => None,
            };
            let worker = Arc::new(PublishWorker::with_commands(worker_config));
            let finalized = worker
                .run_job(kind, finalizer.as_ref())
                .await
                .with_context(|| format!("Task {} failed", kind))?;
            if let Some(record) = finalized.and_then(|f| f.review) {
                println!("review record {} ({})", record.code, record.id);
            }
        }
    }

    Ok(())
}
