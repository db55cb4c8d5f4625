//! Distributed execution on a render farm
//!
//! ## Table of Contents
//! - **FarmJob**: One farm job per build task
//! - **FarmClient**: Submission backend (HTTP web service or submit command)
//! - **FarmSubmitter**: Submits a whole build graph as a dependency chain
//! - **filtered_environment**: Variables forwarded to farm workers

pub mod command;
pub mod http;

pub use command::CommandFarmClient;
pub use http::HttpFarmClient;

use crate::config::FarmSettings;
use crate::error::{PublishError, Result};
use crate::graph::{BuildGraph, BuildTask, TaskKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

const BLOCKED_VARS: [&str; 5] = ["PYTHONHOME", "TEMP", "TMP", "USER", "USERNAME"];

const FORCED_VARS: [&str; 7] = [
    "PATH",
    "PYTHONPATH",
    "MAYA_PLUG_IN_PATH",
    "MAYA_MODULE_PATH",
    "MTOA_PATH",
    "ARNOLD_PLUGIN_PATH",
    "PXR_PLUGINPATH_NAME",
];

const FORWARDED_PREFIXES: [&str; 6] = ["HAL_", "REZ_", "ARNOLD_", "PEREGRINE_", "YETI_", "USD_"];

const FORWARDED_EXACT: [&str; 5] = ["JOB", "SHOW", "SHOT", "SEQ", "OCIO"];

/// Select the variables a farm worker needs from `vars`.
///
/// Blocked names never pass; non-ASCII names or values are dropped.
pub fn filtered_environment(
    vars: impl IntoIterator<Item = (String, String)>,
    extra: &[String],
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter(|(k, v)| k.is_ascii() && v.is_ascii())
        .filter(|(k, _)| !BLOCKED_VARS.contains(&k.as_str()))
        .filter(|(k, _)| {
            FORCED_VARS.contains(&k.as_str())
                || FORWARDED_EXACT.contains(&k.as_str())
                || FORWARDED_PREFIXES.iter().any(|p| k.starts_with(p))
                || extra.iter().any(|e| e == k)
        })
        .collect()
}

/// One job on the farm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmJob {
    /// `{scene}-{suffix}`
    pub name: String,
    /// Build task the job runs
    pub task_id: String,
    /// Groups the jobs of one publish
    pub batch_name: String,
    /// Program each farm task runs
    pub executable: PathBuf,
    /// Program arguments
    pub args: Vec<String>,
    /// Resource pool
    pub pool: String,
    /// Resource group
    pub group: String,
    /// Priority
    pub priority: u32,
    /// Farm ids this job waits for
    pub dependencies: Vec<String>,
    /// Start even when a dependency failed
    #[serde(default)]
    pub resume_on_failed_dependencies: bool,
    /// Forwarded environment
    pub environment: BTreeMap<String, String>,
    /// Main output, shown by the farm monitor
    pub output: Option<PathBuf>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

impl FarmJob {
    /// Job running `executable` with defaults from `settings`
    pub fn new(name: impl Into<String>, task_id: impl Into<String>, settings: &FarmSettings) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            batch_name: String::new(),
            executable: settings.executable.clone(),
            args: Vec::new(),
            pool: settings.pool.clone(),
            group: settings.group.clone(),
            priority: settings.priority,
            dependencies: Vec::new(),
            resume_on_failed_dependencies: false,
            environment: BTreeMap::new(),
            output: None,
            working_dir: None,
        }
    }

    /// Set the batch name
    pub fn with_batch(mut self, batch: impl Into<String>) -> Self {
        self.batch_name = batch.into();
        self
    }

    /// Set the arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the dependency ids
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Start even when a dependency failed
    pub fn with_resume_on_failed_dependencies(mut self, resume: bool) -> Self {
        self.resume_on_failed_dependencies = resume;
        self
    }

    /// Set the environment
    pub fn with_environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.environment = env;
        self
    }

    /// Set the main output
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Job description in farm key/value form
    pub fn job_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("Name".into(), self.name.clone());
        info.insert("Plugin".into(), "CommandLine".into());
        info.insert("Pool".into(), self.pool.clone());
        info.insert("Group".into(), self.group.clone());
        info.insert("Priority".into(), self.priority.to_string());
        info.insert("BatchName".into(), self.batch_name.clone());
        info.insert("Frames".into(), "1".into());
        info.insert("ConcurrentTasks".into(), "1".into());
        if !self.dependencies.is_empty() {
            info.insert("JobDependencies".into(), self.dependencies.join(","));
        }
        if self.resume_on_failed_dependencies {
            info.insert("ResumeOnFailedDependencies".into(), "true".into());
        }
        if let Some(output) = &self.output {
            info.insert("OutputFilename0".into(), output.display().to_string());
        }
        for (i, (k, v)) in self.environment.iter().enumerate() {
            info.insert(format!("EnvironmentKeyValue{}", i), format!("{}={}", k, v));
        }
        info
    }

    /// Command-line plugin description
    pub fn plugin_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("Executable".into(), self.executable.display().to_string());
        info.insert(
            "Arguments".into(),
            self.args.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" "),
        );
        info.insert("Shell".into(), "default".into());
        if let Some(dir) = &self.working_dir {
            info.insert("StartupDirectory".into(), dir.display().to_string());
        }
        info
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

/// Farm submission backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FarmClient: Send + Sync {
    /// Enqueue a job; returns the farm's job id
    async fn submit(&self, job: &FarmJob) -> Result<String>;
}

/// Shared farm client handle
pub type BoxedFarmClient = Arc<dyn FarmClient>;

/// Farm client for the configured backend
pub fn client_from_settings(settings: &FarmSettings) -> Result<BoxedFarmClient> {
    match (&settings.endpoint, &settings.submit_command) {
        (Some(endpoint), _) => Ok(Arc::new(HttpFarmClient::new(endpoint)?)),
        (None, Some(command)) => Ok(Arc::new(CommandFarmClient::new(command))),
        (None, None) => Err(PublishError::config(
            "farm needs an endpoint or a submit command",
        )),
    }
}

/// Jobs accepted for one publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Submission {
    /// Batch the jobs belong to
    pub batch_name: String,
    /// Farm job id per task id, in submission order
    pub jobs: Vec<(String, String)>,
}

impl Submission {
    /// Farm id of a task
    pub fn job_id(&self, task_id: &str) -> Option<&str> {
        self.jobs
            .iter()
            .find(|(t, _)| t == task_id)
            .map(|(_, j)| j.as_str())
    }
}

/// Submits build graphs as farm job chains
pub struct FarmSubmitter {
    client: BoxedFarmClient,
    settings: FarmSettings,
    environment: BTreeMap<String, String>,
}

impl FarmSubmitter {
    /// Submitter forwarding this process's filtered environment
    pub fn new(client: BoxedFarmClient, settings: FarmSettings) -> Self {
        let environment = filtered_environment(std::env::vars(), &settings.extra_env);
        Self {
            client,
            settings,
            environment,
        }
    }

    /// Replace the forwarded environment
    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Farm job for one task.
    ///
    /// The sink resumes past failed dependencies; it composes whatever
    /// fragments exist and fails on its own when the render is missing.
    pub fn job_for(
        &self,
        task: &BuildTask,
        scene_name: &str,
        batch: &str,
        worker_config: &Path,
        dependencies: Vec<String>,
    ) -> FarmJob {
        let mut args = vec!["worker".to_string(), worker_config.display().to_string()];
        args.extend(task.kind.worker_args());

        let mut job = FarmJob::new(format!("{}-{}", scene_name, task.id), &task.id, &self.settings)
            .with_batch(batch)
            .with_args(args)
            .with_dependencies(dependencies)
            .with_resume_on_failed_dependencies(task.kind == TaskKind::Assemble)
            .with_environment(self.environment.clone());
        if let Some(output) = task.outputs.first() {
            job = job.with_output(output);
        }
        if let Some(dir) = worker_config.parent() {
            job = job.with_working_dir(dir);
        }
        job
    }

    /// Submit every task in dependency order.
    ///
    /// Each job waits on the farm ids of its graph dependencies. The first
    /// refused job stops the chain; the error lists what was already accepted.
    pub async fn submit_graph(
        &self,
        graph: &BuildGraph,
        scene: &Path,
        worker_config: &Path,
        batch: &str,
    ) -> Result<Submission> {
        let order = graph.topological_order()?;
        let scene_name = scene
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scene".into());

        let mut submission = Submission {
            batch_name: batch.to_string(),
            jobs: Vec::with_capacity(order.len()),
        };
        for id in &order {
            let Some(task) = graph.get(id) else { continue };
            let deps: Vec<String> = task
                .deps
                .iter()
                .filter_map(|d| submission.job_id(d).map(str::to_string))
                .collect();
            let job = self.job_for(task, &scene_name, batch, worker_config, deps);

            let accepted = match self.client.submit(&job).await {
                Ok(job_id) if !job_id.trim().is_empty() => job_id,
                Ok(_) => {
                    let cause = PublishError::external("farm returned an empty job id");
                    return Err(self.refused(id, cause, &submission));
                }
                Err(e) => return Err(self.refused(id, e, &submission)),
            };
            info!(task = %id, job_id = %accepted, deps = job.dependencies.len(), "Job submitted");
            submission.jobs.push((id.clone(), accepted));
        }

        info!(batch = %batch, jobs = submission.jobs.len(), "Build graph submitted");
        Ok(submission)
    }

    fn refused(&self, task: &str, cause: PublishError, submission: &Submission) -> PublishError {
        let submitted: Vec<String> = submission.jobs.iter().map(|(_, j)| j.clone()).collect();
        error!(task = %task, error = %cause, submitted = ?submitted, "Submission chain stopped");
        PublishError::submission(format!("{}: {}", task, cause), submitted)
    }
}
