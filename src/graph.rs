//! Build graph for one publish
//!
//! ## Table of Contents
//! - **TaskKind**: export_base, proxy, lod[i], texture_convert[chunk], assemble
//! - **TaskStatus**: Lifecycle of a task within one run
//! - **BuildTask**: Node with dependencies and declared outputs
//! - **BuildGraph**: DAG with the single sink `assemble`

use crate::config::PublishOptions;
use crate::error::{PublishError, Result};
use crate::version::{artifacts, AssetVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

/// Id of the graph's sink
pub const SINK: &str = "assemble";

/// What a task produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Full-resolution render fragment
    ExportBase,
    /// Reduced proxy fragment
    Proxy,
    /// Level-of-detail fragment `i`
    Lod(u32),
    /// One chunk of the texture manifest
    TextureConvert(usize),
    /// Composition of every produced fragment
    Assemble,
}

impl TaskKind {
    /// Stable task id, also the farm job suffix
    pub fn id(&self) -> String {
        match self {
            Self::ExportBase => "export_base".into(),
            Self::Proxy => "proxy".into(),
            Self::Lod(i) => format!("lod{}", i),
            Self::TextureConvert(chunk) => format!("texture_convert{}", chunk),
            Self::Assemble => SINK.into(),
        }
    }

    /// Whether a failure ends the publish
    pub fn is_required(&self) -> bool {
        matches!(self, Self::ExportBase | Self::Assemble)
    }

    /// Worker arguments: `<kind> [<n>]`
    pub fn worker_args(&self) -> Vec<String> {
        match self {
            Self::ExportBase => vec!["export_base".into()],
            Self::Proxy => vec!["proxy".into()],
            Self::Lod(i) => vec!["lod".into(), i.to_string()],
            Self::TextureConvert(chunk) => vec!["texture_convert".into(), chunk.to_string()],
            Self::Assemble => vec![SINK.into()],
        }
    }

    /// Inverse of [`TaskKind::worker_args`]
    pub fn parse(kind: &str, index: Option<&str>) -> Result<Self> {
        let number = |what: &str| -> Result<u64> {
            index
                .ok_or_else(|| PublishError::config(format!("{} needs an index", what)))?
                .parse()
                .map_err(|_| PublishError::config(format!("{} index must be a number", what)))
        };
        match kind {
            "export_base" => Ok(Self::ExportBase),
            "proxy" => Ok(Self::Proxy),
            "lod" => u32::try_from(number("lod")?)
                .map(Self::Lod)
                .map_err(|_| PublishError::config("lod index out of range")),
            "texture_convert" => usize::try_from(number("texture_convert")?)
                .map(Self::TextureConvert)
                .map_err(|_| PublishError::config("texture_convert index out of range")),
            "assemble" => Ok(Self::Assemble),
            other => Err(PublishError::config(format!("unknown task kind '{}'", other))),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Not started
    #[default]
    Pending,
    /// In progress
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Not run because an upstream task failed
    Skipped,
}

impl TaskStatus {
    /// Whether the task has finished, one way or another
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// One node of the build graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    /// Unique id
    pub id: String,
    /// What the task does
    pub kind: TaskKind,
    /// Ids this task waits for
    pub deps: BTreeSet<String>,
    /// Current status
    pub status: TaskStatus,
    /// Paths the task writes
    pub outputs: Vec<PathBuf>,
}

impl BuildTask {
    /// Task with no dependencies
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: kind.id(),
            kind,
            deps: BTreeSet::new(),
            status: TaskStatus::Pending,
            outputs: Vec::new(),
        }
    }

    /// Add a dependency
    pub fn with_dep(mut self, id: impl Into<String>) -> Self {
        self.deps.insert(id.into());
        self
    }

    /// Declare an output
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }
}

/// DAG of build tasks in insertion order
#[derive(Debug, Clone, Default)]
pub struct BuildGraph {
    tasks: Vec<BuildTask>,
    index: HashMap<String, usize>,
}

impl BuildGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph for one publish.
    ///
    /// `assemble` depends on `export_base` plus every other scheduled task.
    pub fn plan(version: &AssetVersion, options: &PublishOptions, texture_chunks: usize) -> Result<Self> {
        let mut graph = Self::new();
        let base = TaskKind::ExportBase.id();
        graph.add(BuildTask::new(TaskKind::ExportBase).with_output(version.artifact(artifacts::RENDER)?))?;

        if options.proxy.enabled {
            graph.add(
                BuildTask::new(TaskKind::Proxy)
                    .with_dep(&base)
                    .with_output(version.artifact(artifacts::PROXY)?),
            )?;
        }
        for level in 1..=options.lod_levels() {
            graph.add(
                BuildTask::new(TaskKind::Lod(level))
                    .with_dep(&base)
                    .with_output(version.lod_fragment(level)),
            )?;
        }
        if options.texture_lod {
            for chunk in 0..texture_chunks {
                graph.add(BuildTask::new(TaskKind::TextureConvert(chunk)))?;
            }
        }

        let mut sink = BuildTask::new(TaskKind::Assemble)
            .with_output(version.artifact(artifacts::PAYLOAD)?)
            .with_output(version.artifact(artifacts::META)?)
            .with_output(version.artifact(artifacts::TOP)?);
        for task in &graph.tasks {
            sink.deps.insert(task.id.clone());
        }
        graph.add(sink)?;
        graph.topological_order()?;
        Ok(graph)
    }

    /// Add a task; ids must be unique
    pub fn add(&mut self, task: BuildTask) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(PublishError::config(format!("duplicate task '{}'", task.id)));
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Task by id
    pub fn get(&self, id: &str) -> Option<&BuildTask> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Mutable task by id
    pub fn get_mut(&mut self, id: &str) -> Option<&mut BuildTask> {
        match self.index.get(id) {
            Some(&i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    /// All tasks in insertion order
    pub fn tasks(&self) -> &[BuildTask] {
        &self.tasks
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Update a task's status
    pub fn set_status(&mut self, id: &str, status: TaskStatus) {
        if let Some(task) = self.get_mut(id) {
            task.status = status;
        }
    }

    /// Task ids in dependency order (Kahn); ties keep insertion order
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut indegree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.deps {
                let &d = self.index.get(dep).ok_or_else(|| {
                    PublishError::config(format!("task '{}' depends on unknown '{}'", task.id, dep))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.tasks.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = ready.pop_front() {
            order.push(self.tasks[i].id.clone());
            for &n in &dependents[i] {
                indegree[n] -= 1;
                if indegree[n] == 0 {
                    ready.push_back(n);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, t)| t.id.as_str())
                .collect();
            return Err(PublishError::config(format!(
                "build graph has a cycle through [{}]",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Ids that transitively depend on `id`
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for task in &self.tasks {
                if task.deps.contains(&current) && out.insert(task.id.clone()) {
                    queue.push_back(task.id.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> AssetVersion {
        AssetVersion::new("chair", "v001", "/assets/chair/_publish/maya/v001")
    }

    #[test]
    fn test_plan_shape() {
        let options = PublishOptions::default()
            .with_proxy(true, 90.0)
            .with_lods(true, 2, 50.0)
            .with_texture_lod(true);
        let graph = BuildGraph::plan(&version(), &options, 3).unwrap();

        let ids: Vec<&str> = graph.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "export_base",
                "proxy",
                "lod1",
                "lod2",
                "texture_convert0",
                "texture_convert1",
                "texture_convert2",
                "assemble"
            ]
        );
        assert!(graph.get("texture_convert1").unwrap().deps.is_empty());
        assert_eq!(
            graph.get("lod2").unwrap().deps,
            BTreeSet::from(["export_base".to_string()])
        );
        assert_eq!(graph.get(SINK).unwrap().deps.len(), 7);

        let multi: Vec<&str> = graph
            .tasks()
            .iter()
            .filter(|t| t.deps.len() > 1)
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(multi, vec![SINK]);
    }

    #[test]
    fn test_minimal_plan() {
        let options = PublishOptions::default().with_proxy(false, 90.0);
        let graph = BuildGraph::plan(&version(), &options, 4).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["export_base", "assemble"]);
    }

    #[test]
    fn test_sink_is_last() {
        let options = PublishOptions::default().with_lods(true, 3, 50.0).with_texture_lod(true);
        let graph = BuildGraph::plan(&version(), &options, 2).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(order.last().map(String::as_str), Some(SINK));
        assert_eq!(order.first().map(String::as_str), Some("export_base"));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = BuildGraph::new();
        graph.add(BuildTask::new(TaskKind::Proxy).with_dep("lod1")).unwrap();
        graph.add(BuildTask::new(TaskKind::Lod(1)).with_dep("proxy")).unwrap();
        let err = graph.topological_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let mut graph = BuildGraph::new();
        graph.add(BuildTask::new(TaskKind::ExportBase)).unwrap();
        assert!(graph.add(BuildTask::new(TaskKind::ExportBase)).is_err());

        graph.add(BuildTask::new(TaskKind::Proxy).with_dep("nope")).unwrap();
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_dependents() {
        let options = PublishOptions::default().with_proxy(true, 90.0);
        let graph = BuildGraph::plan(&version(), &options, 0).unwrap();
        assert_eq!(
            graph.dependents_of("export_base"),
            BTreeSet::from(["proxy".to_string(), SINK.to_string()])
        );
        assert!(graph.dependents_of(SINK).is_empty());
    }

    #[test]
    fn test_worker_args_round_trip() {
        for kind in [
            TaskKind::ExportBase,
            TaskKind::Proxy,
            TaskKind::Lod(3),
            TaskKind::TextureConvert(12),
            TaskKind::Assemble,
        ] {
            let args = kind.worker_args();
            let parsed = TaskKind::parse(&args[0], args.get(1).map(String::as_str)).unwrap();
            assert_eq!(parsed, kind);
        }
        assert!(TaskKind::parse("lod", None).is_err());
        assert!(TaskKind::parse("bake", None).is_err());
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let err = TaskKind::parse("lod", Some("4294967297")).unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
        assert_eq!(
            TaskKind::parse("lod", Some("4294967295")).unwrap(),
            TaskKind::Lod(u32::MAX)
        );
    }
}
