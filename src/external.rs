//! External collaborators
//!
//! ## Table of Contents
//! - **ExportProfile**: One named set of exporter options in a fallback chain
//! - **Exporter**: Scene to layer export, with `CommandExporter`
//! - **TextureConverter**: Tile downscaling, with `OiioConverter`
//! - **Thumbnailer**: Publish thumbnail capture, with `CommandThumbnailer`
//!
//! Command lines are templates; `{scene}`, `{node}`, `{output}` are filled
//! per request. A non-zero exit is an external tool error.

use crate::error::{PublishError, Result};
use crate::lod::TextureJob;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Named exporter options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportProfile {
    /// Profile name, recorded when it succeeds
    pub name: String,
    /// Option name to value, passed as `--option key=value`
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ExportProfile {
    /// Create a profile with no options
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    /// Add an option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Default chain, most faithful first
    pub fn default_chain() -> Vec<Self> {
        vec![
            Self::new("separate-shapes")
                .with_option("mergeTransformAndShape", "false")
                .with_option("stripNamespaces", "true")
                .with_option("defaultMeshScheme", "none"),
            Self::new("merged-shapes")
                .with_option("mergeTransformAndShape", "true")
                .with_option("stripNamespaces", "true"),
            Self::new("minimal")
                .with_option("mergeTransformAndShape", "true")
                .with_option("exportVisibility", "false")
                .with_option("exportDisplayColor", "false"),
        ]
    }
}

/// One export of a scene node to a layer
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    /// Source scene
    pub scene: PathBuf,
    /// Node to export
    pub node: String,
    /// Output layer
    pub output: PathBuf,
    /// Percent of geometry removed before export
    pub reduction: Option<f64>,
    /// Purpose stamped by the exporter, e.g. `proxy`
    pub purpose: Option<String>,
}

impl ExportRequest {
    /// Full-resolution export
    pub fn new(scene: impl Into<PathBuf>, node: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            scene: scene.into(),
            node: node.into(),
            output: output.into(),
            reduction: None,
            purpose: None,
        }
    }

    /// Reduce by `percent` before exporting
    pub fn with_reduction(mut self, percent: f64) -> Self {
        self.reduction = Some(percent);
        self
    }

    /// Set the purpose
    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }
}

/// Scene exporter
pub trait Exporter: Send + Sync {
    /// Export with one profile
    fn export(&self, request: &ExportRequest, profile: &ExportProfile) -> Result<()>;

    /// Texture file paths referenced by the scene's shading
    fn textures(&self, scene: &Path) -> Result<Vec<String>>;
}

/// Remove a partial output before a retry or the next profile
pub fn cleanup_output(request: &ExportRequest) {
    if request.output.exists() {
        if let Err(e) = std::fs::remove_file(&request.output) {
            warn!(output = %request.output.display(), error = %e, "Failed to remove partial export");
        }
    }
}

/// Try each profile in order; returns the name of the one that succeeded.
///
/// Each profile gets the policy's retries before the next one is tried.
pub fn export_with_fallback(
    exporter: &dyn Exporter,
    request: &ExportRequest,
    profiles: &[ExportProfile],
    retry: &RetryPolicy,
) -> Result<String> {
    let mut last = PublishError::config("no export profiles configured");
    for profile in profiles {
        let attempt = retry.run(
            || {
                exporter.export(request, profile)?;
                if request.output.is_file() {
                    Ok(())
                } else {
                    Err(PublishError::external(format!(
                        "exporter produced no output at {}",
                        request.output.display()
                    )))
                }
            },
            || cleanup_output(request),
        );
        match attempt {
            Ok(()) => {
                info!(
                    node = %request.node,
                    output = %request.output.display(),
                    profile = %profile.name,
                    "Export succeeded"
                );
                return Ok(profile.name.clone());
            }
            Err(e) if e.is_retryable() => {
                warn!(profile = %profile.name, error = %e, "Export profile failed, trying next");
                cleanup_output(request);
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

/// Texture downscaler
pub trait TextureConverter: Send + Sync {
    /// Write `job.dst` from `job.src` at the job's scale
    fn convert(&self, job: &TextureJob) -> Result<()>;
}

/// Publish thumbnail renderer
pub trait Thumbnailer: Send + Sync {
    /// Render a thumbnail of `scene` into `output`
    fn capture(&self, scene: &Path, output: &Path) -> Result<()>;
}

/// `{root}/_publish/_SGthumbnail/{top}_temp.1001.png`
pub fn thumbnail_path(task_root: &Path, top_name: &str) -> PathBuf {
    task_root
        .join("_publish")
        .join("_SGthumbnail")
        .join(format!("{}_temp.1001.png", top_name))
}

/// Existing thumbnail for the asset, or a freshly captured one
pub fn ensure_thumbnail(
    thumbnailer: &dyn Thumbnailer,
    scene: &Path,
    task_root: &Path,
    top_name: &str,
) -> Result<PathBuf> {
    let path = thumbnail_path(task_root, top_name);
    if path.is_file() {
        debug!(thumbnail = %path.display(), "Reusing thumbnail");
        return Ok(path);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    thumbnailer.capture(scene, &path)?;
    if !path.is_file() {
        return Err(PublishError::external(format!(
            "thumbnailer produced no image at {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Fill `{key}` placeholders in every argument
pub fn fill_template(template: &[String], values: &[(&str, String)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            values.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .collect()
}

fn run(argv: &[String]) -> Result<std::process::Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PublishError::config("empty command line"))?;
    debug!(program = %program, args = ?args, "Running external tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| PublishError::external(format!("{}: {}", program, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PublishError::external(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output)
}

/// Exporter driven by an external command line
#[derive(Debug, Clone)]
pub struct CommandExporter {
    command: Vec<String>,
}

impl CommandExporter {
    /// Exporter running `command`
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn argv(&self, request: &ExportRequest, profile: &ExportProfile) -> Vec<String> {
        let mut argv = fill_template(
            &self.command,
            &[
                ("scene", request.scene.display().to_string()),
                ("node", request.node.clone()),
                ("output", request.output.display().to_string()),
            ],
        );
        for (key, value) in &profile.options {
            argv.push("--option".into());
            argv.push(format!("{}={}", key, value));
        }
        if let Some(percent) = request.reduction {
            argv.push("--reduce".into());
            argv.push(format!("{}", percent));
        }
        if let Some(purpose) = &request.purpose {
            argv.push("--purpose".into());
            argv.push(purpose.clone());
        }
        argv
    }
}

impl Exporter for CommandExporter {
    fn export(&self, request: &ExportRequest, profile: &ExportProfile) -> Result<()> {
        if let Some(dir) = request.output.parent() {
            std::fs::create_dir_all(dir)?;
        }
        run(&self.argv(request, profile))?;
        Ok(())
    }

    fn textures(&self, scene: &Path) -> Result<Vec<String>> {
        let mut argv = fill_template(
            &self.command,
            &[
                ("scene", scene.display().to_string()),
                ("node", String::new()),
                ("output", "-".into()),
            ],
        );
        argv.push("--list-textures".into());
        let output = run(&argv)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Converter running an image tool as `tool src --resize N% -o dst`
#[derive(Debug, Clone)]
pub struct OiioConverter {
    tool: String,
}

impl OiioConverter {
    /// Converter using `tool`
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

impl TextureConverter for OiioConverter {
    fn convert(&self, job: &TextureJob) -> Result<()> {
        if let Some(dir) = job.dst.parent() {
            std::fs::create_dir_all(dir)?;
        }
        run(&[
            self.tool.clone(),
            job.src.display().to_string(),
            "--resize".into(),
            job.resize_arg(),
            "-o".into(),
            job.dst.display().to_string(),
        ])?;
        Ok(())
    }
}

/// Thumbnailer driven by an external command line
#[derive(Debug, Clone)]
pub struct CommandThumbnailer {
    command: Vec<String>,
}

impl CommandThumbnailer {
    /// Thumbnailer running `command`
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Thumbnailer for CommandThumbnailer {
    fn capture(&self, scene: &Path, output: &Path) -> Result<()> {
        run(&fill_template(
            &self.command,
            &[
                ("scene", scene.display().to_string()),
                ("output", output.display().to_string()),
            ],
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct FlakyExporter {
        fail_profiles: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl Exporter for FlakyExporter {
        fn export(&self, request: &ExportRequest, profile: &ExportProfile) -> Result<()> {
            self.calls.lock().push(profile.name.clone());
            std::fs::write(&request.output, b"{}")?;
            if self.fail_profiles.contains(&profile.name.as_str()) {
                return Err(PublishError::external("unsupported flag"));
            }
            Ok(())
        }

        fn textures(&self, _scene: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::new().initial_delay(Duration::from_millis(1)))
    }

    #[test]
    fn test_fallback_records_successful_profile() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FlakyExporter {
            fail_profiles: vec!["separate-shapes"],
            calls: Mutex::new(Vec::new()),
        };
        let request = ExportRequest::new("scene.ma", "chair", dir.path().join("render.json"));

        let used = export_with_fallback(&exporter, &request, &ExportProfile::default_chain(), &quick())
            .unwrap();
        assert_eq!(used, "merged-shapes");
        assert_eq!(
            *exporter.calls.lock(),
            vec!["separate-shapes", "separate-shapes", "merged-shapes"]
        );
    }

    #[test]
    fn test_fallback_exhausted_cleans_output() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FlakyExporter {
            fail_profiles: vec!["separate-shapes", "merged-shapes", "minimal"],
            calls: Mutex::new(Vec::new()),
        };
        let request = ExportRequest::new("scene.ma", "chair", dir.path().join("render.json"));

        let err = export_with_fallback(&exporter, &request, &ExportProfile::default_chain(), &quick())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!request.output.exists());
        assert_eq!(exporter.calls.lock().len(), 6);
    }

    #[test]
    fn test_command_exporter_arguments() {
        let exporter = CommandExporter::new(vec![
            "export".into(),
            "{scene}".into(),
            "--node={node}".into(),
            "{output}".into(),
        ]);
        let request = ExportRequest::new("/s/chair.ma", "chair", "/v/geo/chair_proxy.json")
            .with_reduction(90.0)
            .with_purpose("proxy");
        let argv = exporter.argv(&request, &ExportProfile::new("p").with_option("a", "1"));
        assert_eq!(
            argv,
            vec![
                "export",
                "/s/chair.ma",
                "--node=chair",
                "/v/geo/chair_proxy.json",
                "--option",
                "a=1",
                "--reduce",
                "90",
                "--purpose",
                "proxy"
            ]
        );
    }

    #[test]
    fn test_missing_tool_is_external_error() {
        let err = run(&["definitely-not-an-installed-tool-xyz".into()]).unwrap_err();
        assert!(matches!(err, PublishError::ExternalTool(_)));
    }

    struct CountingThumbnailer(Mutex<usize>);

    impl Thumbnailer for CountingThumbnailer {
        fn capture(&self, _scene: &Path, output: &Path) -> Result<()> {
            *self.0.lock() += 1;
            std::fs::write(output, b"png")?;
            Ok(())
        }
    }

    #[test]
    fn test_thumbnail_reused_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let thumbnailer = CountingThumbnailer(Mutex::new(0));
        let first = ensure_thumbnail(&thumbnailer, Path::new("s.ma"), dir.path(), "chair").unwrap();
        let second = ensure_thumbnail(&thumbnailer, Path::new("s.ma"), dir.path(), "chair").unwrap();

        assert_eq!(first, second);
        assert!(first.ends_with("_publish/_SGthumbnail/chair_temp.1001.png"));
        assert_eq!(*thumbnailer.0.lock(), 1);
    }
}
