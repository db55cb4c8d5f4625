//! Configuration for asset publishing
//!
//! ## Table of Contents
//! - **PublishConfig**: Complete configuration (env, TOML, builder)
//! - **PublishOptions**: Per-publish feature switches handed to every worker
//! - **FarmSettings**: Distributed execution settings
//! - **TextureSettings**: Texture conversion tool and pool size
//! - **ReviewSettings**: Review service endpoint

use crate::error::{PublishError, Result};
use crate::external::ExportProfile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete publish configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Filesystem roots
    pub paths: PathSettings,
    /// Who and what is being published
    pub identity: Identity,
    /// Feature switches
    pub options: PublishOptions,
    /// Exporter command and fallback profiles
    pub export: ExportSettings,
    /// Texture conversion
    pub texture: TextureSettings,
    /// Local or farm execution
    pub farm: FarmSettings,
    /// Review submission
    pub review: ReviewSettings,
}

impl PublishConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let task_root = lookup("HAL_TASK_ROOT")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PublishError::config("HAL_TASK_ROOT is not set"))?;

        let mut config = Self::default();
        config.paths.task_root = Some(PathBuf::from(task_root));
        config.identity = Identity {
            asset: lookup("HAL_ASSET"),
            task: lookup("HAL_TASK"),
            sequence: lookup("HAL_SEQUENCE"),
            shot: lookup("HAL_SHOT"),
            user: lookup("HAL_USER")
                .or_else(|| lookup("USER"))
                .or_else(|| lookup("USERNAME"))
                .unwrap_or_else(|| "unknown".into()),
        };
        if let Some(endpoint) = lookup("ASSET_PUBLISH_FARM_URL") {
            config.farm.endpoint = Some(endpoint);
        }
        if let Some(endpoint) = lookup("ASSET_PUBLISH_REVIEW_URL") {
            config.review.endpoint = Some(endpoint);
        }
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PublishError::config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| PublishError::config(format!("Failed to parse config: {}", e)))
    }

    /// Set the task root
    pub fn with_task_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths.task_root = Some(root.into());
        self
    }

    /// Set the publish options
    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the execution mode
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.farm.mode = mode;
        self
    }

    /// Set the identity
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Required task root, or a configuration error
    pub fn task_root(&self) -> Result<&Path> {
        self.paths
            .task_root
            .as_deref()
            .ok_or_else(|| PublishError::config("task root is not configured"))
    }

    /// Validate everything that must hold before work starts
    pub fn validate(&self) -> Result<()> {
        self.task_root()?;
        self.options.validate()?;
        if self.texture.workers == 0 {
            return Err(PublishError::config("texture.workers must be at least 1"));
        }
        if self.farm.chunk_size == 0 {
            return Err(PublishError::config("farm.chunk_size must be at least 1"));
        }
        if self.farm.mode == ExecutionMode::Distributed
            && self.farm.endpoint.is_none()
            && self.farm.submit_command.is_none()
        {
            return Err(PublishError::config(
                "distributed mode needs farm.endpoint or farm.submit_command",
            ));
        }
        Ok(())
    }
}

/// Filesystem roots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Asset task root; versions land in `{root}/_publish/{domain}`
    pub task_root: Option<PathBuf>,
    /// Publish domain directory name
    pub domain: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            task_root: None,
            domain: "maya".into(),
        }
    }
}

/// Pipeline identity of the publish
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    /// Asset name
    pub asset: Option<String>,
    /// Task name
    pub task: Option<String>,
    /// Sequence (shots only)
    pub sequence: Option<String>,
    /// Shot (shots only)
    pub shot: Option<String>,
    /// Publishing user
    pub user: String,
}

impl Identity {
    /// Review content name: `{seq}_{shot}_{task}` for shots, `{asset}_{task}` otherwise
    pub fn content(&self) -> String {
        let task = self.task.as_deref().unwrap_or("task");
        match (&self.sequence, &self.shot) {
            (Some(seq), Some(shot)) => format!("{}_{}_{}", seq, shot, task),
            _ => format!("{}_{}", self.asset.as_deref().unwrap_or("asset"), task),
        }
    }
}

/// Feature switches shared by the orchestrator and every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Reduced proxy fragment
    pub proxy: ProxyOptions,
    /// Geometric levels of detail
    pub lods: LodOptions,
    /// Texture tiers and the "mtl" variant set
    pub texture_lod: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            proxy: ProxyOptions::default(),
            lods: LodOptions::default(),
            texture_lod: false,
        }
    }
}

impl PublishOptions {
    /// Enable or disable the proxy
    pub fn with_proxy(mut self, enabled: bool, percent: f64) -> Self {
        self.proxy = ProxyOptions { enabled, percent };
        self
    }

    /// Enable or disable LODs
    pub fn with_lods(mut self, enabled: bool, count: u32, percent: f64) -> Self {
        self.lods = LodOptions {
            enabled,
            count,
            percent,
        };
        self
    }

    /// Enable or disable texture tiers
    pub fn with_texture_lod(mut self, enabled: bool) -> Self {
        self.texture_lod = enabled;
        self
    }

    /// Number of LOD levels actually requested
    pub fn lod_levels(&self) -> u32 {
        if self.lods.enabled {
            self.lods.count
        } else {
            0
        }
    }

    fn validate(&self) -> Result<()> {
        if self.proxy.enabled && !(0.0..100.0).contains(&self.proxy.percent) {
            return Err(PublishError::config(format!(
                "proxy percent {} outside [0, 100)",
                self.proxy.percent
            )));
        }
        if self.lods.enabled && !(self.lods.percent > 0.0 && self.lods.percent < 100.0) {
            return Err(PublishError::config(format!(
                "lod percent {} outside (0, 100)",
                self.lods.percent
            )));
        }
        Ok(())
    }
}

/// Proxy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Whether a proxy is produced
    pub enabled: bool,
    /// Percent of geometry removed for the proxy
    pub percent: f64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            percent: 90.0,
        }
    }
}

/// LOD settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodOptions {
    /// Whether LODs are produced
    pub enabled: bool,
    /// Number of levels after LOD0
    pub count: u32,
    /// Percent of geometry kept per level
    pub percent: f64,
}

impl Default for LodOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 2,
            percent: 50.0,
        }
    }
}

/// Exporter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Command line of the external exporter; placeholders are filled per request
    pub command: Vec<String>,
    /// Ordered fallback profiles
    pub profiles: Vec<ExportProfile>,
    /// Command line that renders a thumbnail; `{scene}` and `{output}` are filled
    pub thumbnail: Vec<String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "mayapy".into(),
                "-m".into(),
                "scene_export".into(),
                "{scene}".into(),
                "{node}".into(),
                "{output}".into(),
            ],
            profiles: ExportProfile::default_chain(),
            thumbnail: vec![
                "mayapy".into(),
                "-m".into(),
                "scene_thumbnail".into(),
                "{scene}".into(),
                "{output}".into(),
            ],
        }
    }
}

/// Texture conversion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureSettings {
    /// Image tool executable
    pub tool: String,
    /// Bounded pool size for local conversion
    pub workers: usize,
}

impl Default for TextureSettings {
    fn default() -> Self {
        Self {
            tool: "oiiotool".into(),
            workers: 16,
        }
    }
}

/// Where the build graph runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Single process on this machine
    #[default]
    Local,
    /// One farm job per task
    Distributed,
}

/// Farm settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmSettings {
    /// Execution mode
    pub mode: ExecutionMode,
    /// Web service endpoint for HTTP submission
    pub endpoint: Option<String>,
    /// Submission command for command-line submission
    pub submit_command: Option<String>,
    /// Resource pool hint
    pub pool: String,
    /// Resource group hint
    pub group: String,
    /// Job priority
    pub priority: u32,
    /// Executable each farm task runs
    pub executable: PathBuf,
    /// Texture manifest entries per conversion task
    pub chunk_size: usize,
    /// Extra variable names always forwarded to workers
    pub extra_env: Vec<String>,
}

impl Default for FarmSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Local,
            endpoint: None,
            submit_command: None,
            pool: "3d".into(),
            group: "3d".into(),
            priority: 50,
            executable: PathBuf::from("asset-publish"),
            chunk_size: 50,
            extra_env: Vec::new(),
        }
    }
}

/// Review service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    /// Submit a review record once the publish is assembled
    pub enabled: bool,
    /// Service base URL
    pub endpoint: Option<String>,
    /// Environment variable holding the API token
    pub token_env: String,
    /// Status given to new records
    pub status: String,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            token_env: "REVIEW_API_TOKEN".into(),
            status: "rev".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_requires_task_root() {
        let err = PublishConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
    }

    #[test]
    fn test_from_lookup_reads_identity() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HAL_TASK_ROOT", "/show/assets/chair/mdl"),
            ("HAL_ASSET", "chair"),
            ("HAL_TASK", "mdl"),
            ("USER", "jdoe"),
        ]);
        let config = PublishConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(
            config.task_root().unwrap(),
            Path::new("/show/assets/chair/mdl")
        );
        assert_eq!(config.identity.user, "jdoe");
        assert_eq!(config.identity.content(), "chair_mdl");
    }

    #[test]
    fn test_shot_content_name() {
        let identity = Identity {
            sequence: Some("sq010".into()),
            shot: Some("sh0040".into()),
            task: Some("lgt".into()),
            ..Default::default()
        };
        assert_eq!(identity.content(), "sq010_sh0040_lgt");
    }

    #[test]
    fn test_from_file_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publish.toml");
        std::fs::write(
            &path,
            r#"
[paths]
task_root = "/tmp/chair"

[options]
texture_lod = true

[options.lods]
enabled = true
count = 3
percent = 50.0

[farm]
mode = "distributed"
endpoint = "http://farm:8081"
"#,
        )
        .unwrap();

        let config = PublishConfig::from_file(&path).unwrap();
        assert_eq!(config.options.lod_levels(), 3);
        assert!(config.options.texture_lod);
        assert!(config.options.proxy.enabled);
        assert_eq!(config.farm.mode, ExecutionMode::Distributed);
        assert_eq!(config.farm.pool, "3d");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_percent() {
        let config = PublishConfig::new()
            .with_task_root("/tmp/x")
            .with_options(PublishOptions::default().with_lods(true, 2, 100.0));
        assert!(matches!(
            config.validate(),
            Err(PublishError::Configuration(_))
        ));
    }

    #[test]
    fn test_distributed_needs_endpoint() {
        let config = PublishConfig::new()
            .with_task_root("/tmp/x")
            .with_mode(ExecutionMode::Distributed);
        assert!(config.validate().is_err());
    }
}
