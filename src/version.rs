//! Version slot allocation
//!
//! ## Table of Contents
//! - **VersionAllocator**: Scans a publish root and claims the next `vNNN` directory
//! - **AssetVersion**: One allocated version with its artifact map
//! - **artifacts**: Well-known artifact names

use crate::error::{PublishError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Well-known artifact names
pub mod artifacts {
    /// Full-resolution geometry + shading fragment
    pub const RENDER: &str = "render";
    /// Reduced proxy fragment
    pub const PROXY: &str = "proxy";
    /// Ordered sublayer stack document
    pub const PAYLOAD: &str = "payload";
    /// Material rebinding override document
    pub const META: &str = "meta";
    /// Per-level fragments and wrap documents
    pub const VARIANT_DIR: &str = "variant_dir";
    /// Per-tier shading fragments
    pub const SHADER_DIR: &str = "shader_dir";
    /// Variant selection document
    pub const VARIANT: &str = "variant";
    /// Top interface document
    pub const TOP: &str = "top";
    /// Texture conversion manifest
    pub const MANIFEST: &str = "manifest";
    /// Serialized worker configuration
    pub const WORKER_CONFIG: &str = "worker_config";
}

/// Extension used for every layer document
pub const LAYER_EXT: &str = "json";

/// `{asset_root}/_publish/{domain}`
pub fn publish_root(asset_root: &Path, domain: &str) -> PathBuf {
    asset_root.join("_publish").join(domain)
}

/// One allocated version of an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetVersion {
    /// Top prim name
    pub top_name: String,
    /// Version label, e.g. `v007`
    pub label: String,
    /// Version directory
    pub dir: PathBuf,
    /// Artifact name to path
    pub artifacts: BTreeMap<String, PathBuf>,
}

impl AssetVersion {
    /// Build the artifact map for a version directory
    pub fn new(top_name: impl Into<String>, label: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let top_name = top_name.into();
        let dir = dir.into();
        let doc = |stem: &str| dir.join(format!("{}.{}", stem, LAYER_EXT));

        let mut map = BTreeMap::new();
        map.insert(
            artifacts::RENDER.to_string(),
            dir.join("geo").join(format!("{}_render.{}", top_name, LAYER_EXT)),
        );
        map.insert(
            artifacts::PROXY.to_string(),
            dir.join("geo").join(format!("{}_proxy.{}", top_name, LAYER_EXT)),
        );
        map.insert(artifacts::PAYLOAD.to_string(), doc("payload"));
        map.insert(artifacts::META.to_string(), doc("meta"));
        map.insert(artifacts::VARIANT_DIR.to_string(), dir.join("variant"));
        map.insert(artifacts::SHADER_DIR.to_string(), dir.join("variant").join("shd"));
        map.insert(artifacts::VARIANT.to_string(), doc("variant"));
        map.insert(artifacts::TOP.to_string(), doc(&top_name));
        map.insert(artifacts::MANIFEST.to_string(), doc("texture_manifest"));
        map.insert(artifacts::WORKER_CONFIG.to_string(), doc("publish_config"));

        Self {
            top_name,
            label: label.into(),
            dir,
            artifacts: map,
        }
    }

    /// Path of a named artifact
    pub fn artifact(&self, name: &str) -> Result<&Path> {
        self.artifacts
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| PublishError::config(format!("unknown artifact '{}'", name)))
    }

    /// Fragment produced by LOD level `i`
    pub fn lod_fragment(&self, level: u32) -> PathBuf {
        self.dir
            .join("variant")
            .join(format!("{}_LOD{}.{}", self.top_name, level, LAYER_EXT))
    }

    /// Wrap document for LOD level `i`
    pub fn lod_wrap(&self, level: u32) -> PathBuf {
        self.dir
            .join("variant")
            .join(format!("{}_LOD{}_wrap.{}", self.top_name, level, LAYER_EXT))
    }

    /// Shading fragment for a texture tier (`None` is the full-resolution one)
    pub fn shader_fragment(&self, tier: Option<&str>) -> PathBuf {
        let name = match tier {
            Some(tier) => format!("{}_shd_{}.{}", self.top_name, tier, LAYER_EXT),
            None => format!("{}_shd.{}", self.top_name, LAYER_EXT),
        };
        self.dir.join("variant").join("shd").join(name)
    }
}

/// Allocates monotonically increasing version directories
#[derive(Debug, Clone)]
pub struct VersionAllocator {
    max_attempts: u32,
}

impl Default for VersionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionAllocator {
    /// Create an allocator
    pub fn new() -> Self {
        Self { max_attempts: 16 }
    }

    /// Set how many consecutive slots may be lost to concurrent publishers
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Highest version number present under `parent` (0 if none)
    pub fn scan(&self, parent: &Path) -> Result<u64> {
        let entries = match std::fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut max = 0;
        for entry in entries {
            let name = entry?.file_name();
            if let Some(n) = name.to_str().and_then(parse_label) {
                max = max.max(n);
            }
        }
        Ok(max)
    }

    /// Label that the next allocation would claim
    pub fn next_label(&self, parent: &Path) -> Result<String> {
        Ok(format_label(self.scan(parent)? + 1))
    }

    /// Claim the next free version directory under `parent`.
    ///
    /// The directory is created exclusively; if another publisher claims the
    /// same slot first, the following number is tried.
    pub fn allocate(&self, parent: &Path) -> Result<(String, PathBuf)> {
        std::fs::create_dir_all(parent).map_err(|e| {
            PublishError::config(format!(
                "cannot create publish root {}: {}",
                parent.display(),
                e
            ))
        })?;

        let mut candidate = self.scan(parent)? + 1;
        for _ in 0..self.max_attempts {
            let label = format_label(candidate);
            let dir = parent.join(&label);
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    info!(version = %label, dir = %dir.display(), "Version allocated");
                    return Ok((label, dir));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(version = %label, "Version slot taken, trying next");
                    candidate += 1;
                }
                Err(e) => {
                    return Err(PublishError::config(format!(
                        "cannot create version directory {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
        }

        Err(PublishError::config(format!(
            "no free version slot under {} after {} attempts",
            parent.display(),
            self.max_attempts
        )))
    }

    /// Allocate and build the artifact map in one step
    pub fn allocate_version(&self, parent: &Path, top_name: &str) -> Result<AssetVersion> {
        let (label, dir) = self.allocate(parent)?;
        Ok(AssetVersion::new(top_name, label, dir))
    }
}

/// Number of a `v` + three-or-more-digit label, case-insensitive
pub fn parse_label(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(['v', 'V'])?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Zero-padded label; width grows past three digits when needed
pub fn format_label(n: u64) -> String {
    format!("v{:03}", n)
}
