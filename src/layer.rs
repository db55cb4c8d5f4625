//! Scene-description layers
//!
//! ## Table of Contents
//! - **Layer**: One document: sublayer stack, default prim and prim specs
//! - **PrimSpec**: Opinions a layer holds about one prim
//! - **AssetRef**: Reference or payload target
//! - **VariantSetSpec / VariantSpec**: Authored variant alternatives
//! - **path**: Prim path helpers
//! - **write_atomic**: Temp-file-then-rename writes
//!
//! Layers are stored as pretty-printed JSON. Asset paths inside a layer are
//! resolved against the directory of the layer that authored them.

use crate::error::{PublishError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Direct binding relationship name
pub const BINDING_REL: &str = "material:binding";
/// Prefix of collection binding relationships
pub const COLLECTION_BINDING_PREFIX: &str = "material:binding:collection";

/// Prim path helpers
pub mod path {
    /// Pseudo-root path
    pub const ROOT: &str = "/";

    /// Parent of an absolute prim path (`/` for root prims)
    pub fn parent(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => ROOT,
            Some(i) => &path[..i],
            None => ROOT,
        }
    }

    /// Last path element
    pub fn name(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Append a child element
    pub fn join(parent: &str, child: &str) -> String {
        if parent == ROOT {
            format!("/{}", child)
        } else {
            format!("{}/{}", parent, child)
        }
    }

    /// Whether `path` is `prefix` or lies beneath it
    pub fn has_prefix(path: &str, prefix: &str) -> bool {
        prefix == ROOT
            || path == prefix
            || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    /// Swap `old` for `new` at the front of `path`; `None` outside `old`
    pub fn replace_prefix(path: &str, old: &str, new: &str) -> Option<String> {
        if !has_prefix(path, old) {
            return None;
        }
        let rest = if old == ROOT {
            path.trim_start_matches('/')
        } else {
            path[old.len()..].trim_start_matches('/')
        };
        Some(if rest.is_empty() {
            new.to_string()
        } else {
            join(new, rest)
        })
    }

    /// Ancestors from the root prim down to the parent, excluding `/`
    pub fn ancestors(path: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut cur = parent(path);
        while cur != ROOT {
            out.push(cur);
            cur = parent(cur);
        }
        out.reverse();
        out
    }
}

/// How a prim spec participates in composition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specifier {
    /// Concrete definition
    #[default]
    Def,
    /// Override of opinions defined elsewhere
    Over,
    /// Abstract template
    Class,
}

/// Material binding strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingStrength {
    /// Descendant bindings win
    WeakerThanDescendants,
    /// This binding wins over descendant bindings
    StrongerThanDescendants,
}

/// Reference or payload target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    /// Layer path, relative to the authoring layer's directory
    pub asset_path: String,
    /// Target prim; the layer's default prim when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prim_path: Option<String>,
}

impl AssetRef {
    /// Target the default prim of a layer
    pub fn new(asset_path: impl Into<String>) -> Self {
        Self {
            asset_path: asset_path.into(),
            prim_path: None,
        }
    }

    /// Target a specific prim
    pub fn with_prim(mut self, prim_path: impl Into<String>) -> Self {
        self.prim_path = Some(prim_path.into());
        self
    }
}

/// One variant's opinions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VariantSpec {
    /// Variant name
    pub name: String,
    /// References added to the owning prim
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<AssetRef>,
    /// Specs below the owner, keyed by path relative to it
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub prims: BTreeMap<String, PrimSpec>,
}

/// An ordered set of variants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantSetSpec {
    /// Set name
    pub name: String,
    /// Variants in authoring order; the first is the default
    pub variants: Vec<VariantSpec>,
}

impl VariantSetSpec {
    /// Find or append a variant
    pub fn variant_mut(&mut self, name: &str) -> &mut VariantSpec {
        let idx = match self.variants.iter().position(|v| v.name == name) {
            Some(idx) => idx,
            None => {
                self.variants.push(VariantSpec {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.variants.len() - 1
            }
        };
        &mut self.variants[idx]
    }

    /// Look up a variant
    pub fn variant(&self, name: &str) -> Option<&VariantSpec> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Opinions about a single prim in a single layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrimSpec {
    /// def / over / class
    pub specifier: Specifier,
    /// Schema type, e.g. `Mesh`, `Material`, `Shader`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Model kind, e.g. `component`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Attribute values
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    /// Free-form metadata
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, Value>,
    /// Relationship targets by name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Vec<String>>,
    /// Strength of the direct material binding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_strength: Option<BindingStrength>,
    /// Reference arcs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<AssetRef>,
    /// Deferred payload arcs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<AssetRef>,
    /// Inherit arcs (prim paths)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,
    /// Authored variant sets in strength order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variant_sets: Vec<VariantSetSpec>,
    /// Selected variant per set
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variant_selections: BTreeMap<String, String>,
}

impl PrimSpec {
    /// An `over` with no opinions
    pub fn over() -> Self {
        Self {
            specifier: Specifier::Over,
            ..Default::default()
        }
    }

    /// A `def` of the given type
    pub fn def(type_name: impl Into<String>) -> Self {
        Self {
            specifier: Specifier::Def,
            type_name: Some(type_name.into()),
            ..Default::default()
        }
    }

    /// Set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set relationship targets
    pub fn with_relationship(mut self, name: impl Into<String>, targets: Vec<String>) -> Self {
        self.relationships.insert(name.into(), targets);
        self
    }

    /// Find or append a variant set
    pub fn variant_set_mut(&mut self, name: &str) -> &mut VariantSetSpec {
        let idx = match self.variant_sets.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.variant_sets.push(VariantSetSpec {
                    name: name.to_string(),
                    variants: Vec::new(),
                });
                self.variant_sets.len() - 1
            }
        };
        &mut self.variant_sets[idx]
    }

    /// Look up a variant set
    pub fn variant_set(&self, name: &str) -> Option<&VariantSetSpec> {
        self.variant_sets.iter().find(|s| s.name == name)
    }
}

/// A scene-description document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Layer {
    /// Where the layer lives; anchors relative asset paths
    #[serde(skip)]
    pub path: PathBuf,
    /// Default prim name for arcs without an explicit target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_prim: Option<String>,
    /// Sublayer asset paths, strongest first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sublayers: Vec<String>,
    /// Prim specs keyed by absolute path
    pub prims: BTreeMap<String, PrimSpec>,
}

impl Layer {
    /// Empty layer that will be saved at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Read a layer; a missing file is a composition error
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                PublishError::composition(format!("layer not found: {}", path.display()))
            }
            _ => PublishError::Io(e),
        })?;
        let mut layer: Layer = serde_json::from_str(&content).map_err(|e| {
            PublishError::composition(format!("unreadable layer {}: {}", path.display(), e))
        })?;
        layer.path = path.to_path_buf();
        Ok(layer)
    }

    /// Read the layer at `path`, or start an empty one there
    pub fn open_or_new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Ok(Self::new(path))
        }
    }

    /// Write the layer to its own path through a temp file and rename
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(PublishError::composition("cannot save an anonymous layer"));
        }
        write_atomic(&self.path, serde_json::to_string_pretty(self)?.as_bytes())?;
        debug!(layer = %self.path.display(), prims = self.prims.len(), "Layer saved");
        Ok(())
    }

    /// Directory relative asset paths resolve against
    pub fn anchor(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Resolve an asset path authored in this layer
    pub fn resolve(&self, asset_path: &str) -> PathBuf {
        let p = Path::new(asset_path);
        if p.is_absolute() {
            normalize(p)
        } else {
            normalize(&self.anchor().join(p))
        }
    }

    /// Asset path to author in this layer for a file at `target`
    pub fn asset_path_to(&self, target: &Path) -> String {
        relative_path(self.anchor(), target)
    }

    /// Spec at `path`
    pub fn prim(&self, path: &str) -> Option<&PrimSpec> {
        self.prims.get(path)
    }

    /// Whether a spec exists at `path`
    pub fn has_prim(&self, path: &str) -> bool {
        self.prims.contains_key(path)
    }

    /// Spec at `path`, creating it (and `over` ancestors) as an `over`
    pub fn override_prim(&mut self, path: &str) -> &mut PrimSpec {
        self.ensure_ancestors(path);
        self.prims.entry(path.to_string()).or_insert_with(PrimSpec::over)
    }

    /// Spec at `path` as a `def` of `type_name`
    pub fn define_prim(&mut self, path: &str, type_name: &str) -> &mut PrimSpec {
        let spec = self.override_prim(path);
        spec.specifier = Specifier::Def;
        spec.type_name = Some(type_name.to_string());
        spec
    }

    /// Spec at `path` as a `class`
    pub fn class_prim(&mut self, path: &str) -> &mut PrimSpec {
        let spec = self.override_prim(path);
        spec.specifier = Specifier::Class;
        spec
    }

    /// Insert a spec, replacing any existing one
    pub fn insert_prim(&mut self, path: &str, spec: PrimSpec) {
        self.ensure_ancestors(path);
        self.prims.insert(path.to_string(), spec);
    }

    fn ensure_ancestors(&mut self, path: &str) {
        for ancestor in path::ancestors(path) {
            self.prims
                .entry(ancestor.to_string())
                .or_insert_with(PrimSpec::over);
        }
    }

    /// Names of direct children of `parent` that have specs here
    pub fn child_names(&self, parent: &str) -> Vec<String> {
        let start = if parent == path::ROOT {
            "/".to_string()
        } else {
            format!("{}/", parent)
        };
        self.prims
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .filter(|(k, _)| path::parent(k) == parent)
            .map(|(k, _)| path::name(k).to_string())
            .collect()
    }

    /// Specs at or beneath `root`, in path order
    pub fn subtree<'a>(&'a self, root: &'a str) -> impl Iterator<Item = (&'a String, &'a PrimSpec)> + 'a {
        self.prims
            .range(root.to_string()..)
            .take_while(move |(k, _)| k.starts_with(root))
            .filter(move |(k, _)| path::has_prefix(k, root))
    }

    /// Copy the specs at and beneath `src_root` of `src` to `dst_root` here.
    ///
    /// Relationship targets inside the copied subtree follow the copy.
    pub fn copy_subtree(&mut self, src: &Layer, src_root: &str, dst_root: &str) -> usize {
        let copies: Vec<(String, PrimSpec)> = src
            .subtree(src_root)
            .filter_map(|(p, spec)| {
                let dst = path::replace_prefix(p, src_root, dst_root)?;
                let mut spec = spec.clone();
                for targets in spec.relationships.values_mut() {
                    for t in targets.iter_mut() {
                        if let Some(moved) = path::replace_prefix(t, src_root, dst_root) {
                            *t = moved;
                        }
                    }
                }
                Some((dst, spec))
            })
            .collect();
        let count = copies.len();
        for (dst, spec) in copies {
            self.insert_prim(&dst, spec);
        }
        count
    }
}

/// Write `bytes` to `path` via a temp file in the same directory and an atomic rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Lexically normalize `.` and `..` components
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path of `target` relative to directory `from`, `./`-prefixed when below it
pub fn relative_path(from: &Path, target: &Path) -> String {
    let from = normalize(from);
    let target = normalize(target);
    let from_parts: Vec<_> = from.components().collect();
    let target_parts: Vec<_> = target.components().collect();

    let common = from_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 && target.is_absolute() {
        return target.to_string_lossy().into_owned();
    }

    let mut parts: Vec<String> = Vec::new();
    for _ in common..from_parts.len() {
        parts.push("..".into());
    }
    for c in &target_parts[common..] {
        parts.push(c.as_os_str().to_string_lossy().into_owned());
    }
    let joined = parts.join("/");
    if joined.starts_with("..") {
        joined
    } else {
        format!("./{}", joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(path::parent("/top/geo"), "/top");
        assert_eq!(path::parent("/top"), "/");
        assert_eq!(path::name("/top/geo/mesh"), "mesh");
        assert_eq!(path::join("/", "top"), "/top");
        assert!(path::has_prefix("/top/mtl/a", "/top/mtl"));
        assert!(!path::has_prefix("/top/mtlx", "/top/mtl"));
        assert_eq!(
            path::replace_prefix("/mtl/wood/tex", "/mtl", "/top/mtl").as_deref(),
            Some("/top/mtl/wood/tex")
        );
        assert_eq!(path::replace_prefix("/geo", "/mtl", "/x"), None);
        assert_eq!(path::ancestors("/a/b/c"), vec!["/a", "/a/b"]);
    }

    #[test]
    fn test_override_creates_ancestors() {
        let mut layer = Layer::new("/tmp/x.json");
        layer.define_prim("/top/geo/mesh", "Mesh");
        assert_eq!(layer.prim("/top").unwrap().specifier, Specifier::Over);
        assert_eq!(layer.child_names("/"), vec!["top"]);
        assert_eq!(layer.child_names("/top"), vec!["geo"]);
        assert_eq!(layer.child_names("/top/geo"), vec!["mesh"]);
    }

    #[test]
    fn test_copy_subtree_moves_internal_targets() {
        let mut src = Layer::new("/tmp/src.json");
        src.define_prim("/mtl/wood", "Material").relationships.insert(
            "outputs:surface".into(),
            vec!["/mtl/wood/surface".into()],
        );
        src.define_prim("/mtl/wood/surface", "Shader");
        src.define_prim("/mtl/woodgrain", "Material");

        let mut dst = Layer::new("/tmp/dst.json");
        let copied = dst.copy_subtree(&src, "/mtl/wood", "/top/mtl/wood");
        assert_eq!(copied, 2);
        assert_eq!(
            dst.prim("/top/mtl/wood").unwrap().relationships["outputs:surface"],
            vec!["/top/mtl/wood/surface".to_string()]
        );
        assert!(!dst.has_prim("/top/mtl/woodgrain"));
    }

    #[test]
    fn test_relative_paths() {
        assert_eq!(
            relative_path(Path::new("/pub/v001"), Path::new("/pub/v001/geo/a.json")),
            "./geo/a.json"
        );
        assert_eq!(
            relative_path(Path::new("/pub/v001/variant"), Path::new("/pub/v001/meta.json")),
            "../meta.json"
        );
        let layer = Layer::new("/pub/v001/variant/w.json");
        assert_eq!(layer.resolve("../meta.json"), PathBuf::from("/pub/v001/meta.json"));
    }

    #[test]
    fn test_save_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/layer.json");
        let mut layer = Layer::new(&path);
        layer.default_prim = Some("top".into());
        layer.sublayers.push("./meta.json".into());
        layer.define_prim("/top", "Xform").kind = Some("component".into());
        layer.save().unwrap();

        let back = Layer::open(&path).unwrap();
        assert_eq!(back, layer);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_missing_layer_is_composition_error() {
        let err = Layer::open("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, PublishError::Composition(_)));
    }
}
