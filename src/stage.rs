//! Layer composition
//!
//! ## Table of Contents
//! - **Stage**: Composed view of a root layer and everything it reaches
//! - **ComposedPrim**: Resolved opinions for one prim path
//! - **PrimSite**: One contributing spec (layer + path), strongest first
//! - **LoadPolicy**: Whether payload arcs are followed
//!
//! Opinions are gathered per prim in strength order: the local layer stack
//! (sublayers, strongest first), then inherits, selected variants,
//! references and finally payloads. Children are discovered from every
//! contributing site, so arcs compose whole namespaces.

use crate::error::{PublishError, Result};
use crate::layer::{path, BindingStrength, Layer, PrimSpec, Specifier};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const MAX_ARC_DEPTH: usize = 64;

/// Whether payload arcs are followed during composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Follow every payload
    #[default]
    LoadAll,
    /// Leave payloads unloaded
    LoadNone,
}

/// One contributing spec
#[derive(Debug, Clone)]
pub struct PrimSite {
    /// Layer holding the prim spec
    pub layer: Arc<Layer>,
    /// Path of the prim spec in that layer
    pub path: String,
}

impl PrimSite {
    /// The prim spec itself
    pub fn spec(&self) -> Option<&PrimSpec> {
        self.layer.prim(&self.path)
    }
}

/// Resolved opinions for one prim
#[derive(Debug, Clone)]
pub struct ComposedPrim {
    /// Composed path
    pub path: String,
    /// Strongest non-`over` specifier, `Over` when nothing defines the prim
    pub specifier: Specifier,
    /// Strongest type name
    pub type_name: Option<String>,
    /// Strongest kind
    pub kind: Option<String>,
    /// Attributes, strongest opinion per name
    pub attributes: BTreeMap<String, Value>,
    /// Metadata, strongest opinion per key
    pub custom_data: BTreeMap<String, Value>,
    /// Relationships mapped into composed namespace, strongest per name
    pub relationships: BTreeMap<String, Vec<String>>,
    /// Strongest binding strength
    pub binding_strength: Option<BindingStrength>,
    /// Variant selections in effect
    pub variant_selections: BTreeMap<String, String>,
    /// Contributing specs, strongest first
    pub sites: Vec<PrimSite>,
}

impl ComposedPrim {
    /// Last path element
    pub fn name(&self) -> &str {
        path::name(&self.path)
    }

    /// Whether some layer defines (not merely overrides) the prim
    pub fn is_defined(&self) -> bool {
        self.specifier != Specifier::Over
    }

    /// Whether the strongest type is `type_name`
    pub fn is_a(&self, type_name: &str) -> bool {
        self.type_name.as_deref() == Some(type_name)
    }

    /// Strongest site that defines the prim
    pub fn defining_site(&self) -> Option<&PrimSite> {
        self.sites
            .iter()
            .find(|s| s.spec().map(|p| p.specifier == Specifier::Def).unwrap_or(false))
    }
}

type LayerStack = Arc<Vec<Arc<Layer>>>;

// A site in some layer stack, with the namespace mapping of the arc that led to it
#[derive(Clone)]
struct Node {
    stack: LayerStack,
    path: String,
    source_root: String,
    target_root: String,
}

impl Node {
    fn child(&self, name: &str) -> Node {
        Node {
            stack: self.stack.clone(),
            path: path::join(&self.path, name),
            source_root: self.source_root.clone(),
            target_root: self.target_root.clone(),
        }
    }

    fn map_to_composed(&self, p: &str) -> String {
        path::replace_prefix(p, &self.source_root, &self.target_root).unwrap_or_else(|| p.to_string())
    }

    fn map_to_source(&self, p: &str) -> String {
        path::replace_prefix(p, &self.target_root, &self.source_root).unwrap_or_else(|| p.to_string())
    }

    fn specs(&self) -> impl Iterator<Item = (&Arc<Layer>, &PrimSpec)> {
        self.stack
            .iter()
            .filter_map(move |layer| layer.prim(&self.path).map(|spec| (layer, spec)))
    }
}

/// Composed view of a root layer
#[derive(Debug, Clone)]
pub struct Stage {
    root: PathBuf,
    prims: BTreeMap<String, ComposedPrim>,
    layers: Vec<PathBuf>,
}

impl Stage {
    /// Compose `root` with every payload loaded
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(root, LoadPolicy::LoadAll)
    }

    /// Compose `root` under a load policy
    pub fn open_with(root: impl AsRef<Path>, policy: LoadPolicy) -> Result<Self> {
        let mut composer = Composer {
            policy,
            cache: HashMap::new(),
            prims: BTreeMap::new(),
        };
        let stack = composer.stack(root.as_ref(), &mut Vec::new())?;
        let pseudo_root = Node {
            stack,
            path: path::ROOT.to_string(),
            source_root: path::ROOT.to_string(),
            target_root: path::ROOT.to_string(),
        };
        composer.compose_children(path::ROOT, &[pseudo_root])?;

        let mut layers: Vec<PathBuf> = composer.cache.keys().cloned().collect();
        layers.sort();
        debug!(root = %root.as_ref().display(), prims = composer.prims.len(), layers = layers.len(), "Stage composed");

        Ok(Self {
            root: root.as_ref().to_path_buf(),
            prims: composer.prims,
            layers,
        })
    }

    /// Root layer path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every layer file that contributed
    pub fn used_layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// Composed prim at `path`
    pub fn prim(&self, path: &str) -> Option<&ComposedPrim> {
        self.prims.get(path)
    }

    /// All composed prims in depth-first path order
    pub fn traverse(&self) -> impl Iterator<Item = &ComposedPrim> {
        self.prims.values()
    }

    /// Composed prims at or beneath `root`
    pub fn subtree<'a>(&'a self, root: &'a str) -> impl Iterator<Item = &'a ComposedPrim> + 'a {
        self.prims
            .range(root.to_string()..)
            .take_while(move |(k, _)| k.starts_with(root))
            .filter(move |(k, _)| path::has_prefix(k, root))
            .map(|(_, p)| p)
    }
}

struct Composer {
    policy: LoadPolicy,
    cache: HashMap<PathBuf, Arc<Layer>>,
    prims: BTreeMap<String, ComposedPrim>,
}

impl Composer {
    fn layer(&mut self, path: &Path) -> Result<Arc<Layer>> {
        if let Some(layer) = self.cache.get(path) {
            return Ok(layer.clone());
        }
        let layer = Arc::new(Layer::open(path)?);
        self.cache.insert(path.to_path_buf(), layer.clone());
        Ok(layer)
    }

    // Root layer followed by its sublayers, depth first, strongest first
    fn stack(&mut self, root: &Path, visiting: &mut Vec<PathBuf>) -> Result<LayerStack> {
        let mut out = Vec::new();
        self.collect_stack(root, visiting, &mut out)?;
        Ok(Arc::new(out))
    }

    fn collect_stack(
        &mut self,
        path: &Path,
        visiting: &mut Vec<PathBuf>,
        out: &mut Vec<Arc<Layer>>,
    ) -> Result<()> {
        if visiting.iter().any(|v| v == path) {
            return Err(PublishError::composition(format!(
                "sublayer cycle through {}",
                path.display()
            )));
        }
        let layer = self.layer(path)?;
        visiting.push(path.to_path_buf());
        out.push(layer.clone());
        for sub in &layer.sublayers {
            self.collect_stack(&layer.resolve(sub), visiting, out)?;
        }
        visiting.pop();
        Ok(())
    }

    fn arc_target(&mut self, layer: &Layer, asset: &str, prim: Option<&str>) -> Result<(LayerStack, String)> {
        let stack = self.stack(&layer.resolve(asset), &mut Vec::new())?;
        let target = match prim {
            Some(p) => p.to_string(),
            None => {
                let default = stack[0].default_prim.clone().ok_or_else(|| {
                    PublishError::composition(format!(
                        "{} has no default prim and the arc names no target",
                        stack[0].path.display()
                    ))
                })?;
                path::join(path::ROOT, &default)
            }
        };
        Ok((stack, target))
    }

    // All nodes contributing to `node`'s prim, strongest first
    fn expand(
        &mut self,
        node: Node,
        selections: &BTreeMap<String, String>,
        depth: usize,
        out: &mut Vec<Node>,
    ) -> Result<()> {
        if depth > MAX_ARC_DEPTH {
            return Err(PublishError::composition(format!(
                "composition arcs nest deeper than {} at {}",
                MAX_ARC_DEPTH, node.path
            )));
        }

        let local: Vec<(Arc<Layer>, PrimSpec)> = node
            .specs()
            .map(|(layer, spec)| (layer.clone(), spec.clone()))
            .collect();

        let mut selections = selections.clone();
        for (_, spec) in &local {
            for (set, choice) in &spec.variant_selections {
                selections.entry(set.clone()).or_insert_with(|| choice.clone());
            }
        }

        let composed_path = node.map_to_composed(&node.path);
        out.push(node.clone());

        for (_, spec) in &local {
            for inherit in &spec.inherits {
                let source = node.map_to_source(inherit);
                let class_node = Node {
                    stack: node.stack.clone(),
                    path: source.clone(),
                    source_root: source,
                    target_root: composed_path.clone(),
                };
                self.expand(class_node, &selections, depth + 1, out)?;
            }
        }

        for (layer, spec) in &local {
            for set in &spec.variant_sets {
                let Some(choice) = selections.get(&set.name) else { continue };
                let Some(variant) = set.variant(choice) else { continue };

                let mut synthetic = Layer::new(layer.path.clone());
                let owner = synthetic.override_prim(&node.path);
                owner.references = variant.references.clone();
                for (rel, child) in &variant.prims {
                    let p = rel
                        .split('/')
                        .filter(|s| !s.is_empty())
                        .fold(node.path.clone(), |acc, s| path::join(&acc, s));
                    synthetic.insert_prim(&p, child.clone());
                }
                let variant_node = Node {
                    stack: Arc::new(vec![Arc::new(synthetic)]),
                    path: node.path.clone(),
                    source_root: node.source_root.clone(),
                    target_root: node.target_root.clone(),
                };
                self.expand(variant_node, &selections, depth + 1, out)?;
            }
        }

        for (layer, spec) in &local {
            for reference in &spec.references {
                let (stack, target) =
                    self.arc_target(layer, &reference.asset_path, reference.prim_path.as_deref())?;
                let ref_node = Node {
                    stack,
                    path: target.clone(),
                    source_root: target,
                    target_root: composed_path.clone(),
                };
                self.expand(ref_node, &selections, depth + 1, out)?;
            }
        }

        if self.policy == LoadPolicy::LoadAll {
            for (layer, spec) in &local {
                for payload in &spec.payloads {
                    let (stack, target) =
                        self.arc_target(layer, &payload.asset_path, payload.prim_path.as_deref())?;
                    let payload_node = Node {
                        stack,
                        path: target.clone(),
                        source_root: target,
                        target_root: composed_path.clone(),
                    };
                    self.expand(payload_node, &selections, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }

    fn compose_children(&mut self, parent: &str, nodes: &[Node]) -> Result<()> {
        let mut names = BTreeSet::new();
        for node in nodes {
            for layer in node.stack.iter() {
                names.extend(layer.child_names(&node.path));
            }
        }

        for name in names {
            let child_path = path::join(parent, &name);
            let mut expanded = Vec::new();
            for node in nodes {
                let child = node.child(&name);
                if child.specs().next().is_some() {
                    self.expand(child, &BTreeMap::new(), 0, &mut expanded)?;
                }
            }
            let composed = resolve(&child_path, &expanded);
            self.prims.insert(child_path.clone(), composed);
            self.compose_children(&child_path, &expanded)?;
        }
        Ok(())
    }
}

fn resolve(path: &str, nodes: &[Node]) -> ComposedPrim {
    let mut prim = ComposedPrim {
        path: path.to_string(),
        specifier: Specifier::Over,
        type_name: None,
        kind: None,
        attributes: BTreeMap::new(),
        custom_data: BTreeMap::new(),
        relationships: BTreeMap::new(),
        binding_strength: None,
        variant_selections: BTreeMap::new(),
        sites: Vec::new(),
    };

    for node in nodes {
        for (layer, spec) in node.specs() {
            if prim.specifier == Specifier::Over && spec.specifier != Specifier::Over {
                prim.specifier = spec.specifier;
            }
            if prim.type_name.is_none() {
                prim.type_name = spec.type_name.clone();
            }
            if prim.kind.is_none() {
                prim.kind = spec.kind.clone();
            }
            if prim.binding_strength.is_none() {
                prim.binding_strength = spec.binding_strength;
            }
            for (k, v) in &spec.attributes {
                prim.attributes.entry(k.clone()).or_insert_with(|| v.clone());
            }
            for (k, v) in &spec.custom_data {
                prim.custom_data.entry(k.clone()).or_insert_with(|| v.clone());
            }
            for (k, v) in &spec.variant_selections {
                prim.variant_selections.entry(k.clone()).or_insert_with(|| v.clone());
            }
            for (name, targets) in &spec.relationships {
                prim.relationships
                    .entry(name.clone())
                    .or_insert_with(|| targets.iter().map(|t| node.map_to_composed(t)).collect());
            }
            prim.sites.push(PrimSite {
                layer: layer.clone(),
                path: node.path.clone(),
            });
        }
    }
    prim
}
