//! Layer composition documents
//!
//! ## Table of Contents
//! - **LayerComposer**: Authors payload, variant, wrap, shading and interface documents
//! - **VariantEntry**: One variant name and the layer it references
//! - **VariantScope**: Whether a variant replaces the owner or fills a child
//!
//! Every document is built in memory from scratch and written atomically, so
//! a failed composition never leaves a partial output behind.

use crate::error::{PublishError, Result};
use crate::layer::{path, AssetRef, Layer, PrimSpec, Specifier};
use crate::lod::texture::{expand_tiles, is_tiled, original_path, tier_path, TextureTier};
use crate::rebind::TEXTURE_INPUTS;
use crate::stage::Stage;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Private container for class templates
pub const CLASS_CONTAINER: &str = "/__class__";

/// One variant of a variant set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    /// Variant name, e.g. `LOD0`
    pub name: String,
    /// Layer the variant references
    pub layer: PathBuf,
    /// Prim in that layer; its default prim when absent
    pub prim_path: Option<String>,
}

impl VariantEntry {
    /// Variant referencing the default prim of `layer`
    pub fn new(name: impl Into<String>, layer: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            layer: layer.into(),
            prim_path: None,
        }
    }

    /// Reference a specific prim instead
    pub fn with_prim(mut self, prim_path: impl Into<String>) -> Self {
        self.prim_path = Some(prim_path.into());
        self
    }
}

/// Where a variant's reference is authored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantScope {
    /// On the owner itself; the variant supplies the owner's content
    Owner,
    /// On a child of the owner; siblings contributed elsewhere survive
    Child(String),
}

/// Shading fragment written for one texture tier
#[derive(Debug, Clone)]
pub struct ShaderFragment {
    /// Output path
    pub path: PathBuf,
    /// Materials in the fragment
    pub materials: usize,
    /// Texture inputs pointing at tier files
    pub retargeted: usize,
}

/// Authors the documents of one asset version
#[derive(Debug, Clone)]
pub struct LayerComposer {
    top_name: String,
    top: String,
}

fn require(layer: &Path, what: &str) -> Result<()> {
    if layer.is_file() {
        Ok(())
    } else {
        Err(PublishError::composition(format!(
            "{} layer missing: {}",
            what,
            layer.display()
        )))
    }
}

impl LayerComposer {
    /// Composer for the asset whose top prim is `/<top_name>`
    pub fn new(top_name: impl Into<String>) -> Self {
        let top_name = top_name.into();
        let top = path::join(path::ROOT, &top_name);
        Self { top_name, top }
    }

    /// Top prim path
    pub fn top(&self) -> &str {
        &self.top
    }

    /// Document holding only `layers` as its sublayer stack, strongest first
    pub fn compose_payload(&self, output: &Path, layers: &[PathBuf]) -> Result<Layer> {
        for layer in layers {
            require(layer, "payload input")?;
        }

        let mut doc = Layer::new(output);
        doc.default_prim = Some(self.top_name.clone());
        doc.sublayers = layers.iter().map(|l| doc.asset_path_to(l)).collect();
        doc.save()?;

        info!(payload = %output.display(), sublayers = ?doc.sublayers, "Payload composed");
        Ok(doc)
    }

    /// Author `set_name` on `owner` in `doc`, one reference per variant.
    ///
    /// Prior references of each variant are cleared before the new one is
    /// added. The selection ends on the first variant.
    pub fn compose_variant_set(
        &self,
        doc: &mut Layer,
        owner: &str,
        set_name: &str,
        variants: &[VariantEntry],
        scope: &VariantScope,
    ) -> Result<()> {
        let Some(default) = variants.first() else {
            return Err(PublishError::composition(format!(
                "variant set '{}' on {} has no variants",
                set_name, owner
            )));
        };
        for variant in variants {
            require(&variant.layer, "variant")?;
        }

        for variant in variants {
            let reference = AssetRef {
                asset_path: doc.asset_path_to(&variant.layer),
                prim_path: variant.prim_path.clone(),
            };
            let spec = doc
                .override_prim(owner)
                .variant_set_mut(set_name)
                .variant_mut(&variant.name);
            let target = match scope {
                VariantScope::Owner => &mut spec.references,
                VariantScope::Child(child) => {
                    &mut spec
                        .prims
                        .entry(child.clone())
                        .or_insert_with(PrimSpec::over)
                        .references
                }
            };
            target.clear();
            target.push(reference);
            debug!(owner = %owner, set = %set_name, variant = %variant.name, "Variant authored");
        }

        doc.override_prim(owner)
            .variant_selections
            .insert(set_name.to_string(), default.name.clone());
        Ok(())
    }

    /// `variant` document: optional "mtl" set scoped to `<top>/mtl`, then "levels"
    pub fn compose_variant_document(
        &self,
        output: &Path,
        levels: &[VariantEntry],
        shaders: &[VariantEntry],
    ) -> Result<Layer> {
        let mut doc = Layer::new(output);
        doc.default_prim = Some(self.top_name.clone());
        doc.define_prim(&self.top, "Xform");

        if !shaders.is_empty() {
            self.compose_variant_set(
                &mut doc,
                &self.top,
                "mtl",
                shaders,
                &VariantScope::Child("mtl".into()),
            )?;
        }
        self.compose_variant_set(&mut doc, &self.top, "levels", levels, &VariantScope::Owner)?;
        doc.save()?;

        info!(
            variant = %output.display(),
            levels = levels.len(),
            shaders = shaders.len(),
            "Variant document composed"
        );
        Ok(doc)
    }

    /// Wrap for one LOD fragment: `meta` sublayered over a reference to the fragment
    pub fn compose_lod_wrap(&self, output: &Path, meta: &Path, fragment: &Path) -> Result<Layer> {
        require(meta, "meta")?;
        require(fragment, "LOD fragment")?;

        let mut doc = Layer::new(output);
        doc.default_prim = Some(self.top_name.clone());
        doc.sublayers = vec![doc.asset_path_to(meta)];
        let reference = AssetRef::new(doc.asset_path_to(fragment));
        doc.override_prim(&self.top).references.push(reference);
        doc.save()?;
        Ok(doc)
    }

    /// Top interface: component prim inheriting its class template, payloading `target`
    pub fn compose_interface(&self, output: &Path, target: &Path) -> Result<Layer> {
        require(target, "interface target")?;

        let class_path = path::join(CLASS_CONTAINER, &self.top_name);
        let mut doc = Layer::new(output);
        doc.class_prim(CLASS_CONTAINER);
        doc.class_prim(&class_path);

        let payload = AssetRef::new(doc.asset_path_to(target));
        let top = doc.define_prim(&self.top, "Xform");
        top.kind = Some("component".into());
        top.inherits = vec![class_path];
        top.payloads = vec![payload];
        top.custom_data
            .insert("geo".into(), Value::String(self.top_name.clone()));
        doc.default_prim = Some(self.top_name.clone());
        doc.save()?;

        info!(interface = %output.display(), target = %target.display(), "Interface composed");
        Ok(doc)
    }

    /// Flatten `<top>/mtl` of a composed stage into a standalone `/mtl` fragment.
    ///
    /// With a tier, texture inputs point at that tier's files where they
    /// exist on disk; without one they point at the originals.
    pub fn compose_shader_fragment(
        &self,
        output: &Path,
        source: &Stage,
        tier: Option<&TextureTier>,
    ) -> Result<ShaderFragment> {
        let scope = path::join(&self.top, "mtl");
        let mut doc = Layer::new(output);
        doc.default_prim = Some("mtl".into());
        doc.define_prim("/mtl", "Scope");

        let mut materials = 0;
        let mut retargeted = 0;
        for prim in source.subtree(&scope) {
            let Some(dst) = path::replace_prefix(&prim.path, &scope, "/mtl") else {
                continue;
            };
            if dst == "/mtl" {
                continue;
            }
            if prim.is_a("Material") {
                materials += 1;
            }

            let mut spec = PrimSpec {
                specifier: if prim.is_defined() { Specifier::Def } else { Specifier::Over },
                type_name: prim.type_name.clone(),
                attributes: prim.attributes.clone(),
                custom_data: prim.custom_data.clone(),
                ..Default::default()
            };
            for (name, targets) in &prim.relationships {
                let mapped = targets
                    .iter()
                    .map(|t| path::replace_prefix(t, &scope, "/mtl").unwrap_or_else(|| t.clone()))
                    .collect();
                spec.relationships.insert(name.clone(), mapped);
            }
            for input in TEXTURE_INPUTS {
                let Some(current) = spec.attributes.get(input).and_then(Value::as_str) else {
                    continue;
                };
                let original = original_path(current);
                let chosen = match tier {
                    Some(tier) => {
                        let candidate = tier_path(&original, tier);
                        if tier_file_exists(&candidate) {
                            retargeted += 1;
                            candidate
                        } else {
                            original
                        }
                    }
                    None => original,
                };
                spec.attributes.insert(input.to_string(), Value::String(chosen));
            }
            doc.insert_prim(&dst, spec);
        }
        doc.save()?;

        debug!(
            fragment = %output.display(),
            tier = tier.map(|t| t.name).unwrap_or("LOD0"),
            materials,
            retargeted,
            "Shading fragment composed"
        );
        Ok(ShaderFragment {
            path: output.to_path_buf(),
            materials,
            retargeted,
        })
    }
}

fn tier_file_exists(candidate: &str) -> bool {
    if is_tiled(candidate) {
        expand_tiles(candidate)
            .map(|tiles| !tiles.is_empty())
            .unwrap_or(false)
    } else {
        Path::new(candidate).is_file()
    }
}
