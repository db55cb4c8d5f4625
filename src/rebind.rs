//! Material rebinding
//!
//! ## Table of Contents
//! - **MaterialRebinder**: Copies foreign materials under `<top>/mtl` and retargets bindings
//! - **RebindReport**: What one pass changed
//! - **MaterialCopy**: One copied material
//!
//! Every edit lands in a single override layer (`meta`) that is kept as the
//! strongest sublayer of the payload. Copies are stamped with their source
//! path, so a later pass maps to the existing copy instead of copying again.

use crate::composer::CLASS_CONTAINER;
use crate::error::{PublishError, Result};
use crate::layer::{
    normalize, path, BindingStrength, Layer, PrimSpec, BINDING_REL, COLLECTION_BINDING_PREFIX,
};
use crate::stage::{ComposedPrim, Stage};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// customData key recording where a copied material came from
pub const SOURCE_MATERIAL_KEY: &str = "sourceMaterial";
/// customData key naming the prim on leaf meshes
pub const PRIM_NAME_TAG_KEY: &str = "primNameTag";
/// customData key recording a mesh's final material binding
pub const MATERIAL_BINDING_KEY: &str = "materialBinding";
/// Shader inputs that carry texture file paths
pub const TEXTURE_INPUTS: [&str; 3] = ["inputs:file", "inputs:filename", "inputs:image"];
/// Plain-string mirror of a shader's texture path
pub const TEXTURE_STRING_INPUT: &str = "inputs:filename_str";

const BINDABLE_TYPES: [&str; 6] = ["Mesh", "GeomSubset", "Xform", "Scope", "Points", "BasisCurves"];

/// One copied material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialCopy {
    /// Composed path of the original
    pub source: String,
    /// Path of the copy under `<top>/mtl`
    pub copy: String,
    /// Layer the original was defined in
    pub layer: PathBuf,
}

/// What one rebinding pass did
#[derive(Debug, Clone, Default)]
pub struct RebindReport {
    /// Materials copied in this pass
    pub copied: Vec<MaterialCopy>,
    /// Source to copy mapping in effect (including earlier passes)
    pub remap: BTreeMap<String, String>,
    /// Direct bindings authored
    pub direct: usize,
    /// GeomSubset bindings authored
    pub subsets: usize,
    /// Collection bindings authored
    pub collections: usize,
    /// Leaf meshes stamped
    pub meshes: usize,
    /// Binding targets that resolve to no material
    pub dangling: Vec<String>,
}

/// Rebinds every material binding of one asset to its own material scope
#[derive(Debug, Clone)]
pub struct MaterialRebinder {
    top: String,
    mtl_scope: String,
}

impl MaterialRebinder {
    /// Rebinder for the asset whose top prim is `/<top_name>`
    pub fn new(top_name: &str) -> Self {
        let top = path::join(path::ROOT, top_name);
        let mtl_scope = path::join(&top, "mtl");
        Self { top, mtl_scope }
    }

    /// The asset's material scope, `<top>/mtl`
    pub fn material_scope(&self) -> &str {
        &self.mtl_scope
    }

    /// Put `meta` at index 0 of the payload's sublayers unless it is already there.
    ///
    /// Returns whether the payload was rewritten.
    pub fn ensure_meta_sublayer(payload: &Path, meta: &Path) -> Result<bool> {
        let mut layer = Layer::open(payload)?;
        let meta_abs = normalize(meta);
        let present = layer
            .sublayers
            .iter()
            .position(|s| layer.resolve(s) == meta_abs);

        match present {
            Some(0) => Ok(false),
            Some(idx) => {
                let entry = layer.sublayers.remove(idx);
                layer.sublayers.insert(0, entry);
                layer.save()?;
                Ok(true)
            }
            None => {
                let entry = layer.asset_path_to(&meta_abs);
                layer.sublayers.insert(0, entry);
                layer.save()?;
                Ok(true)
            }
        }
    }

    /// Run one pass over the composed payload, writing edits into `meta`
    pub fn rebind(&self, payload: &Path, meta: &Path) -> Result<RebindReport> {
        if !payload.exists() {
            return Err(PublishError::composition(format!(
                "payload not found: {}",
                payload.display()
            )));
        }

        let mut meta_layer = Layer::open_or_new(meta)?;
        if !meta.exists() {
            meta_layer.save()?;
        }
        if Self::ensure_meta_sublayer(payload, meta)? {
            debug!(payload = %payload.display(), "Meta layer prepended to payload");
        }

        let stage = Stage::open(payload)?;
        meta_layer.override_prim(&self.top);
        meta_layer.define_prim(&self.mtl_scope, "Scope");

        let mut pass = RebindPass {
            rebinder: self,
            stage: &stage,
            meta: &mut meta_layer,
            report: RebindReport::default(),
        };
        pass.seed();
        pass.run();
        let report = pass.report;

        meta_layer.save()?;
        info!(
            top = %self.top,
            copied = report.copied.len(),
            direct = report.direct,
            subsets = report.subsets,
            collections = report.collections,
            meshes = report.meshes,
            "Materials rebound"
        );
        for target in &report.dangling {
            warn!(target = %target, "Binding target has no material");
        }
        Ok(report)
    }
}

struct RebindPass<'a> {
    rebinder: &'a MaterialRebinder,
    stage: &'a Stage,
    meta: &'a mut Layer,
    report: RebindReport,
}

impl RebindPass<'_> {
    // Earlier copies are found through their source stamp
    fn seed(&mut self) {
        for prim in self.stage.subtree(&self.rebinder.mtl_scope) {
            if let Some(Value::String(src)) = prim.custom_data.get(SOURCE_MATERIAL_KEY) {
                self.report.remap.insert(src.clone(), prim.path.clone());
            }
        }
    }

    fn run(&mut self) {
        let stage = self.stage;
        let mut material_root: Option<&str> = None;

        for prim in stage.traverse() {
            if path::has_prefix(&prim.path, CLASS_CONTAINER) {
                continue;
            }
            if prim.is_a("Shader") && path::has_prefix(&prim.path, &self.rebinder.top) {
                self.stamp_shader(prim);
            }
            if let Some(root) = material_root {
                if path::has_prefix(&prim.path, root) {
                    continue;
                }
                material_root = None;
            }
            if prim.is_a("Material") {
                if !path::has_prefix(&prim.path, &self.rebinder.top) {
                    self.localize(&prim.path);
                }
                material_root = Some(&prim.path);
                continue;
            }
            if path::has_prefix(&prim.path, &self.rebinder.mtl_scope) {
                continue;
            }
            if self.is_bindable(prim) {
                self.rebind_prim(prim);
            }
        }
    }

    fn is_bindable(&self, prim: &ComposedPrim) -> bool {
        let typed = prim
            .type_name
            .as_deref()
            .map(|t| BINDABLE_TYPES.contains(&t))
            .unwrap_or(false);
        let bound = prim.relationships.keys().any(|k| k.starts_with(BINDING_REL));
        (typed && path::has_prefix(&prim.path, &self.rebinder.top)) || bound
    }

    // Map a binding target to the asset's own copy, copying on first sight
    fn localize(&mut self, source: &str) -> String {
        if path::has_prefix(source, &self.rebinder.top) {
            return source.to_string();
        }
        if let Some(copy) = self.report.remap.get(source) {
            return copy.clone();
        }

        let Some(material) = self.stage.prim(source) else {
            self.report.dangling.push(source.to_string());
            return source.to_string();
        };
        let Some(site) = material.defining_site() else {
            self.report.dangling.push(source.to_string());
            return source.to_string();
        };

        let base = path::name(source).to_string();
        let mut copy = path::join(&self.rebinder.mtl_scope, &base);
        let mut n = 1;
        while self.meta.has_prim(&copy) || self.stage.prim(&copy).is_some() {
            copy = path::join(&self.rebinder.mtl_scope, &format!("{}_r{}", base, n));
            n += 1;
        }

        self.meta.copy_subtree(&site.layer, &site.path, &copy);
        self.meta
            .override_prim(&copy)
            .custom_data
            .insert(SOURCE_MATERIAL_KEY.into(), Value::String(source.to_string()));
        let shader_paths: Vec<String> = self.meta.subtree(&copy).map(|(p, _)| p.clone()).collect();
        for p in shader_paths {
            if let Some(spec) = self.meta.prims.get_mut(&p) {
                stamp_texture_string(spec);
            }
        }

        debug!(source = %source, copy = %copy, "Material copied");
        self.report.copied.push(MaterialCopy {
            source: source.to_string(),
            copy: copy.clone(),
            layer: site.layer.path.clone(),
        });
        self.report.remap.insert(source.to_string(), copy.clone());
        copy
    }

    fn rebind_prim(&mut self, prim: &ComposedPrim) {
        let subset = prim.is_a("GeomSubset");
        let mut authored: Vec<(String, Vec<String>)> = Vec::new();
        let mut direct_target = None;

        for (name, targets) in &prim.relationships {
            if name.starts_with(COLLECTION_BINDING_PREFIX) {
                let mut retargeted = targets.clone();
                let material = retargeted
                    .iter()
                    .position(|t| self.stage.prim(t).is_some_and(|p| p.is_a("Material")));
                if let Some(i) = material {
                    let source = retargeted[i].clone();
                    retargeted[i] = self.localize(&source);
                }
                self.report.collections += 1;
                authored.push((name.clone(), retargeted));
            } else if name == BINDING_REL || name.starts_with("material:binding:") {
                let retargeted: Vec<String> = targets.iter().map(|t| self.localize(t)).collect();
                if name == BINDING_REL {
                    direct_target = retargeted.first().cloned();
                }
                if subset {
                    self.report.subsets += 1;
                } else {
                    self.report.direct += 1;
                }
                authored.push((name.clone(), retargeted));
            }
        }

        let over = self.meta.override_prim(&prim.path);
        for (name, targets) in authored {
            if !name.starts_with(COLLECTION_BINDING_PREFIX) {
                over.binding_strength = Some(BindingStrength::StrongerThanDescendants);
            }
            over.relationships.insert(name, targets);
        }

        if prim.is_a("Mesh") {
            let purpose = if is_proxy_path(&prim.path) { "proxy" } else { "render" };
            over.attributes.insert("purpose".into(), Value::String(purpose.into()));
            over.custom_data
                .insert(PRIM_NAME_TAG_KEY.into(), Value::String(prim.name().to_string()));
            if let Some(target) = direct_target {
                over.custom_data
                    .insert(MATERIAL_BINDING_KEY.into(), Value::String(target));
            }
            self.report.meshes += 1;
        }
    }

    fn stamp_shader(&mut self, prim: &ComposedPrim) {
        if let Some(value) = texture_input(&prim.attributes) {
            self.meta
                .override_prim(&prim.path)
                .attributes
                .insert(TEXTURE_STRING_INPUT.into(), Value::String(value));
        }
    }
}

fn texture_input(attributes: &BTreeMap<String, Value>) -> Option<String> {
    TEXTURE_INPUTS
        .iter()
        .find_map(|name| attributes.get(*name).and_then(Value::as_str))
        .map(str::to_string)
}

fn stamp_texture_string(spec: &mut PrimSpec) {
    if spec.type_name.as_deref() != Some("Shader") {
        return;
    }
    if let Some(value) = texture_input(&spec.attributes) {
        spec.attributes
            .insert(TEXTURE_STRING_INPUT.into(), Value::String(value));
    }
}

/// Proxy geometry lives under (or is) a prim whose name ends in `_proxy`
pub fn is_proxy_path(prim_path: &str) -> bool {
    prim_path.split('/').any(|seg| seg.ends_with("_proxy"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Base fragment: mesh under /chair bound to a material outside the asset scope
    fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let render = dir.join("geo/chair_render.json");
        let mut base = Layer::new(&render);
        base.default_prim = Some("chair".into());
        base.define_prim("/chair", "Xform");
        base.define_prim("/chair/geo", "Xform");
        base.define_prim("/chair/geo/seat", "Mesh")
            .relationships
            .insert(BINDING_REL.into(), vec!["/mtl/wood".into()]);
        base.define_prim("/chair/geo/seat/top_faces", "GeomSubset")
            .relationships
            .insert(BINDING_REL.into(), vec!["/mtl/varnish".into()]);
        base.define_prim("/chair/geo", "Xform").relationships.insert(
            format!("{}:legs", COLLECTION_BINDING_PREFIX),
            vec!["/chair/geo.collection:legs".into(), "/mtl/wood".into()],
        );
        base.define_prim("/mtl/wood", "Material").relationships.insert(
            "outputs:surface".into(),
            vec!["/mtl/wood/pbr".into()],
        );
        base.insert_prim(
            "/mtl/wood/pbr",
            PrimSpec::def("Shader").with_attribute("inputs:file", "/tex/wood.<UDIM>.exr"),
        );
        base.define_prim("/mtl/varnish", "Material");
        base.save().unwrap();

        let payload = dir.join("payload.json");
        let mut layer = Layer::new(&payload);
        layer.default_prim = Some("chair".into());
        layer.sublayers = vec![layer.asset_path_to(&render)];
        layer.save().unwrap();
        (payload, dir.join("meta.json"))
    }

    #[test]
    fn test_weak_material_copied_and_rebound() {
        let dir = tempfile::tempdir().unwrap();
        let (payload, meta) = fixture(dir.path());

        let report = MaterialRebinder::new("chair").rebind(&payload, &meta).unwrap();
        assert_eq!(report.copied.len(), 2);
        assert_eq!(report.direct, 1);
        assert_eq!(report.subsets, 1);
        assert_eq!(report.collections, 1);
        assert_eq!(report.meshes, 1);
        assert!(report.dangling.is_empty());

        let stage = Stage::open(&payload).unwrap();
        let seat = stage.prim("/chair/geo/seat").unwrap();
        assert_eq!(seat.relationships[BINDING_REL], vec!["/chair/mtl/wood".to_string()]);
        assert_eq!(
            seat.binding_strength,
            Some(BindingStrength::StrongerThanDescendants)
        );
        assert_eq!(seat.attributes["purpose"], "render");
        assert_eq!(seat.custom_data[MATERIAL_BINDING_KEY], "/chair/mtl/wood");

        let subset = stage.prim("/chair/geo/seat/top_faces").unwrap();
        assert_eq!(
            subset.relationships[BINDING_REL],
            vec!["/chair/mtl/varnish".to_string()]
        );

        let geo = stage.prim("/chair/geo").unwrap();
        let collection = &geo.relationships[&format!("{}:legs", COLLECTION_BINDING_PREFIX)];
        assert_eq!(collection[0], "/chair/geo.collection:legs");
        assert_eq!(collection[1], "/chair/mtl/wood");

        let copied = stage.prim("/chair/mtl/wood").unwrap();
        assert!(copied.is_a("Material"));
        assert_eq!(copied.relationships["outputs:surface"], vec!["/chair/mtl/wood/pbr".to_string()]);
        assert_eq!(
            stage.prim("/chair/mtl/wood/pbr").unwrap().attributes[TEXTURE_STRING_INPUT],
            "/tex/wood.<UDIM>.exr"
        );

        let payload_layer = Layer::open(&payload).unwrap();
        assert_eq!(payload_layer.sublayers[0], "./meta.json");
    }

    #[test]
    fn test_collection_material_found_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let (payload, meta) = fixture(dir.path());
        let rel = format!("{}:top", COLLECTION_BINDING_PREFIX);
        let render = dir.path().join("geo/chair_render.json");
        let mut base = Layer::open(&render).unwrap();
        base.define_prim("/chair/geo", "Xform").relationships.insert(
            rel.clone(),
            vec!["/mtl/varnish".into(), "/chair/geo.collection:top".into()],
        );
        base.save().unwrap();

        let report = MaterialRebinder::new("chair").rebind(&payload, &meta).unwrap();
        assert_eq!(report.collections, 2);

        let stage = Stage::open(&payload).unwrap();
        assert_eq!(
            stage.prim("/chair/geo").unwrap().relationships[&rel],
            vec![
                "/chair/mtl/varnish".to_string(),
                "/chair/geo.collection:top".to_string()
            ]
        );
    }

    #[test]
    fn test_every_bound_material_reachable_from_scope() {
        let dir = tempfile::tempdir().unwrap();
        let (payload, meta) = fixture(dir.path());
        let rebinder = MaterialRebinder::new("chair");
        rebinder.rebind(&payload, &meta).unwrap();

        let stage = Stage::open(&payload).unwrap();
        for prim in stage.traverse() {
            for (name, targets) in &prim.relationships {
                if !name.starts_with(BINDING_REL) {
                    continue;
                }
                let material = targets.last().unwrap();
                assert!(path::has_prefix(material, rebinder.material_scope()), "{}", material);
                assert!(stage.prim(material).unwrap().is_a("Material"));
            }
        }
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (payload, meta) = fixture(dir.path());
        let rebinder = MaterialRebinder::new("chair");
        rebinder.rebind(&payload, &meta).unwrap();
        let meta_before = Layer::open(&meta).unwrap();
        let payload_before = Layer::open(&payload).unwrap();

        let again = rebinder.rebind(&payload, &meta).unwrap();
        assert!(again.copied.is_empty());
        assert_eq!(again.remap.len(), 2);
        assert_eq!(Layer::open(&meta).unwrap(), meta_before);
        assert_eq!(Layer::open(&payload).unwrap(), payload_before);
    }

    #[test]
    fn test_name_collision_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let (payload, meta) = fixture(dir.path());

        let local = dir.path().join("local.json");
        let mut layer = Layer::new(&local);
        layer.define_prim("/chair/mtl/wood", "Material");
        layer.save().unwrap();
        let mut p = Layer::open(&payload).unwrap();
        p.sublayers.push("./local.json".into());
        p.save().unwrap();

        let report = MaterialRebinder::new("chair").rebind(&payload, &meta).unwrap();
        let wood = report.copied.iter().find(|c| c.source == "/mtl/wood").unwrap();
        assert_eq!(wood.copy, "/chair/mtl/wood_r1");
    }

    #[test]
    fn test_proxy_purpose() {
        assert!(is_proxy_path("/chair/chair_proxy/seat"));
        assert!(is_proxy_path("/chair/geo/seat_proxy"));
        assert!(!is_proxy_path("/chair/geo/proxy_seat"));
    }

    #[test]
    fn test_missing_payload_is_composition_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MaterialRebinder::new("chair")
            .rebind(&dir.path().join("payload.json"), &dir.path().join("meta.json"))
            .unwrap_err();
        assert!(matches!(err, PublishError::Composition(_)));
    }
}
