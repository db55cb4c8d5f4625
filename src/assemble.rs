//! Final composition of one version
//!
//! ## Table of Contents
//! - **Assembler**: Payload, rebinding, LOD wraps, shading tiers, variants, interface
//! - **AssemblyReport**: What was composed and what was left out
//!
//! Optional fragments that are missing on disk are treated as not requested.

use crate::composer::{LayerComposer, VariantEntry};
use crate::config::PublishOptions;
use crate::error::{PublishError, Result};
use crate::lod::TEXTURE_TIERS;
use crate::rebind::{MaterialRebinder, RebindReport};
use crate::stage::Stage;
use crate::version::{artifacts, AssetVersion};
use std::path::PathBuf;
use tracing::{info, warn};

/// Summary of an assembly
#[derive(Debug, Clone, Default)]
pub struct AssemblyReport {
    /// Payload sublayers, strongest first
    pub payload_layers: Vec<PathBuf>,
    /// LOD levels that made it into the "levels" set
    pub lods: Vec<u32>,
    /// Variants of the "mtl" set
    pub shader_variants: Vec<String>,
    /// Rebinding pass summary
    pub rebind: RebindReport,
    /// Document the interface payloads
    pub interface_target: PathBuf,
}

/// Composes the fragments of one version into its published documents
pub struct Assembler<'a> {
    version: &'a AssetVersion,
    options: &'a PublishOptions,
    composer: LayerComposer,
}

impl<'a> Assembler<'a> {
    /// Assembler for `version`
    pub fn new(version: &'a AssetVersion, options: &'a PublishOptions) -> Self {
        Self {
            version,
            options,
            composer: LayerComposer::new(&version.top_name),
        }
    }

    /// Run every composition step
    pub fn run(&self) -> Result<AssemblyReport> {
        let render = self.version.artifact(artifacts::RENDER)?.to_path_buf();
        if !render.is_file() {
            return Err(PublishError::composition(format!(
                "render fragment missing: {}",
                render.display()
            )));
        }
        let payload = self.version.artifact(artifacts::PAYLOAD)?.to_path_buf();
        let meta = self.version.artifact(artifacts::META)?.to_path_buf();

        let mut fragments = Vec::with_capacity(2);
        if self.options.proxy.enabled {
            let proxy = self.version.artifact(artifacts::PROXY)?.to_path_buf();
            if proxy.is_file() {
                fragments.push(proxy);
            } else {
                warn!(proxy = %proxy.display(), "Proxy fragment missing, payload built without it");
            }
        }
        fragments.push(render);

        self.composer.compose_payload(&payload, &fragments)?;
        let rebind = MaterialRebinder::new(&self.version.top_name).rebind(&payload, &meta)?;

        let mut report = AssemblyReport {
            payload_layers: std::iter::once(meta.clone()).chain(fragments).collect(),
            rebind,
            ..Default::default()
        };

        let mut levels = vec![VariantEntry::new("LOD0", &payload).with_prim(self.composer.top())];
        for level in 1..=self.options.lod_levels() {
            let fragment = self.version.lod_fragment(level);
            if !fragment.is_file() {
                warn!(level, fragment = %fragment.display(), "LOD fragment missing, level omitted");
                continue;
            }
            let wrap = self.version.lod_wrap(level);
            self.composer.compose_lod_wrap(&wrap, &meta, &fragment)?;
            levels.push(VariantEntry::new(format!("LOD{}", level), wrap));
            report.lods.push(level);
        }

        let shaders = if self.options.texture_lod {
            self.shader_variants(&payload)?
        } else {
            Vec::new()
        };
        report.shader_variants = shaders.iter().map(|v| v.name.clone()).collect();

        report.interface_target = if report.lods.is_empty() && shaders.is_empty() {
            payload
        } else {
            let variant = self.version.artifact(artifacts::VARIANT)?.to_path_buf();
            self.composer
                .compose_variant_document(&variant, &levels, &shaders)?;
            variant
        };

        let top = self.version.artifact(artifacts::TOP)?;
        self.composer.compose_interface(top, &report.interface_target)?;

        info!(
            version = %self.version.label,
            interface = %top.display(),
            lods = report.lods.len(),
            shader_variants = report.shader_variants.len(),
            copied = report.rebind.copied.len(),
            "Version assembled"
        );
        Ok(report)
    }

    fn shader_variants(&self, payload: &std::path::Path) -> Result<Vec<VariantEntry>> {
        let stage = Stage::open(payload)?;
        let clean = self.composer.compose_shader_fragment(
            &self.version.shader_fragment(None),
            &stage,
            None,
        )?;
        if clean.materials == 0 {
            warn!(top = %self.composer.top(), "No materials to tier, mtl variants omitted");
            return Ok(Vec::new());
        }

        let mut variants = vec![VariantEntry::new("LOD0", &clean.path).with_prim("/mtl")];
        for tier in &TEXTURE_TIERS {
            let fragment = self.composer.compose_shader_fragment(
                &self.version.shader_fragment(Some(tier.name)),
                &stage,
                Some(tier),
            )?;
            if fragment.retargeted == 0 {
                warn!(tier = %tier.name, "No converted textures for tier");
            }
            variants.push(VariantEntry::new(tier.name, &fragment.path).with_prim("/mtl"));
        }
        Ok(variants)
    }
}
