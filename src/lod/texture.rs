//! Texture tiers
//!
//! ## Table of Contents
//! - **TextureTier**: Named downscale factor (LOD2, LOD4, LOD10)
//! - **TextureJob**: One source tile to one tier output
//! - **TextureManifest**: Sorted, chunkable list of jobs
//! - **convert_jobs**: Runs jobs on a bounded worker pool
//!
//! Tiled textures carry a `<UDIM>` token (any case) in place of the
//! four-digit tile id. Every tier output is derived from the original tile.

use crate::error::{PublishError, Result};
use crate::external::TextureConverter;
use crate::retry::RetryPolicy;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const UDIM_TOKEN: &str = "<UDIM>";
const DEFAULT_TILE: u32 = 1001;

/// A named downscale factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureTier {
    /// Tier name, also the directory and suffix
    pub name: &'static str,
    /// Downscale factor
    pub scale: u32,
}

impl TextureTier {
    /// `--resize` percentage for this tier
    pub fn resize_percent(&self) -> u32 {
        100 / self.scale
    }
}

/// Fixed tier set
pub const TEXTURE_TIERS: [TextureTier; 3] = [
    TextureTier { name: "LOD2", scale: 2 },
    TextureTier { name: "LOD4", scale: 4 },
    TextureTier { name: "LOD10", scale: 10 },
];

/// Byte span of the UDIM token, case-insensitive
fn udim_span(s: &str) -> Option<(usize, usize)> {
    let lower = s.to_ascii_lowercase();
    lower
        .find("<udim>")
        .map(|start| (start, start + UDIM_TOKEN.len()))
}

/// Whether the path carries a UDIM token
pub fn is_tiled(path: &str) -> bool {
    udim_span(path).is_some()
}

/// Tile id delimited by `.` or `_` on both sides, e.g. `albedo.1012.exr`
pub fn tile_id(file_name: &str) -> Option<u32> {
    tile_span(file_name).and_then(|(start, end)| file_name[start..end].parse().ok())
}

fn tile_span(s: &str) -> Option<(usize, usize)> {
    let b = s.as_bytes();
    if b.len() < 6 {
        return None;
    }
    (1..b.len() - 4).find_map(|i| {
        let delimited = matches!(b[i - 1], b'.' | b'_') && matches!(b[i + 4], b'.' | b'_');
        let digits = b[i] == b'1' && b[i + 1..i + 4].iter().all(u8::is_ascii_digit);
        (delimited && digits).then_some((i, i + 4))
    })
}

/// Replace a concrete tile id in the file name with the UDIM token
pub fn abstract_udim(path: &str) -> String {
    if is_tiled(path) {
        return path.to_string();
    }
    let (dir, name) = split_file(path);
    match tile_span(name) {
        Some((start, end)) => format!("{}{}{}{}", dir, &name[..start], UDIM_TOKEN, &name[end..]),
        None => path.to_string(),
    }
}

fn split_file(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => path.split_at(i + 1),
        None => ("", path),
    }
}

fn with_tile(path: &str, tile: u32) -> String {
    match udim_span(path) {
        Some((start, end)) => format!("{}{}{}", &path[..start], tile, &path[end..]),
        None => path.to_string(),
    }
}

/// Expand a texture path to its concrete tiles keyed by tile id.
///
/// Untiled paths yield a single entry keyed 1001 when the file exists.
/// Matches of a tiled pattern without a valid tile id are skipped.
pub fn expand_tiles(pattern: &str) -> Result<BTreeMap<u32, PathBuf>> {
    let glob_pattern = match udim_span(pattern) {
        Some((start, end)) => format!(
            "{}[0-9][0-9][0-9][0-9]{}",
            glob::Pattern::escape(&pattern[..start]),
            glob::Pattern::escape(&pattern[end..])
        ),
        None if Path::new(pattern).exists() => glob::Pattern::escape(pattern),
        None => pattern.to_string(),
    };

    let entries = glob::glob(&glob_pattern)
        .map_err(|e| PublishError::config(format!("bad texture pattern {}: {}", pattern, e)))?;

    let token = udim_span(split_file(pattern).1).map(|(start, _)| start);
    let mut tiles = BTreeMap::new();
    for entry in entries {
        let path = entry.map_err(|e| PublishError::Io(e.into()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let tile = match token {
            Some(start) => name
                .get(start..start + 4)
                .and_then(|digits| digits.parse().ok())
                .filter(|&tile| tile >= DEFAULT_TILE),
            None if is_tiled(pattern) => tile_id(name),
            None => Some(tile_id(name).unwrap_or(DEFAULT_TILE)),
        };
        match tile {
            Some(tile) => {
                tiles.insert(tile, path);
            }
            None => warn!(file = %path.display(), pattern = %pattern, "Not a UDIM tile, skipped"),
        }
    }
    Ok(tiles)
}

/// Path of `path` in a tier: `{dir}/{tier}/{stem}_{tier}{rest}`.
///
/// The suffix goes before the UDIM token when there is one, otherwise
/// before the extension. Already-tiered names keep their suffix.
pub fn tier_path(path: &str, tier: &TextureTier) -> String {
    let (dir, name) = split_file(path);
    let suffix = format!("_{}", tier.name);

    let renamed = match udim_span(name) {
        Some((start, _)) => {
            let (prefix, rest) = name.split_at(start);
            let (prefix, sep) = match prefix.strip_suffix(['.', '_']) {
                Some(stripped) => (stripped, &prefix[stripped.len()..]),
                None => (prefix, ""),
            };
            if prefix.ends_with(&suffix) {
                name.to_string()
            } else {
                format!("{}{}{}{}", prefix, suffix, sep, rest)
            }
        }
        None => {
            let (stem, ext) = match name.rfind('.') {
                Some(i) if i > 0 => name.split_at(i),
                _ => (name, ""),
            };
            if stem.ends_with(&suffix) {
                name.to_string()
            } else {
                format!("{}{}{}", stem, suffix, ext)
            }
        }
    };

    let dir = dir.trim_end_matches('/');
    let tier_dir = format!("/{}", tier.name);
    if dir.ends_with(&tier_dir) {
        format!("{}/{}", dir, renamed)
    } else if dir.is_empty() {
        format!("{}/{}", tier.name, renamed)
    } else {
        format!("{}/{}/{}", dir, tier.name, renamed)
    }
}

/// Inverse of [`tier_path`]: strips `/LODn/` directories and `_LODn` suffixes
pub fn original_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len().saturating_sub(1);
    let kept: Vec<String> = segments
        .iter()
        .enumerate()
        .filter(|(i, seg)| *i == last || !is_lod_name(seg))
        .map(|(i, seg)| {
            if i == last {
                strip_lod_suffix(seg)
            } else {
                seg.to_string()
            }
        })
        .collect();
    kept.join("/")
}

fn is_lod_name(s: &str) -> bool {
    s.strip_prefix("LOD")
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

// Removes every `_LOD<digits>` directly followed by `.` or `<`
fn strip_lod_suffix(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(i) = rest.find("_LOD") {
        let after = &rest[i + 4..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let follows = after[digits..].chars().next();
        if digits > 0 && matches!(follows, Some('.') | Some('<')) {
            out.push_str(&rest[..i]);
            rest = &after[digits..];
        } else {
            out.push_str(&rest[..i + 4]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// One source tile downscaled into one tier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureJob {
    /// Original full-resolution tile
    pub src: PathBuf,
    /// Tier output
    pub dst: PathBuf,
    /// Tier name
    pub tier: String,
    /// Downscale factor
    pub scale: u32,
    /// Tile id (1001 for untiled textures)
    pub tile: u32,
}

impl TextureJob {
    /// `--resize` argument
    pub fn resize_arg(&self) -> String {
        format!("{}%", 100 / self.scale.max(1))
    }

    /// Output already present with non-zero size
    pub fn is_done(&self) -> bool {
        std::fs::metadata(&self.dst)
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }
}

/// Order-independent list of conversion jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextureManifest {
    /// Jobs, sorted and deduplicated
    pub jobs: Vec<TextureJob>,
}

impl TextureManifest {
    /// Plan every tier for every concrete tile of `textures`
    pub fn plan(textures: &[String], tiers: &[TextureTier]) -> Result<Self> {
        let patterns: BTreeSet<String> = textures
            .iter()
            .map(|t| abstract_udim(&t.replace('\\', "/")))
            .collect();

        let mut jobs = BTreeSet::new();
        for pattern in &patterns {
            let tiles = expand_tiles(pattern)?;
            if tiles.is_empty() {
                warn!(texture = %pattern, "No tiles found for texture");
                continue;
            }
            for tier in tiers {
                let dst_pattern = tier_path(pattern, tier);
                for (tile, src) in &tiles {
                    jobs.insert(TextureJob {
                        src: src.clone(),
                        dst: PathBuf::from(with_tile(&dst_pattern, *tile)),
                        tier: tier.name.to_string(),
                        scale: tier.scale,
                        tile: *tile,
                    });
                }
            }
        }

        info!(textures = patterns.len(), jobs = jobs.len(), "Texture manifest planned");
        Ok(Self {
            jobs: jobs.into_iter().collect(),
        })
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether there is nothing to convert
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of chunks of `size` jobs
    pub fn chunk_count(&self, size: usize) -> usize {
        self.jobs.len().div_ceil(size.max(1))
    }

    /// Jobs of chunk `index`
    pub fn chunk(&self, index: usize, size: usize) -> &[TextureJob] {
        let size = size.max(1);
        let start = (index * size).min(self.jobs.len());
        let end = (start + size).min(self.jobs.len());
        &self.jobs[start..end]
    }

    /// Write the manifest as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::layer::write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    /// Read a manifest
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PublishError::input_missing(format!("texture manifest {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Outcome of a conversion batch
#[derive(Debug, Clone, Default)]
pub struct ConversionSummary {
    /// Jobs converted in this run
    pub converted: usize,
    /// Jobs whose output already existed
    pub skipped: usize,
    /// Jobs that failed, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// Run `jobs` on a pool of at most `workers` threads.
///
/// A failing tile is retried per `retry` after its partial output is
/// removed, then skipped. The batch itself only errors when the pool cannot
/// be built.
pub fn convert_jobs(
    jobs: &[TextureJob],
    converter: &dyn TextureConverter,
    workers: usize,
    retry: &RetryPolicy,
) -> Result<ConversionSummary> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("texture-{}", i))
        .build()
        .map_err(|e| PublishError::config(format!("texture pool: {}", e)))?;

    let summary = Mutex::new(ConversionSummary::default());
    pool.install(|| {
        jobs.par_iter().for_each(|job| {
            if job.is_done() {
                summary.lock().skipped += 1;
                return;
            }
            let result = retry.run(
                || converter.convert(job),
                || {
                    if job.dst.is_file() {
                        if let Err(e) = std::fs::remove_file(&job.dst) {
                            debug!(dst = %job.dst.display(), error = %e, "Partial tile not removed");
                        }
                    }
                },
            );
            match result {
                Ok(()) => {
                    debug!(dst = %job.dst.display(), "Texture converted");
                    summary.lock().converted += 1;
                }
                Err(e) => {
                    warn!(src = %job.src.display(), tier = %job.tier, error = %e, "Texture conversion failed");
                    summary.lock().failed.push((job.src.clone(), e.to_string()));
                }
            }
        })
    });

    let summary = summary.into_inner();
    info!(
        converted = summary.converted,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        "Texture batch finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOD2: TextureTier = TEXTURE_TIERS[0];

    #[test]
    fn test_tile_id() {
        assert_eq!(tile_id("albedo.1012.exr"), Some(1012));
        assert_eq!(tile_id("albedo_1003_v2.tx"), Some(1003));
        assert_eq!(tile_id("albedo1012.exr"), None);
        assert_eq!(tile_id("albedo.2012.exr"), None);
    }

    #[test]
    fn test_abstract_udim() {
        assert_eq!(
            abstract_udim("/tex/export/wood.1001.exr"),
            "/tex/export/wood.<UDIM>.exr"
        );
        assert_eq!(abstract_udim("/tex/wood.exr"), "/tex/wood.exr");
        assert_eq!(abstract_udim("/tex/wood.<udim>.exr"), "/tex/wood.<udim>.exr");
    }

    #[test]
    fn test_tier_path_tiled_and_plain() {
        assert_eq!(
            tier_path("/tex/export/wood.<UDIM>.exr", &LOD2),
            "/tex/export/LOD2/wood_LOD2.<UDIM>.exr"
        );
        assert_eq!(
            tier_path("/tex/export/wood.exr", &TEXTURE_TIERS[2]),
            "/tex/export/LOD10/wood_LOD10.exr"
        );
        let once = tier_path("/tex/wood.exr", &LOD2);
        assert_eq!(tier_path(&once, &LOD2), once);
    }

    #[test]
    fn test_original_path_inverts_tier_path() {
        for src in ["/tex/export/wood.<UDIM>.exr", "/tex/export/wood.exr", "/a/b_c.tif"] {
            for tier in &TEXTURE_TIERS {
                assert_eq!(original_path(&tier_path(src, tier)), src);
            }
        }
    }

    #[test]
    fn test_resize_arg() {
        assert_eq!(TEXTURE_TIERS.map(|t| t.resize_percent()), [50, 25, 10]);
    }

    #[test]
    fn test_plan_expands_tiles_from_originals() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        for tile in [1001, 1002] {
            std::fs::write(dir.path().join(format!("wood.{}.exr", tile)), b"px").unwrap();
        }
        std::fs::write(dir.path().join("metal.exr"), b"px").unwrap();

        let textures = vec![
            format!("{}/wood.1001.exr", root),
            format!("{}/wood.<UDIM>.exr", root),
            format!("{}/metal.exr", root),
        ];
        let manifest = TextureManifest::plan(&textures, &TEXTURE_TIERS).unwrap();

        // (2 wood tiles + 1 metal) x 3 tiers, duplicates removed
        assert_eq!(manifest.len(), 9);
        assert!(manifest
            .jobs
            .iter()
            .all(|j| !j.src.file_name().unwrap().to_string_lossy().contains("LOD")));
        let wood2 = manifest
            .jobs
            .iter()
            .find(|j| j.tile == 1002 && j.tier == "LOD4")
            .unwrap();
        assert_eq!(
            wood2.dst,
            PathBuf::from(format!("{}/LOD4/wood_LOD4.1002.exr", root))
        );

        assert_eq!(manifest.chunk_count(4), 3);
        assert_eq!(manifest.chunk(2, 4).len(), 1);
        assert!(manifest.chunk(7, 4).is_empty());
    }

    struct CountingConverter {
        calls: AtomicUsize,
    }

    impl TextureConverter for CountingConverter {
        fn convert(&self, job: &TextureJob) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.tile == 1002 {
                return Err(PublishError::external("corrupt tile"));
            }
            std::fs::create_dir_all(job.dst.parent().unwrap())?;
            std::fs::write(&job.dst, b"small")?;
            Ok(())
        }
    }

    #[test]
    fn test_convert_skips_existing_and_failed_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let job = |tile: u32| TextureJob {
            src: dir.path().join(format!("t.{}.exr", tile)),
            dst: dir.path().join(format!("LOD2/t_LOD2.{}.exr", tile)),
            tier: "LOD2".into(),
            scale: 2,
            tile,
        };
        let jobs = vec![job(1001), job(1002), job(1003)];
        std::fs::create_dir_all(dir.path().join("LOD2")).unwrap();
        std::fs::write(&jobs[2].dst, b"done").unwrap();

        let converter = CountingConverter {
            calls: AtomicUsize::new(0),
        };
        let summary = convert_jobs(&jobs, &converter, 2, &RetryPolicy::none()).unwrap();

        assert_eq!(summary.converted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);

        let again = convert_jobs(&jobs, &converter, 2, &RetryPolicy::none()).unwrap();
        assert_eq!(again.skipped, 2);
    }

    struct FlakyConverter {
        calls: AtomicUsize,
    }

    impl TextureConverter for FlakyConverter {
        fn convert(&self, job: &TextureJob) -> Result<()> {
            std::fs::create_dir_all(job.dst.parent().unwrap())?;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::fs::write(&job.dst, b"trunc")?;
                return Err(PublishError::external("oiiotool exited with 1"));
            }
            assert!(!job.dst.exists(), "partial output survived the retry");
            std::fs::write(&job.dst, b"small")?;
            Ok(())
        }
    }

    #[test]
    fn test_failed_tile_retried_after_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![TextureJob {
            src: dir.path().join("t.1001.exr"),
            dst: dir.path().join("LOD4/t_LOD4.1001.exr"),
            tier: "LOD4".into(),
            scale: 4,
            tile: 1001,
        }];
        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
        };
        let retry = RetryPolicy::new(
            crate::retry::RetryConfig::new().initial_delay(std::time::Duration::from_millis(1)),
        );

        let summary = convert_jobs(&jobs, &converter, 1, &retry).unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.converted, 1);
        assert!(summary.failed.is_empty());
        assert_eq!(std::fs::read(&jobs[0].dst).unwrap(), b"small");
    }

    #[test]
    fn test_expand_tiles_skips_non_udim_matches() {
        let dir = tempfile::tempdir().unwrap();
        for tile in ["0999", "1001", "1002"] {
            std::fs::write(dir.path().join(format!("wood.{}.exr", tile)), tile).unwrap();
        }
        let pattern = format!("{}/wood.<UDIM>.exr", dir.path().display());

        let tiles = expand_tiles(&pattern).unwrap();
        assert_eq!(tiles.keys().copied().collect::<Vec<_>>(), vec![1001, 1002]);
        assert_eq!(tiles[&1001], dir.path().join("wood.1001.exr"));

        let plain = expand_tiles(&format!("{}/wood.0999.exr", dir.path().display())).unwrap();
        assert_eq!(plain.keys().copied().collect::<Vec<_>>(), vec![DEFAULT_TILE]);
    }
}
