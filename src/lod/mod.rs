//! Level-of-detail planning
//!
//! ## Table of Contents
//! - **LodPlanner**: Geometric reduction targets per level
//! - **LodLevel**: One planned level
//! - **texture**: Texture tiers, UDIM expansion and the conversion manifest

pub mod texture;

use serde::{Deserialize, Serialize};

pub use texture::{TextureJob, TextureManifest, TextureTier, TEXTURE_TIERS};

/// Percent of the original geometry removed at `level` (1-based).
///
/// `keep = (base_percent / 100)^level`, result clamped to `[0, 99]`.
pub fn remove_percent(base_percent: f64, level: u32) -> f64 {
    let keep_ratio = (base_percent / 100.0).powi(level as i32);
    (100.0 * (1.0 - keep_ratio)).clamp(0.0, 99.0)
}

/// Where a level's reduction starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionSource {
    /// The full-resolution original
    Original,
}

/// One planned level of detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodLevel {
    /// Level number, 1-based
    pub level: u32,
    /// Percent of the original geometry kept
    pub keep_percent: f64,
    /// Percent removed by the reduction
    pub remove_percent: f64,
    /// Always the original, never a previously reduced level
    pub source: ReductionSource,
}

impl LodLevel {
    /// Variant name in the "levels" set
    pub fn variant_name(&self) -> String {
        format!("LOD{}", self.level)
    }
}

/// Plans geometric reduction for a fixed per-level keep percentage
#[derive(Debug, Clone, Copy)]
pub struct LodPlanner {
    base_percent: f64,
}

impl LodPlanner {
    /// Planner keeping `base_percent` of the geometry per level
    pub fn new(base_percent: f64) -> Self {
        Self { base_percent }
    }

    /// Plan a single level
    pub fn level(&self, level: u32) -> LodLevel {
        let remove = remove_percent(self.base_percent, level);
        LodLevel {
            level,
            keep_percent: 100.0 - remove,
            remove_percent: remove,
            source: ReductionSource::Original,
        }
    }

    /// Plan levels `1..=count`
    pub fn plan(&self, count: u32) -> Vec<LodLevel> {
        (1..=count).map(|i| self.level(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halving_levels() {
        let levels: Vec<f64> = LodPlanner::new(50.0)
            .plan(3)
            .iter()
            .map(|l| l.remove_percent)
            .collect();
        assert_eq!(levels.len(), 3);
        for (got, want) in levels.iter().zip([50.0, 75.0, 87.5]) {
            assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_remove_percent_monotone_and_bounded() {
        for base in [0.5, 1.0, 10.0, 33.3, 50.0, 75.0, 90.0, 99.9] {
            let mut prev = -1.0;
            for i in 1..=12 {
                let r = remove_percent(base, i);
                assert!((0.0..=99.0).contains(&r), "base {} level {} -> {}", base, i, r);
                assert!(r >= prev, "base {} level {} not monotone", base, i);
                prev = r;
            }
        }
    }

    #[test]
    fn test_clamps_at_ninety_nine() {
        assert_eq!(remove_percent(10.0, 3), 99.0);
    }

    #[test]
    fn test_every_level_reduces_the_original() {
        let plan = LodPlanner::new(60.0).plan(4);
        assert!(plan.iter().all(|l| l.source == ReductionSource::Original));
        assert_eq!(plan[1].variant_name(), "LOD2");
        assert!((plan[1].keep_percent - 36.0).abs() < 1e-9);
    }
}
