//! Parameter variations for multi-plan batches.

use serde::{Deserialize, Serialize};
use subdiv_db::models::{GenerationRequest, LayoutKind};

/// Lists each variant cycles through, by index modulo list length.
///
/// An empty list leaves that parameter as the base request has it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariationAxes {
    pub aspect_ratios: Vec<f64>,
    pub layouts: Vec<LayoutKind>,
    pub target_lots: Vec<u32>,
}

impl Default for VariationAxes {
    fn default() -> Self {
        Self {
            aspect_ratios: vec![0.85, 0.92, 1.0, 1.08, 1.15],
            layouts: LayoutKind::ALL.to_vec(),
            target_lots: Vec::new(),
        }
    }
}

/// One variant in a batch: its index plus the independent request it
/// submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantParams {
    pub index: u32,
    pub request: GenerationRequest,
}

/// Derive `count` variations of `base`. Pure: the same inputs always yield
/// the same list.
pub fn build_variations(
    base: &GenerationRequest,
    count: u32,
    axes: &VariationAxes,
) -> Vec<VariantParams> {
    (0..count)
        .map(|index| VariantParams {
            index,
            request: GenerationRequest {
                lot_aspect_ratio: cycle(&axes.aspect_ratios, index).or(base.lot_aspect_ratio),
                road_layout: cycle(&axes.layouts, index).or(base.road_layout),
                target_lots: cycle(&axes.target_lots, index).or(base.target_lots),
                ..base.clone()
            },
        })
        .collect()
}

fn cycle<T: Copy>(values: &[T], index: u32) -> Option<T> {
    if values.is_empty() {
        None
    } else {
        Some(values[index as usize % values.len()])
    }
}
