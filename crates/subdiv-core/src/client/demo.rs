//! Offline backend that synthesises a plausible layout from the request.
//!
//! Used when no API key is configured. The layout is a simple two-row
//! block around a 12 m road with the amenity strip along the far edge; it
//! is deterministic for a given request and is streamed in fixed-size
//! chunks so the streaming path runs end to end.

use async_trait::async_trait;
use subdiv_db::models::{
    AmenityArea, GeneratedPlan, GenerationRequest, LayoutKind, Lot, MIN_LOT_AREA, PlanMetrics,
    Position, RoadNetwork, Strategy, TokenUsage,
};

use super::trait_def::{GenerationCall, GenerationClient, ModelResponse};
use crate::error::GenerationError;
use crate::prompt::ROAD_WIDTH_M;
use crate::stream::ModelChunk;

const CHUNK_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct DemoClient {
    chunk_chars: usize,
}

impl Default for DemoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoClient {
    pub fn new() -> Self {
        Self {
            chunk_chars: CHUNK_CHARS,
        }
    }

    /// Stream in chunks of `n` characters instead of the default 64.
    pub fn with_chunk_chars(n: usize) -> Self {
        Self {
            chunk_chars: n.max(1),
        }
    }
}

#[async_trait]
impl GenerationClient for DemoClient {
    fn name(&self) -> &str {
        "demo"
    }

    async fn generate(&self, call: &GenerationCall) -> Result<ModelResponse, GenerationError> {
        let plan = synthesize(&call.request);
        let text = serde_json::to_string_pretty(&plan)
            .map_err(|e| GenerationError::FatalCall(format!("demo encoding failed: {e}")))?;
        tracing::info!(lots = plan.lots.len(), "using demo mode - no remote call made");

        let usage = TokenUsage {
            input_tokens: (call.prompt.len() / 4) as u64,
            output_tokens: (text.len() / 4) as u64,
        };
        let chunks = split_chars(&text, self.chunk_chars);
        let stream = async_stream::stream! {
            for chunk in chunks {
                yield Ok(ModelChunk::Text(chunk));
            }
            yield Ok(ModelChunk::Usage(usage));
        };
        Ok(ModelResponse::Streaming(Box::pin(stream)))
    }

    fn estimate_cost(&self, _usage: &TokenUsage) -> f64 {
        0.0
    }
}

fn split_chars(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(n).map(|c| c.iter().collect()).collect()
}

/// Build a self-consistent plan for `request`.
pub fn synthesize(request: &GenerationRequest) -> GeneratedPlan {
    let width = request.land_width.max(0.0);
    let length = request.land_length.max(0.0);
    let land_area = request.land_area;

    let amenity_area = request.expected_amenity_area().max(0.0);
    let amenity_depth = if width > 0.0 { amenity_area / width } else { 0.0 };
    let road_area = width * ROAD_WIDTH_M;

    // Two rows of lots, one each side of the road.
    let row_depth = ((length - ROAD_WIDTH_M - amenity_depth) / 2.0).max(0.0);

    let mut lots = Vec::new();
    if row_depth > 0.0 && width > 0.0 {
        let per_row = lots_per_row(request, width, row_depth);
        let lot_width = width / f64::from(per_row);
        let rows = [0.0, row_depth + ROAD_WIDTH_M];
        let mut number = 1;
        for y in rows {
            for i in 0..per_row {
                lots.push(Lot {
                    number,
                    width: round2(lot_width),
                    length: round2(row_depth),
                    area: round2(lot_width * row_depth),
                    x: round2(f64::from(i) * lot_width),
                    y: round2(y),
                });
                number += 1;
            }
        }
    }

    let total_lot_area: f64 = lots.iter().map(|l| l.area).sum();
    let viable_lots = lots.iter().filter(|l| l.area >= MIN_LOT_AREA).count() as u32;
    let invalid_lots = lots
        .iter()
        .filter(|l| l.area < MIN_LOT_AREA)
        .map(|l| l.number)
        .collect();
    let metrics = PlanMetrics {
        total_lots: lots.len() as u32,
        viable_lots,
        invalid_lots,
        average_lot_area: if lots.is_empty() {
            0.0
        } else {
            round2(total_lot_area / lots.len() as f64)
        },
        land_utilization_percent: if land_area > 0.0 {
            round2(total_lot_area / land_area * 100.0)
        } else {
            0.0
        },
    };

    let amenities = if amenity_area > 0.0 {
        vec![AmenityArea {
            kind: "green_space".to_string(),
            area: round2(amenity_area),
            position: Some(Position {
                x: 0.0,
                y: round2(length - amenity_depth),
            }),
            description: "Green strip along the far edge of the land".to_string(),
        }]
    } else {
        Vec::new()
    };

    GeneratedPlan {
        lots,
        road_network: RoadNetwork {
            width: ROAD_WIDTH_M,
            total_area: round2(road_area),
            layout: request.road_layout.unwrap_or(LayoutKind::Grid),
        },
        amenities,
        metrics,
    }
}

fn lots_per_row(request: &GenerationRequest, width: f64, row_depth: f64) -> u32 {
    if let Some(target) = request.target_lots {
        return target.div_ceil(2).max(1);
    }
    let ratio = request.lot_aspect_ratio.unwrap_or(0.5).max(0.1);
    let mut lot_width = row_depth * ratio;
    match request.strategy {
        Some(Strategy::MaximizeLots) => {
            lot_width = lot_width.min(MIN_LOT_AREA / row_depth * 1.05);
        }
        Some(Strategy::LargerLots) => lot_width *= 1.5,
        Some(Strategy::Balanced) | None => {}
    }
    // Never aim below the minimum area.
    lot_width = lot_width.max(MIN_LOT_AREA / row_depth);
    ((width / lot_width).floor() as u32).max(1)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
