//! Prompt construction for layout generation.
//!
//! Everything here is pure: the same request and strategy always produce
//! byte-identical text, which is what makes regeneration reproducible and
//! lets the prompt be fingerprinted.

mod schema;

use sha2::{Digest, Sha256};
use subdiv_db::models::{GenerationRequest, Strategy};

use crate::validate::ValidationRules;

pub use schema::response_schema;

/// Road width (m) every layout must use.
pub const ROAD_WIDTH_M: f64 = 12.0;

/// Output contract restated in every generated prompt.
const OUTPUT_FORMAT: &str = r#"## Output Format

Respond with ONE JSON object and nothing else (no prose, no markdown fences):

{
  "lots": [
    { "number": 1, "width": 10.0, "length": 25.0, "area": 250.0, "x": 0.0, "y": 0.0 }
  ],
  "roadNetwork": { "width": 12.0, "totalArea": 1200.0, "layout": "grid" },
  "amenities": [
    { "kind": "green_space", "area": 400.0, "position": { "x": 0.0, "y": 0.0 }, "description": "..." }
  ],
  "metrics": {
    "totalLots": 1,
    "viableLots": 1,
    "invalidLots": [],
    "averageLotArea": 250.0,
    "landUtilizationPercent": 75.0
  }
}

- `layout` is one of: "grid", "perimeter", "central-spine", "loop".
- `x`/`y` are the lot's top-left corner in metres from the land's top-left corner.
- Amenity `kind` is one of: "social_club", "parking", "green_space", "maintenance", or another short snake_case label.
- `metrics.totalLots` MUST equal the number of entries in `lots`.
- `metrics.viableLots` MUST equal the number of lots whose `area` meets the minimum.
- `metrics.invalidLots` lists the `number` of every lot below the minimum.
"#;

/// Build the exact instruction text for a generation call.
///
/// `strategy` takes precedence over `request.strategy`. A
/// `request.prompt_override` replaces the generated text entirely and
/// both strategies are ignored.
pub fn build_prompt(request: &GenerationRequest, strategy: Option<Strategy>) -> String {
    if let Some(custom) = &request.prompt_override {
        return custom.clone();
    }
    let rules = ValidationRules::default();
    let strategy = strategy.or(request.strategy);

    let mut prompt = String::with_capacity(4096);

    prompt.push_str("# Land Subdivision Layout\n\n");
    prompt.push_str(
        "You are an urban planner producing a subdivision layout for a single plot of land. \
         Divide the land into numbered residential lots, a road network and amenity areas, \
         and report metrics describing your own output.\n\n",
    );

    // Land.
    prompt.push_str("## Land\n\n");
    prompt.push_str(&format!(
        "- Dimensions: {:.2} m wide x {:.2} m long\n",
        request.land_width, request.land_length
    ));
    prompt.push_str(&format!("- Total area: {:.2} sqm\n", request.land_area));
    if let Some(locale) = &request.locale {
        prompt.push_str(&format!("- Location context: {locale}\n"));
    }
    prompt.push('\n');

    // Hard constraints, always restated.
    let amenity_area = request.expected_amenity_area();
    prompt.push_str("## Constraints\n\n");
    prompt.push_str(&format!(
        "1. Every lot must have an area of at least {:.0} sqm. Lots below {:.0} sqm are acceptable but discouraged.\n",
        rules.min_lot_area, rules.warn_lot_area
    ));
    prompt.push_str(&format!(
        "2. Amenity areas must total {:.2}% of the land ({:.2} sqm), within +/- {:.0}%.\n",
        request.amenity_percent, amenity_area, rules.amenity_warn_deviation_percent
    ));
    prompt.push_str(&format!(
        "3. Roads are {:.1} m wide and must not exceed {:.0}% of the land area ({:.2} sqm).\n",
        ROAD_WIDTH_M,
        rules.max_road_area_percent,
        request.land_area * rules.max_road_area_percent / 100.0
    ));
    prompt.push_str(&format!(
        "4. Aim for at least {:.0}% land utilization by lots.\n",
        rules.min_utilization_percent
    ));
    prompt.push_str(
        "5. Number lots sequentially starting at 1, row by row from the top-left corner, \
         left to right.\n\n",
    );

    // Layout preferences.
    let mut preferences = Vec::new();
    if let Some(target) = request.target_lots {
        preferences.push(format!("- Target number of lots: {target}"));
    }
    if let Some(layout) = request.road_layout {
        preferences.push(format!("- Road layout: {layout}"));
    }
    if let Some(ratio) = request.lot_aspect_ratio {
        preferences.push(format!("- Lot width/length ratio: about {ratio:.2}"));
    }
    if !preferences.is_empty() {
        prompt.push_str("## Layout Preferences\n\n");
        for line in preferences {
            prompt.push_str(&line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    // Strategy narrative.
    if let Some(strategy) = strategy {
        prompt.push_str("## Optimization Goal\n\n");
        prompt.push_str(strategy_guidance(strategy));
        prompt.push_str("\n\n");
    }

    prompt.push_str(OUTPUT_FORMAT);
    prompt
}

fn strategy_guidance(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::MaximizeLots => {
            "Maximize the number of viable lots. Keep lots close to the minimum area, \
             prefer compact road layouts and avoid leftover slivers of land."
        }
        Strategy::LargerLots => {
            "Prefer fewer, larger lots. Favour generous frontages and regular shapes \
             over raw lot count."
        }
        Strategy::Balanced => {
            "Balance lot count against lot size. Keep lots comfortably above the minimum \
             while still using the land efficiently."
        }
    }
}

/// SHA-256 hex digest of a prompt, stored on candidates for reproducibility.
pub fn prompt_fingerprint(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}
