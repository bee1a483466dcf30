//! Coercion of the model's untyped JSON into a strict [`GeneratedPlan`].
//!
//! Models drift from the requested shape in small, predictable ways:
//! alternate key names, numbers emitted as strings, integers emitted as
//! `12.0`, a missing lot area. Those are repaired here; anything else is
//! left for serde to reject.

use serde_json::{Map, Number, Value};
use subdiv_db::models::GeneratedPlan;

/// Top-level key aliases, mapped onto the canonical name.
const TOP_LEVEL_ALIASES: &[(&str, &str)] = &[
    ("units", "lots"),
    ("parcels", "lots"),
    ("roads", "roadNetwork"),
    ("road_network", "roadNetwork"),
    ("amenityAreas", "amenities"),
    ("commonAreas", "amenities"),
];

/// Fields that must be integers.
const INTEGER_KEYS: &[&str] = &["number", "totalLots", "viableLots"];

/// Fields that must be numbers.
const NUMBER_KEYS: &[&str] = &[
    "width",
    "length",
    "area",
    "x",
    "y",
    "totalArea",
    "averageLotArea",
    "landUtilizationPercent",
];

/// Coerce `doc` and decode it. Errors are human-readable reasons.
pub fn decode_plan(doc: Value) -> Result<GeneratedPlan, String> {
    let Value::Object(mut root) = doc else {
        return Err("top-level JSON value is not an object".to_string());
    };

    for (alias, canonical) in TOP_LEVEL_ALIASES {
        if !root.contains_key(*canonical) {
            if let Some(v) = root.remove(*alias) {
                root.insert((*canonical).to_string(), v);
            }
        }
    }

    if let Some(Value::Array(lots)) = root.get_mut("lots") {
        for lot in lots.iter_mut() {
            if let Value::Object(fields) = lot {
                coerce_fields(fields);
                fill_missing_area(fields);
            }
        }
    }
    if let Some(Value::Object(road)) = root.get_mut("roadNetwork") {
        coerce_fields(road);
        if let Some(Value::String(layout)) = road.get_mut("layout") {
            *layout = layout.trim().to_ascii_lowercase().replace([' ', '_'], "-");
        }
    }
    if let Some(Value::Array(amenities)) = root.get_mut("amenities") {
        for amenity in amenities.iter_mut() {
            if let Value::Object(fields) = amenity {
                coerce_fields(fields);
                if let Some(Value::Object(pos)) = fields.get_mut("position") {
                    coerce_fields(pos);
                }
            }
        }
    }
    if let Some(Value::Object(metrics)) = root.get_mut("metrics") {
        coerce_fields(metrics);
        if let Some(Value::Array(invalid)) = metrics.get_mut("invalidLots") {
            for n in invalid.iter_mut() {
                coerce_integer(n);
            }
        }
    }

    serde_json::from_value(Value::Object(root)).map_err(|e| format!("plan does not match schema: {e}"))
}

fn coerce_fields(fields: &mut Map<String, Value>) {
    for (key, value) in fields.iter_mut() {
        if INTEGER_KEYS.contains(&key.as_str()) {
            coerce_integer(value);
        } else if NUMBER_KEYS.contains(&key.as_str()) {
            coerce_number(value);
        }
    }
}

fn coerce_number(value: &mut Value) {
    if let Value::String(s) = value {
        if let Some(n) = s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            *value = Value::Number(n);
        }
    }
}

fn coerce_integer(value: &mut Value) {
    coerce_number(value);
    if let Some(f) = value.as_f64() {
        if value.as_u64().is_none() && f >= 0.0 && f.fract() == 0.0 {
            *value = Value::Number(Number::from(f as u64));
        }
    }
}

fn fill_missing_area(fields: &mut Map<String, Value>) {
    if fields.contains_key("area") {
        return;
    }
    let width = fields.get("width").and_then(Value::as_f64);
    let length = fields.get("length").and_then(Value::as_f64);
    if let (Some(w), Some(l)) = (width, length) {
        if let Some(n) = Number::from_f64(w * l) {
            fields.insert("area".to_string(), Value::Number(n));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use subdiv_db::models::LayoutKind;

    fn canonical() -> Value {
        json!({
            "lots": [
                { "number": 1, "width": 10.0, "length": 12.0, "area": 120.0, "x": 0.0, "y": 0.0 },
                { "number": 2, "width": 10.0, "length": 12.0, "area": 120.0, "x": 10.0, "y": 0.0 }
            ],
            "roadNetwork": { "width": 12.0, "totalArea": 180.0, "layout": "grid" },
            "amenities": [
                { "kind": "green_space", "area": 200.0, "description": "park" }
            ],
            "metrics": {
                "totalLots": 2,
                "viableLots": 2,
                "invalidLots": [],
                "averageLotArea": 120.0,
                "landUtilizationPercent": 72.5
            }
        })
    }

    #[test]
    fn decodes_canonical_document() {
        let plan = decode_plan(canonical()).unwrap();
        assert_eq!(plan.lots.len(), 2);
        assert_eq!(plan.road_network.layout, LayoutKind::Grid);
        assert_eq!(plan.amenities[0].position, None);
        assert_eq!(plan.metrics.total_lots, 2);
    }

    #[test]
    fn repairs_common_model_drift() {
        let doc = json!({
            "units": [
                { "number": "1", "width": "10", "length": 12, "x": 0, "y": 0 },
                { "number": 2.0, "width": 10, "length": 12, "area": 120, "x": 10, "y": 0 }
            ],
            "roads": { "width": 12, "totalArea": "180.5", "layout": "Central Spine" },
            "commonAreas": [
                { "kind": "parking", "area": "80", "position": { "x": "1", "y": 2 } }
            ],
            "metrics": {
                "totalLots": 2.0,
                "viableLots": "2",
                "invalidLots": [3.0],
                "averageLotArea": 120,
                "landUtilizationPercent": "70"
            }
        });
        let plan = decode_plan(doc).unwrap();
        assert_eq!(plan.lots[0].number, 1);
        assert!((plan.lots[0].area - 120.0).abs() < 1e-9);
        assert_eq!(plan.lots[1].number, 2);
        assert_eq!(plan.road_network.layout, LayoutKind::CentralSpine);
        assert!((plan.road_network.total_area - 180.5).abs() < 1e-9);
        assert_eq!(plan.amenities[0].kind, "parking");
        assert_eq!(plan.amenities[0].position.unwrap().x, 1.0);
        assert_eq!(plan.metrics.viable_lots, 2);
        assert_eq!(plan.metrics.invalid_lots, vec![3]);
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let mut doc = canonical();
        doc["units"] = json!([]);
        let plan = decode_plan(doc).unwrap();
        assert_eq!(plan.lots.len(), 2);
    }

    #[test]
    fn missing_metrics_is_rejected() {
        let mut doc = canonical();
        doc.as_object_mut().unwrap().remove("metrics");
        let err = decode_plan(doc).unwrap_err();
        assert!(err.contains("metrics"), "{err}");
    }

    #[test]
    fn unknown_layout_is_rejected() {
        let mut doc = canonical();
        doc["roadNetwork"]["layout"] = json!("spiral");
        assert!(decode_plan(doc).is_err());
    }

    #[test]
    fn non_object_document_is_rejected() {
        let err = decode_plan(json!([1, 2, 3])).unwrap_err();
        assert!(err.contains("not an object"));
    }
}
