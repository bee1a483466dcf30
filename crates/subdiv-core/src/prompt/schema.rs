use serde_json::{Value, json};

/// JSON schema for the generated plan document, sent alongside the prompt
/// to backends that support schema-constrained output.
pub fn response_schema() -> Value {
    let number = json!({ "type": "number" });
    let integer = json!({ "type": "integer" });

    json!({
        "type": "object",
        "required": ["lots", "roadNetwork", "amenities", "metrics"],
        "properties": {
            "lots": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["number", "width", "length", "area", "x", "y"],
                    "properties": {
                        "number": integer,
                        "width": number,
                        "length": number,
                        "area": number,
                        "x": number,
                        "y": number
                    }
                }
            },
            "roadNetwork": {
                "type": "object",
                "required": ["width", "totalArea", "layout"],
                "properties": {
                    "width": number,
                    "totalArea": number,
                    "layout": {
                        "type": "string",
                        "enum": ["grid", "perimeter", "central-spine", "loop"]
                    }
                }
            },
            "amenities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["kind", "area"],
                    "properties": {
                        "kind": { "type": "string" },
                        "area": number,
                        "position": {
                            "type": "object",
                            "properties": { "x": number, "y": number }
                        },
                        "description": { "type": "string" }
                    }
                }
            },
            "metrics": {
                "type": "object",
                "required": [
                    "totalLots",
                    "viableLots",
                    "invalidLots",
                    "averageLotArea",
                    "landUtilizationPercent"
                ],
                "properties": {
                    "totalLots": integer,
                    "viableLots": integer,
                    "invalidLots": { "type": "array", "items": integer },
                    "averageLotArea": number,
                    "landUtilizationPercent": number
                }
            }
        }
    })
}
