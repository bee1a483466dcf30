use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum area (sqm) for a lot to count as viable.
pub const MIN_LOT_AREA: f64 = 90.0;

/// Error returned when parsing an enum from its textual form fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Road network layout requested from, or reported by, the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutKind {
    Grid,
    Perimeter,
    #[serde(alias = "central_spine", alias = "centralSpine")]
    CentralSpine,
    Loop,
}

impl LayoutKind {
    pub const ALL: [LayoutKind; 4] = [
        LayoutKind::Grid,
        LayoutKind::Perimeter,
        LayoutKind::CentralSpine,
        LayoutKind::Loop,
    ];
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Grid => "grid",
            Self::Perimeter => "perimeter",
            Self::CentralSpine => "central-spine",
            Self::Loop => "loop",
        };
        f.write_str(s)
    }
}

impl FromStr for LayoutKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grid" => Ok(Self::Grid),
            "perimeter" => Ok(Self::Perimeter),
            "central-spine" | "central_spine" => Ok(Self::CentralSpine),
            "loop" => Ok(Self::Loop),
            other => Err(ParseEnumError::new("layout kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Optimization narrative appended to the base generation instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Fit as many viable lots as possible.
    MaximizeLots,
    /// Fewer, more generous lots.
    LargerLots,
    Balanced,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MaximizeLots => "maximize-lots",
            Self::LargerLots => "larger-lots",
            Self::Balanced => "balanced",
        };
        f.write_str(s)
    }
}

impl FromStr for Strategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maximize-lots" => Ok(Self::MaximizeLots),
            "larger-lots" => Ok(Self::LargerLots),
            "balanced" => Ok(Self::Balanced),
            other => Err(ParseEnumError::new("strategy", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome of the generation call backing a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Completed,
    Failed,
    Rejected,
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for GenerationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(ParseEnumError::new("generation status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Summary of the business-rule validation applied to a generated plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Warnings,
    Invalid,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Valid => "valid",
            Self::Warnings => "warnings",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

impl FromStr for ValidationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "warnings" => Ok(Self::Warnings),
            "invalid" => Ok(Self::Invalid),
            other => Err(ParseEnumError::new("validation status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Whether a candidate currently governs its project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Inactive,
    Active,
    Archived,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for Activation {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError::new("activation", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Why a generation ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    QuotaExhausted,
    TransientCall,
    FatalCall,
    /// The stream broke after output had started arriving.
    Interrupted,
    Truncated,
    Malformed,
    Timeout,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::TransientCall => "transient_call",
            Self::FatalCall => "fatal_call",
            Self::Interrupted => "interrupted",
            Self::Truncated => "truncated",
            Self::Malformed => "malformed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Generation request
// ---------------------------------------------------------------------------

/// Parameters of one generation call. Immutable once issued; stored on the
/// candidate so the exact call can be reproduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Land width in metres.
    pub land_width: f64,
    /// Land length in metres.
    pub land_length: f64,
    /// Land area in square metres.
    pub land_area: f64,
    /// Share of the land reserved for amenity areas, in percent.
    pub amenity_percent: f64,
    #[serde(default)]
    pub target_lots: Option<u32>,
    /// Free-text locale context (city, zoning notes).
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Replaces the generated prompt entirely when set.
    #[serde(default)]
    pub prompt_override: Option<String>,
    #[serde(default)]
    pub road_layout: Option<LayoutKind>,
    /// Preferred lot width / length ratio.
    #[serde(default)]
    pub lot_aspect_ratio: Option<f64>,
}

impl GenerationRequest {
    /// A request with only the land dimensions and amenity share set.
    pub fn new(land_width: f64, land_length: f64, amenity_percent: f64) -> Self {
        Self {
            land_width,
            land_length,
            land_area: land_width * land_length,
            amenity_percent,
            target_lots: None,
            locale: None,
            strategy: None,
            prompt_override: None,
            road_layout: None,
            lot_aspect_ratio: None,
        }
    }

    /// Amenity area (sqm) implied by `land_area * amenity_percent / 100`.
    pub fn expected_amenity_area(&self) -> f64 {
        self.land_area * self.amenity_percent / 100.0
    }
}

// ---------------------------------------------------------------------------
// Generated plan
// ---------------------------------------------------------------------------

/// A single subdividable lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lot {
    pub number: u32,
    pub width: f64,
    pub length: f64,
    pub area: f64,
    pub x: f64,
    pub y: f64,
}

impl Lot {
    pub fn is_viable(&self) -> bool {
        self.area >= MIN_LOT_AREA
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadNetwork {
    pub width: f64,
    pub total_area: f64,
    pub layout: LayoutKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A non-lot area serving a collective purpose (club, parking, green space).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmenityArea {
    pub kind: String,
    pub area: f64,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub description: String,
}

/// Metrics as self-reported by the model. Never trusted without the
/// consistency check in the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetrics {
    pub total_lots: u32,
    pub viable_lots: u32,
    #[serde(default)]
    pub invalid_lots: Vec<u32>,
    pub average_lot_area: f64,
    pub land_utilization_percent: f64,
}

/// Parsed structured output of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPlan {
    pub lots: Vec<Lot>,
    pub road_network: RoadNetwork,
    #[serde(default)]
    pub amenities: Vec<AmenityArea>,
    pub metrics: PlanMetrics,
}

impl GeneratedPlan {
    /// Count of lots meeting [`MIN_LOT_AREA`], computed from the lot list.
    pub fn computed_viable_lots(&self) -> u32 {
        self.lots.iter().filter(|l| l.is_viable()).count() as u32
    }

    /// Numbers of the lots below [`MIN_LOT_AREA`], in plan order.
    pub fn computed_invalid_lots(&self) -> Vec<u32> {
        self.lots
            .iter()
            .filter(|l| !l.is_viable())
            .map(|l| l.number)
            .collect()
    }

    pub fn total_amenity_area(&self) -> f64 {
        self.amenities.iter().map(|a| a.area).sum()
    }

    /// Combined area of the viable lots.
    pub fn viable_lot_area(&self) -> f64 {
        self.lots
            .iter()
            .filter(|l| l.is_viable())
            .map(|l| l.area)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// Token counters reported by the generation backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Terminal failure details for a candidate whose generation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// One generated (or attempted) plan instance for a project.
///
/// Candidates are never deleted; rejected and superseded ones stay in the
/// store as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub project_id: String,
    /// Set when the candidate was produced as part of a multi-variant batch.
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    #[serde(default)]
    pub variant_index: Option<u32>,
    pub request: GenerationRequest,
    /// SHA-256 (hex) of the prompt text sent for this candidate.
    #[serde(default)]
    pub prompt_fingerprint: Option<String>,
    #[serde(default)]
    pub plan: Option<GeneratedPlan>,
    pub generation_status: GenerationStatus,
    #[serde(default)]
    pub validation_status: Option<ValidationStatus>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
    pub approved: bool,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    /// A retried attempt may have been billed twice by the backend.
    #[serde(default)]
    pub possibly_duplicated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Candidate {
    /// Build a fresh `pending` candidate for a generation about to start.
    pub fn pending(project_id: impl Into<String>, request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            batch_id: None,
            variant_index: None,
            request,
            prompt_fingerprint: None,
            plan: None,
            generation_status: GenerationStatus::Pending,
            validation_status: None,
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
            approved: false,
            approved_at: None,
            rejection_reason: None,
            activation: Activation::Inactive,
            failure: None,
            usage: TokenUsage::default(),
            estimated_cost: None,
            duration_ms: None,
            retry_count: 0,
            possibly_duplicated: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.activation == Activation::Active
    }

    pub fn is_archived(&self) -> bool {
        self.activation == Activation::Archived
    }
}
