//! Business-rule validation of a generated plan.
//!
//! Every rule runs on every plan; nothing short-circuits, so the caller sees
//! all problems at once. Validation never fails as an error: the outcome is
//! always a [`ValidationReport`].

use std::fmt;

use serde::{Deserialize, Serialize};
use subdiv_db::models::{GeneratedPlan, MIN_LOT_AREA, ValidationStatus};

/// Thresholds applied by [`validate_with`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Lots below this area (sqm) are errors.
    pub min_lot_area: f64,
    /// Lots at or above the minimum but below this area are warnings.
    pub warn_lot_area: f64,
    /// Amenity deviation (percent of expected) above which a warning is raised.
    pub amenity_warn_deviation_percent: f64,
    /// Amenity deviation (percent of expected) above which an error is raised.
    pub amenity_error_deviation_percent: f64,
    /// Road area (percent of land) above which a warning is raised.
    pub max_road_area_percent: f64,
    /// Land utilization (percent) below which a warning is raised.
    pub min_utilization_percent: f64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_lot_area: MIN_LOT_AREA,
            warn_lot_area: 95.0,
            amenity_warn_deviation_percent: 5.0,
            amenity_error_deviation_percent: 15.0,
            max_road_area_percent: 25.0,
            min_utilization_percent: 70.0,
        }
    }
}

/// Which rule produced an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    MinLotArea,
    LotAreaMargin,
    AmenityArea,
    RoadArea,
    LandUtilization,
    MetricsConsistency,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MinLotArea => "min_lot_area",
            Self::LotAreaMargin => "lot_area_margin",
            Self::AmenityArea => "amenity_area",
            Self::RoadArea => "road_area",
            Self::LandUtilization => "land_utilization",
            Self::MetricsConsistency => "metrics_consistency",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub rule: Rule,
    pub message: String,
    /// Lot numbers the issue refers to, if any.
    #[serde(default)]
    pub lots: Vec<u32>,
}

impl ValidationIssue {
    fn new(rule: Rule, message: String) -> Self {
        Self {
            rule,
            message,
            lots: Vec::new(),
        }
    }

    fn with_lots(mut self, lots: Vec<u32>) -> Self {
        self.lots = lots;
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// `errors.is_empty()`; warnings never affect it.
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn status(&self) -> ValidationStatus {
        if !self.errors.is_empty() {
            ValidationStatus::Invalid
        } else if !self.warnings.is_empty() {
            ValidationStatus::Warnings
        } else {
            ValidationStatus::Valid
        }
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }
}

/// Validate with the default thresholds.
pub fn validate(plan: &GeneratedPlan, input_area: f64, input_amenity_percent: f64) -> ValidationReport {
    validate_with(plan, input_area, input_amenity_percent, &ValidationRules::default())
}

pub fn validate_with(
    plan: &GeneratedPlan,
    input_area: f64,
    input_amenity_percent: f64,
    rules: &ValidationRules,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // 1. Lots below the minimum area.
    let undersized: Vec<u32> = plan
        .lots
        .iter()
        .filter(|l| l.area < rules.min_lot_area)
        .map(|l| l.number)
        .collect();
    if !undersized.is_empty() {
        errors.push(
            ValidationIssue::new(
                Rule::MinLotArea,
                format!(
                    "{} lot(s) below the minimum of {:.0} sqm: {}",
                    undersized.len(),
                    rules.min_lot_area,
                    join_numbers(&undersized)
                ),
            )
            .with_lots(undersized),
        );
    }

    // 2. Lots just above the minimum.
    let marginal: Vec<u32> = plan
        .lots
        .iter()
        .filter(|l| l.area >= rules.min_lot_area && l.area < rules.warn_lot_area)
        .map(|l| l.number)
        .collect();
    if !marginal.is_empty() {
        warnings.push(
            ValidationIssue::new(
                Rule::LotAreaMargin,
                format!(
                    "{} lot(s) between {:.0} and {:.0} sqm: {}",
                    marginal.len(),
                    rules.min_lot_area,
                    rules.warn_lot_area,
                    join_numbers(&marginal)
                ),
            )
            .with_lots(marginal),
        );
    }

    // 3. Amenity area against the requested share.
    let expected_amenity = input_area * input_amenity_percent / 100.0;
    if expected_amenity > 0.0 {
        let actual = plan.total_amenity_area();
        let deviation = (actual - expected_amenity).abs() / expected_amenity * 100.0;
        let message = format!(
            "amenity area {actual:.2} sqm deviates {deviation:.1}% from the expected {expected_amenity:.2} sqm"
        );
        if deviation > rules.amenity_error_deviation_percent {
            errors.push(ValidationIssue::new(Rule::AmenityArea, message));
        } else if deviation > rules.amenity_warn_deviation_percent {
            warnings.push(ValidationIssue::new(Rule::AmenityArea, message));
        }
    }

    // 4. Road network share (advisory).
    if input_area > 0.0 {
        let road_percent = plan.road_network.total_area / input_area * 100.0;
        if road_percent > rules.max_road_area_percent {
            warnings.push(ValidationIssue::new(
                Rule::RoadArea,
                format!(
                    "road network uses {road_percent:.1}% of the land (max {:.0}%)",
                    rules.max_road_area_percent
                ),
            ));
        }
    }

    // 5. Land utilization.
    if plan.metrics.land_utilization_percent < rules.min_utilization_percent {
        warnings.push(ValidationIssue::new(
            Rule::LandUtilization,
            format!(
                "land utilization {:.1}% is below {:.0}%",
                plan.metrics.land_utilization_percent, rules.min_utilization_percent
            ),
        ));
    }

    // 6. Self-reported metrics must match the lot list.
    let actual_total = plan.lots.len() as u32;
    if plan.metrics.total_lots != actual_total {
        errors.push(ValidationIssue::new(
            Rule::MetricsConsistency,
            format!(
                "metrics report {} lots but the plan contains {actual_total}",
                plan.metrics.total_lots
            ),
        ));
    }
    let actual_viable = plan
        .lots
        .iter()
        .filter(|l| l.area >= rules.min_lot_area)
        .count() as u32;
    if plan.metrics.viable_lots != actual_viable {
        errors.push(ValidationIssue::new(
            Rule::MetricsConsistency,
            format!(
                "metrics report {} viable lots but {actual_viable} meet the minimum area",
                plan.metrics.viable_lots
            ),
        ));
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn join_numbers(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
