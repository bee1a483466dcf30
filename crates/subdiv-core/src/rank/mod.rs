//! Weighted composite ranking of candidates.
//!
//! Rankings are derived data: they are recomputed from the candidates every
//! time and never stored.

use serde::Serialize;
use subdiv_db::models::{Candidate, GeneratedPlan, ValidationStatus};
use uuid::Uuid;

const W_VIABLE: f64 = 0.4;
const W_UTILIZATION: f64 = 0.3;
const W_ROAD: f64 = 0.2;
const W_AVERAGE_AREA: f64 = 0.001;

/// Tolerance when comparing a metric against the set maximum/minimum.
const EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum RankError {
    #[error("candidate {0} has no generated plan to rank")]
    MissingPlan(Uuid),
}

/// Metric values the score was computed from.
///
/// Lot counts come from the lot list, not from the plan's self-reported
/// metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_lots: u32,
    pub viable_lots: u32,
    pub invalid_lots: Vec<u32>,
    pub average_lot_area: f64,
    pub land_utilization_percent: f64,
    pub road_area_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    pub candidate_id: Uuid,
    /// 1 = best.
    pub rank: u32,
    pub score: f64,
    pub metrics: MetricsSnapshot,
    /// Viable lot area times the price per sqm, when a price was given.
    pub estimated_revenue: Option<f64>,
    pub highlights: Vec<String>,
    pub concerns: Vec<String>,
}

impl MetricsSnapshot {
    fn of(plan: &GeneratedPlan, input_area: f64) -> Self {
        let road_area_percent = if input_area > 0.0 {
            plan.road_network.total_area / input_area * 100.0
        } else {
            0.0
        };
        Self {
            total_lots: plan.lots.len() as u32,
            viable_lots: plan.computed_viable_lots(),
            invalid_lots: plan.computed_invalid_lots(),
            average_lot_area: plan.metrics.average_lot_area,
            land_utilization_percent: plan.metrics.land_utilization_percent,
            road_area_percent,
        }
    }
}

/// `0.4*viable + 0.3*utilization + 0.2*(100 - road%) + 0.001*average_area`.
pub fn composite_score(m: &MetricsSnapshot) -> f64 {
    W_VIABLE * f64::from(m.viable_lots)
        + W_UTILIZATION * m.land_utilization_percent
        + W_ROAD * (100.0 - m.road_area_percent)
        + W_AVERAGE_AREA * m.average_lot_area
}

/// Score and order `candidates`, best first.
///
/// Equal scores keep their input order. Every candidate must carry a plan;
/// the result is always a permutation of the input ids with ranks `1..=N`.
pub fn rank(
    candidates: &[Candidate],
    input_area: f64,
    price_per_area: Option<f64>,
) -> Result<Vec<Ranking>, RankError> {
    let mut scored = Vec::with_capacity(candidates.len());
    for c in candidates {
        let plan = c.plan.as_ref().ok_or(RankError::MissingPlan(c.id))?;
        let metrics = MetricsSnapshot::of(plan, input_area);
        let revenue = price_per_area.map(|price| plan.viable_lot_area() * price);
        scored.push(Scored {
            id: c.id,
            score: composite_score(&metrics),
            metrics,
            revenue,
            has_warnings: c.validation_status == Some(ValidationStatus::Warnings),
        });
    }

    let bounds = Bounds::of(&scored);

    let mut rankings: Vec<Ranking> = scored
        .iter()
        .map(|s| {
            let (highlights, concerns) = bounds.describe(s);
            Ranking {
                candidate_id: s.id,
                rank: 0,
                score: s.score,
                metrics: s.metrics.clone(),
                estimated_revenue: s.revenue,
                highlights,
                concerns,
            }
        })
        .collect();

    // `sort_by` is stable, which is what gives ties their input order.
    rankings.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (i, r) in rankings.iter_mut().enumerate() {
        r.rank = i as u32 + 1;
    }
    Ok(rankings)
}

struct Scored {
    id: Uuid,
    score: f64,
    metrics: MetricsSnapshot,
    revenue: Option<f64>,
    has_warnings: bool,
}

/// Min/max of each metric across the full candidate set.
struct Bounds {
    viable: (f64, f64),
    utilization: (f64, f64),
    road: (f64, f64),
    average: (f64, f64),
    revenue: Option<f64>,
}

impl Bounds {
    fn of(scored: &[Scored]) -> Self {
        fn span(values: impl Iterator<Item = f64>) -> (f64, f64) {
            values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            })
        }
        Self {
            viable: span(scored.iter().map(|s| f64::from(s.metrics.viable_lots))),
            utilization: span(scored.iter().map(|s| s.metrics.land_utilization_percent)),
            road: span(scored.iter().map(|s| s.metrics.road_area_percent)),
            average: span(scored.iter().map(|s| s.metrics.average_lot_area)),
            revenue: scored
                .iter()
                .filter_map(|s| s.revenue)
                .max_by(f64::total_cmp),
        }
    }

    fn describe(&self, s: &Scored) -> (Vec<String>, Vec<String>) {
        let m = &s.metrics;
        let mut highlights = Vec::new();
        let mut concerns = Vec::new();

        let viable = f64::from(m.viable_lots);
        if eq(viable, self.viable.1) {
            highlights.push("maximizes lot count".to_string());
        }
        if eq(m.land_utilization_percent, self.utilization.1) {
            highlights.push("best land utilization".to_string());
        }
        if eq(m.road_area_percent, self.road.0) {
            highlights.push("most compact road network".to_string());
        }
        if eq(m.average_lot_area, self.average.1) {
            highlights.push("largest average lot".to_string());
        }
        if let (Some(revenue), Some(best)) = (s.revenue, self.revenue) {
            if eq(revenue, best) {
                highlights.push("highest estimated revenue".to_string());
            }
        }

        // A metric only counts as a concern when the set actually differs on it.
        if differs(self.viable) && eq(viable, self.viable.0) {
            concerns.push("fewest viable lots".to_string());
        }
        if differs(self.utilization) && eq(m.land_utilization_percent, self.utilization.0) {
            concerns.push("lowest land utilization".to_string());
        }
        if differs(self.road) && eq(m.road_area_percent, self.road.1) {
            concerns.push("largest road network".to_string());
        }
        if differs(self.average) && eq(m.average_lot_area, self.average.0) {
            concerns.push("smallest average lot".to_string());
        }
        if !m.invalid_lots.is_empty() {
            concerns.push(format!("{} lot(s) below minimum area", m.invalid_lots.len()));
        }
        if s.has_warnings {
            concerns.push("has validation warnings".to_string());
        }

        (highlights, concerns)
    }
}

fn eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPSILON
}

fn differs((lo, hi): (f64, f64)) -> bool {
    hi - lo > EPSILON
}
