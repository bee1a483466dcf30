//! Tunables for [`crate::pipeline::Pipeline`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::validate::ValidationRules;
use crate::variants::VariationAxes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub validation: ValidationRules,
    pub variation: VariationAxes,
    /// Maximum number of batch variants generated concurrently.
    pub fan_out: usize,
    /// Upper bound on a single attempt, stream included.
    pub attempt_timeout_secs: u64,
    /// Sale price per sqm of viable lot area, for revenue estimates in
    /// rankings.
    pub price_per_area: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            validation: ValidationRules::default(),
            variation: VariationAxes::default(),
            fan_out: 3,
            attempt_timeout_secs: 120,
            price_per_area: None,
        }
    }
}

impl PipelineConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }
}
