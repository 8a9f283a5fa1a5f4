//! Confidence scoring for harvested patterns.
//!
//! Confidence is always recomputed from the full observation set. Each rating
//! is normalized to `s = (rating - 1) / 4`, weighted by recency with an
//! exponential half-life (the newest observation has weight 1), and the
//! weighted mean is blended with a neutral prior of 0.5:
//!
//! ```text
//! w_i  = 0.5 ^ ((n - 1 - i) / half_life)        i = 0 is the oldest
//! m    = sum(w_i * s_i) / sum(w_i)
//! conf = (n * m + k * 0.5) / (n + k)
//! ```
//!
//! The prior's share `k / (n + k)` shrinks as evidence accumulates, so one
//! observation never produces certainty while a long run of identical
//! ratings converges on them.

use serde::{Deserialize, Serialize};

pub const NEUTRAL_PRIOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceParams {
    /// Observations this many positions back count half as much as the newest.
    pub half_life: f64,
    /// Pseudo-observation count given to the neutral prior.
    pub prior_weight: f64,
}

impl Default for ConfidenceParams {
    fn default() -> Self {
        Self {
            half_life: 5.0,
            prior_weight: 2.0,
        }
    }
}

/// Normalizes a 1..=5 rating to [0, 1].
pub fn normalize_rating(rating: u8) -> f64 {
    (f64::from(rating.clamp(1, 5)) - 1.0) / 4.0
}

/// Confidence for ratings ordered oldest to newest. `None` without ratings.
pub fn compute_confidence(ratings: &[u8], params: &ConfidenceParams) -> Option<f64> {
    if ratings.is_empty() {
        return None;
    }

    let n = ratings.len();
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (i, rating) in ratings.iter().enumerate() {
        let age = (n - 1 - i) as f64;
        let weight = if params.half_life > 0.0 {
            0.5_f64.powf(age / params.half_life)
        } else {
            1.0
        };
        weighted_sum += weight * normalize_rating(*rating);
        weight_total += weight;
    }
    let mean = if weight_total > 0.0 { weighted_sum / weight_total } else { NEUTRAL_PRIOR };

    let n = n as f64;
    let k = params.prior_weight.max(0.0);
    let confidence = (n * mean + k * NEUTRAL_PRIOR) / (n + k);
    Some(confidence.clamp(0.0, 1.0))
}
