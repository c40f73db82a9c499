//! Linear fallback latency model: `beta0 + beta1*prefillTokens +
//! beta2*decodeTokens`, for fast tests where the roofline model's extra
//! precision isn't worth the runtime cost.

use crate::{LatencyModel, StepConfig};
use blis_common::{BlisError, Micros, Result};

#[derive(Debug, Clone, Copy)]
pub struct LinearLatencyModel {
    pub beta0_us: f64,
    pub beta1_us_per_prefill_token: f64,
    pub beta2_us_per_decode_request: f64,
}

impl Default for LinearLatencyModel {
    fn default() -> Self {
        Self {
            beta0_us: 500.0,
            beta1_us_per_prefill_token: 8.0,
            beta2_us_per_decode_request: 15.0,
        }
    }
}

impl LatencyModel for LinearLatencyModel {
    fn step_time(&self, step: &StepConfig) -> Result<Micros> {
        let prefill_tokens = step.total_prefill_tokens() as f64;
        let decode_tokens = step.num_decode_requests() as f64;
        let total = self.beta0_us
            + self.beta1_us_per_prefill_token * prefill_tokens
            + self.beta2_us_per_decode_request * decode_tokens;
        if !total.is_finite() {
            return Err(BlisError::NonFinite(format!(
                "linear latency model produced non-finite step time: {total}"
            )));
        }
        Ok(total.round() as Micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_work_is_beta0() {
        let model = LinearLatencyModel::default();
        let t = model.step_time(&StepConfig::default()).unwrap();
        assert_eq!(t, model.beta0_us.round() as Micros);
    }

    #[test]
    fn mixed_equals_sum_of_components_by_construction() {
        let model = LinearLatencyModel::default();
        let prefill_only = StepConfig {
            prefill_token_counts: vec![100],
            decode_kv_lengths: vec![],
        };
        let decode_only = StepConfig {
            prefill_token_counts: vec![],
            decode_kv_lengths: vec![10, 20, 30],
        };
        let mixed = StepConfig {
            prefill_token_counts: vec![100],
            decode_kv_lengths: vec![10, 20, 30],
        };
        let p = model.step_time(&prefill_only).unwrap();
        let d = model.step_time(&decode_only).unwrap();
        let m = model.step_time(&mixed).unwrap();
        // linear model combines additively, not via max — distinct from the
        // roofline model's combination rule; the linear fallback is
        // intentionally simpler.
        assert_eq!(m, p + d - model.beta0_us.round() as Micros);
    }

    #[test]
    fn deterministic() {
        let model = LinearLatencyModel::default();
        let step = StepConfig {
            prefill_token_counts: vec![50, 75],
            decode_kv_lengths: vec![5],
        };
        let a = model.step_time(&step).unwrap();
        let b = model.step_time(&step).unwrap();
        assert_eq!(a, b);
    }
}
