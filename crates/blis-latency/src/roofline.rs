//! Piecewise roofline latency model.
//!
//! Computes a prefill component and a decode component independently, each
//! as `max(compute-bound time, memory-bound time)` against the hardware's
//! peak FLOPs and peak bandwidth, then combines the two components with
//! `max(prefill, decode)` — never a convex combination. Because each
//! component depends only on its own half of the `StepConfig`,
//! `stepTime(mixed) == max(stepTime(prefill-only), stepTime(decode-only))`
//! holds by construction.

use crate::{HardwareProfile, LatencyModel, StepConfig};
use blis_common::{BlisError, Micros, Result};

#[derive(Debug, Clone)]
pub struct RooflineLatencyModel {
    pub hardware: HardwareProfile,
}

impl RooflineLatencyModel {
    pub fn new(hardware: HardwareProfile) -> Self {
        Self { hardware }
    }

    /// FLOPs for a forward pass over `num_tokens` tokens: the standard
    /// `2 * params * tokens` approximation for a single transformer
    /// forward pass (multiply-accumulate counted as 2 FLOPs).
    fn flops_for_tokens(&self, num_tokens: f64) -> f64 {
        2.0 * self.hardware.num_params_billion * 1e9 * num_tokens
    }

    /// Bytes that must move from HBM to read the full parameter set once
    /// (the dominant memory traffic for a batched forward pass, prefill or
    /// decode alike — KV-cache bytes are added on top for decode, where
    /// they are not amortized across a large token count the way weight
    /// reads are).
    fn weight_bytes(&self) -> f64 {
        self.hardware.num_params_billion * 1e9 * self.hardware.dtype_bytes
    }

    fn per_layer_overhead_us(&self) -> f64 {
        self.hardware.per_layer_overhead_us * self.hardware.num_layers as f64
    }

    fn effective_bandwidth_bytes_per_sec(&self) -> f64 {
        self.hardware.peak_bandwidth_tbs * 1e12 * self.hardware.bw_efficiency_factor
    }

    fn peak_flops_per_sec(&self) -> f64 {
        self.hardware.peak_tflops * 1e12
    }

    /// Prefill component: compute-bound vs memory-bound time to process
    /// `total_prefill_tokens` new prompt tokens across all prefilling
    /// requests in this step, plus fixed per-layer overhead.
    fn prefill_component_us(&self, total_prefill_tokens: usize) -> f64 {
        if total_prefill_tokens == 0 {
            return 0.0;
        }
        let tokens = total_prefill_tokens as f64;
        let compute_s = self.flops_for_tokens(tokens) / self.peak_flops_per_sec();
        let mem_s = (self.weight_bytes() * self.hardware.activation_mem_factor)
            / self.effective_bandwidth_bytes_per_sec();
        let compute_us = compute_s * 1e6;
        let mem_us = mem_s * 1e6;
        compute_us.max(mem_us) + self.per_layer_overhead_us()
    }

    /// Decode component: one token per decode request, memory-bound on
    /// weight reads (amortized once per batched step) plus KV-cache reads
    /// proportional to each request's current KV length.
    fn decode_component_us(&self, decode_kv_lengths: &[usize]) -> f64 {
        if decode_kv_lengths.is_empty() {
            return 0.0;
        }
        let num_decode = decode_kv_lengths.len() as f64;
        let compute_s = self.flops_for_tokens(num_decode) / self.peak_flops_per_sec();
        let kv_bytes: f64 = decode_kv_lengths
            .iter()
            .map(|&kv_len| kv_len as f64 * self.hardware.kv_bytes_per_token)
            .sum();
        let mem_bytes = self.weight_bytes() + kv_bytes;
        let mem_s = mem_bytes / self.effective_bandwidth_bytes_per_sec();
        let compute_us = compute_s * 1e6;
        let mem_us = mem_s * 1e6;
        compute_us.max(mem_us) + self.per_layer_overhead_us()
    }
}

impl LatencyModel for RooflineLatencyModel {
    fn step_time(&self, step: &StepConfig) -> Result<Micros> {
        let prefill_us = self.prefill_component_us(step.total_prefill_tokens());
        let decode_us = self.decode_component_us(&step.decode_kv_lengths);
        let total_us = prefill_us.max(decode_us);
        if !total_us.is_finite() {
            return Err(BlisError::NonFinite(format!(
                "roofline latency model produced non-finite step time: {total_us}"
            )));
        }
        Ok(total_us.round() as Micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    fn model() -> RooflineLatencyModel {
        RooflineLatencyModel::new(catalog::lookup("llama-3.1-8b").unwrap())
    }

    #[test]
    fn empty_step_is_zero() {
        let m = model();
        let t = m.step_time(&StepConfig::default()).unwrap();
        assert_eq!(t, 0);
    }

    #[test]
    fn mixed_equals_max_of_components() {
        let m = model();
        let prefill_only = StepConfig {
            prefill_token_counts: vec![512, 256],
            decode_kv_lengths: vec![],
        };
        let decode_only = StepConfig {
            prefill_token_counts: vec![],
            decode_kv_lengths: vec![100, 200, 300, 400],
        };
        let mixed = StepConfig {
            prefill_token_counts: vec![512, 256],
            decode_kv_lengths: vec![100, 200, 300, 400],
        };
        let p = m.step_time(&prefill_only).unwrap();
        let d = m.step_time(&decode_only).unwrap();
        let mx = m.step_time(&mixed).unwrap();
        assert_eq!(mx, p.max(d));
    }

    #[test]
    fn deterministic_given_identical_input() {
        let m = model();
        let step = StepConfig {
            prefill_token_counts: vec![128],
            decode_kv_lengths: vec![64, 128],
        };
        assert_eq!(m.step_time(&step).unwrap(), m.step_time(&step).unwrap());
    }

    #[test]
    fn more_prefill_tokens_never_decreases_prefill_component() {
        let m = model();
        let small = StepConfig {
            prefill_token_counts: vec![64],
            decode_kv_lengths: vec![],
        };
        let large = StepConfig {
            prefill_token_counts: vec![4096],
            decode_kv_lengths: vec![],
        };
        assert!(m.step_time(&large).unwrap() >= m.step_time(&small).unwrap());
    }
}
