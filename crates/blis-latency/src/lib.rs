//! Pure, deterministic step-time models.
//!
//! `stepTime(batch, hardware) -> duration` is a pure function: no
//! randomness, no I/O, identical input implies identical output. One trait,
//! two analytically different cost models, selected by `--model` / config.

use blis_common::{Micros, Result};

pub mod catalog;
pub mod linear;
pub mod roofline;

pub use catalog::HardwareProfile;
pub use linear::LinearLatencyModel;
pub use roofline::RooflineLatencyModel;

/// One simulator step's workload, as handed to the latency model by
/// `InstanceSimulator` after batch formation.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Token counts of each prefilling request in this step (a chunked
    /// prefill contributes only its chunk size, not the full prompt).
    pub prefill_token_counts: Vec<usize>,
    /// Current KV length (tokens already attended to) of each decode
    /// request advancing by one token this step.
    pub decode_kv_lengths: Vec<usize>,
}

impl StepConfig {
    pub fn is_empty(&self) -> bool {
        self.prefill_token_counts.is_empty() && self.decode_kv_lengths.is_empty()
    }

    pub fn total_prefill_tokens(&self) -> usize {
        self.prefill_token_counts.iter().sum()
    }

    pub fn num_decode_requests(&self) -> usize {
        self.decode_kv_lengths.len()
    }
}

/// A pure step-time model. Implementations must never read the clock,
/// generate randomness, or perform I/O: `stepTime` is a mathematical
/// function of its input, full stop.
pub trait LatencyModel: Send + Sync {
    fn step_time(&self, step: &StepConfig) -> Result<Micros>;
}
