//! Hardware/model profile catalog selected by `--model <id>`.
//!
//! Profiles are embedded YAML, parsed once and looked up by id, with the
//! source baked into the binary instead of read from disk, since the
//! catalog is a fixed part of the simulator rather than per-deployment
//! operator config.

use blis_common::{BlisError, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;

/// Tunables for the piecewise-roofline latency model plus the model shape
/// parameters needed to turn a token count into FLOPs and bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareProfile {
    pub id: String,
    pub peak_tflops: f64,
    pub peak_bandwidth_tbs: f64,
    #[serde(default = "default_bw_efficiency_factor")]
    pub bw_efficiency_factor: f64,
    pub per_layer_overhead_us: f64,
    #[serde(default = "default_activation_mem_factor")]
    pub activation_mem_factor: f64,
    pub num_layers: u64,
    pub num_params_billion: f64,
    pub dtype_bytes: f64,
    pub kv_bytes_per_token: f64,
}

fn default_bw_efficiency_factor() -> f64 {
    0.82
}

fn default_activation_mem_factor() -> f64 {
    0.75
}

impl HardwareProfile {
    pub fn validate(&self) -> Result<()> {
        let fields: [(&str, f64); 7] = [
            ("peak_tflops", self.peak_tflops),
            ("peak_bandwidth_tbs", self.peak_bandwidth_tbs),
            ("bw_efficiency_factor", self.bw_efficiency_factor),
            ("per_layer_overhead_us", self.per_layer_overhead_us),
            ("activation_mem_factor", self.activation_mem_factor),
            ("num_params_billion", self.num_params_billion),
            ("kv_bytes_per_token", self.kv_bytes_per_token),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(BlisError::Validation(format!(
                    "hardware profile {}: field {name} must be finite and non-negative, got {value}",
                    self.id
                )));
            }
        }
        if self.bw_efficiency_factor > 1.0 || self.activation_mem_factor > 1.0 {
            tracing::warn!(
                target: "blis_latency::catalog",
                "hardware profile {}: bw_efficiency_factor={} activation_mem_factor={} outside the usual (0,1] range",
                self.id,
                self.bw_efficiency_factor,
                self.activation_mem_factor
            );
        }
        Ok(())
    }
}

const CATALOG_YAML: &str = include_str!("catalog_data.yaml");

static CATALOG: Lazy<HashMap<String, HardwareProfile>> = Lazy::new(|| {
    let profiles: Vec<HardwareProfile> =
        serde_yaml::from_str(CATALOG_YAML).expect("embedded hardware catalog must parse");
    profiles.into_iter().map(|p| (p.id.clone(), p)).collect()
});

/// Look up a hardware profile by the `--model` id. Returns `ErrValidation`
/// (as a `BlisError::Validation`) for an unknown id, so the CLI fails fast
/// before building anything.
pub fn lookup(model_id: &str) -> Result<HardwareProfile> {
    CATALOG
        .get(model_id)
        .cloned()
        .ok_or_else(|| {
            let known: Vec<&str> = CATALOG.keys().map(String::as_str).collect();
            BlisError::Validation(format!(
                "unknown --model '{model_id}', known models: {known:?}"
            ))
        })
        .and_then(|p| {
            p.validate()?;
            Ok(p)
        })
}
