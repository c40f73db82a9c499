//! Shared error taxonomy, id/time newtypes, and deterministic hashing for BLIS.
//!
//! Every other crate in the workspace depends on this one and nothing here
//! depends back on them, so it is safe to pull in from `blis-latency` and
//! `blis-core` alike without creating a cycle.

pub type Result<T> = core::result::Result<T, BlisError>;

/// Simulated time, in integer microseconds. Never negative in practice; kept
/// signed so clock-regression arithmetic can't underflow silently.
pub type Micros = i64;

/// Monotonic KV page identifier, unique for the lifetime of a single run.
pub type BlockId = u64;

/// Monotonic request identifier, assigned by `WorkloadSource` at arrival time.
pub type RequestId = u64;

/// Index of an `InstanceSimulator` within `ClusterSimulator`'s instance arena.
pub type InstanceId = usize;

/// The error taxonomy of the simulator (see the source spec's Error Handling
/// Design section). Validation errors abort before a run starts;
/// `OutOfBlocks` is expected and handled internally by the scheduler;
/// `ClockRegression`, `NonFinite`, and `Underflow` are contract violations
/// that abort the run; `WorkloadExhausted` is normal termination. Library
/// code only ever returns these — it never calls `std::process::exit` or
/// `panic!` to enforce them; that's `blis-cli`'s job.
#[derive(thiserror::Error, Debug)]
pub enum BlisError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("out of KV blocks")]
    OutOfBlocks,

    #[error("clock regression: popped event at {popped} but clock was already at {clock}")]
    ClockRegression { clock: Micros, popped: Micros },

    #[error("non-finite value produced: {0}")]
    NonFinite(String),

    #[error("event queue underflow: pop on empty queue")]
    Underflow,

    #[error("workload source exhausted")]
    WorkloadExhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BlisError {
    /// Whether this error represents a contract violation that must abort
    /// the run with a non-zero exit code, as opposed to an expected runtime
    /// condition (`OutOfBlocks`) or normal termination (`WorkloadExhausted`).
    pub fn is_fatal_bug(&self) -> bool {
        matches!(
            self,
            BlisError::ClockRegression { .. } | BlisError::NonFinite(_) | BlisError::Underflow
        )
    }
}

/// A small, dependency-free, version-stable 64-bit hash (FNV-1a). Used
/// anywhere the simulator needs a deterministic hash across Rust toolchain
/// versions — `std::collections::hash_map::DefaultHasher`'s algorithm is
/// explicitly *not* guaranteed stable across releases, which would silently
/// break seed reproducibility for users who upgrade their compiler between
/// runs.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Combine two hash-sized values deterministically. Used to derive RNG
/// partitions and block content hashes from multiple fields without
/// allocating an intermediate `String`.
pub fn hash_combine(parts: &[&[u8]]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for part in parts {
        for &b in *part {
            hash ^= b as u64;
            hash = hash.wrapping_mul(PRIME);
        }
        // separator so ("ab","c") and ("a","bc") hash differently
        hash ^= 0xff;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Process-wide defaults, overridable by environment variables: a config
/// struct with a hard-coded `Default`, overridden field-by-field by `BLIS_*`
/// variables for callers that invoke the CLI from a wrapper script without
/// repeating every flag.
pub mod defaults {
    use std::env;

    #[derive(Debug, Clone)]
    pub struct Defaults {
        pub log_level: String,
        pub counterfactual_k: usize,
        pub trace_level: String,
    }

    impl Default for Defaults {
        fn default() -> Self {
            Self {
                log_level: "error".to_string(),
                counterfactual_k: 3,
                trace_level: "none".to_string(),
            }
        }
    }

    impl Defaults {
        pub fn load() -> Self {
            let mut cfg = Self::default();
            if let Ok(v) = env::var("BLIS_LOG") {
                cfg.log_level = v;
            }
            if let Some(v) = env::var("BLIS_COUNTERFACTUAL_K")
                .ok()
                .and_then(|v| v.parse().ok())
            {
                cfg.counterfactual_k = v;
            }
            if let Ok(v) = env::var("BLIS_TRACE_LEVEL") {
                cfg.trace_level = v;
            }
            cfg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a64_is_deterministic() {
        assert_eq!(fnv1a64(b"hello"), fnv1a64(b"hello"));
        assert_ne!(fnv1a64(b"hello"), fnv1a64(b"world"));
    }

    #[test]
    fn hash_combine_respects_boundaries() {
        let a = hash_combine(&[b"ab", b"c"]);
        let b = hash_combine(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn defaults_load_without_env_matches_default() {
        // best-effort: only checks structure, not exact env isolation
        let d = Defaults::default();
        assert_eq!(d.log_level, "error");
        assert_eq!(d.counterfactual_k, 3);
    }
}
