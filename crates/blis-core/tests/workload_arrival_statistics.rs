//! Statistical sanity check that the gamma inter-arrival process (used to
//! model bursty, non-Poisson arrivals) actually converges to the mean and
//! coefficient of variation its `cv` parameter targets, over enough draws
//! that the sampling error is negligible next to the tolerance.

use blis_core::request::SloClass;
use blis_core::rng::PartitionedRng;
use blis_core::workload::{ArrivalProcess, ClientSpec, TokenDistribution, WorkloadSource, WorkloadSpec};

fn spec(rate: f64, cv: f64) -> WorkloadSpec {
    WorkloadSpec {
        version: "1".into(),
        seed: None,
        aggregate_rate: rate,
        arrival_process: ArrivalProcess::Gamma { cv },
        clients: vec![ClientSpec {
            tenant_id: "t".into(),
            rate_fraction: 1.0,
            slo_class: SloClass::Standard,
            input_tokens: TokenDistribution::Constant { value: 32 },
            output_tokens: TokenDistribution::Constant { value: 8 },
            prefix_group: None,
            prefix_length: None,
            streaming: false,
            reasoning_ratio_percent: None,
            multi_turn: None,
        }],
    }
}

#[test]
fn gamma_interarrival_times_match_target_mean_and_cv() {
    const N: usize = 20_000;
    let rate = 100.0;
    let cv = 1.5;
    let prng = PartitionedRng::new(9);
    let mut source = WorkloadSource::new(spec(rate, cv), &prng, Some(N));

    let mut deltas = Vec::with_capacity(N);
    for _ in 0..N {
        let request = source.next(0).unwrap();
        deltas.push(request.arrival_time as f64);
    }

    let mean: f64 = deltas.iter().sum::<f64>() / N as f64;
    let variance: f64 = deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / N as f64;
    let sample_cv = variance.sqrt() / mean;

    let target_mean_us = 1_000_000.0 / rate;
    assert!(
        (mean - target_mean_us).abs() / target_mean_us < 0.15,
        "sample mean {mean} too far from target {target_mean_us}"
    );
    assert!(
        (sample_cv - cv).abs() / cv < 0.25,
        "sample cv {sample_cv} too far from target {cv}"
    );
}

#[test]
fn poisson_interarrival_times_have_cv_near_one() {
    const N: usize = 20_000;
    let rate = 200.0;
    let prng = PartitionedRng::new(17);
    let mut poisson_spec = spec(rate, 1.0);
    poisson_spec.arrival_process = ArrivalProcess::Poisson;
    let mut source = WorkloadSource::new(poisson_spec, &prng, Some(N));

    let mut deltas = Vec::with_capacity(N);
    for _ in 0..N {
        let request = source.next(0).unwrap();
        deltas.push(request.arrival_time as f64);
    }

    let mean: f64 = deltas.iter().sum::<f64>() / N as f64;
    let variance: f64 = deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / N as f64;
    let sample_cv = variance.sqrt() / mean;

    // The exponential distribution (Poisson arrivals) has cv == 1 exactly.
    assert!((sample_cv - 1.0).abs() < 0.15, "poisson arrivals should have cv near 1, got {sample_cv}");
}
