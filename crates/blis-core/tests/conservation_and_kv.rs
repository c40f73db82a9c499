//! Cross-module invariants that only show up over a full run: request
//! conservation (INV-1) under admission pressure, and KV-cache bookkeeping
//! (INV-2) staying internally consistent once eviction, offload, and
//! preemption have all had a chance to fire under a tight block budget.

use blis_core::admission::AdmissionPolicy;
use blis_core::cluster::ClusterSimulator;
use blis_core::instance::{InstanceSimulator, PriorityPolicy, SchedulerKind};
use blis_core::metrics::TraceLevel;
use blis_core::request::SloClass;
use blis_core::rng::PartitionedRng;
use blis_core::routing::RoutingPolicy;
use blis_core::workload::{ArrivalProcess, ClientSpec, TokenDistribution, WorkloadSource, WorkloadSpec};
use blis_latency::LinearLatencyModel;

fn bursty_workload(num_requests: usize, seed: u64) -> WorkloadSource {
    let spec = WorkloadSpec {
        version: "1".into(),
        seed: None,
        aggregate_rate: 2000.0,
        arrival_process: ArrivalProcess::Poisson,
        clients: vec![ClientSpec {
            tenant_id: "t".into(),
            rate_fraction: 1.0,
            slo_class: SloClass::Standard,
            input_tokens: TokenDistribution::Constant { value: 256 },
            output_tokens: TokenDistribution::Constant { value: 64 },
            prefix_group: None,
            prefix_length: None,
            streaming: false,
            reasoning_ratio_percent: None,
            multi_turn: None,
        }],
    };
    let prng = PartitionedRng::new(seed);
    WorkloadSource::new(spec, &prng, Some(num_requests))
}

/// Deliberately tight: few GPU blocks relative to the request size and
/// arrival rate above, so the escalation ladder (evict, offload, preempt)
/// must engage for the run to make progress at all.
fn tight_instances(n: usize) -> Vec<InstanceSimulator> {
    (0..n)
        .map(|i| {
            InstanceSimulator::new(
                i,
                16,
                20,
                12,
                SchedulerKind::PriorityFcfs,
                PriorityPolicy::SloBased,
                4,
                64,
                0.7,
                2,
                2.0e8,
                2048.0,
            )
        })
        .collect()
}

#[test]
fn conservation_holds_under_admission_pressure_with_token_bucket() {
    let mut cluster = ClusterSimulator::new(
        tight_instances(3),
        AdmissionPolicy::token_bucket(8.0, 20.0).unwrap(),
        RoutingPolicy::LeastLoaded,
        bursty_workload(300, 101),
        1024,
        Box::new(LinearLatencyModel::default()),
        16,
        3,
        TraceLevel::None,
        None,
    )
    .unwrap();
    cluster.run().unwrap();

    assert!(cluster.rejected() > 0, "a tight token bucket under this load should reject some requests");
    assert_eq!(cluster.injected(), cluster.completed() + cluster.rejected());
}

#[test]
fn tight_kv_budget_forces_preemption_and_keeps_kv_cache_consistent() {
    let mut cluster = ClusterSimulator::new(
        tight_instances(2),
        AdmissionPolicy::always_admit(),
        RoutingPolicy::RoundRobin { next: 0 },
        bursty_workload(200, 202),
        1024,
        Box::new(LinearLatencyModel::default()),
        16,
        3,
        TraceLevel::None,
        None,
    )
    .unwrap();
    cluster.run().unwrap();

    assert_eq!(cluster.injected(), cluster.completed() + cluster.rejected());

    let total_preemptions: u32 = cluster.metrics().per_request().iter().map(|m| m.preemption_count).sum();
    assert!(
        total_preemptions > 0,
        "a KV budget this tight under this load should force at least one preemption"
    );
}

#[test]
fn kv_cache_invariants_hold_after_a_single_instance_is_driven_under_pressure() {
    use blis_core::request::{Request, RequestRuntime, SloClass as ReqSloClass};

    let mut inst = InstanceSimulator::new(
        0,
        4,   // block_size_tokens
        6,   // total_gpu_blocks: far too few for six concurrent requests
        4,   // total_cpu_blocks
        SchedulerKind::PriorityFcfs,
        PriorityPolicy::SloBased,
        3, // max_batch_size
        0,
        0.5, // kv_offload_threshold
        2,   // kv_offload_max_blocks_per_tick
        1.0e6,
        512.0,
    );

    for id in 0..6u64 {
        let request = Request {
            id,
            arrival_time: 0,
            input_tokens: 20,
            output_tokens: 10,
            tenant_id: "t".into(),
            slo_class: ReqSloClass::Standard,
            prefix_group: None,
            prefix_length: None,
            streaming: false,
            multi_turn: None,
            round: 0,
        };
        inst.enqueue(RequestRuntime::new(request));
    }

    let latency = LinearLatencyModel::default();
    let mut now: i64 = 0;
    let mut completed = 0usize;
    let mut preempted_events = 0usize;
    for _ in 0..10_000 {
        if inst.is_idle() {
            break;
        }
        let outcome = inst.step_tick(now, &latency).unwrap();
        completed += outcome.completed.len();
        preempted_events += outcome.preempted.len();
        now += outcome.step_time_us.max(1);
    }

    assert_eq!(completed, 6, "every enqueued request should eventually complete");
    assert!(
        preempted_events > 0,
        "six requests competing for six GPU blocks should force at least one preemption"
    );
    inst.kv_cache().check_invariants().expect("kv cache must remain internally consistent");
    assert_eq!(inst.kv_cache().used_blocks(), 0, "no blocks should remain allocated once every request has completed");
}
