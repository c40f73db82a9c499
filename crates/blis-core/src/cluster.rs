//! Cluster-level orchestration: arrivals, admission, routing, and the
//! per-instance step ticks, driven by a single `EventQueue`.
//!
//! `ClusterSimulator` is the one component in the workspace that sees every
//! other component at once; cyclic ownership is avoided here by giving
//! instances only an opaque `InstanceId` (an index into `self.instances`)
//! rather than a back-pointer — an arena-plus-index layout.

use crate::admission::AdmissionPolicy;
use crate::events::{Event, EventPayload, EventQueue};
use crate::instance::InstanceSimulator;
use crate::metrics::{MetricsCollector, TraceLevel, TraceRecorder};
use crate::prefix_index::{request_block_hashes, PrefixCacheIndex};
use crate::request::{Request, RequestRuntime};
use crate::routing::{InstanceSnapshot, RoutingContext, RoutingPolicy};
use crate::workload::WorkloadSource;
use blis_common::{BlisError, InstanceId, Micros, RequestId, Result};
use blis_latency::LatencyModel;
use std::collections::HashMap;

pub struct ClusterSimulator {
    instances: Vec<InstanceSimulator>,
    queue: EventQueue,
    admission: AdmissionPolicy,
    routing: RoutingPolicy,
    workload: WorkloadSource,
    prefix_index: PrefixCacheIndex,
    latency: Box<dyn LatencyModel>,
    trace: TraceRecorder,
    metrics: MetricsCollector,
    block_size_tokens: usize,
    counterfactual_k: usize,
    horizon: Option<Micros>,

    /// Synchronously-maintained routing signal: incremented the instant a
    /// request is routed, decremented once it actually enters that
    /// instance's waiting queue. Lives on `ClusterSimulator`, never on an
    /// instance, which never sees load outside its own queue.
    pending_requests: Vec<usize>,
    /// Routed but not yet pushed into an instance's waiting queue — the gap
    /// between a routing decision and the `InstanceArrival` event it
    /// scheduled at the same simulated time.
    in_flight: HashMap<RequestId, RequestRuntime>,
    /// The next sampled arrival, staged between being drawn and its
    /// `ClusterArrival` event firing. `None` once `WorkloadSource` is
    /// exhausted (`ErrWorkloadExhausted` is normal termination, not a bug).
    pending_arrival: Option<Request>,

    injected: u64,
    rejected: u64,
    completed: u64,
}

impl ClusterSimulator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Vec<InstanceSimulator>,
        admission: AdmissionPolicy,
        routing: RoutingPolicy,
        mut workload: WorkloadSource,
        prefix_index_capacity: usize,
        latency: Box<dyn LatencyModel>,
        block_size_tokens: usize,
        counterfactual_k: usize,
        trace_level: TraceLevel,
        horizon: Option<Micros>,
    ) -> Result<Self> {
        let num_instances = instances.len();
        let mut queue = EventQueue::new();
        let pending_arrival = match workload.next(0) {
            Ok(req) => {
                queue.push(req.arrival_time, EventPayload::ClusterArrival);
                Some(req)
            }
            Err(BlisError::WorkloadExhausted) => None,
            Err(e) => return Err(e),
        };

        Ok(Self {
            instances,
            queue,
            admission,
            routing,
            workload,
            prefix_index: PrefixCacheIndex::new(prefix_index_capacity),
            latency,
            trace: TraceRecorder::new(trace_level, counterfactual_k),
            metrics: MetricsCollector::new(num_instances),
            block_size_tokens,
            counterfactual_k,
            horizon,
            pending_requests: vec![0; num_instances],
            in_flight: HashMap::new(),
            pending_arrival,
            injected: 0,
            rejected: 0,
            completed: 0,
        })
    }

    pub fn clock(&self) -> Micros {
        self.queue.clock()
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn trace(&self) -> &TraceRecorder {
        &self.trace
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Drains the `EventQueue` until it is empty or the simulated clock
    /// would exceed `--horizon`. Requests still in flight at that point are
    /// `Queued`/`Running` and remain accounted for by `running`/`queued`
    /// in the conservation check — the horizon is a hard stop, not a
    /// completion condition.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let Some(next_time) = self.queue.peek_time() else {
                break;
            };
            if let Some(horizon) = self.horizon {
                if next_time > horizon {
                    break;
                }
            }
            let event = self.queue.pop()?;
            self.dispatch(event)?;
            self.assert_conservation();
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event.payload {
            EventPayload::ClusterArrival => self.on_cluster_arrival(event.time),
            EventPayload::InstanceArrival { instance, request } => {
                self.on_instance_arrival(event.time, instance, request)
            }
            EventPayload::InstanceStep { instance } => self.on_instance_step(event.time, instance),
            EventPayload::MultiTurnContinuation { parent } => self.on_multi_turn_continuation(event.time, parent),
        }
    }

    fn on_cluster_arrival(&mut self, now: Micros) -> Result<()> {
        let request = self
            .pending_arrival
            .take()
            .expect("ClusterArrival fired without a staged request");
        self.injected += 1;

        let admitted = self.admission.try_admit(now);
        self.trace.record_admission(request.id, now, admitted);
        if admitted {
            self.admit_and_route(request, now);
        } else {
            self.rejected += 1;
            tracing::debug!(target: "blis_core::cluster", request_id = request.id, now, "request rejected by admission policy");
        }

        match self.workload.next(now) {
            Ok(next) => {
                self.queue.push(next.arrival_time, EventPayload::ClusterArrival);
                self.pending_arrival = Some(next);
            }
            Err(BlisError::WorkloadExhausted) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// A multi-turn conversation's think-time has elapsed: sample the next
    /// round's request from the parent's tenant and run it through the same
    /// admission-then-routing pipeline a first-turn arrival would take.
    /// Counted as a new injection, independent of the parent's own
    /// injected/completed accounting — conservation treats each round as
    /// its own request.
    fn on_multi_turn_continuation(&mut self, now: Micros, parent: Request) -> Result<()> {
        let Some(request) = self.workload.next_round(&parent, now) else {
            return Ok(());
        };
        self.injected += 1;

        let admitted = self.admission.try_admit(now);
        self.trace.record_admission(request.id, now, admitted);
        if admitted {
            self.admit_and_route(request, now);
        } else {
            self.rejected += 1;
            tracing::debug!(target: "blis_core::cluster", request_id = request.id, now, "multi-turn follow-up rejected by admission policy");
        }
        Ok(())
    }

    fn admit_and_route(&mut self, request: Request, now: Micros) {
        let total_tokens = request.total_tokens();
        let block_hashes = request_block_hashes(
            request.id,
            request.prefix_group.as_deref(),
            request.prefix_length,
            total_tokens,
            self.block_size_tokens,
        );

        let snapshots: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .enumerate()
            .map(|(id, inst)| InstanceSnapshot {
                id,
                queue_depth: inst.queue_depth(),
                batch_size: inst.batch_size(),
                pending_requests: self.pending_requests[id],
                kv_utilization: inst.kv_utilization(),
            })
            .collect();
        let ctx = RoutingContext {
            request_prefix_hashes: &block_hashes,
            prefix_index: &self.prefix_index,
        };
        let decision = self.routing.route(&snapshots, &ctx, self.counterfactual_k);
        self.trace.record_routing(request.id, now, &decision);

        let target = decision.chosen;
        self.pending_requests[target] += 1;

        let request_id = request.id;
        let mut rt = RequestRuntime::new(request);
        rt.block_hashes = block_hashes;
        rt.assigned_instance = Some(target);
        rt.admitted_at = Some(now);
        self.in_flight.insert(request_id, rt);
        self.queue.push(
            now,
            EventPayload::InstanceArrival {
                instance: target,
                request: request_id,
            },
        );
    }

    fn on_instance_arrival(&mut self, now: Micros, instance: InstanceId, request: RequestId) -> Result<()> {
        let rt = self
            .in_flight
            .remove(&request)
            .expect("InstanceArrival fired for a request not held in flight");
        self.pending_requests[instance] = self.pending_requests[instance].saturating_sub(1);
        let was_idle = self.instances[instance].is_idle();
        self.instances[instance].enqueue(rt);
        if was_idle {
            self.queue.push(now, EventPayload::InstanceStep { instance });
        }
        Ok(())
    }

    fn on_instance_step(&mut self, now: Micros, instance: InstanceId) -> Result<()> {
        let outcome = self.instances[instance].step_tick(now, self.latency.as_ref())?;

        for event in &outcome.newly_hashed_blocks {
            self.prefix_index.record(event.hash, instance, now);
        }
        for hash in &outcome.invalidated_block_hashes {
            self.prefix_index.remove(*hash);
        }
        for rt in &outcome.completed {
            self.metrics.record_completion(rt, instance);
            self.completed += 1;
            if rt.request.has_next_round() {
                let think_time_us = rt
                    .request
                    .multi_turn
                    .as_ref()
                    .expect("has_next_round implies a multi_turn descriptor")
                    .think_time_us;
                let fire_at = rt.completed_at.expect("completed request must have completed_at set") + think_time_us;
                self.queue.push(
                    fire_at,
                    EventPayload::MultiTurnContinuation {
                        parent: rt.request.clone(),
                    },
                );
            }
        }
        for rt in &outcome.rejected {
            self.rejected += 1;
            tracing::debug!(
                target: "blis_core::cluster",
                instance,
                now,
                request_id = rt.id(),
                "request rejected: unfittable on its assigned instance even after escalation"
            );
        }
        if !outcome.preempted.is_empty() {
            tracing::debug!(
                target: "blis_core::cluster",
                instance,
                now,
                count = outcome.preempted.len(),
                "instance preempted running requests to admit higher-priority work"
            );
        }
        if outcome.still_has_work {
            self.queue.push(now + outcome.step_time_us, EventPayload::InstanceStep { instance });
        }
        Ok(())
    }

    /// Every injected request is, at all times, exactly one of completed,
    /// rejected, running, or queued. Checked as a post-condition of every
    /// tick in debug builds only (`debug_assert!` is a no-op in release —
    /// this is a contract violation, not a recoverable runtime condition).
    fn assert_conservation(&self) {
        let running: u64 = self.instances.iter().map(|i| i.batch_size() as u64).sum();
        let queued: u64 =
            self.instances.iter().map(|i| i.queue_depth() as u64).sum::<u64>() + self.in_flight.len() as u64;
        let accounted = self.completed + self.rejected + running + queued;
        debug_assert_eq!(
            accounted,
            self.injected,
            "conservation violated: injected={} completed={} rejected={} running={} queued={}",
            self.injected,
            self.completed,
            self.rejected,
            running,
            queued
        );
    }
}
