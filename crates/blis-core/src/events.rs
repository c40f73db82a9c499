//! Deterministic min-priority event queue.
//!
//! Ordered by `(time, class, seq)`. At equal `time`, cluster events drain
//! strictly before instance events — this is what makes `PendingRequests` a
//! synchronously-fresh routing signal while `kv-utilization` stays a
//! deliberately lagging one. Within a class at equal time, insertion order
//! (`seq`) breaks the tie.

use crate::request::Request;
use blis_common::{BlisError, InstanceId, Micros, RequestId, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Cluster-class events strictly precede instance-class events at equal
/// simulated time. The discriminant order mirrors that priority: `Cluster`
/// sorts before `Instance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventClass {
    Cluster = 0,
    Instance = 1,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    /// The workload source should be asked for its next arrival.
    ClusterArrival,
    /// An admitted, routed request should be pushed onto its target
    /// instance's waiting queue.
    InstanceArrival {
        instance: InstanceId,
        request: RequestId,
    },
    /// The named instance should form and dispatch its next step batch.
    InstanceStep { instance: InstanceId },
    /// A completed multi-turn conversation's think-time has elapsed;
    /// `WorkloadSource` should be asked to sample the next round's request
    /// from `parent`'s tenant and send it through admission and routing.
    MultiTurnContinuation { parent: Request },
}

impl EventPayload {
    pub fn class(&self) -> EventClass {
        match self {
            EventPayload::ClusterArrival => EventClass::Cluster,
            EventPayload::InstanceArrival { .. } => EventClass::Cluster,
            EventPayload::InstanceStep { .. } => EventClass::Instance,
            EventPayload::MultiTurnContinuation { .. } => EventClass::Cluster,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub time: Micros,
    pub seq: i64,
    pub payload: EventPayload,
}

/// Heap entry ordered so that `BinaryHeap` (a max-heap) pops the
/// numerically smallest `(time, class, seq)` tuple first, by reversing the
/// natural comparison.
struct QueueEntry {
    time: Micros,
    class: EventClass,
    seq: i64,
    payload: EventPayload,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.class == other.class && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want min-heap semantics on
        // (time, class, seq).
        (other.time, other.class, other.seq).cmp(&(self.time, self.class, self.seq))
    }
}

/// Deterministic min-priority event queue. Carries the simulated clock,
/// which advances only on `pop` and never retreats; a `pop` that would
/// observe a lower time than the current clock is `ErrClockRegression` — a
/// contract violation, not a recoverable condition.
pub struct EventQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: i64,
    clock: Micros,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            clock: 0,
        }
    }

    /// Push an event at `time`. `seq` is assigned here, monotonically, and
    /// is the final tie-breaker within `(time, class)`.
    pub fn push(&mut self, time: Micros, payload: EventPayload) {
        let class = payload.class();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            time,
            class,
            seq,
            payload,
        });
    }

    /// Pop the next event in `(time, class, seq)` order, advancing the
    /// clock. Empty queue is `ErrUnderflow`; a popped time earlier than the
    /// current clock is `ErrClockRegression` (should be unreachable given
    /// `push` never accepts a time less than the current clock via
    /// `ClusterSimulator`'s own bookkeeping, but checked here as the last
    /// line of defense since the queue is the sole authority on ordering).
    pub fn pop(&mut self) -> Result<Event> {
        let entry = self.heap.pop().ok_or(BlisError::Underflow)?;
        if entry.time < self.clock {
            return Err(BlisError::ClockRegression {
                clock: self.clock,
                popped: entry.time,
            });
        }
        self.clock = entry.time;
        Ok(Event {
            time: entry.time,
            seq: entry.seq,
            payload: entry.payload,
        })
    }

    pub fn peek_time(&self) -> Option<Micros> {
        self.heap.peek().map(|e| e.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clock(&self) -> Micros {
        self.clock
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
