//! Arrival-process and request-attribute sampling.
//!
//! Emits `(arrivalTime, Request)` pairs. A single aggregate inter-arrival
//! stream (poisson / gamma(cv) / weibull(cv)) decides *when* the next
//! request arrives; a categorical draw over each client's `rate_fraction`
//! decides *which* client it belongs to — this keeps the timing
//! determinism trivial (one stream, one draw per arrival) while still
//! splitting an aggregate rate across named clients.

use crate::request::{ContextGrowth, MultiTurnDescriptor, Request, SloClass};
use crate::rng::{PartitionedRng, Stream};
use blis_common::{BlisError, Micros, RequestId, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArrivalProcess {
    Poisson,
    Gamma { cv: f64 },
    Weibull { cv: f64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TokenDistribution {
    Constant { value: usize },
    Gaussian { mean: f64, std: f64, min: usize, max: usize },
}

impl TokenDistribution {
    fn sample(&self, stream: &mut Stream) -> usize {
        match self {
            TokenDistribution::Constant { value } => *value,
            TokenDistribution::Gaussian { mean, std, min, max } => {
                stream
                    .gaussian_clamped(*mean, *std, *min as f64, *max as f64)
                    .round() as usize
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            TokenDistribution::Constant { value } => {
                if *value == 0 {
                    return Err(BlisError::Validation(
                        "constant token distribution value must be positive".into(),
                    ));
                }
                Ok(())
            }
            TokenDistribution::Gaussian { mean, std, min, max } => {
                if !mean.is_finite() || !std.is_finite() || *std < 0.0 {
                    return Err(BlisError::Validation(format!(
                        "gaussian token distribution has non-finite or negative parameters: mean={mean} std={std}"
                    )));
                }
                if min > max {
                    return Err(BlisError::Validation(format!(
                        "gaussian token distribution min ({min}) exceeds max ({max})"
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiTurnSpec {
    pub max_rounds: u32,
    pub think_time_us: Micros,
    pub context_growth: ContextGrowth,
}

fn default_slo_class() -> SloClass {
    SloClass::Standard
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSpec {
    pub tenant_id: String,
    pub rate_fraction: f64,
    #[serde(default = "default_slo_class")]
    pub slo_class: SloClass,
    pub input_tokens: TokenDistribution,
    pub output_tokens: TokenDistribution,
    #[serde(default)]
    pub prefix_group: Option<String>,
    #[serde(default)]
    pub prefix_length: Option<usize>,
    #[serde(default)]
    pub streaming: bool,
    /// Extra output tokens expressed as a percentage of the base
    /// `output_tokens` draw, modeling reasoning/"thinking" token overhead.
    #[serde(default)]
    pub reasoning_ratio_percent: Option<TokenDistribution>,
    #[serde(default)]
    pub multi_turn: Option<MultiTurnSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    pub version: String,
    #[serde(default)]
    pub seed: Option<u64>,
    pub aggregate_rate: f64,
    pub arrival_process: ArrivalProcess,
    pub clients: Vec<ClientSpec>,
}

impl WorkloadSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: WorkloadSpec = serde_yaml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.version != "1" && self.version != "2" {
            return Err(BlisError::Validation(format!(
                "unsupported workload schema version {:?}, expected \"1\" or \"2\"",
                self.version
            )));
        }
        if self.clients.is_empty() {
            return Err(BlisError::Validation(
                "workload spec must declare at least one client".into(),
            ));
        }
        if !self.aggregate_rate.is_finite() || self.aggregate_rate <= 0.0 {
            return Err(BlisError::Validation(format!(
                "aggregate_rate must be finite and positive, got {}",
                self.aggregate_rate
            )));
        }
        if let ArrivalProcess::Gamma { cv } | ArrivalProcess::Weibull { cv } = &self.arrival_process {
            if !cv.is_finite() || *cv <= 0.0 {
                return Err(BlisError::Validation(format!(
                    "arrival process cv must be finite and positive, got {cv}"
                )));
            }
        }
        let total_fraction: f64 = self.clients.iter().map(|c| c.rate_fraction).sum();
        if !total_fraction.is_finite() || total_fraction <= 0.0 {
            return Err(BlisError::Validation(
                "client rate_fractions must sum to a finite positive value".into(),
            ));
        }
        for c in &self.clients {
            if !c.rate_fraction.is_finite() || c.rate_fraction < 0.0 {
                return Err(BlisError::Validation(format!(
                    "client {:?} rate_fraction must be finite and non-negative",
                    c.tenant_id
                )));
            }
            c.input_tokens.validate()?;
            c.output_tokens.validate()?;
            if let Some(r) = &c.reasoning_ratio_percent {
                r.validate()?;
            }
        }
        Ok(())
    }
}

pub struct WorkloadSource {
    spec: WorkloadSpec,
    arrival_stream: Stream,
    select_stream: Stream,
    client_input_streams: Vec<Stream>,
    client_output_streams: Vec<Stream>,
    client_reasoning_streams: Vec<Stream>,
    cumulative_fractions: Vec<f64>,
    next_id: RequestId,
    emitted: usize,
    num_requests_limit: Option<usize>,
}

impl WorkloadSource {
    pub fn new(spec: WorkloadSpec, prng: &PartitionedRng, num_requests_limit: Option<usize>) -> Self {
        let total: f64 = spec.clients.iter().map(|c| c.rate_fraction).sum();
        let mut cumulative = Vec::with_capacity(spec.clients.len());
        let mut running = 0.0;
        for c in &spec.clients {
            running += c.rate_fraction / total;
            cumulative.push(running);
        }
        let client_input_streams = (0..spec.clients.len())
            .map(|i| prng.partition(&format!("workload.client{i}.input")))
            .collect();
        let client_output_streams = (0..spec.clients.len())
            .map(|i| prng.partition(&format!("workload.client{i}.output")))
            .collect();
        let client_reasoning_streams = (0..spec.clients.len())
            .map(|i| prng.partition(&format!("workload.client{i}.reasoning")))
            .collect();
        Self {
            arrival_stream: prng.partition("workload.arrival"),
            select_stream: prng.partition("workload.client-select"),
            client_input_streams,
            client_output_streams,
            client_reasoning_streams,
            cumulative_fractions: cumulative,
            spec,
            next_id: 0,
            emitted: 0,
            num_requests_limit,
        }
    }

    /// Builds a single-client workload purely from CLI flags, bypassing the
    /// YAML loader. Used when `--workload-spec` is not given.
    pub fn from_cli(
        prng: &PartitionedRng,
        rate: f64,
        num_requests: Option<usize>,
        input_tokens: TokenDistribution,
        output_tokens: TokenDistribution,
    ) -> Result<Self> {
        let spec = WorkloadSpec {
            version: "1".to_string(),
            seed: None,
            aggregate_rate: rate,
            arrival_process: ArrivalProcess::Poisson,
            clients: vec![ClientSpec {
                tenant_id: "default".to_string(),
                rate_fraction: 1.0,
                slo_class: SloClass::Standard,
                input_tokens,
                output_tokens,
                prefix_group: None,
                prefix_length: None,
                streaming: false,
                reasoning_ratio_percent: None,
                multi_turn: None,
            }],
        };
        spec.validate()?;
        Ok(Self::new(spec, prng, num_requests))
    }

    fn next_interarrival_us(&mut self) -> Micros {
        let mean_interval_s = 1.0 / self.spec.aggregate_rate;
        let draw_s = match &self.spec.arrival_process {
            ArrivalProcess::Poisson => self.arrival_stream.exponential(self.spec.aggregate_rate),
            ArrivalProcess::Gamma { cv } => {
                let shape = 1.0 / (cv * cv).max(1e-9);
                let scale = mean_interval_s / shape;
                self.arrival_stream.gamma(shape, scale)
            }
            ArrivalProcess::Weibull { cv } => {
                let shape = weibull_shape_from_cv(*cv);
                let scale = mean_interval_s / gamma_function(1.0 + 1.0 / shape);
                self.arrival_stream.weibull(shape, scale)
            }
        };
        (draw_s * 1_000_000.0).round().max(0.0) as Micros
    }

    fn select_client(&mut self) -> usize {
        let u = self.select_stream.uniform(0.0, 1.0);
        self.cumulative_fractions
            .iter()
            .position(|&c| u <= c)
            .unwrap_or(self.cumulative_fractions.len() - 1)
    }

    /// Draw the next `(arrivalTime, Request)` pair, or `ErrWorkloadExhausted`
    /// once `--num-requests` has been reached.
    pub fn next(&mut self, now: Micros) -> Result<Request> {
        if let Some(limit) = self.num_requests_limit {
            if self.emitted >= limit {
                return Err(BlisError::WorkloadExhausted);
            }
        }
        let delta = self.next_interarrival_us();
        let arrival_time = now + delta;
        let client_idx = self.select_client();
        let client = &self.spec.clients[client_idx];

        let input_tokens = client
            .input_tokens
            .sample(&mut self.client_input_streams[client_idx])
            .max(1);
        let mut output_tokens = client
            .output_tokens
            .sample(&mut self.client_output_streams[client_idx])
            .max(1);
        if let Some(ratio_dist) = &client.reasoning_ratio_percent {
            let percent = ratio_dist.sample(&mut self.client_reasoning_streams[client_idx]) as f64;
            output_tokens += ((output_tokens as f64) * (percent / 100.0)).round() as usize;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.emitted += 1;

        let multi_turn = client.multi_turn.as_ref().map(|m| MultiTurnDescriptor {
            max_rounds: m.max_rounds,
            think_time_us: m.think_time_us,
            context_growth: m.context_growth,
        });

        Ok(Request {
            id,
            arrival_time,
            input_tokens,
            output_tokens,
            tenant_id: client.tenant_id.clone(),
            slo_class: client.slo_class,
            prefix_group: client.prefix_group.clone(),
            prefix_length: client.prefix_length,
            streaming: client.streaming,
            multi_turn,
            round: 0,
        })
    }

    /// Builds the follow-up turn of a multi-turn conversation: a fresh
    /// `Request` (its own id, counted as a new arrival) whose prompt size
    /// follows `parent.multi_turn`'s `context_growth` rule and whose output
    /// size is sampled the same way a first-turn request's would be, from
    /// the same tenant's distributions. Returns `None` if `tenant_id` no
    /// longer matches a configured client (cannot happen for requests this
    /// `WorkloadSource` itself produced).
    pub fn next_round(&mut self, parent: &Request, arrival_time: Micros) -> Option<Request> {
        let multi_turn = parent.multi_turn.clone()?;
        let client_idx = self.spec.clients.iter().position(|c| c.tenant_id == parent.tenant_id)?;
        let client = &self.spec.clients[client_idx];

        let input_tokens = match multi_turn.context_growth {
            // the next prompt is everything said and heard so far.
            ContextGrowth::Accumulate => parent.total_tokens(),
            // the window slides forward rather than growing without bound.
            ContextGrowth::Truncate => parent.input_tokens,
        }
        .max(1);
        let mut output_tokens = client
            .output_tokens
            .sample(&mut self.client_output_streams[client_idx])
            .max(1);
        if let Some(ratio_dist) = &client.reasoning_ratio_percent {
            let percent = ratio_dist.sample(&mut self.client_reasoning_streams[client_idx]) as f64;
            output_tokens += ((output_tokens as f64) * (percent / 100.0)).round() as usize;
        }

        let id = self.next_id;
        self.next_id += 1;

        Some(Request {
            id,
            arrival_time,
            input_tokens,
            output_tokens,
            tenant_id: client.tenant_id.clone(),
            slo_class: client.slo_class,
            prefix_group: client.prefix_group.clone(),
            prefix_length: client.prefix_length,
            streaming: client.streaming,
            multi_turn: Some(multi_turn),
            round: parent.round + 1,
        })
    }
}

/// Empirical CV-to-shape inversion for the Weibull distribution (no closed
/// form exists); accurate to a few percent for `cv` in roughly `[0.3, 8]`,
/// which covers the inter-arrival burstiness ranges workload authors use in
/// practice.
fn weibull_shape_from_cv(cv: f64) -> f64 {
    cv.max(1e-6).powf(-1.086)
}

/// Lanczos approximation of the gamma function (g=7, n=9 coefficients),
/// accurate to roughly 1e-10 for positive arguments. Used to convert a
/// Weibull shape parameter into the scale that yields the target mean
/// inter-arrival time, without pulling in a special-functions dependency.
fn gamma_function(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFICIENTS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        std::f64::consts::PI / ((std::f64::consts::PI * x).sin() * gamma_function(1.0 - x))
    } else {
        let x = x - 1.0;
        let mut a = COEFFICIENTS[0];
        for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
            a += c / (x + i as f64);
        }
        let t = x + G + 0.5;
        (2.0 * std::f64::consts::PI).sqrt() * t.powf(x + 0.5) * (-t).exp() * a
    }
}
