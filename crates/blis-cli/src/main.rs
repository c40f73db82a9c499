//! `blis` — batched LLM inference cluster simulator CLI.
//!
//! Parses and validates flags, builds the cluster, runs it to completion (or
//! `--horizon`), and writes results: `--results-path` for per-request JSON,
//! stdout for the aggregate summary and optional trace output. Diagnostics
//! go to stderr only via `tracing`, so stdout stays byte-reproducible for a
//! fixed seed.

use anyhow::{bail, Context, Result as AnyResult};
use blis_core::admission::AdmissionPolicy;
use blis_core::cluster::ClusterSimulator;
use blis_core::instance::{InstanceSimulator, PriorityPolicy, SchedulerKind};
use blis_core::metrics::TraceLevel;
use blis_core::rng::PartitionedRng;
use blis_core::routing::{RoutingPolicy, ScorerKind};
use blis_core::workload::{TokenDistribution, WorkloadSource, WorkloadSpec};
use blis_latency::{LatencyModel, LinearLatencyModel, RooflineLatencyModel};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "blis", version, about = "Batched LLM inference cluster simulator")]
struct Cli {
    /// Hardware/model catalog id, or "linear" for the linear fallback model.
    #[arg(long)]
    model: String,

    #[arg(long)]
    num_instances: usize,
    #[arg(long)]
    total_kv_blocks: usize,
    #[arg(long)]
    block_size_in_tokens: usize,
    /// Hard cap on concurrently running requests per instance, independent
    /// of KV capacity — the other half of batch admission alongside
    /// available blocks.
    #[arg(long, default_value_t = 64)]
    max_batch_size: usize,

    #[arg(long, default_value = "round-robin")]
    routing_policy: String,
    /// Required iff `--routing-policy weighted`: "name:weight,name:weight,…".
    #[arg(long)]
    routing_scorers: Option<String>,

    #[arg(long, default_value = "fcfs")]
    scheduler: String,
    #[arg(long, default_value = "slo-based")]
    priority_policy: String,

    #[arg(long, default_value = "always-admit")]
    admission_policy: String,
    #[arg(long)]
    token_bucket_capacity: Option<f64>,
    #[arg(long)]
    token_bucket_refill_rate: Option<f64>,

    /// 0 disables chunked prefill.
    #[arg(long, default_value_t = 0)]
    long_prefill_token_threshold: usize,

    #[arg(long, default_value_t = 0)]
    kv_cpu_blocks: usize,
    #[arg(long, default_value_t = 1.0)]
    kv_offload_threshold: f64,
    #[arg(long, default_value_t = 0)]
    kv_offload_max_blocks_per_tick: usize,
    /// Bytes/sec. 0 models an instantaneous (cost-free) CPU-tier transfer.
    #[arg(long, default_value_t = 0.0)]
    kv_transfer_bandwidth: f64,

    #[arg(long)]
    workload_spec: Option<PathBuf>,
    #[arg(long)]
    rate: Option<f64>,
    #[arg(long)]
    num_requests: Option<usize>,
    #[arg(long, default_value_t = 512)]
    prompt_tokens: usize,
    #[arg(long, default_value_t = 128)]
    output_tokens: usize,

    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    horizon: Option<i64>,

    #[arg(long)]
    results_path: Option<PathBuf>,

    /// Falls back to `BLIS_TRACE_LEVEL`, then the hard-coded default.
    #[arg(long)]
    trace_level: Option<String>,
    /// Falls back to `BLIS_COUNTERFACTUAL_K`, then the hard-coded default.
    #[arg(long)]
    counterfactual_k: Option<usize>,
    #[arg(long, default_value_t = false)]
    summarize_trace: bool,

    /// Falls back to `BLIS_LOG`, then the hard-coded default.
    #[arg(long)]
    log: Option<String>,

    #[arg(long, default_value_t = 1024)]
    prefix_index_capacity: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let defaults = blis_common::defaults::Defaults::load();
    init_tracing(cli.log.as_deref().unwrap_or(&defaults.log_level));
    match run(cli, defaults) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn run(cli: Cli, defaults: blis_common::defaults::Defaults) -> AnyResult<()> {
    if cli.num_instances == 0 {
        bail!("--num-instances must be positive");
    }
    if cli.total_kv_blocks == 0 || cli.block_size_in_tokens == 0 {
        bail!("--total-kv-blocks and --block-size-in-tokens must be positive");
    }
    if !cli.kv_offload_threshold.is_finite() || !(0.0..=1.0).contains(&cli.kv_offload_threshold) {
        bail!(
            "--kv-offload-threshold must be within [0, 1], got {}",
            cli.kv_offload_threshold
        );
    }
    if !cli.kv_transfer_bandwidth.is_finite() || cli.kv_transfer_bandwidth < 0.0 {
        bail!(
            "--kv-transfer-bandwidth must be finite and non-negative, got {}",
            cli.kv_transfer_bandwidth
        );
    }

    let scheduler = SchedulerKind::parse(&cli.scheduler)
        .with_context(|| format!("unknown --scheduler '{}'", cli.scheduler))?;
    let priority_policy = PriorityPolicy::parse(&cli.priority_policy)
        .with_context(|| format!("unknown --priority-policy '{}'", cli.priority_policy))?;
    let trace_level_str = cli.trace_level.as_deref().unwrap_or(&defaults.trace_level);
    let trace_level = TraceLevel::parse(trace_level_str)
        .with_context(|| format!("unknown --trace-level '{trace_level_str}'"))?;
    let counterfactual_k = cli.counterfactual_k.unwrap_or(defaults.counterfactual_k);

    let (latency, kv_bytes_per_token): (Box<dyn LatencyModel>, f64) = if cli.model == "linear" {
        let fallback = blis_latency::catalog::lookup("linear-fast-test").map_err(anyhow::Error::from)?;
        (Box::new(LinearLatencyModel::default()), fallback.kv_bytes_per_token)
    } else {
        let hardware = blis_latency::catalog::lookup(&cli.model).map_err(anyhow::Error::from)?;
        let kv_bytes_per_token = hardware.kv_bytes_per_token;
        (Box::new(RooflineLatencyModel::new(hardware)), kv_bytes_per_token)
    };

    let admission = match cli.admission_policy.as_str() {
        "always-admit" => AdmissionPolicy::always_admit(),
        "token-bucket" => {
            let capacity = cli
                .token_bucket_capacity
                .context("--token-bucket-capacity is required for --admission-policy token-bucket")?;
            let refill = cli
                .token_bucket_refill_rate
                .context("--token-bucket-refill-rate is required for --admission-policy token-bucket")?;
            AdmissionPolicy::token_bucket(capacity, refill).map_err(anyhow::Error::from)?
        }
        other => bail!("unknown --admission-policy '{other}'"),
    };

    let routing = parse_routing_policy(&cli.routing_policy, cli.routing_scorers.as_deref())?;

    let prng = PartitionedRng::new(cli.seed.unwrap_or(0));
    let workload = match &cli.workload_spec {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading --workload-spec {}", path.display()))?;
            let mut spec = WorkloadSpec::from_yaml(&text).map_err(anyhow::Error::from)?;
            if let Some(seed) = cli.seed {
                spec.seed = Some(seed);
            }
            let seed = spec.seed.unwrap_or(0);
            WorkloadSource::new(spec, &PartitionedRng::new(seed), cli.num_requests)
        }
        None => {
            let rate = cli.rate.context("either --workload-spec or --rate is required")?;
            WorkloadSource::from_cli(
                &prng,
                rate,
                cli.num_requests,
                TokenDistribution::Constant { value: cli.prompt_tokens },
                TokenDistribution::Constant { value: cli.output_tokens },
            )
            .map_err(anyhow::Error::from)?
        }
    };

    let instances: Vec<InstanceSimulator> = (0..cli.num_instances)
        .map(|id| {
            InstanceSimulator::new(
                id,
                cli.block_size_in_tokens,
                cli.total_kv_blocks,
                cli.kv_cpu_blocks,
                scheduler,
                priority_policy,
                cli.max_batch_size,
                cli.long_prefill_token_threshold,
                cli.kv_offload_threshold,
                cli.kv_offload_max_blocks_per_tick,
                cli.kv_transfer_bandwidth,
                cli.block_size_in_tokens as f64 * kv_bytes_per_token,
            )
        })
        .collect();

    let mut cluster = ClusterSimulator::new(
        instances,
        admission,
        routing,
        workload,
        cli.prefix_index_capacity,
        latency,
        cli.block_size_in_tokens,
        counterfactual_k,
        trace_level,
        cli.horizon,
    )
    .map_err(anyhow::Error::from)?;

    cluster.run().map_err(anyhow::Error::from)?;

    if let Some(path) = &cli.results_path {
        let json = serde_json::to_string_pretty(&cluster.metrics().per_request_json())?;
        std::fs::write(path, json).with_context(|| format!("writing --results-path {}", path.display()))?;
    }

    let aggregate = cluster.metrics().aggregate();
    println!("{}", serde_json::to_string_pretty(&aggregate)?);

    if trace_level == TraceLevel::Decisions {
        println!("{}", serde_json::to_string_pretty(&TraceDump {
            admissions: cluster.trace().admissions(),
            routings: cluster.trace().routings(),
        })?);
    }
    if cli.summarize_trace {
        println!("{}", serde_json::to_string_pretty(&cluster.trace().summarize())?);
    }

    println!(
        "injected={} completed={} rejected={}",
        cluster.injected(),
        cluster.completed(),
        cluster.rejected()
    );

    Ok(())
}

#[derive(serde::Serialize)]
struct TraceDump<'a> {
    admissions: &'a [blis_core::metrics::AdmissionRecord],
    routings: &'a [blis_core::metrics::RoutingRecord],
}

fn parse_routing_policy(name: &str, scorers: Option<&str>) -> AnyResult<RoutingPolicy> {
    match name {
        "round-robin" => Ok(RoutingPolicy::RoundRobin { next: 0 }),
        "least-loaded" => Ok(RoutingPolicy::LeastLoaded),
        "prefix-affinity" => Ok(RoutingPolicy::PrefixAffinity),
        "always-busiest" => Ok(RoutingPolicy::AlwaysBusiest),
        "weighted" => {
            let spec = scorers.context("--routing-scorers is required for --routing-policy weighted")?;
            let mut parsed = Vec::new();
            for entry in spec.split(',') {
                let (name, weight) = entry
                    .split_once(':')
                    .with_context(|| format!("invalid --routing-scorers entry '{entry}', expected name:weight"))?;
                let kind = ScorerKind::parse(name.trim())
                    .with_context(|| format!("unknown scorer '{name}' in --routing-scorers"))?;
                let weight: u32 = weight
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid weight '{weight}' in --routing-scorers"))?;
                parsed.push((kind, weight));
            }
            if parsed.is_empty() {
                bail!("--routing-scorers must name at least one scorer");
            }
            Ok(RoutingPolicy::Weighted { scorers: parsed })
        }
        other => bail!("unknown --routing-policy '{other}'"),
    }
}
