//! CLI entry point (§6). Mirrors the reference scheduler's flags one-for-one
//! and adds `--config`/`--simulate` so the binary runs against any workflow
//! JSON, not only the three bundled demo presets.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use jolteon_scheduler::constants::default_config_grid;
use jolteon_scheduler::emitter::BoundType as EmitterBoundType;
use jolteon_scheduler::external::{FunctionInvoker, FunctionManager, LocalSimulator};
use jolteon_scheduler::perf_model::{StagePerfModel, TrainingSample};
use jolteon_scheduler::profiler::{profile_sweep, ProfileRecord};
use jolteon_scheduler::scheduler;
use jolteon_scheduler::workflow::Workflow;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WorkflowPreset {
    Ml,
    Tpcds,
    Video,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SchedulerName {
    Jolteon,
    Ditto,
    Orion,
    Caerus,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BoundType {
    Latency,
    Cost,
}

impl From<BoundType> for EmitterBoundType {
    fn from(value: BoundType) -> Self {
        match value {
            BoundType::Latency => EmitterBoundType::Latency,
            BoundType::Cost => EmitterBoundType::Cost,
        }
    }
}

/// Chance-constrained scheduler for serverless DAG workflows.
#[derive(Parser, Debug)]
#[command(name = "jolteon", author, version, about)]
struct Cli {
    /// Bundled demo workflow preset, used when `--config` is not given.
    #[arg(short = 'w', long = "workflow", value_enum)]
    workflow: Option<WorkflowPreset>,

    /// Path to a workflow config JSON file (§6); overrides `-w`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scheduling strategy.
    #[arg(short = 's', long = "scheduler", value_enum, default_value = "jolteon")]
    scheduler: SchedulerName,

    /// What the bound value constrains.
    #[arg(long = "bt", value_enum, default_value = "latency")]
    bound_type: BoundType,

    /// The bound value itself (seconds for latency, cost units for cost).
    #[arg(long = "bv")]
    bound_value: f64,

    /// Desired chance-constraint service level, e.g. 0.95.
    #[arg(short = 'l', long = "service-level", default_value_t = 0.95)]
    service_level: f64,

    /// Confidence that the scenario-program bound holds, e.g. 0.999.
    #[arg(short = 'c', long = "confidence", default_value_t = 0.999)]
    confidence: f64,

    /// Profile only; do not train or schedule.
    #[arg(short = 'p', long = "profile-only", default_value_t = false)]
    profile_only: bool,

    /// Train only (from an existing profile file); do not schedule.
    #[arg(short = 't', long = "train-only", default_value_t = false)]
    train_only: bool,

    /// Path to read/write the JSON profile file.
    #[arg(long, default_value = "profile.json")]
    profile_path: PathBuf,

    /// Use the in-memory `LocalSimulator` instead of a real invocation client.
    #[arg(long, default_value_t = true)]
    simulate: bool,
}

fn preset_path(preset: WorkflowPreset) -> PathBuf {
    let name = match preset {
        WorkflowPreset::Ml => "ml.json",
        WorkflowPreset::Tpcds => "tpcds.json",
        WorkflowPreset::Video => "video.json",
    };
    PathBuf::from("demos").join(name)
}

fn load_workflow(cli: &Cli) -> Result<Workflow> {
    let path = match (&cli.config, cli.workflow) {
        (Some(p), _) => p.clone(),
        (None, Some(preset)) => preset_path(preset),
        (None, None) => anyhow::bail!("one of --config or -w/--workflow is required"),
    };
    let json = fs::read_to_string(&path).with_context(|| format!("reading workflow config at {}", path.display()))?;
    Workflow::parse_config(&json).map_err(anyhow::Error::from).context("parsing workflow config")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut workflow = load_workflow(&cli)?;

    if !cli.simulate {
        anyhow::bail!("only --simulate is supported; real Lambda/S3 clients are out of scope");
    }
    let sim = Arc::new(LocalSimulator::new());
    let invoker: Arc<dyn FunctionInvoker> = sim.clone();
    let manager: Arc<dyn FunctionManager> = sim;

    if cli.profile_only {
        let grid = default_config_grid();
        let record = profile_sweep(&mut workflow, invoker, manager, &grid, 3)
            .await
            .map_err(anyhow::Error::from)
            .context("profiling sweep")?;
        let json = serde_json::to_string_pretty(&record).context("serializing profile")?;
        fs::write(&cli.profile_path, json).with_context(|| format!("writing profile to {}", cli.profile_path.display()))?;
        tracing::info!(path = %cli.profile_path.display(), "wrote profile");
        return Ok(());
    }

    let profile_json = fs::read_to_string(&cli.profile_path)
        .with_context(|| format!("reading profile at {}", cli.profile_path.display()))?;
    let record: ProfileRecord = serde_json::from_str(&profile_json).context("parsing profile JSON")?;
    train_all_stages(&mut workflow, &record)?;

    if cli.train_only {
        tracing::info!("training complete");
        return Ok(());
    }

    match cli.scheduler {
        SchedulerName::Jolteon => {
            let status = scheduler::schedule(
                &mut workflow,
                cli.bound_type.into(),
                cli.bound_value,
                cli.service_level,
                cli.confidence,
                jolteon_scheduler::constants::DEFAULT_SAMPLE_SEED,
            )
            .map_err(anyhow::Error::from)
            .context("solving chance-constrained schedule")?;
            tracing::info!(?status, "solver finished");
        }
        other => {
            anyhow::bail!("scheduler {:?} is a shallow baseline; only jolteon is fully implemented here", other);
        }
    }

    for stage in &workflow.stages {
        println!("{}: num_func={} memory_mb={:.1}", stage.name, stage.num_func, stage.memory_mb);
    }
    Ok(())
}

/// Build per-epoch training samples from a profile record's avg column and
/// fit every stage's performance model.
fn train_all_stages(workflow: &mut Workflow, record: &ProfileRecord) -> Result<()> {
    let grid = default_config_grid();
    for idx in 0..workflow.stages.len() {
        let name = workflow.stages[idx].name.clone();
        let phases = record
            .stages
            .get(&name)
            .ok_or_else(|| anyhow::anyhow!("profile missing stage {name}"))?;

        let has_parent = !workflow.stages[idx].parents.is_empty();
        let allow_parallel = workflow.stages[idx].allow_parallel;
        let parent_num_func = workflow.stages[idx].parents.first().map(|&p| workflow.stages[p].num_func as f64);

        let mut samples = Vec::new();
        let mut cold_samples = Vec::new();
        // §4.1's training procedure: drop the first epoch (cold warm-up),
        // then flatten every remaining epoch's config-pair row into samples.
        for epoch_idx in 1..phases.read.len() {
            let Some(read_row) = phases.read.get(epoch_idx) else { continue };
            let Some(compute_row) = phases.compute.get(epoch_idx) else { continue };
            let Some(write_row) = phases.write.get(epoch_idx) else { continue };
            let cold_row = phases.cold.get(epoch_idx);

            for (config_idx, &(mem, num_func)) in grid.iter().enumerate() {
                let Some(read) = read_row.get(config_idx) else { continue };
                let Some(compute) = compute_row.get(config_idx) else { continue };
                let Some(write) = write_row.get(config_idx) else { continue };
                if let Some(cold) = cold_row.and_then(|row| row.get(config_idx)) {
                    cold_samples.push(cold[0]);
                }

                let k = mem as f64 / jolteon_scheduler::constants::MB_PER_VCPU;
                let d = num_func as f64;
                samples.push(TrainingSample {
                    d,
                    k,
                    parent_d: parent_num_func,
                    read: read[0],
                    compute: compute[0],
                    write: write[0],
                });
            }
        }

        let model = StagePerfModel::train(cold_samples, allow_parallel, has_parent, &samples)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("fitting stage {name}"))?;
        workflow.stages[idx].model = Some(model);
    }
    Ok(())
}
