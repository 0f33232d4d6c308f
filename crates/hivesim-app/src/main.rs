use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hivesim_core::{
    ExperimentJob, Expr, HeadlessConfig, OutputDecl, Parameter, Registry, RunReport,
    RuntimeContext, SetupError, SimulationConfig, StopReason, Value, run_replications,
};
use hivesim_storage::{JsonLinesSink, JsonModelLoader, PngImageWriter, load_plan, save_job};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "hivesim",
    version,
    about = "Run hivesim experiments headless"
)]
struct Cli {
    /// JSON file holding simulation settings (cell size, footprint, colors).
    #[arg(long, env = "HIVESIM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory that relative model paths are resolved against.
    #[arg(long, env = "HIVESIM_MODEL_ROOT")]
    model_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one experiment to completion.
    Run(RunArgs),
    /// Run the same experiment once per seed, in parallel.
    Replicate {
        #[command(flatten)]
        run: RunArgs,
        /// Comma-separated seeds, one replication each.
        #[arg(long, value_delimiter = ',', required = true)]
        seeds: Vec<u64>,
    },
    /// Run every job of a persisted plan, one after the other.
    Plan {
        plan: PathBuf,
        /// Directory receiving one `job-<id>.jsonl` file per job.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[command(flatten)]
        headless: HeadlessArgs,
    },
    /// List the experiments, parameters and outputs a model declares.
    Describe { model: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Model descriptor (JSON).
    model: PathBuf,
    /// Experiment declared by the model; its seed, stop step, parameters
    /// and outputs are used unless overridden.
    #[arg(short, long, default_value = "")]
    experiment: String,
    /// Stop once this many steps have run; negative runs until the stop
    /// condition holds.
    #[arg(long, allow_negative_numbers = true)]
    final_step: Option<i64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Stop condition as a JSON expression, e.g. `{"var": "done"}`.
    #[arg(long)]
    until: Option<String>,
    /// Parameter override as `name=<json value>`.
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,
    /// Extra output as `name` or `name:framerate`.
    #[arg(short, long = "watch", value_name = "NAME[:RATE]")]
    watch: Vec<String>,
    /// JSON-lines file receiving the sampled outputs.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Write the job document here before running.
    #[arg(long)]
    save_job: Option<PathBuf>,
    #[command(flatten)]
    headless: HeadlessArgs,
}

#[derive(Args, Debug)]
struct HeadlessArgs {
    /// Directory receiving display images.
    #[arg(long, env = "HIVESIM_IMAGES", default_value = "images")]
    images: PathBuf,
    /// Do not print progress dots.
    #[arg(long)]
    no_progress: bool,
}

impl HeadlessArgs {
    fn config(&self) -> HeadlessConfig {
        HeadlessConfig {
            images_dir: self.images.clone(),
            show_progress: !self.no_progress,
            ..HeadlessConfig::default()
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let context = build_context(&cli)?;

    match cli.command {
        Command::Run(args) => run_command(&context, &args),
        Command::Replicate { run, seeds } => replicate_command(&context, &run, &seeds),
        Command::Plan {
            plan,
            output_dir,
            headless,
        } => plan_command(&context, &plan, output_dir.as_deref(), &headless),
        Command::Describe { model } => describe_command(&context, &model),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_context(cli: &Cli) -> Result<RuntimeContext> {
    let config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<SimulationConfig>(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };
    let loader = match &cli.model_root {
        Some(root) => JsonModelLoader::with_root(root),
        None => JsonModelLoader::new(),
    };
    RuntimeContext::new(Arc::new(Registry::with_builtins()), Box::new(loader), config)
        .context("invalid simulation config")
}

fn build_job(context: &RuntimeContext, args: &RunArgs) -> Result<ExperimentJob> {
    let model = context
        .model(&args.model)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    let mut job = if args.experiment.is_empty() {
        ExperimentJob::new(&args.model, "", -1, 0)
    } else {
        ExperimentJob::from_declaration(&args.model, &model, &args.experiment)?
    };
    if let Some(final_step) = args.final_step {
        job.set_final_step(final_step);
    }
    if let Some(seed) = args.seed {
        job.set_seed(seed);
    }
    if let Some(until) = &args.until {
        let expr: Expr = serde_json::from_str(until).context("--until is not a JSON expression")?;
        job.set_until(Some(expr));
    }
    for param in &args.params {
        let (name, value) = parse_param(param)?;
        match job.set_parameter_value(&name, value.clone()) {
            Err(SetupError::UnresolvedParameter(_)) => job.add_parameter(Parameter::new(name, value)),
            other => other?,
        }
    }
    for watch in &args.watch {
        let (name, framerate) = parse_watch(watch)?;
        if job.set_output_framerate(&name, framerate).is_err() {
            job.add_output(&name, framerate)?;
        }
    }
    job.set_headless(args.headless.config());
    job.set_image_writer(Box::new(PngImageWriter));
    Ok(job)
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("parameter `{raw}` is not of the form name=value");
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

fn parse_watch(raw: &str) -> Result<(String, u32)> {
    match raw.split_once(':') {
        Some((name, rate)) => {
            let rate = rate
                .parse()
                .with_context(|| format!("invalid frame rate in `{raw}`"))?;
            Ok((name.to_string(), rate))
        }
        None => Ok((raw.to_string(), 1)),
    }
}

fn attach_sink(job: &mut ExperimentJob, path: &Path) -> Result<()> {
    let sink = JsonLinesSink::create(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    job.set_sink(Box::new(sink));
    Ok(())
}

fn run_command(context: &RuntimeContext, args: &RunArgs) -> Result<()> {
    let mut job = build_job(context, args)?;
    if let Some(path) = &args.save_job {
        save_job(path, &job.to_record())?;
        info!(path = %path.display(), "job document saved");
    }
    if let Some(path) = &args.output {
        attach_sink(&mut job, path)?;
    }
    let report = job.play_and_dispose(context)?;
    summarize(&report)
}

/// `out.jsonl` becomes `out-<seed>.jsonl`.
fn replication_path(base: &Path, seed: u64) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}-{seed}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{seed}"),
    };
    base.with_file_name(name)
}

fn replicate_command(context: &RuntimeContext, args: &RunArgs, seeds: &[u64]) -> Result<()> {
    let mut template = build_job(context, args)?;
    let mut headless = args.headless.config();
    headless.show_progress = false;
    template.set_headless(headless);
    let results = run_replications(&template, context, seeds, |job| {
        job.set_image_writer(Box::new(PngImageWriter));
        if let Some(base) = &args.output {
            let path = replication_path(base, job.seed());
            if let Err(err) = attach_sink(job, &path) {
                warn!(seed = job.seed(), error = %err, "replication runs without output file");
            }
        }
    });
    let mut failures = 0;
    for (seed, result) in results {
        match result {
            Ok(report) if !report.failed() => summarize(&report)?,
            Ok(report) => {
                failures += 1;
                println!("seed {seed}: {}", stop_label(&report.stop));
            }
            Err(err) => {
                failures += 1;
                println!("seed {seed}: {err}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} replications failed", seeds.len());
    }
    Ok(())
}

fn plan_command(
    context: &RuntimeContext,
    plan: &Path,
    output_dir: Option<&Path>,
    headless: &HeadlessArgs,
) -> Result<()> {
    let plan = load_plan(plan).with_context(|| format!("failed to read plan {}", plan.display()))?;
    info!(jobs = plan.jobs.len(), "running plan");
    for record in plan.jobs {
        let mut job = ExperimentJob::from_record(record);
        let output = output_dir.map(|dir| dir.join(format!("job-{}.jsonl", job.id())));
        job.set_headless(headless.config());
        job.set_image_writer(Box::new(PngImageWriter));
        if let Some(path) = &output {
            attach_sink(&mut job, path)?;
        }
        let report = job
            .play_and_dispose(context)
            .with_context(|| format!("job {} could not run", job.id()))?;
        summarize(&report)?;
    }
    Ok(())
}

fn describe_command(context: &RuntimeContext, path: &Path) -> Result<()> {
    let model = context
        .model(path)
        .with_context(|| format!("failed to load model {}", path.display()))?;
    let environment = model.environment();
    println!(
        "model {} ({} x {}{})",
        model.name(),
        environment.width,
        environment.height,
        if environment.torus == Some(true) { ", torus" } else { "" }
    );
    let species: Vec<&str> = model
        .all_species()
        .iter()
        .filter(|species| !species.is_builtin())
        .map(|species| species.name())
        .collect();
    println!("species: {}", species.join(", "));
    for experiment in model.experiments() {
        println!("experiment {}", experiment.name);
        if let Some(seed) = experiment.seed {
            println!("  seed {seed}");
        }
        if let Some(final_step) = experiment.final_step {
            println!("  final step {final_step}");
        }
        for parameter in &experiment.parameters {
            println!(
                "  parameter {} -> {} : {} = {}",
                parameter.name,
                parameter.var.as_deref().unwrap_or(&parameter.name),
                parameter.ty,
                parameter.value
            );
        }
        for output in &experiment.outputs {
            let kind = match output {
                OutputDecl::Monitor { .. } => "monitor",
                OutputDecl::Display { .. } => "display",
            };
            println!(
                "  {kind} {} every {} step(s)",
                output.name(),
                output.framerate()
            );
        }
    }
    Ok(())
}

fn stop_label(stop: &StopReason) -> String {
    match stop {
        StopReason::FinalStep => "final step reached".into(),
        StopReason::Condition => "stop condition met".into(),
        StopReason::Interrupted => "interrupted".into(),
        StopReason::Failed(err) => format!("failed: {err}"),
    }
}

fn summarize(report: &RunReport) -> Result<()> {
    println!(
        "job {} seed {}: {} steps, cycle {}, {} in {:.2?}",
        report.job_id,
        report.seed,
        report.steps,
        report.cycle,
        stop_label(&report.stop),
        report.elapsed
    );
    if let StopReason::Failed(err) = &report.stop {
        bail!("job {} failed: {err}", report.job_id);
    }
    Ok(())
}
