use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use patchbench::batch::{absolute, run_batch, ManifestSettings, ModelRun, RunManifest, RunPaths};
use patchbench::config::{Credentials, HarnessConfig, ModelsFile, CREDENTIALS_FILE};
use patchbench::harness::{AttemptContext, Mode};
use patchbench::predictions::{sanitize_file, validate_predictions_file, write_baseline};
use patchbench::task::{load_instance_lines, resolve_tasks, JsonlDataset};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_INSTANCES: &str = "instances/i1_instances_lite.jsonl";

#[derive(Parser, Debug)]
#[command(
    name = "patchbench",
    about = "Generate, repair, and check model-written patches for SWE-bench style tasks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every task against every configured model.
    Run(RunArgs),
    /// Check that a predictions file is well-formed.
    Validate(ValidateArgs),
    /// Strip fences and patch markers from every model_patch.
    Sanitize(SanitizeArgs),
    /// Write empty-patch predictions for every instance.
    Baseline(BaselineArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long, default_value = DEFAULT_INSTANCES)]
    instances: PathBuf,
    /// Local JSONL export of the benchmark, joined on instance_id.
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long, default_value = "config/models.toml")]
    models_config: PathBuf,
    #[arg(long, default_value_t = 2)]
    attempts: usize,
    #[arg(long, default_value_t = 0.2)]
    temperature: f32,
    #[arg(long, default_value_t = 2000)]
    max_output_tokens: u32,
    #[arg(long, value_enum, default_value_t = Mode::Patch)]
    mode: Mode,
    /// Concurrent tasks (default: WORKERS or 12).
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value = "runs")]
    out_dir: PathBuf,
    /// Skip the dry-run apply against a real checkout.
    #[arg(long)]
    no_preflight: bool,
    /// Don't add file hints mined from the issue text.
    #[arg(long)]
    no_hints: bool,
    #[arg(long, default_value = CREDENTIALS_FILE)]
    credentials: PathBuf,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    predictions: PathBuf,
}

#[derive(Args, Debug)]
struct SanitizeArgs {
    input: PathBuf,
    /// Defaults to <stem>.sanitized.jsonl next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BaselineArgs {
    #[arg(long, default_value = DEFAULT_INSTANCES)]
    instances: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value = "baseline_no_patch")]
    model_name: String,
    #[arg(long, default_value = "runs")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("patchbench=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_predictions(args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Sanitize(args) => run_sanitize(args),
        Commands::Baseline(args) => run_baseline(args),
    }
}

async fn run_predictions(args: RunArgs) -> Result<()> {
    let credentials = Credentials::load(&args.credentials)?;
    let models = ModelsFile::load(&args.models_config)?;
    let mut config = HarnessConfig::resolve(credentials, &models)?;

    config.attempts.attempts = args.attempts;
    config.attempts.mode = args.mode;
    config.attempts.sampling.temperature = args.temperature;
    config.attempts.sampling.max_output_tokens = args.max_output_tokens;
    if args.no_preflight {
        config.attempts.preflight = false;
    }
    if args.no_hints {
        config.attempts.hints = false;
    }
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    let config = config.into_shared();

    let lines = load_instance_lines(&args.instances)?;
    let dataset = args
        .dataset
        .as_deref()
        .map(JsonlDataset::load)
        .transpose()?;
    let tasks = resolve_tasks(lines, dataset.as_ref())
        .with_context(|| format!("Failed to resolve tasks from '{}'", args.instances.display()))?;

    let runs = models
        .models
        .iter()
        .map(|spec| {
            Ok(ModelRun {
                spec: spec.clone(),
                gateway: config.make_gateway(spec)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let ctx = Arc::new(AttemptContext {
        workspaces: Arc::new(config.workspace_provider()),
        fixups: config.fixups.clone(),
        settings: config.attempts.clone(),
    });
    let paths = RunPaths::new(&args.out_dir, &args.run_id);
    let summary = run_batch(ctx, &tasks, &runs, config.workers, &paths).await?;

    let mut manifest = RunManifest::new(&args.run_id, &paths.predictions);
    manifest.instances_path = Some(absolute(&args.instances));
    manifest.models = models.models.clone();
    manifest.settings = Some(ManifestSettings::new(&config.attempts, config.workers));
    manifest.summary = summary.counts.clone();
    manifest.write(&paths.manifest)?;

    println!("Predictions written: {}", paths.predictions.display());
    println!("Manifest: {}", paths.manifest.display());
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let issues = validate_predictions_file(&args.predictions)?;
    if issues.is_empty() {
        println!("Predictions file looks well-formed.");
        return Ok(());
    }
    for issue in &issues {
        println!("{}", issue);
    }
    println!("Issues found in predictions.");
    std::process::exit(1);
}

fn run_sanitize(args: SanitizeArgs) -> Result<()> {
    let report = sanitize_file(&args.input, args.output.as_deref())?;
    println!(
        "Wrote {} (sanitized {}/{})",
        report.output.display(),
        report.changed,
        report.total
    );
    Ok(())
}

fn run_baseline(args: BaselineArgs) -> Result<()> {
    let run_id = args
        .run_id
        .unwrap_or_else(|| format!("baseline-{}", chrono::Utc::now().timestamp()));
    let ids: Vec<String> = load_instance_lines(&args.instances)?
        .into_iter()
        .map(|line| line.instance_id)
        .collect();
    if ids.is_empty() {
        return Err(anyhow!(
            "No instances found in '{}'",
            args.instances.display()
        ));
    }
    let paths = RunPaths::new(&args.out_dir, &run_id);
    write_baseline(&ids, &args.instances, &paths, &run_id, &args.model_name)?;

    println!("Baseline predictions written to {}", paths.predictions.display());
    println!("Manifest written to {}", paths.manifest.display());
    Ok(())
}
