use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mediaflow::config::{BalancingStrategy, OrchestratorConfig};
use mediaflow::job::{
    ElementKind, JobAnalyzer, JobRequest, JobState, JobSummary, MediaElement,
    OutputFormat as MediaFormat,
};
use mediaflow::orchestrator::Orchestrator;
use mediaflow::resources::WorkerNode;
use mediaflow::shutdown::install_shutdown_handler;
use mediaflow::worker::{SimulatedStepHandler, StepExecutor};
use mediaflow::workflow::WorkflowCatalog;

#[derive(Parser, Debug)]
#[command(name = "mediaflow")]
#[command(version)]
#[command(about = "Job orchestration engine for content-processing workflows")]
#[command(propagate_version = true)]
struct Args {
    /// Log output format
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator against simulated worker nodes
    Run(RunArgs),

    /// Print the analysis of a job request file as JSON
    Analyze {
        /// Path to a JSON job request
        file: PathBuf,
    },

    /// List the workflow catalog
    Templates {
        /// Extra templates to load on top of the built-ins (JSON array)
        #[arg(long)]
        templates: Option<PathBuf>,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON configuration file; flags below override its values
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Node selection strategy (round-robin, least-connections,
    /// weighted-round-robin, hash-based, resource-fit, multi-factor)
    #[arg(long)]
    strategy: Option<BalancingStrategy>,

    /// Maximum number of concurrently active jobs
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Job-level retries before a job is marked failed
    #[arg(long)]
    max_job_retries: Option<u32>,

    /// Number of baseline worker nodes to register
    #[arg(long, default_value = "4")]
    nodes: usize,

    /// Maintenance tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// JSON array of job requests to submit instead of the demo set
    #[arg(long)]
    requests: Option<PathBuf>,

    /// Extra workflow templates (JSON array)
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Base duration of a simulated step in milliseconds
    #[arg(long, default_value = "50")]
    step_delay_ms: u64,

    /// Probability that a simulated step attempt fails
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunSummaryOutput {
    submitted: usize,
    rejected: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
    jobs: Vec<JobSummary>,
}

#[derive(Serialize)]
struct TemplateOutput {
    name: String,
    parallel: bool,
    steps: Vec<String>,
    description: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(args: &RunArgs) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config = config.with_strategy(strategy);
    }
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_jobs = max;
    }
    if let Some(retries) = args.max_job_retries {
        config = config.with_max_job_retries(retries);
    }
    if let Some(tick) = args.tick_ms {
        config = config.with_tick_interval(tick);
    }
    config.validate()?;
    Ok(config)
}

fn load_catalog(path: Option<&PathBuf>) -> Result<WorkflowCatalog, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => WorkflowCatalog::from_file(path)?,
        None => WorkflowCatalog::builtin(),
    })
}

/// A spread of small and medium jobs that fit baseline nodes.
fn demo_requests() -> Vec<JobRequest> {
    vec![
        JobRequest::new(MediaFormat::Mp4, 1280, 720)
            .with_elements(ElementKind::Image, 2)
            .with_client("studio-a"),
        JobRequest::new(MediaFormat::Gif, 640, 480).with_elements(ElementKind::Text, 1),
        JobRequest::new(MediaFormat::Webm, 1920, 1080)
            .with_elements(ElementKind::Image, 3)
            .with_element(MediaElement::new(ElementKind::Audio, "soundtrack.mp3"))
            .with_client("studio-b"),
        JobRequest::new(MediaFormat::Mov, 1280, 720)
            .with_elements(ElementKind::Audio, 2)
            .with_client("studio-a"),
        JobRequest::new(MediaFormat::Mp4, 3840, 2160)
            .with_elements(ElementKind::Image, 4)
            .with_elements(ElementKind::Text, 2),
        JobRequest::new(MediaFormat::Mp4, 1920, 1080)
            .with_element(MediaElement::new(ElementKind::Video, "intro.mp4").with_duration(20.0))
            .with_client("studio-c"),
    ]
}

fn read_requests(path: &PathBuf) -> Result<Vec<JobRequest>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let catalog = load_catalog(args.templates.as_ref())?;
    let requests = match &args.requests {
        Some(path) => read_requests(path)?,
        None => demo_requests(),
    };

    let handler = SimulatedStepHandler::new(Duration::from_millis(args.step_delay_ms))
        .with_failure_rate(args.failure_rate);
    let executor = StepExecutor::uniform(Arc::new(handler));
    let drain_timeout = config.drain_timeout();
    let baseline = config.pool.baseline.clone();

    tracing::info!(
        nodes = args.nodes,
        strategy = %config.balancer.strategy,
        max_concurrent = config.max_concurrent_jobs,
        max_job_retries = config.max_job_retries,
        templates = catalog.len(),
        "Starting mediaflow"
    );

    let orchestrator = Orchestrator::builder(config)
        .with_catalog(catalog)
        .with_executor(executor)
        .build()?;
    for i in 1..=args.nodes {
        let id = format!("node-{}", i);
        orchestrator
            .register_node(WorkerNode::new(id.clone(), id, &baseline))
            .await?;
    }

    let shutdown = install_shutdown_handler();
    orchestrator.start(shutdown.clone())?;

    let mut submitted = 0;
    let mut rejected = 0;
    for request in requests {
        match orchestrator.submit(request).await {
            Ok(_) => submitted += 1,
            Err(e) => {
                rejected += 1;
                tracing::warn!(error = %e, "Submission rejected");
            }
        }
    }

    // Wait for the jobs to settle or for a signal.
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {
                if orchestrator.active_jobs().await == 0 {
                    break;
                }
            }
        }
    }

    orchestrator.shutdown(drain_timeout).await;
    let jobs = orchestrator.jobs().await;
    print_run_summary(submitted, rejected, jobs, &args.output)?;
    Ok(())
}

fn print_run_summary(
    submitted: usize,
    rejected: usize,
    jobs: Vec<JobSummary>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count();
    let summary = RunSummaryOutput {
        submitted,
        rejected,
        completed: count(JobState::Completed),
        failed: count(JobState::Failed),
        cancelled: count(JobState::Cancelled),
        jobs,
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<38} {:<11} {:<17} {:<10} {:<7} ERROR",
                "JOB ID", "STATE", "WORKFLOW", "NODE", "RETRIES"
            );
            println!("{}", "-".repeat(96));
            for job in &summary.jobs {
                println!(
                    "{:<38} {:<11} {:<17} {:<10} {:<7} {}",
                    job.id,
                    job.state,
                    job.workflow,
                    job.node_id.as_deref().unwrap_or("-"),
                    job.retries,
                    job.error.as_deref().unwrap_or("")
                );
            }
            println!();
            println!(
                "Submitted {}, rejected {}: {} completed, {} failed, {} cancelled",
                summary.submitted,
                summary.rejected,
                summary.completed,
                summary.failed,
                summary.cancelled
            );
        }
    }
    Ok(())
}

fn handle_analyze(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&file)?;
    let request: JobRequest = serde_json::from_str(&raw)?;
    request.validate()?;
    let analysis = JobAnalyzer::new().analyze(&request);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn handle_templates(
    templates: Option<PathBuf>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = load_catalog(templates.as_ref())?;
    let rows: Vec<TemplateOutput> = catalog
        .templates()
        .map(|t| TemplateOutput {
            name: t.name.clone(),
            parallel: t.parallel,
            steps: t.steps.iter().map(|s| s.id.clone()).collect(),
            description: t.description.clone(),
        })
        .collect();

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => {
            println!("{:<18} {:<9} STEPS", "NAME", "PARALLEL");
            println!("{}", "-".repeat(70));
            for row in &rows {
                println!(
                    "{:<18} {:<9} {}",
                    row.name,
                    if row.parallel { "yes" } else { "no" },
                    row.steps.join(" ")
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_format);

    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
        Commands::Analyze { file } => handle_analyze(file)?,
        Commands::Templates { templates, output } => handle_templates(templates, &output)?,
    }

    Ok(())
}
