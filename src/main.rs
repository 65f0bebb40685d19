mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use idcycle_auth::AuthSessionBroker;
use idcycle_core::config::EngineConfig;
use idcycle_core::event::{EventBus, EventSink};
use idcycle_core::redact::Redactor;
use idcycle_core::traits::ProviderRegistry;
use idcycle_core::types::{LifecycleRequest, Plan, RunStatus};
use idcycle_engine::plan::{export_plan, read_document, write_plan_export};
use idcycle_engine::{event_capacity, Executor, PlanBuilder, RunLogger, WorkflowFile};
use idcycle_steps::{InMemoryIdentityProvider, StepRegistry};

/// Alias under which the reference in-memory directory is registered.
const IDENTITY_PROVIDER: &str = "Identity";

#[derive(Parser)]
#[command(name = "idcycle", version, about = "Declarative identity lifecycle workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "idcycle.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Inputs {
    /// Workflow definition (.json or .toml)
    #[arg(short, long)]
    workflow: PathBuf,
    /// Lifecycle request (.json or .toml)
    #[arg(short, long)]
    request: PathBuf,
    /// Seed the in-memory directory from a JSON file
    #[arg(long)]
    identities: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a plan and print a short summary
    Validate {
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Build a plan and write its canonical JSON export
    Plan {
        #[command(flatten)]
        inputs: Inputs,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Build and execute a plan, printing the execution result
    Run {
        #[command(flatten)]
        inputs: Inputs,
        /// Write every event to this JSONL file
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// List registered step types
    Steps,
    /// Check configuration health
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("idcycle=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate { inputs } => {
            let (plan, _) = build_plan(&config, &inputs)?;
            print_summary(&plan);
        }
        Commands::Plan { inputs, out } => {
            let (plan, _) = build_plan(&config, &inputs)?;
            let redactor = Redactor::new(&config.redaction);
            match out {
                Some(path) => {
                    write_plan_export(&plan, &redactor, &path)?;
                    info!(path = %path.display(), "Plan exported");
                }
                None => print!("{}", export_plan(&plan, &redactor)?),
            }
        }
        Commands::Run { inputs, events } => {
            let (plan, providers) = build_plan(&config, &inputs)?;
            let status = run_plan(&config, &plan, &providers, events).await?;
            if status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Steps => {
            let catalog = StepRegistry::with_builtins().catalog();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Commands::Doctor => {
            println!("idcycle doctor");
            println!("==============");
            if !doctor::run_doctor(&cli.config, &config) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn build_plan(
    config: &EngineConfig,
    inputs: &Inputs,
) -> anyhow::Result<(Plan, ProviderRegistry)> {
    let request: LifecycleRequest = serde_json::from_value(read_document(&inputs.request)?)
        .with_context(|| format!("parsing request {}", inputs.request.display()))?;
    let providers = providers(config, inputs.identities.as_deref())?;
    let plan = PlanBuilder::new().build(&WorkflowFile::new(inputs.workflow.clone()), &request, &providers)?;
    Ok((plan, providers))
}

fn providers(config: &EngineConfig, identities: Option<&Path>) -> anyhow::Result<ProviderRegistry> {
    let directory = match identities {
        Some(path) => InMemoryIdentityProvider::from_seed(&read_document(path)?)
            .with_context(|| format!("seeding identities from {}", path.display()))?,
        None => InMemoryIdentityProvider::new(),
    };
    let mut providers = ProviderRegistry::new().with_provider(IDENTITY_PROVIDER, Arc::new(directory));
    if let Some(auth) = &config.auth {
        let broker = AuthSessionBroker::from_config(auth)?;
        info!(routes = broker.route_count(), default = broker.has_default(), "Auth sessions configured");
        providers.set_auth_sessions(Arc::new(broker));
    }
    Ok(providers)
}

async fn run_plan(
    config: &EngineConfig,
    plan: &Plan,
    providers: &ProviderRegistry,
    events: Option<PathBuf>,
) -> anyhow::Result<RunStatus> {
    let bus = Arc::new(EventBus::new(event_capacity(plan, &config.retry)));
    let cancel = CancellationToken::new();

    let logger = match (events, config.log_dir()) {
        (Some(path), _) => Some(RunLogger::new(path, 3)),
        (None, Some(dir)) => Some(RunLogger::in_dir(&dir, &plan.correlation_id, config.log.level)),
        (None, None) => None,
    };
    let log_task = logger.map(|logger| {
        info!(path = %logger.path().display(), "Writing run log");
        logger.spawn(&bus, plan.correlation_id.clone(), cancel.clone())
    });

    let sink: Arc<dyn EventSink> = bus.clone();
    let outcome = Executor::new(config)
        .execute(plan, providers, Some(sink))
        .await;
    if outcome.is_err() {
        cancel.cancel();
    }
    if let Some(task) = log_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Run log task failed");
        }
    }

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.status)
}

fn print_summary(plan: &Plan) {
    println!(
        "Workflow '{}' ({}) is valid",
        plan.workflow_name, plan.lifecycle_event
    );
    println!("  Correlation: {}", plan.correlation_id);
    for (label, steps) in [("Steps", &plan.steps), ("OnFailure", &plan.on_failure_steps)] {
        if steps.is_empty() {
            continue;
        }
        println!("  {}:", label);
        for step in steps {
            let caps = if step.requires_capabilities.is_empty() {
                String::new()
            } else {
                format!(" [{}]", step.requires_capabilities.join(", "))
            };
            println!(
                "    {:>2}. {:<28} {:<20} {:?}{}",
                step.index, step.name, step.step_type, step.status, caps
            );
        }
    }
}
