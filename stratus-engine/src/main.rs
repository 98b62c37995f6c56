//! stratus: apply, validate and generate convergence plans.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tabled::Table;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratus_engine::{
    ConvergencePlan, DatabaseOptions, EngineConfig, MemoryProvider, Providers, Reconciler,
    ReportRow, RunReport, WebStackBlueprint, WebStackOptions,
};

/// Declarative find-or-create reconciliation of resource graphs
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile a plan against the local state file
    Apply {
        /// Plan file (JSON)
        #[arg(long)]
        plan: PathBuf,

        /// Provider state file
        #[arg(long, default_value = "stratus-state.json")]
        state_file: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Validate a plan and print its resolution order
    Validate {
        /// Plan file (JSON)
        #[arg(long)]
        plan: PathBuf,
    },
    /// Print the web-stack plan as JSON
    Blueprint(BlueprintArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Poll interval for network resources, in seconds
    #[arg(long, default_value = "10")]
    network_poll_interval: u64,

    /// Poll interval for instances and databases, in seconds
    #[arg(long, default_value = "30")]
    compute_poll_interval: u64,

    /// Readiness timeout per resource, in seconds
    #[arg(long, default_value = "600")]
    readiness_timeout: u64,

    /// Overall deadline for the run, in seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Maximum resources resolved concurrently
    #[arg(long, default_value = "8")]
    max_concurrency: usize,
}

impl From<&EngineArgs> for EngineConfig {
    fn from(args: &EngineArgs) -> Self {
        EngineConfig {
            network_poll_interval: Duration::from_secs(args.network_poll_interval),
            compute_poll_interval: Duration::from_secs(args.compute_poll_interval),
            readiness_timeout: Duration::from_secs(args.readiness_timeout),
            run_deadline: args.deadline.map(Duration::from_secs),
            max_concurrency: args.max_concurrency,
        }
    }
}

#[derive(Args, Debug)]
struct BlueprintArgs {
    /// Name prefix for provider-side resources
    #[arg(long, default_value = "web")]
    name: String,

    /// Network CIDR block (a /16)
    #[arg(long, default_value = "10.0.0.0/16")]
    cidr_block: String,

    /// Availability zones for the two subnet pairs
    #[arg(long, num_args = 2, default_values = ["zone-a", "zone-b"])]
    zones: Vec<String>,

    /// Instance image
    #[arg(long, default_value = "image-web")]
    image_id: String,

    /// Instance type
    #[arg(long, default_value = "small")]
    instance_type: String,

    /// Key pair name
    #[arg(long, default_value = "web-key")]
    key_name: String,

    /// Where the private key is written on creation
    #[arg(long, default_value = "keys/web-key.pem")]
    key_path: String,

    /// Adopt an existing key pair even if the local private key is missing
    #[arg(long)]
    allow_missing_key: bool,

    /// Target group health check path
    #[arg(long, default_value = "/health")]
    health_check_path: String,

    /// Include a database instance
    #[arg(long, requires = "db_password")]
    database: bool,

    #[arg(long, default_value = "web-db")]
    db_identifier: String,

    #[arg(long, default_value = "postgres")]
    db_engine: String,

    #[arg(long, default_value = "db.small")]
    db_instance_class: String,

    /// Allocated storage in GB
    #[arg(long, default_value = "20")]
    db_storage: u64,

    #[arg(long, default_value = "app")]
    db_username: String,

    /// Database master password (required with --database)
    #[arg(long)]
    db_password: Option<String>,

    /// Include an object-store bucket with this name
    #[arg(long)]
    bucket: Option<String>,
}

impl BlueprintArgs {
    fn into_options(self) -> Result<WebStackOptions> {
        let database = if self.database {
            let master_password = self
                .db_password
                .context("--database requires --db-password")?;
            Some(DatabaseOptions {
                identifier: self.db_identifier,
                engine: self.db_engine,
                instance_class: self.db_instance_class,
                allocated_storage_gb: self.db_storage,
                master_username: self.db_username,
                master_password,
            })
        } else {
            None
        };

        let [zone_a, zone_b]: [String; 2] = self
            .zones
            .try_into()
            .map_err(|_| anyhow::anyhow!("exactly two zones are required"))?;

        Ok(WebStackOptions {
            name: self.name,
            cidr_block: self.cidr_block,
            zones: [zone_a, zone_b],
            image_id: self.image_id,
            instance_type: self.instance_type,
            key_name: self.key_name,
            key_path: self.key_path,
            require_local_key: !self.allow_missing_key,
            health_check_path: self.health_check_path,
            database,
            bucket: self.bucket,
        })
    }
}

/// JSON form of a finished run.
#[derive(Serialize)]
struct ApplyOutput {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    success: bool,
    error: Option<String>,
    resources: Vec<ReportRow>,
}

impl From<&RunReport> for ApplyOutput {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            success: report.is_success(),
            error: report.error.as_ref().map(|e| e.to_string()),
            resources: report.rows(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus=info,stratus_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Apply {
            plan,
            state_file,
            output,
            engine,
        } => {
            let report = apply(&plan, &state_file, EngineConfig::from(&engine)).await?;
            match output {
                OutputFormat::Table => {
                    println!("{}", Table::new(report.rows()));
                    if let Some(err) = &report.error {
                        eprintln!("Error: {}", err);
                    }
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&ApplyOutput::from(&report))?;
                    println!("{}", json);
                }
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Command::Validate { plan } => {
            let plan = load_plan(&plan).await?;
            let order = plan.topological_order()?;
            println!("Plan is valid ({} resources). Resolution order:", plan.len());
            for (n, idx) in order.iter().enumerate() {
                let spec = &plan.specs()[*idx];
                println!("{:>3}. {} ({})", n + 1, spec.logical_name, spec.kind);
            }
        }
        Command::Blueprint(args) => {
            let plan = WebStackBlueprint::new(args.into_options()?).build()?;
            println!("{}", plan.to_json_pretty()?);
        }
    }

    Ok(())
}

async fn load_plan(path: &Path) -> Result<ConvergencePlan> {
    let input = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    ConvergencePlan::from_json(&input)
        .with_context(|| format!("invalid plan {}", path.display()))
}

async fn apply(plan_path: &Path, state_file: &Path, config: EngineConfig) -> Result<RunReport> {
    let plan = load_plan(plan_path).await?;
    let provider = MemoryProvider::open(state_file)
        .await
        .with_context(|| format!("failed to open state file {}", state_file.display()))?;
    info!(
        "Applying {} ({} resources) with state file {}",
        plan_path.display(),
        plan.len(),
        state_file.display()
    );

    let reconciler = Reconciler::new(Providers::new(Arc::new(provider)), config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            trigger.cancel();
        }
    });

    let report = reconciler.reconcile_with_cancel(&plan, cancel).await?;
    Ok(report)
}
