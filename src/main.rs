use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use fleetnet::config::{load_delta, FleetConfig};
use fleetnet::dashboard::run_dashboard;
use fleetnet::fleet::{Fleet, FleetOutcome};
use fleetnet::results::{NodeRecord, ResultsStore};
use fleetnet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleetnet")]
#[command(version)]
#[command(about = "Contract-net task allocation with decentralized load rebalancing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a fleet of compute nodes and tasks and run it to convergence
    Run(RunArgs),

    /// Print a results file written by `run`
    Results {
        /// Results file to read
        #[arg(long, default_value = "results.json")]
        path: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Fleet description (JSON)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Convergence tolerance (overrides the config file and --delta-file)
    #[arg(long)]
    delta: Option<f64>,

    /// File holding a bare delta value; unreadable values fall back to the default
    #[arg(long)]
    delta_file: Option<PathBuf>,

    /// Where to write the final per-node results
    #[arg(long, default_value = "results.json")]
    results: PathBuf,

    /// Port for the read-only status API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Give up waiting for convergence after this many seconds
    #[arg(long, default_value = "300")]
    max_runtime_secs: u64,

    /// Prefix applied to every task name
    #[arg(long)]
    task_prefix: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

async fn run_fleet(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FleetConfig::load(&args.config)?;
    if let Some(path) = &args.delta_file {
        config.delta = load_delta(path);
    }
    if let Some(delta) = args.delta {
        config.delta = delta;
    }
    if let Some(prefix) = &args.task_prefix {
        config.tasks = config
            .tasks
            .into_iter()
            .map(|task| task.with_prefix(prefix))
            .collect();
    }

    let store = ResultsStore::new(&args.results);
    store.reset()?;

    let shutdown = install_shutdown_handler();
    let fleet = Fleet::start(&config, shutdown.clone())?;

    if let Some(port) = args.dashboard_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let view = fleet.view();
        let dashboard_shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_dashboard(addr, view, dashboard_shutdown).await;
        });
    }

    let converged = fleet
        .wait_until_converged(Duration::from_secs(args.max_runtime_secs))
        .await;
    if converged {
        tracing::info!("Fleet converged");
    } else if shutdown.is_cancelled() {
        tracing::info!("Stopped before convergence");
    } else {
        tracing::warn!(
            max_runtime_secs = args.max_runtime_secs,
            "Fleet did not converge in time"
        );
    }

    let summary = fleet.view().summary();
    let outcome = fleet.shutdown().await;
    store.merge(&outcome.nodes)?;

    print_outcome(&outcome);
    println!();
    println!(
        "Average load {:.3}, max deviation {:.3}, delta {}",
        summary.average_load, summary.max_deviation, config.delta
    );
    if !summary.ownership_conflicts.is_empty() {
        eprintln!(
            "Warning: tasks held by more than one node: {:?}",
            summary.ownership_conflicts
        );
    }
    Ok(())
}

fn print_outcome(outcome: &FleetOutcome) {
    println!(
        "{:<6} {:<16} {:<9} {:<11} {:<6} PHASE",
        "ID", "NAME", "CAPACITY", "TOTAL TIME", "TASKS"
    );
    println!("{}", "-".repeat(64));
    for node in &outcome.nodes {
        println!(
            "{:<6} {:<16} {:<9} {:<11.3} {:<6} {}",
            node.id,
            node.name,
            node.capacity,
            node.total_time,
            node.tasks.len(),
            node.phase
        );
    }

    let unassigned: Vec<_> = outcome
        .tasks
        .iter()
        .filter(|t| t.assigned_node.is_none())
        .map(|t| t.id.to_string())
        .collect();
    if !unassigned.is_empty() {
        println!();
        println!("Unassigned tasks: {}", unassigned.join(", "));
    }
}

fn handle_results(path: PathBuf, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let records = ResultsStore::new(path).load()?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No results found.");
                return Ok(());
            }
            println!(
                "{:<16} {:<9} {:<11} {:<25} TASKS",
                "NODE", "CAPACITY", "TOTAL TIME", "FINISHED AT"
            );
            println!("{}", "-".repeat(78));
            for (name, record) in &records {
                print_record(name, record);
            }
        }
    }
    Ok(())
}

fn print_record(name: &str, record: &NodeRecord) {
    let tasks: Vec<String> = record
        .tasks
        .iter()
        .map(|t| format!("{}({})", t.name, t.complexity))
        .collect();
    println!(
        "{:<16} {:<9} {:<11.3} {:<25} {}",
        name,
        record.capacity,
        record.total_time,
        record.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
        tasks.join(" ")
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_fleet(run_args).await?;
        }
        Commands::Results { path, output } => {
            handle_results(path, &output)?;
        }
    }

    Ok(())
}
