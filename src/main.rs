//! fixloop - Dependency-aware build-error remediation
//!
//! Command-line entry point: run a build-fix session, inspect the manifest's
//! dependency graph, or run a single validation.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::warn;

use fixloop::diagnostics::{ErrorMapper, FixLedger};
use fixloop::oracle::oracle_from_config;
use fixloop::scheduler::schedule;
use fixloop::workspace::ProjectTree;
use fixloop::{
    BuildFixPipeline, CancellationFlag, CommandValidationOracle, DependencyGraph, FixloopConfig,
    FixloopError, Manifest, PipelineResult, SessionStatus,
};

#[derive(Parser)]
#[command(name = "fixloop")]
#[command(version)]
#[command(about = "Iterative, dependency-aware build-error remediation", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build-fix session until the project validates or a bound is hit
    Run {
        /// Session id (defaults to a random UUID)
        #[arg(long)]
        session_id: Option<String>,

        /// Maximum fix rounds
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Fix oracle command; the prompt is written to its stdin
        #[arg(long, env = "FIXLOOP_ORACLE_COMMAND", value_name = "COMMAND")]
        oracle_command: Option<String>,

        /// Do not write a session report
        #[arg(long)]
        no_report: bool,

        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the manifest's dependency graph
    Graph {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the validation passes once and print mapped diagnostics
    Validate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "fixloop=debug,info"
    } else {
        "fixloop=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(FixloopError::MissingProject { path: project_path }.exit_code());
    }

    let code = match cli.command {
        Commands::Run {
            session_id,
            max_rounds,
            oracle_command,
            no_report,
            json,
        } => {
            let mut config = load_config(&project_path);
            if let Some(rounds) = max_rounds {
                config = config.with_max_rounds(rounds);
            }
            if let Some(command) = oracle_command {
                let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
                if !argv.is_empty() {
                    config = config.with_oracle_command(argv);
                }
            }
            if no_report {
                config = config.with_persist_reports(false);
            }
            run(&project_path, config, session_id, json).await?
        }

        Commands::Graph { json } => {
            let manifest = load_manifest(&project_path);
            let graph = DependencyGraph::build(&manifest);
            if json {
                println!("{}", serde_json::to_string_pretty(&graph)?);
            } else {
                print_graph(&manifest, &graph);
            }
            0
        }

        Commands::Validate { json } => validate(&project_path, json).await?,
    };

    std::process::exit(code);
}

fn load_config(project_path: &Path) -> FixloopConfig {
    match FixloopConfig::load(project_path) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    }
}

fn load_manifest(project_path: &Path) -> Manifest {
    match Manifest::load(project_path) {
        Ok(manifest) => manifest,
        Err(e) => exit_with(&e),
    }
}

fn exit_with(err: &FixloopError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), err);
    if let FixloopError::SessionAborted { logs, .. } = err {
        eprintln!("\n{}", "Session log:".yellow().bold());
        for line in logs {
            eprintln!("   {}", line);
        }
    }
    std::process::exit(err.exit_code());
}

async fn run(
    project_path: &Path,
    config: FixloopConfig,
    session_id: Option<String>,
    json: bool,
) -> anyhow::Result<i32> {
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let validation = CommandValidationOracle::from_config(&config);
    let oracle = oracle_from_config(&config, project_path);

    let cancellation = CancellationFlag::new();
    let flag = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current round");
            flag.cancel();
        }
    });

    if !json {
        println!(
            "{} session {} in {}",
            "fixloop".cyan().bold(),
            session_id,
            project_path.display()
        );
    }

    let result = match BuildFixPipeline::new(project_path, config, &validation, oracle.as_ref())
        .with_cancellation(cancellation)
        .run(&session_id)
        .await
    {
        Ok(result) => result,
        Err(e) => exit_with(&e),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.status.exit_code())
}

fn print_result(result: &PipelineResult) {
    let status = match result.status {
        SessionStatus::Success => "SUCCESS".green().bold(),
        SessionStatus::Exhausted => "EXHAUSTED".yellow().bold(),
        SessionStatus::Escalated => "ESCALATED".yellow().bold(),
        SessionStatus::Fatal => "FATAL".red().bold(),
    };
    println!("\n{} {}", "Status:".bold(), status);
    println!("{}", "─".repeat(60));
    println!(
        "   Rounds: {}, install retries: {}",
        result.rounds, result.retry_count
    );

    if !result.fixed_files.is_empty() {
        println!("\n{} ({})", "Fixed files".cyan().bold(), result.fixed_files.len());
        for path in &result.fixed_files {
            println!("   {}", path);
        }
    }
    if !result.remaining_errors.is_empty() {
        println!(
            "\n{} ({})",
            "Remaining errors".red().bold(),
            result.remaining_errors.len()
        );
        for error in &result.remaining_errors {
            println!("   {}", error.format());
        }
    }
    if !result.unattributed_errors.is_empty() {
        println!(
            "\n{} {} error(s) could not be attributed to a file",
            "Warning:".yellow().bold(),
            result.unattributed_errors.len()
        );
    }
    if !result.warnings.is_empty() {
        println!("\n{} {}", "Warnings:".yellow(), result.warnings.len());
    }
}

fn print_graph(manifest: &Manifest, graph: &DependencyGraph) {
    println!(
        "\n{} ({} files)",
        "Dependency graph".cyan().bold(),
        manifest.len()
    );
    println!("{}", "─".repeat(60));
    if manifest.is_empty() {
        println!("   Manifest declares no files");
        return;
    }
    for (path, node) in graph.iter() {
        println!("   {}", path.bold());
        for dep in &node.dependencies {
            println!("      -> {}", dep);
        }
        for dependent in &node.dependents {
            println!("      <- {}", dependent.dimmed());
        }
    }
    if !graph.unresolved().is_empty() {
        println!("\n{}", "Unresolved references".yellow().bold());
        for unresolved in graph.unresolved() {
            println!("   {} -> {}", unresolved.from, unresolved.reference);
        }
    }
}

async fn validate(project_path: &Path, json: bool) -> anyhow::Result<i32> {
    let config = load_config(project_path);
    let manifest = load_manifest(project_path);
    let tree = match ProjectTree::open(project_path) {
        Ok(tree) => tree,
        Err(e) => exit_with(&e),
    };
    let graph = DependencyGraph::build(&manifest);
    let oracle = CommandValidationOracle::from_config(&config);
    let runner = fixloop::validation::ValidationRunner::new(&oracle, &tree, &config);

    let sub_roots = runner.buildable_sub_roots(&manifest);
    let report = match runner.validate(&sub_roots).await {
        Ok(report) => report,
        Err(e) => exit_with(&e),
    };
    let ledger = FixLedger::new(config.max_fix_attempts_per_file);
    let mut map = ErrorMapper::new(&manifest, &graph, &tree).map(&report.errors, &ledger);
    let plan = schedule(&mut map, &manifest, &ledger);

    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else if report.success {
        println!(
            "{} Validation passed ({} warnings)",
            "OK".green().bold(),
            report.warnings.len()
        );
    } else {
        println!(
            "\n{} {} errors",
            "Validation failed:".red().bold(),
            report.errors.len()
        );
        for path in &plan.order {
            let Some(mapping) = map.get(path) else {
                continue;
            };
            println!(
                "\n   {} (priority {}, {} dependents)",
                path.bold(),
                mapping.priority,
                mapping.dependents.len()
            );
            for error in &mapping.errors {
                println!("      {}", error.format());
            }
        }
        for error in &map.unattributed {
            println!("\n   {} {}", "(no file)".dimmed(), error.format());
        }
    }
    Ok(if report.success { 0 } else { 1 })
}
