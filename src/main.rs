//! codeloop - Iterative Code Generation Orchestrator
//!
//! Command-line front-end: run a task to completion, quick-test a file,
//! probe the execution backend and inspect configuration.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use codeloop::analyzer::{CheckStatus, Report, TestType};
use codeloop::config::OrchestratorConfig;
use codeloop::sandbox::{select_backend, IsolationMode};
use codeloop::{
    AdmissionPolicy, CodeloopError, Language, Orchestrator, Result, SubmitMode, TaskOutcome,
    TaskRequest,
};

#[derive(Parser)]
#[command(name = "codeloop")]
#[command(version)]
#[command(about = "Generate, run and validate code until it meets a quality bar", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "CODELOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Maximum concurrently running sessions
    #[arg(long, global = true, env = "CODELOOP_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Admission policy when all slots are busy
    #[arg(long, global = true, value_enum, env = "CODELOOP_ADMISSION")]
    admission: Option<AdmissionPolicy>,

    /// Execution isolation
    #[arg(long, global = true, value_enum, env = "CODELOOP_ISOLATION")]
    isolation: Option<IsolationMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task until it succeeds or runs out of iterations
    Run {
        /// What the program should do
        #[arg(short, long)]
        task: String,

        /// Target language
        #[arg(short, long)]
        language: String,

        /// Requirement the program must satisfy (repeatable)
        #[arg(short, long = "requirement")]
        requirements: Vec<String>,

        /// Test criterion the program must check (repeatable)
        #[arg(long = "criterion")]
        criteria: Vec<String>,

        /// Iteration budget
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Quality threshold (0-100)
        #[arg(long)]
        threshold: Option<u32>,

        /// Endpoint to POST the outcome to
        #[arg(long)]
        callback_url: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute and score a file once, without generation
    QuickTest {
        /// Source file to run
        file: PathBuf,

        /// Language of the file
        #[arg(short, long)]
        language: String,

        /// Criteria to apply
        #[arg(long, value_enum, default_value = "smoke")]
        test_type: TestType,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which execution backend would be used
    Probe,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration
    Validate,

    /// Show configuration file paths
    Paths,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "codeloop=debug,info"
    } else {
        "codeloop=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Load the effective config and apply CLI overrides.
fn load_config(cli: &Cli, project: &Path) -> Result<(OrchestratorConfig, Option<PathBuf>)> {
    let (mut config, source) = OrchestratorConfig::discover(cli.config.as_deref(), project)?;
    if let Some(max) = cli.max_concurrent {
        config.concurrency.max_concurrent_sessions = max;
    }
    if let Some(admission) = cli.admission {
        config.concurrency.admission = admission;
    }
    if let Some(isolation) = cli.isolation {
        config.sandbox.isolation = isolation;
    }
    Ok((config, source))
}

async fn run(cli: Cli) -> Result<i32> {
    let project = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project.exists() {
        return Err(CodeloopError::config(format!(
            "Project directory does not exist: {}",
            project.display()
        )));
    }

    match &cli.command {
        Commands::Run {
            task,
            language,
            requirements,
            criteria,
            max_iterations,
            threshold,
            callback_url,
            json,
        } => {
            let (config, _) = load_config(&cli, &project)?;

            let mut request = TaskRequest::new(task.clone(), language.clone());
            request.requirements = requirements.clone();
            request.test_criteria = criteria.clone();
            request.max_iterations = *max_iterations;
            request.quality_threshold = *threshold;
            request.callback_url = callback_url.clone();
            // Fail fast on bad input before probing backends.
            request.validate(&config.session.limits())?;

            let orchestrator = Orchestrator::new(config, &project).await?;
            if !json {
                println!(
                    "{} {} task on {} backend",
                    "Running:".cyan().bold(),
                    language,
                    orchestrator.backend_kind()
                );
            }

            let submission = orchestrator.submit(request, SubmitMode::Wait).await?;
            let Some(outcome) = submission.outcome() else {
                return Ok(1);
            };

            if *json {
                println!("{}", serde_json::to_string_pretty(outcome)?);
            } else {
                print_outcome(outcome);
            }
            Ok(if outcome.success { 0 } else { 1 })
        }

        Commands::QuickTest {
            file,
            language,
            test_type,
            json,
        } => {
            let (config, _) = load_config(&cli, &project)?;
            let code = std::fs::read_to_string(file)?;
            let orchestrator = Orchestrator::new(config, &project).await?;
            let result = orchestrator.quick_test(&code, language, *test_type).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let exec = &result.execution;
                println!(
                    "\n{} {} ({})",
                    "Quick test:".cyan().bold(),
                    file.display(),
                    result.language
                );
                println!("{}", "─".repeat(40));
                match exec.exit_code {
                    Some(code) => println!("   Exit code: {}", code),
                    None if exec.timed_out => println!("   Exit code: {}", "timed out".yellow()),
                    None => println!("   Exit code: {}", "killed".red()),
                }
                println!("   Duration: {}ms", exec.duration_ms);
                println!("   Backend: {}", exec.backend_kind);
                print_report(&result.report);
                if !exec.stdout.is_empty() {
                    println!("\n{}", "stdout:".bold());
                    print!("{}", exec.stdout);
                }
                if !exec.stderr.is_empty() {
                    println!("\n{}", "stderr:".bold());
                    print!("{}", exec.stderr);
                }
            }
            Ok(0)
        }

        Commands::Probe => {
            let (config, _) = load_config(&cli, &project)?;
            let backend = select_backend(&config.sandbox).await?;

            println!("\n{} Execution Backend", "Probe:".cyan().bold());
            println!("{}", "─".repeat(40));
            println!("   Isolation: {:?}", config.sandbox.isolation);
            println!("   Selected: {} ({})", backend.name(), backend.kind());
            println!("\n   Interpreters:");
            for language in Language::all() {
                let (program, _) = language.interpreter();
                let status = if which::which(program).is_ok() {
                    "found".green()
                } else {
                    "missing".yellow()
                };
                println!("   {:<12} {:<10} {}", language.to_string(), program, status);
            }
            Ok(0)
        }

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                let (config, source) = load_config(&cli, &project)?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    match &source {
                        Some(path) => println!("# Loaded from {}", path.display()),
                        None => println!("# Defaults (no configuration file found)"),
                    }
                    print!("{}", config.to_toml()?);
                }
                Ok(0)
            }

            ConfigAction::Validate => {
                let (config, source) = load_config(&cli, &project)?;
                config.validate()?;
                match source {
                    Some(path) => println!("{} {} is valid", "OK".green(), path.display()),
                    None => println!(
                        "{} No configuration file found (defaults are valid)",
                        "OK".green()
                    ),
                }
                Ok(0)
            }

            ConfigAction::Paths => {
                println!("\n{} Configuration Paths", "Config:".cyan().bold());
                println!("{}", "─".repeat(40));
                println!(
                    "   Project: {}",
                    OrchestratorConfig::project_path(&project).display()
                );
                match OrchestratorConfig::user_path() {
                    Some(path) => println!("   User: {}", path.display()),
                    None => println!("   User: (no config directory on this platform)"),
                }
                Ok(0)
            }
        },
    }
}

fn print_outcome(outcome: &TaskOutcome) {
    let reason = outcome
        .reason
        .map(|r| r.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let headline = if outcome.success {
        "Success:".green().bold()
    } else {
        "Failed:".red().bold()
    };

    println!("\n{} {}", headline, reason);
    println!("{}", "─".repeat(40));
    println!("   Session: {}", outcome.session_id);
    println!("   Iterations: {}", outcome.total_iterations);
    println!("   Time: {:.1}s", outcome.execution_time);
    if let Some(report) = &outcome.final_report {
        print_report(report);
    }
    if let Some(code) = &outcome.final_code {
        println!("\n{}", "Final code:".bold());
        print!("{}", code);
        if !code.ends_with('\n') {
            println!();
        }
    }
}

fn print_report(report: &Report) {
    println!("   Score: {}", report.score);
    println!("   Summary: {}", report.summary_text);
    for (check, result) in &report.criteria_results {
        let mark = match result.status {
            CheckStatus::Pass => "PASS".green(),
            CheckStatus::Fail => "FAIL".red(),
            CheckStatus::Unverified => "????".yellow(),
        };
        println!("   [{}] {}", mark, check);
    }
}
