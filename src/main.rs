//! Ralph Loop - autonomous control loop for Claude Code
//!
//! Command-line entry point: runs the loop and inspects or resets its
//! persisted state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use ralph_loop::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerState};
use ralph_loop::config::{ExecutionMode, LoopConfig};
use ralph_loop::logging::init_logging;
use ralph_loop::r#loop::operations::SystemClock;
use ralph_loop::r#loop::{LoopController, LoopExit};
use ralph_loop::session::SessionManager;
use ralph_loop::state::{RunStatus, StateStore, CIRCUIT_BREAKER_FILE};
use ralph_loop::LoopError;

#[derive(Parser)]
#[command(name = "ralph-loop")]
#[command(version)]
#[command(about = "Autonomous Claude Code loop with rate limiting and stagnation detection", long_about = None)]
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
    /// Run the loop until the work is done or a guard stops it
    Run {
        /// Maximum agent calls per hour
        #[arg(long)]
        calls: Option<u32>,

        /// Agent timeout in minutes
        #[arg(long)]
        timeout: Option<u64>,

        /// Stream agent output live instead of polling a capture file
        #[arg(long)]
        streaming: bool,

        /// Close the circuit breaker before starting
        #[arg(long)]
        reset_circuit: bool,
    },

    /// Show the last run-status snapshot
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or reset the circuit breaker
    Circuit {
        #[command(subcommand)]
        action: CircuitAction,
    },

    /// Inspect or reset the loop session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum CircuitAction {
    /// Show breaker state and counters
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Close the breaker and clear its counters
    Reset {
        /// Reason recorded with the reset
        #[arg(long, default_value = "manual_reset")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// End the session and drop the continuity token
    Reset {
        /// Reason recorded with the reset
        #[arg(long, default_value = "manual_reset")]
        reason: String,
    },
    /// List recent session transitions
    History {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run_cli(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            let code = e
                .downcast_ref::<LoopError>()
                .map_or(1, LoopError::exit_code);
            std::process::exit(code);
        }
    }
}

async fn run_cli(cli: Cli) -> Result<i32> {
    let project = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project.is_dir() {
        anyhow::bail!("Project directory does not exist: {}", project.display());
    }
    let store = StateStore::new(LoopConfig::state_dir(&project));

    match cli.command {
        Commands::Run {
            calls,
            timeout,
            streaming,
            reset_circuit,
        } => {
            let mut config = LoopConfig::load(&project)?;
            if let Some(calls) = calls {
                config.rate_limit.max_calls_per_hour = calls;
            }
            if let Some(timeout) = timeout {
                config.agent.timeout_minutes = timeout;
            }
            if streaming {
                config.agent.execution_mode = ExecutionMode::Streaming;
            }
            if reset_circuit {
                config.circuit_breaker.reset_on_startup = true;
            }
            config.validate()?;

            let verbose = cli.verbose || config.verbose;
            init_logging(Some(&store.log_dir()), verbose)?;

            if which::which(&config.agent.command).is_err() {
                return Err(LoopError::AgentNotFound {
                    command: config.agent.command.clone(),
                }
                .into());
            }

            print_banner(&project, &config);
            let mut controller = LoopController::new(project, config).with_countdown(true);
            let exit = controller.run().await?;
            print_exit(&exit, controller.loop_count());
            Ok(exit.exit_code())
        }

        Commands::Status { json } => {
            init_logging(None, cli.verbose)?;
            let status = RunStatus::load(&store);
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(0);
            }

            println!("\n{} Loop Status", "Status:".cyan().bold());
            println!("{}", "─".repeat(60));
            match status {
                None => println!("   No run recorded yet"),
                Some(status) => {
                    println!("   State: {}", status.status.bold());
                    if let Some(ts) = status.timestamp {
                        println!("   Updated: {}", ts.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                    println!("   Loops: {}", status.loop_count);
                    println!(
                        "   Calls this hour: {}/{}",
                        status.calls_this_window, status.budget_limit
                    );
                    println!("   Last action: {}", status.last_action);
                    if let Some(reason) = status.exit_reason {
                        println!("   Exit reason: {}", reason);
                    }
                    if let Some(next) = status.next_reset_time {
                        println!("   Budget resets: {}", next.format("%H:%M:%S UTC"));
                    }
                }
            }
            let breaker: CircuitBreakerState = store.read_json(CIRCUIT_BREAKER_FILE);
            println!("   Circuit: {}", colored_state(breaker.state));
            Ok(0)
        }

        Commands::Circuit { action } => {
            init_logging(None, cli.verbose)?;
            match action {
                CircuitAction::Status { json } => {
                    let config = LoopConfig::load(&project)?;
                    let breaker = CircuitBreaker::new(
                        store.clone(),
                        Arc::new(SystemClock),
                        config.circuit_breaker,
                    );
                    if json {
                        println!("{}", serde_json::to_string_pretty(breaker.state())?);
                        return Ok(0);
                    }
                    print_breaker(breaker.state());
                }
                CircuitAction::Reset { reason } => {
                    let config = LoopConfig::load(&project)?;
                    let _lock = store.lock()?;
                    let mut breaker = CircuitBreaker::new(
                        store.clone(),
                        Arc::new(SystemClock),
                        config.circuit_breaker,
                    );
                    breaker.reset(&reason)?;
                    println!(
                        "{} Circuit breaker closed ({})",
                        "✓".green().bold(),
                        reason
                    );
                }
            }
            Ok(0)
        }

        Commands::Session { action } => {
            init_logging(None, cli.verbose)?;
            let config = LoopConfig::load(&project)?;
            let manager = SessionManager::new(
                store.clone(),
                Arc::new(SystemClock),
                config.session_expiry(),
            );
            match action {
                SessionAction::Reset { reason } => {
                    let _lock = store.lock()?;
                    manager.reset(&reason, 0)?;
                    println!("{} Session reset ({})", "✓".green().bold(), reason);
                }
                SessionAction::History { json } => {
                    let history = manager.history();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&history)?);
                        return Ok(0);
                    }
                    println!(
                        "\n{} Session transitions ({} total)",
                        "Session:".cyan().bold(),
                        history.len()
                    );
                    println!("{}", "─".repeat(60));
                    if history.is_empty() {
                        println!("   No transitions recorded");
                    }
                    for t in history.iter() {
                        println!(
                            "   [{}] {} -> {} ({}, loop {})",
                            t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            t.from_state,
                            t.to_state,
                            t.reason,
                            t.loop_number
                        );
                    }
                }
            }
            Ok(0)
        }
    }
}

fn colored_state(state: BreakerState) -> colored::ColoredString {
    match state {
        BreakerState::Closed => state.to_string().green().bold(),
        BreakerState::Open => state.to_string().red().bold(),
    }
}

fn print_banner(project: &Path, config: &LoopConfig) {
    println!("\n{} Ralph Loop", "Starting:".cyan().bold());
    println!("{}", "─".repeat(60));
    println!("   Project: {}", project.display());
    println!("   Agent: {}", config.agent.command);
    println!(
        "   Budget: {} calls/hour, timeout {}m",
        config.rate_limit.max_calls_per_hour, config.agent.timeout_minutes
    );
    println!("   Mode: {}", config.agent.execution_mode);
    println!();
}

fn print_breaker(state: &CircuitBreakerState) {
    println!("\n{} Circuit Breaker", "Circuit:".cyan().bold());
    println!("{}", "─".repeat(60));
    println!("   State: {}", colored_state(state.state));
    println!("   No-progress loops: {}", state.consecutive_no_progress);
    println!("   Same-error loops: {}", state.consecutive_same_error);
    if let Some(sig) = &state.last_error_signature {
        println!("   Last error: {}", sig);
    }
    if let Some(reason) = state.trip_reason {
        println!("   Trip reason: {}", reason);
    }
    if let Some(opened) = state.opened_at {
        println!("   Opened: {}", opened.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "   Auto-reset: {} (cooldown {}m)",
        if state.auto_reset_enabled { "on" } else { "off" },
        state.cooldown_minutes
    );
    println!("   Total opens: {}", state.total_opens);
}

fn print_exit(exit: &LoopExit, loops: u32) {
    let line = format!("{} after {} loop(s)", exit, loops);
    match exit {
        LoopExit::Completed(_) => println!("\n{} {}", "✓".green().bold(), line),
        LoopExit::Interrupted | LoopExit::ApiLimitExit => {
            println!("\n{} {}", "■".yellow().bold(), line)
        }
        LoopExit::HaltedCircuit => {
            println!("\n{} {}", "✗".red().bold(), line);
            println!("   Inspect with `ralph-loop circuit status`, then `ralph-loop circuit reset`.");
        }
        LoopExit::HaltedPermission(_) => {
            println!("\n{} {}", "✗".red().bold(), line);
            println!("   Allow the tools in `allowed_tools` (.ralph/config.toml) and run again.");
        }
    }
}
