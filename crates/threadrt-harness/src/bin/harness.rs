//! CLI entrypoint for the threadrt-core demonstration harness.

use std::path::PathBuf;
use std::process::Command as ProcCommand;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Interactive stress/deadlock/signal demonstrations for threadrt-core.
#[derive(Debug, Parser)]
#[command(name = "threadrt-harness")]
#[command(about = "Demonstration scenarios for the threadrt-core thread runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Block/unblock prepare race: unblock arrives before block is called.
    BlockRace {
        /// Optional output JSON report path (prints to stdout if omitted).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Signal delivery to a thread parked in `pause()`.
    SignalWhileBlocked {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Spawn `count` detached threads and measure reclamation latency.
    DetachedReclaim {
        #[arg(long, default_value_t = 1000)]
        count: usize,
        #[arg(long, default_value_t = 2000)]
        budget_ms: u64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Cancel a thread parked in `pause()` and confirm its cleanup handler runs.
    CancelCleanup {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Acquire two locks out of LIFO order; expected to abort the process.
    /// Runs the violation in a subprocess since the abort is unrecoverable.
    LockOrderViolation {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Two threads acquire a lock pair in opposite order; the accountant's
    /// cycle detector should abort the process. Also runs out of process.
    Deadlock {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Internal: actually trigger the lock-order violation in this process.
    /// Kept as a separate command because the abort is irreversible and the
    /// parent needs a clean subprocess boundary to observe it from.
    #[command(hide = true)]
    InternalTriggerLockOrderViolation,
    /// Internal: actually trigger the deadlock in this process.
    #[command(hide = true)]
    InternalTriggerDeadlock,
}

fn write_report(output: &Option<PathBuf>, body: &str) -> std::io::Result<()> {
    match output {
        Some(path) => std::fs::write(path, body),
        None => {
            println!("{body}");
            Ok(())
        }
    }
}

/// Re-run this same binary with `subcommand`, wait for it, and report
/// whether it aborted along with anything it logged to stderr (diagnostics
/// go there unless a sink is configured, section 2.1).
fn run_fatal_scenario(scenario: &'static str, subcommand: &str) -> std::io::Result<String> {
    let exe = std::env::current_exe()?;
    let output = ProcCommand::new(exe).arg(subcommand).output()?;
    let diagnostic_lines = String::from_utf8_lossy(&output.stderr)
        .lines()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    let report = threadrt_harness::FatalScenarioReport {
        scenario,
        aborted: !output.status.success(),
        diagnostic_lines,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::BlockRace { output } => {
            let report = threadrt_harness::block_race().map_err(std::io::Error::other)?;
            write_report(&output, &serde_json::to_string_pretty(&report)?)?;
        }
        Command::SignalWhileBlocked { output } => {
            let report =
                threadrt_harness::signal_while_blocked().map_err(std::io::Error::other)?;
            write_report(&output, &serde_json::to_string_pretty(&report)?)?;
        }
        Command::DetachedReclaim {
            count,
            budget_ms,
            output,
        } => {
            let report =
                threadrt_harness::detached_reclaim(count, Duration::from_millis(budget_ms))
                    .map_err(std::io::Error::other)?;
            write_report(&output, &serde_json::to_string_pretty(&report)?)?;
        }
        Command::CancelCleanup { output } => {
            let report = threadrt_harness::cancel_with_cleanup().map_err(std::io::Error::other)?;
            write_report(&output, &serde_json::to_string_pretty(&report)?)?;
        }
        Command::LockOrderViolation { output } => {
            let body = run_fatal_scenario(
                "lock_order_violation",
                "internal-trigger-lock-order-violation",
            )?;
            write_report(&output, &body)?;
        }
        Command::Deadlock { output } => {
            let body = run_fatal_scenario("deadlock", "internal-trigger-deadlock")?;
            write_report(&output, &body)?;
        }
        Command::InternalTriggerLockOrderViolation => {
            threadrt_harness::trigger_lock_order_violation();
        }
        Command::InternalTriggerDeadlock => {
            threadrt_harness::trigger_deadlock();
        }
    }

    Ok(())
}
