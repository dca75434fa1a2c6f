//! tetrad - multi-role coding agent orchestration
//!
//! Runs a planner, implementer, reviewer and tester in bounded rounds
//! against a workspace, with every risky action behind an approval gate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use tetrad::approval::{ApprovalDecision, Approver, DeferredApprover, InteractiveApprover};
use tetrad::audit::AuditLogger;
use tetrad::driver::DriverSet;
use tetrad::error::TetradError;
use tetrad::policy::{Disposition, SafetyGate};
use tetrad::scheduler::{plan_tasks, NextStep, RunOutcome, Scheduler, SchedulerOptions};
use tetrad::session::{SessionPersistence, SessionSettings, SessionState, StopSignal};
use tetrad::task::{parse_plan, Resolution, Task, TaskStatus};
use tetrad::tools::{Action, ActionKind, ActionStatus, ToolSurface};
use tetrad::workspace::{self, Workspace};
use tetrad::ProjectConfig;

#[derive(Parser)]
#[command(name = "tetrad")]
#[command(version)]
#[command(about = "Multi-role coding agent orchestration with a risk-based action gate", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Workspace root (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".", env = "TETRAD_WORKSPACE")]
    workspace: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the workspace (control directory, .gitignore, tetrad.toml)
    Init {
        /// Overwrite an existing tetrad.toml
        #[arg(short, long)]
        force: bool,
    },

    /// Start a new session and run it
    #[command(group(ArgGroup::new("source").required(true).multiple(true).args(["goal", "plan"])))]
    Start {
        /// Goal handed to the planner
        #[arg(short, long)]
        goal: Option<String>,

        /// Markdown plan whose list items become the tasks
        #[arg(short, long, value_name = "FILE")]
        plan: Option<PathBuf>,

        /// Driver command for every role (overrides [driver].command)
        #[arg(long, value_name = "CMD", env = "TETRAD_DRIVER")]
        driver: Option<String>,

        /// Iteration ceiling per task
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Ask on the terminal instead of parking confirmations
        #[arg(short, long)]
        interactive: bool,

        /// Discard an unfinished session
        #[arg(short, long)]
        force: bool,
    },

    /// Continue the persisted session
    Resume {
        /// Driver command for every role (overrides [driver].command)
        #[arg(long, value_name = "CMD", env = "TETRAD_DRIVER")]
        driver: Option<String>,

        /// Ask on the terminal instead of parking confirmations
        #[arg(short, long)]
        interactive: bool,
    },

    /// Show the session state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Show one task with its full attempt history
        #[arg(short, long, value_name = "ID")]
        task: Option<String>,
    },

    /// Approve the pending action and finish the turn it interrupted
    Approve {
        /// Token printed when the action was parked
        token: String,

        /// Ask on the terminal for actions queued behind it
        #[arg(short, long)]
        interactive: bool,
    },

    /// Deny the pending action
    Deny {
        /// Token printed when the action was parked
        token: String,

        /// Reason recorded on the task
        #[arg(short, long, default_value = "denied by operator")]
        reason: String,
    },

    /// Clear an escalated task
    #[command(group(ArgGroup::new("resolution").required(true).args(["retry", "done"])))]
    Resolve {
        /// Task id (`3` or `task-3`)
        task: String,

        /// Reset the iteration count and hand the task back to the implementer
        #[arg(long)]
        retry: bool,

        /// Accept the task as finished
        #[arg(long)]
        done: bool,
    },

    /// Restore every file a task wrote to its previous content
    Undo {
        /// Task id (`3` or `task-3`)
        task: String,
    },

    /// Inspect the safety policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show how the gate would treat a request
    Check {
        /// Action kind: read, search, write, insert or execute_shell
        kind: ActionKind,

        /// Path, search query or shell command
        target: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Verify the hash chain
    Verify,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            e.downcast_ref::<TetradError>()
                .map_or(1, TetradError::exit_code)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "tetrad=debug,info"
    } else {
        "tetrad=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let workspace = Workspace::open(&cli.workspace)?;

    match cli.command {
        Commands::Init { force } => {
            let report = workspace::init(&workspace, force)?;
            for dir in &report.created_dirs {
                println!("{} Created {}", "OK".green().bold(), dir.display());
            }
            if !report.gitignore_entries_added.is_empty() {
                println!(
                    "{} Added {} to .gitignore",
                    "OK".green().bold(),
                    report.gitignore_entries_added.join(", ")
                );
            }
            if report.config_written {
                println!(
                    "{} Wrote {}",
                    "OK".green().bold(),
                    workspace.config_path().display()
                );
            } else {
                println!(
                    "{} {} exists (use --force to overwrite)",
                    "Skipped:".yellow(),
                    workspace.config_path().display()
                );
            }
            Ok(0)
        }

        Commands::Start {
            goal,
            plan,
            driver,
            max_iterations,
            interactive,
            force,
        } => {
            let mut config = ProjectConfig::load(workspace.root())?;
            if let Some(max) = max_iterations {
                config.orchestrator.max_iterations = max;
                config.validate()?;
            }

            let persistence = persistence(&workspace);
            if let Some(existing) = persistence.load()? {
                if !existing.is_complete() && !force {
                    return Err(TetradError::SessionExists {
                        dir: workspace.control_dir(),
                    }
                    .into());
                }
            }

            let drivers = DriverSet::from_config(&config.driver, workspace.root(), driver.as_deref())?;
            let options = SchedulerOptions::from_config(&config);

            let (goal, tasks) = match plan {
                Some(path) => {
                    let full = resolve_cli_path(&workspace, &path);
                    let content = std::fs::read_to_string(&full).map_err(|e| {
                        TetradError::config_with_path(format!("cannot read plan: {e}"), full.clone())
                    })?;
                    let tasks = parse_plan(&content);
                    if tasks.is_empty() {
                        return Err(TetradError::config_with_path("plan contains no tasks", full).into());
                    }
                    let goal = goal.unwrap_or_else(|| format!("Complete the plan in {}", path.display()));
                    (goal, tasks)
                }
                None => {
                    let goal = goal.unwrap_or_default();
                    println!("{} Asking the planner for a breakdown...", "Planning:".cyan().bold());
                    let tasks = plan_tasks(
                        &drivers,
                        &goal,
                        &workspace,
                        &options,
                        config.orchestrator.transient_retries,
                    )
                    .await?;
                    (goal, tasks)
                }
            };

            let state = SessionState::new(goal, SessionSettings::from(&config.orchestrator), tasks);
            let mut scheduler = build_scheduler(&workspace, &config, state, interactive)?
                .with_drivers(drivers)
                .with_options(options);
            let pruned = scheduler.surface().snapshots().prune_all()?;
            if pruned > 0 {
                tracing::debug!(pruned, "Discarded snapshots of the previous session");
            }
            scheduler.record_start()?;

            println!(
                "{} Session {} with {} tasks",
                "Started:".green().bold(),
                scheduler.state().metadata.session_id,
                scheduler.state().tasks.len()
            );
            for task in &scheduler.state().tasks {
                println!("  {} {}", task.id.dimmed(), task.description);
            }

            drive(scheduler).await
        }

        Commands::Resume {
            driver,
            interactive,
        } => {
            let config = ProjectConfig::load(workspace.root())?;
            let state = persistence(&workspace).load_required()?;
            if state.is_complete() {
                println!("{} Every task is already done", "OK".green().bold());
                return Ok(0);
            }

            let drivers = DriverSet::from_config(&config.driver, workspace.root(), driver.as_deref())?;
            let scheduler = build_scheduler(&workspace, &config, state, interactive)?
                .with_drivers(drivers)
                .with_options(SchedulerOptions::from_config(&config));
            scheduler.record_resume();

            if let Some(task) = scheduler.state().active_task() {
                println!(
                    "{} {} at {} (iteration {}/{})",
                    "Resuming:".cyan().bold(),
                    task.id,
                    task.status,
                    task.iteration,
                    scheduler.state().settings.max_iterations
                );
            }
            drive(scheduler).await
        }

        Commands::Status { json, task } => {
            let state = persistence(&workspace).load_required()?;
            match (json, task) {
                (true, Some(id)) => println!("{}", serde_json::to_string_pretty(state.task(&id)?)?),
                (true, None) => println!("{}", serde_json::to_string_pretty(&state)?),
                (false, Some(id)) => print_task_history(state.task(&id)?, state.settings.max_iterations),
                (false, None) => print_status(&state),
            }
            Ok(0)
        }

        Commands::Approve { token, interactive } => {
            let config = ProjectConfig::load(workspace.root())?;
            let state = persistence(&workspace).load_required()?;
            let mut scheduler = build_scheduler(&workspace, &config, state, interactive)?;
            let next = scheduler
                .resolve_approval(&token, ApprovalDecision::Approve)
                .await?;
            println!("{} Action approved", "OK".green().bold());
            Ok(report_next(&scheduler, &next))
        }

        Commands::Deny { token, reason } => {
            let config = ProjectConfig::load(workspace.root())?;
            let state = persistence(&workspace).load_required()?;
            let mut scheduler = build_scheduler(&workspace, &config, state, false)?;
            let next = scheduler
                .resolve_approval(&token, ApprovalDecision::deny(reason))
                .await?;
            println!("{} Action denied", "OK".green().bold());
            Ok(report_next(&scheduler, &next))
        }

        Commands::Resolve { task, retry, done } => {
            // clap requires exactly one of the two flags
            let resolution = if done && !retry {
                Resolution::MarkDone
            } else {
                Resolution::Retry
            };
            let config = ProjectConfig::load(workspace.root())?;
            let state = persistence(&workspace).load_required()?;
            let mut scheduler = build_scheduler(&workspace, &config, state, false)?;
            let next = scheduler.resolve_escalation(&task, resolution)?;
            println!(
                "{} {} resolved ({})",
                "OK".green().bold(),
                Task::normalize_id(&task),
                match resolution {
                    Resolution::Retry => "retry",
                    Resolution::MarkDone => "done",
                }
            );
            Ok(report_next(&scheduler, &next))
        }

        Commands::Undo { task } => {
            let config = ProjectConfig::load(workspace.root())?;
            let state = persistence(&workspace).load_required()?;
            let mut scheduler = build_scheduler(&workspace, &config, state, false)?;
            let report = scheduler.undo(&task)?;
            if report.is_empty() {
                println!(
                    "{} No recorded writes for {}",
                    "OK".green().bold(),
                    Task::normalize_id(&task)
                );
            } else {
                for path in &report.restored {
                    println!("  {} {}", "restored".green(), path);
                }
                for path in &report.removed {
                    println!("  {} {}", "removed".yellow(), path);
                }
                println!(
                    "{} Undid {} file(s) for {}",
                    "OK".green().bold(),
                    report.restored.len() + report.removed.len(),
                    Task::normalize_id(&task)
                );
            }
            Ok(0)
        }

        Commands::Policy {
            action: PolicyAction::Check { kind, target },
        } => {
            let config = ProjectConfig::load(workspace.root())?;
            let gate = SafetyGate::new(&config.policy.rules)?;
            let action = match hypothetical_action(&workspace, kind, &target) {
                Ok(action) => action,
                Err(e) => {
                    println!("{} {}", "Rejected:".red().bold(), e);
                    return Ok(2);
                }
            };

            let verdict = gate.evaluate(&action);
            let label = match verdict.disposition {
                Disposition::AutoApprove => verdict.disposition.to_string().green().bold(),
                Disposition::RequireConfirmation => verdict.disposition.to_string().yellow().bold(),
                Disposition::HardBlock => verdict.disposition.to_string().red().bold(),
            };
            println!("{} {}", label, action.describe());
            println!("  rule: {}{}", verdict.rule, if verdict.builtin { " (built-in)" } else { "" });
            Ok(if verdict.disposition == Disposition::HardBlock { 2 } else { 0 })
        }

        Commands::Audit {
            action: AuditAction::Verify,
        } => {
            let audit = AuditLogger::new(workspace.audit_path())?;
            let result = audit.verify()?;
            if result.is_valid {
                println!(
                    "{} Audit chain intact ({} entries)",
                    "OK".green().bold(),
                    result.entries_verified
                );
                Ok(0)
            } else {
                eprintln!(
                    "{} Audit chain broken at entry {}: {}",
                    "Invalid:".red().bold(),
                    result
                        .first_invalid_entry
                        .map_or_else(|| "?".to_string(), |s| s.to_string()),
                    result.error_description.unwrap_or_default()
                );
                Ok(1)
            }
        }
    }
}

fn persistence(workspace: &Workspace) -> SessionPersistence {
    SessionPersistence::new(workspace.control_dir())
}

fn build_scheduler(
    workspace: &Workspace,
    config: &ProjectConfig,
    state: SessionState,
    interactive: bool,
) -> anyhow::Result<Scheduler> {
    let gate = SafetyGate::new(&config.policy.rules)?;
    let surface = ToolSurface::new(workspace.clone(), gate, config.shell.clone());
    let audit = AuditLogger::new(workspace.audit_path())?;
    let approver: Arc<dyn Approver> = if interactive {
        Arc::new(InteractiveApprover)
    } else {
        Arc::new(DeferredApprover)
    };
    Ok(Scheduler::new(state, persistence(workspace), surface, audit).with_approver(approver))
}

/// Run the loop with Ctrl-C wired to the stop signal, then report.
async fn drive(scheduler: Scheduler) -> anyhow::Result<i32> {
    let stop = StopSignal::new();
    stop.install();
    let mut scheduler = scheduler.with_stop_signal(stop);

    let outcome = scheduler.run().await?;
    match &outcome {
        RunOutcome::Complete => {
            println!("{} All {} tasks done", "Complete:".green().bold(), scheduler.state().tasks.len());
        }
        RunOutcome::EscalationPending { task_id, reason } => {
            eprintln!("{} {} needs a human: {}", "Escalated:".red().bold(), task_id, reason);
            eprintln!("  inspect: tetrad status --task {task_id}");
            eprintln!("  then:    tetrad resolve {task_id} --retry | --done");
        }
        RunOutcome::AwaitingApproval { token, description } => {
            eprintln!("{} {}", "Approval needed:".yellow().bold(), description);
            eprintln!("  tetrad approve {token}");
            eprintln!("  tetrad deny {token} --reason \"...\"");
        }
        RunOutcome::Stopped => {
            eprintln!("{} Session saved; continue with `tetrad resume`", "Stopped:".yellow().bold());
        }
    }
    Ok(outcome.exit_code())
}

/// Print where a resolved session stands and pick the exit status.
fn report_next(scheduler: &Scheduler, next: &NextStep) -> i32 {
    if let Some(pending) = &scheduler.state().pending_approval {
        eprintln!("{} {}", "Approval needed:".yellow().bold(), pending.describe());
        eprintln!("  tetrad approve {}", pending.token);
        return 4;
    }
    match next {
        NextStep::Invoke { task_id, role } => {
            println!("  next: {role} on {task_id} (run `tetrad resume`)");
            0
        }
        NextStep::Escalated { task_id, reason } => {
            eprintln!("{} {} needs a human: {}", "Escalated:".red().bold(), task_id, reason);
            3
        }
        NextStep::SessionComplete => {
            println!("{} Every task is done", "Complete:".green().bold());
            0
        }
    }
}

fn resolve_cli_path(workspace: &Workspace, path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        path.to_path_buf()
    } else {
        workspace.root().join(path)
    }
}

/// The request `policy check` asks the gate about, with paths made
/// workspace-relative the way the tool surface does before gating.
fn hypothetical_action(workspace: &Workspace, kind: ActionKind, target: &str) -> tetrad::Result<Action> {
    Ok(match kind {
        ActionKind::Read => Action::Read {
            path: workspace.resolve(target)?.display_relative(),
        },
        ActionKind::Search => Action::Search {
            query: target.to_string(),
            path: None,
        },
        ActionKind::Write => Action::Write {
            path: workspace.resolve(target)?.display_relative(),
            content: String::new(),
        },
        ActionKind::ExecuteShell => Action::ExecuteShell {
            command: target.to_string(),
        },
    })
}

fn status_marker(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => "○".dimmed(),
        TaskStatus::Active => "●".cyan(),
        TaskStatus::InReview => "◐".blue(),
        TaskStatus::Testing => "◑".magenta(),
        TaskStatus::Done => "✓".green(),
        TaskStatus::Escalated => "!".red().bold(),
    }
}

fn print_status(state: &SessionState) {
    println!("{} {}", "Goal:".bold(), state.goal);
    println!(
        "{} {} (revision {}, saved {})",
        "Session:".bold(),
        state.metadata.session_id,
        state.metadata.revision,
        state.metadata.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let counts: Vec<String> = state
        .status_counts()
        .iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect();
    println!("{} {}", "Tasks:".bold(), counts.join(", "));
    println!();

    for (i, task) in state.tasks.iter().enumerate() {
        let active = if state.active_index == Some(i) { "▶" } else { " " };
        println!(
            "{} {} {:<8} {:<10} {}/{}  {}",
            active,
            status_marker(task.status),
            task.id,
            task.status.to_string(),
            task.iteration,
            state.settings.max_iterations,
            task.description
        );
        if let Some(reason) = &task.escalation {
            println!("      {} {}", "escalated:".red(), reason);
        }
    }

    if let Some(pending) = &state.pending_approval {
        println!();
        println!("{} {}", "Approval needed:".yellow().bold(), pending.describe());
        println!("  token: {}", pending.token);
    }
}

fn print_task_history(task: &Task, max_iterations: u32) {
    println!("{} {} {}", status_marker(task.status), task.id.bold(), task.description);
    println!(
        "  status: {}  iteration: {}/{}",
        task.status, task.iteration, max_iterations
    );
    if let Some(reason) = &task.escalation {
        println!("  {} {}", "escalated:".red().bold(), reason);
    }
    if task.attempts.is_empty() {
        println!("  no attempts yet");
        return;
    }

    for attempt in &task.attempts {
        println!();
        println!(
            "  #{} {} {} ({} -> {}, iteration {})",
            attempt.sequence,
            attempt.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            attempt
                .role
                .map_or_else(|| "human".to_string(), |r| r.to_string())
                .bold(),
            attempt.status_before,
            attempt.status_after,
            attempt.iteration_after
        );
        println!("     outcome: {}", attempt.outcome.label());
        if let Some(notes) = &attempt.notes {
            println!("     notes: {notes}");
        }
        for record in &attempt.actions {
            let status = match &record.status {
                ActionStatus::Executed { .. } => record.status.label().green(),
                ActionStatus::Failed { .. } | ActionStatus::Rejected { .. } => record.status.label().yellow(),
                _ => record.status.label().red(),
            };
            println!("     - [{}] {}", status, record.action.describe());
        }
    }
}
