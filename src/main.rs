use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod cmd;

#[derive(Parser)]
#[command(name = "taskforge")]
#[command(version, about = "Drive coding tasks through gated, resumable phase plans")]
pub struct Cli {
    /// Show agent output and debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print failures and blocks
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .taskforge/ in the project
    Init,
    /// Create a task
    New {
        title: String,
        /// trivial, small, medium or large
        #[arg(short, long, default_value = "medium")]
        weight: String,
        #[arg(short, long)]
        description: Option<String>,
        /// Tasks that must complete first (comma-separated ids)
        #[arg(long, value_delimiter = ',')]
        blocked_by: Vec<String>,
    },
    /// List tasks
    List,
    /// Show a task's progress, and what to do if it is blocked
    #[command(alias = "status")]
    Show { id: String },
    /// Execute a task from its first unfinished phase
    Run {
        id: String,
        /// Run even if blocking tasks are not completed
        #[arg(long)]
        ignore_blockers: bool,
    },
    /// Continue a stopped task
    Resume {
        id: String,
        /// Take over even if another executor looks alive
        #[arg(long)]
        force: bool,
        /// Restart from this phase instead of the selected one
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        ignore_blockers: bool,
    },
    /// Sync the task branch with its target and close the task out
    Finalize {
        id: String,
        /// Skip the diff risk assessment
        #[arg(long)]
        skip_risk: bool,
        /// Pass regardless of assessed risk
        #[arg(long)]
        force_pass: bool,
    },
    /// Approve a phase waiting on a human gate
    Approve {
        id: String,
        #[arg(short, long)]
        phase: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Reject a phase waiting on a human gate
    Reject {
        id: String,
        #[arg(short, long)]
        phase: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Reset the task branch to the checkpoint before a phase
    Rewind { id: String, phase: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init,
}

/// First Ctrl-C or SIGTERM cancels the run; a second one exits immediately.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let mut signals = 0;
        loop {
            wait_for_signal().await;
            signals += 1;
            if signals > 1 {
                eprintln!("\nForced exit");
                std::process::exit(130);
            }
            eprintln!("\nStopping after the current step (press Ctrl-C again to force)...");
            token.cancel();
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let verbosity = taskforge::config::Verbosity::from_flags(cli.verbose, cli.quiet);

    let log_dir = taskforge::init::is_initialized(&project_dir)
        .then(|| taskforge::init::data_dir(&project_dir).join("logs"));
    let _log_guard = taskforge::logging::init(verbosity, log_dir.as_deref())?;

    let cancel = CancellationToken::new();

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::New {
            title,
            weight,
            description,
            blocked_by,
        } => cmd::cmd_new(
            &cli,
            &project_dir,
            title,
            weight,
            description.as_deref(),
            blocked_by,
        )?,
        Commands::List => cmd::cmd_list(&cli, &project_dir)?,
        Commands::Show { id } => cmd::cmd_show(&cli, &project_dir, id)?,
        Commands::Run {
            id,
            ignore_blockers,
        } => {
            spawn_signal_handler(cancel.clone());
            cmd::cmd_run(&cli, &project_dir, id, *ignore_blockers, cancel).await?
        }
        Commands::Resume {
            id,
            force,
            from,
            ignore_blockers,
        } => {
            spawn_signal_handler(cancel.clone());
            let options = cmd::ResumeOptions {
                force: *force,
                from: from.clone(),
                ignore_blockers: *ignore_blockers,
            };
            cmd::cmd_resume(&cli, &project_dir, id, options, cancel).await?
        }
        Commands::Finalize {
            id,
            skip_risk,
            force_pass,
        } => {
            spawn_signal_handler(cancel.clone());
            let options = taskforge::orchestrator::FinalizeOptions {
                skip_risk: *skip_risk,
                force_pass: *force_pass,
            };
            cmd::cmd_finalize(&cli, &project_dir, id, options, cancel).await?
        }
        Commands::Approve { id, phase, reason } => {
            cmd::cmd_decide(&cli, &project_dir, id, phase, true, reason.as_deref())?
        }
        Commands::Reject { id, phase, reason } => {
            cmd::cmd_decide(&cli, &project_dir, id, phase, false, Some(reason))?
        }
        Commands::Rewind { id, phase } => cmd::cmd_rewind(&cli, &project_dir, id, phase)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
