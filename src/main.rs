use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::config::{CliOverrides, Config};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Cross-process wave coordinator for parallel agent sessions")]
pub struct Cli {
    /// Project root (defaults to $CONDUCTOR_PROJECT_DIR, $CLAUDE_PROJECT_DIR, then the cwd)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Directory holding the coordination state (overrides $SESSIONS_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Directory holding task files (overrides $BACKLOG_TASKS_DIR)
    #[arg(long, global = true)]
    pub tasks_dir: Option<PathBuf>,

    /// Path to conductor.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directive for stderr logging
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a finished session and emit the continuation signal
    Complete {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        group_id: String,
        #[arg(long, default_value = "")]
        subagent_type: String,
        /// Exit status reported by the session (empty means completed)
        #[arg(long, default_value = "")]
        exit_status: String,
    },
    /// Preview the next wave for a bootstrap stage without writing
    Plan {
        #[arg(long, default_value = "1")]
        stage: u32,
    },
    /// Evaluate the status of one group in the persisted plan
    Status { group_id: String },
    /// Print the persisted plan and session index
    Inspect,
    /// Initialize the state directory with empty artifacts
    Init {
        /// Overwrite existing coordination state
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default conductor.toml
    Init,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            project_dir: self.project_dir.clone(),
            state_dir: self.state_dir.clone(),
            tasks_dir: self.tasks_dir.clone(),
            config_file: self.config.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::resolve(&cli.overrides()).context("Failed to resolve configuration")?;
    let _log_guard = conductor::logging::init(&config.logging)?;

    match cli.command {
        Commands::Complete {
            session_id,
            task_id,
            group_id,
            subagent_type,
            exit_status,
        } => {
            let signal = conductor::coordinator::CompletionSignal {
                session_id,
                task_id,
                group_id,
                subagent_type,
                exit_status,
            };
            cmd::cmd_complete(config, signal).await?;
        }
        Commands::Plan { stage } => cmd::cmd_plan(&config, stage)?,
        Commands::Status { group_id } => cmd::cmd_status(&config, &group_id)?,
        Commands::Inspect => cmd::cmd_inspect(&config)?,
        Commands::Init { force } => cmd::cmd_init(&config, force)?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
