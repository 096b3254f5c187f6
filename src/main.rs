use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "devloop")]
#[command(version, about = "Autonomous board orchestrator for coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true, env = "DEVLOOP_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until stopped
    Run {
        /// Only run these loops (comma-separated, e.g. "sync,triage")
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Stop a running scheduler immediately, killing live agents
    Stop,
    /// Stop dispatching and let live agents finish before exiting
    Shutdown,
    /// Show loop liveness, rate-limit state, holds and pending markers
    /// from local state; never contacts the board
    Status {
        /// Print the liveness record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or edit the live board
    Board {
        #[command(subcommand)]
        command: BoardCommands,
    },
    /// Inspect or reset review bounce counts
    Bounces {
        #[command(subcommand)]
        command: Option<BounceCommands>,
    },
    /// Inspect or release items parked after an unclear agent result
    Holds {
        #[command(subcommand)]
        command: Option<HoldCommands>,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum BoardCommands {
    /// Item counts per status, in board order
    Summary,
    /// Item numbers with the given status
    List {
        status: String,
        /// Print only how many
        #[arg(long)]
        count: bool,
    },
    /// Move an item to a new status, refusing illegal transitions
    SetStatus { item: u64, status: String },
    /// Item detail as JSON
    Context { item: u64 },
    /// Rejected and Todo items in the order implementation takes them
    Queue,
}

#[derive(Subcommand, Clone)]
pub enum BounceCommands {
    Show,
    Reset { item: u64 },
}

#[derive(Subcommand, Clone)]
pub enum HoldCommands {
    Show,
    Release { item: u64 },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show,
    Validate,
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { only } => cmd::cmd_run(&project_dir, cli.verbose, only).await?,
        Commands::Stop => cmd::cmd_stop(&project_dir)?,
        Commands::Shutdown => cmd::cmd_shutdown(&project_dir)?,
        Commands::Status { json } => cmd::cmd_status(&project_dir, *json)?,
        Commands::Board { command } => cmd::cmd_board(&project_dir, command.clone()).await?,
        Commands::Bounces { command } => cmd::cmd_bounces(&project_dir, command.clone())?,
        Commands::Holds { command } => cmd::cmd_holds(&project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
