use clap::{Parser, Subcommand};
use colored::*;
use disclaude_cli::telemetry::{init_telemetry, LogFormat};
use disclaude_cli::{load_config, App};
use std::process;

mod cli;

use cli::sessions::SessionsCommands;
use cli::users::UsersCommands;

#[derive(Parser)]
#[command(name = "disclaude")]
#[command(about = "Claude Code sandboxes for chat threads")]
#[command(version)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service, reading chat events from stdin
    Serve,
    /// Show capacity, live sessions and running sandboxes
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage registered users
    #[command(subcommand)]
    Users(UsersCommands),
    /// Inspect and terminate sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_telemetry(&cli.log_level, LogFormat::from_env());

    if let Err(e) = run(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let config = load_config()?;

    match command {
        Commands::Serve => cli::serve::run(App::bootstrap(config).await?).await,
        Commands::Status { json } => cli::status::run(App::bootstrap(config).await?, json).await,
        Commands::Users(cmd) => cmd.execute(&config).await,
        Commands::Sessions(cmd) => cmd.execute(config).await,
    }
}
