// ABOUTME: `disclaude sessions ...`: list sessions and force-terminate one with an audit reason
// ABOUTME: Termination runs the same teardown as a chat close, including slot release

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use disclaude_cli::{open_storage, App};
use disclaude_sandbox::commands::format_duration;
use disclaude_sandbox::{SandboxConfig, SessionRegistry, SessionStatus};

use super::{format_date, new_table};

#[derive(Subcommand)]
pub enum SessionsCommands {
    /// List sessions (live ones unless --all)
    List {
        #[arg(long)]
        all: bool,
    },
    /// Tear down an active session and delete its sandbox
    Terminate {
        /// Session id (ses_...)
        id: String,
        /// Reason recorded on the session for audit
        #[arg(long, default_value = "terminated by operator")]
        reason: String,
    },
}

impl SessionsCommands {
    pub async fn execute(self, config: SandboxConfig) -> Result<()> {
        match self {
            SessionsCommands::List { all } => {
                let registry = SessionRegistry::new(open_storage(&config).await?);
                let sessions = if all {
                    registry.list_all().await?
                } else {
                    registry.list_live().await?
                };

                if sessions.is_empty() {
                    println!("{}", "No sessions found".yellow());
                    return Ok(());
                }

                let mut table =
                    new_table(vec!["ID", "Thread", "User", "Status", "Created", "Duration", "Reason"]);
                for session in &sessions {
                    let status = match session.status {
                        SessionStatus::Active => session.status.as_str().green().to_string(),
                        SessionStatus::Failed => session.status.as_str().red().to_string(),
                        _ => session.status.as_str().to_string(),
                    };
                    table.add_row(vec![
                        session.id.clone(),
                        session.thread_id.clone(),
                        session.user_id.clone(),
                        status,
                        format_date(&session.created_at),
                        format_duration(session.duration()),
                        session.termination_reason.clone().unwrap_or_default(),
                    ]);
                }
                println!("{}", table);
                println!("Total: {} sessions", sessions.len().to_string().cyan());
                Ok(())
            }
            SessionsCommands::Terminate { id, reason } => {
                let app = App::bootstrap(config).await?;
                let report = app.coordinator.force_terminate(&id, &reason).await?;

                println!(
                    "{} Terminated {} ({})",
                    "✅".green(),
                    report.session.id.bold(),
                    report.session.sandbox_name
                );
                for warning in &report.warnings {
                    println!("{} {}", "⚠️".yellow(), warning);
                }
                Ok(())
            }
        }
    }
}
