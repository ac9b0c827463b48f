// ABOUTME: `disclaude users ...`: local administration of the user directory
// ABOUTME: Runs as the local operator, so chat role checks do not apply

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use disclaude_cli::open_storage;
use disclaude_sandbox::{Requester, Role, SandboxConfig, UserDirectory};

use super::{format_date, new_table};

#[derive(Subcommand)]
pub enum UsersCommands {
    /// List registered users
    List,
    /// Register a user
    Add {
        /// Chat identity of the user
        id: String,
        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,
        /// Register directly as an owner
        #[arg(long)]
        owner: bool,
    },
    /// Promote a user to owner
    Promote { id: String },
    /// Demote an owner to user
    Demote { id: String },
    /// Remove a user
    Remove { id: String },
}

impl UsersCommands {
    pub async fn execute(self, config: &SandboxConfig) -> Result<()> {
        let directory = UserDirectory::new(open_storage(config).await?);

        match self {
            UsersCommands::List => list_users(&directory).await,
            UsersCommands::Add { id, name, owner } => {
                let name = name.unwrap_or_else(|| id.clone());
                directory.add_user(Requester::Console, &id, &name).await?;
                if owner {
                    directory.promote_to_owner(Requester::Console, &id).await?;
                }
                println!(
                    "{} Added {} as {}",
                    "✅".green(),
                    name.bold(),
                    if owner { "owner" } else { "user" }
                );
                Ok(())
            }
            UsersCommands::Promote { id } => {
                directory.promote_to_owner(Requester::Console, &id).await?;
                println!("{} Promoted {} to owner", "✅".green(), id.bold());
                Ok(())
            }
            UsersCommands::Demote { id } => {
                directory.demote_from_owner(Requester::Console, &id).await?;
                println!("{} Demoted {} to user", "✅".green(), id.bold());
                Ok(())
            }
            UsersCommands::Remove { id } => {
                directory.remove_user(Requester::Console, &id).await?;
                println!("{} Removed {}", "✅".green(), id.bold());
                Ok(())
            }
        }
    }
}

async fn list_users(directory: &UserDirectory) -> Result<()> {
    let users = directory.list_users().await?;

    if users.is_empty() {
        println!("{}", "No users registered".yellow());
        println!(
            "{}",
            "The first person to answer the owner prompt in chat becomes the owner".dimmed()
        );
        return Ok(());
    }

    let mut table = new_table(vec!["ID", "Name", "Role", "Added"]);
    for user in &users {
        let role = match user.role {
            Role::Owner => "owner 👑",
            Role::User => "user",
        };
        table.add_row(vec![
            user.id.clone(),
            user.username.clone(),
            role.to_string(),
            format_date(&user.created_at),
        ]);
    }

    println!("{}", table);
    println!("Total: {} users", users.len().to_string().cyan());
    Ok(())
}
