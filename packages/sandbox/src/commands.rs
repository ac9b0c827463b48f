// ABOUTME: Chat command router for `/claude ...` commands and plain thread messages
// ABOUTME: Renders lifecycle results as chat replies and runs the first-owner bootstrap prompt

use crate::auth::{AuthError, Requester, UserDirectory};
use crate::lifecycle::{LifecycleCoordinator, LifecycleError, StatusReport};
use crate::storage::{Role, Session, User};
use crate::transport::{ChatTransport, InboundEvent, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub const COMMAND_PREFIX: &str = "/claude";

pub const HELP_TEXT: &str = "🤖 **Claude Code sandbox commands**

📦 **Sessions:**
• `/claude start` - create a sandbox for this thread
• `/claude close` - end this thread's session and delete its sandbox
• `/claude info` - details of this thread's session
• `/claude status` - capacity and running sandboxes

👑 **Owners only:**
• `/claude add user <ID> [name]` - register a user
• `/claude add owner <ID>` - promote a user to owner
• `/claude delete user <ID>` - remove a user
• `/claude delete owner <ID>` - demote an owner

💬 Any other message in a thread with an active session is sent to Claude Code.";

const OWNER_COMMANDS: &str = "👑 **Owner commands:**
• `/claude add user <ID>` • `/claude add owner <ID>`
• `/claude delete user <ID>` • `/claude delete owner <ID>`";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Close,
    Status,
    Info,
    Help,
    AddUser { id: String, name: Option<String> },
    AddOwner { id: String },
    DeleteUser { id: String },
    DeleteOwner { id: String },
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// Parse a message starting with `/claude`; `None` for anything else
    pub fn parse(content: &str) -> Option<Self> {
        let mut parts = content.split_whitespace();
        if parts.next()? != COMMAND_PREFIX {
            return None;
        }

        let Some(sub) = parts.next() else {
            return Some(Self::Help);
        };
        let target = parts.next();
        let id = parts.next().map(str::to_string);

        Some(match (sub, target, id) {
            ("start", ..) => Self::Start,
            ("close", ..) => Self::Close,
            ("status", ..) => Self::Status,
            ("info", ..) => Self::Info,
            ("help", ..) => Self::Help,
            ("add", Some("user"), Some(id)) => Self::AddUser {
                id,
                name: parts.next().map(str::to_string),
            },
            ("add", Some("owner"), Some(id)) => Self::AddOwner { id },
            ("add", ..) => Self::Usage("`/claude add user <ID>` or `/claude add owner <ID>`"),
            ("delete", Some("user"), Some(id)) => Self::DeleteUser { id },
            ("delete", Some("owner"), Some(id)) => Self::DeleteOwner { id },
            ("delete", ..) => {
                Self::Usage("`/claude delete user <ID>` or `/claude delete owner <ID>`")
            }
            (other, ..) => Self::Unknown(other.to_string()),
        })
    }
}

/// `1h 2m 3s` style rendering
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m {}s", m, s),
        _ => format!("{}h {}m {}s", h, m, s),
    }
}

pub fn render_status(user: &User, report: &StatusReport) -> String {
    let mut out = format!(
        "📊 **Sandbox status**\n\n👤 **You:** {} ({})\n\n🏗️ **Capacity:**\n• In use: {}/{}\n• Available: {}\n\n📍 **This thread:**",
        user.username,
        user.role.as_str(),
        report.usage.current,
        report.usage.max,
        report.usage.remaining()
    );

    match &report.session {
        Some(session) => out.push_str(&format!(
            "\n• Session: {} ({})\n• Running for: {}\n• Sandbox: {}",
            session.id,
            session.status.as_str(),
            format_duration(session.duration()),
            session.sandbox_name
        )),
        None => out.push_str("\n• Session: none ⭕"),
    }

    if !report.sandboxes.is_empty() {
        out.push_str("\n\n🔧 **Sandboxes:**");
        for sandbox in &report.sandboxes {
            out.push_str(&format!("\n• {} ({})", sandbox.name, sandbox.phase));
        }
        if report.total_sandboxes > report.sandboxes.len() {
            out.push_str(&format!(
                "\n• ... and {} more",
                report.total_sandboxes - report.sandboxes.len()
            ));
        }
    }
    if let Some(err) = &report.list_error {
        out.push_str(&format!("\n\n⚠️ Could not list sandboxes: {}", err));
    }

    if user.role == Role::Owner {
        out.push_str("\n\n");
        out.push_str(OWNER_COMMANDS);
    }

    out
}

fn render_started(session: &Session, user: &User) -> String {
    format!(
        "✅ **Sandbox ready!**\n\n🏷️ **Session:**\n• ID: {}\n• Sandbox: {}\n• Started by: {}\n\n💬 Talk to Claude Code freely in this thread. Run `/claude close` when you are done.\n\n⚠️ Files are temporary and deleted when the session ends.",
        session.id, session.sandbox_name, user.username
    )
}

fn render_closed(session: &Session, warnings: &[String]) -> String {
    let mut out = format!(
        "✅ **Session ended**\n\n• ID: {}\n• Sandbox: {}\n• Duration: {}\n\n💾 All files from this session were deleted. Run `/claude start` for a new one.",
        session.id,
        session.sandbox_name,
        format_duration(session.duration())
    );
    if !warnings.is_empty() {
        out.push_str("\n\n⚠️ **Cleanup warnings:**");
        for warning in warnings {
            out.push_str(&format!("\n• {}", warning));
        }
    }
    out
}

pub struct CommandRouter {
    coordinator: Arc<LifecycleCoordinator>,
    directory: Arc<UserDirectory>,
    transport: Arc<dyn ChatTransport>,
    /// Unregistered senders that were asked whether they are the owner
    prompted: Mutex<HashSet<String>>,
}

impl CommandRouter {
    pub fn new(
        coordinator: Arc<LifecycleCoordinator>,
        directory: Arc<UserDirectory>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            coordinator,
            directory,
            transport,
            prompted: Mutex::new(HashSet::new()),
        }
    }

    pub async fn handle(&self, event: &InboundEvent) -> Result<()> {
        let thread = event.thread_id.as_str();

        let user = match self.directory.get_user(&event.sender_id).await {
            Ok(user) => user,
            Err(e) => {
                error!(sender = %event.sender_id, error = %e, "Failed to load user");
                return self
                    .transport
                    .send_error(thread, "Failed to load user information.")
                    .await;
            }
        };

        let command = Command::parse(&event.content);
        let Some(user) = user else {
            return self.handle_unregistered(event, command.is_some()).await;
        };

        match command {
            Some(command) => self.dispatch(event, &user, command).await,
            None => self.forward(event).await,
        }
    }

    async fn dispatch(&self, event: &InboundEvent, user: &User, command: Command) -> Result<()> {
        let thread = event.thread_id.as_str();
        debug!(thread_id = %thread, user_id = %user.id, ?command, "Handling command");

        match command {
            Command::Start => {
                self.transport
                    .send_message(thread, "🚀 **Creating Claude Code sandbox...**\nPlease wait.")
                    .await?;
                match self.coordinator.start_session(&user.id, thread).await {
                    Ok(session) => {
                        self.transport
                            .send_message(thread, &render_started(&session, user))
                            .await
                    }
                    Err(e) => self.lifecycle_error(thread, e).await,
                }
            }
            Command::Close => match self.coordinator.close_thread(&user.id, thread).await {
                Ok(report) => {
                    self.transport
                        .send_message(thread, &render_closed(&report.session, &report.warnings))
                        .await
                }
                Err(e) => self.lifecycle_error(thread, e).await,
            },
            Command::Status => match self.coordinator.status_report(Some(thread)).await {
                Ok(report) => {
                    self.transport
                        .send_message(thread, &render_status(user, &report))
                        .await
                }
                Err(e) => self.lifecycle_error(thread, e).await,
            },
            Command::Info => match self.coordinator.session_info(thread).await {
                Ok(Some(info)) => {
                    let mut out = format!(
                        "🏷️ **Session {}**\n• Status: {}\n• Owner: {}\n• Sandbox: {}\n• Duration: {}",
                        info.session.id,
                        info.session.status.as_str(),
                        info.session.user_id,
                        info.session.sandbox_name,
                        format_duration(info.session.duration())
                    );
                    if let Some(phase) = info.phase {
                        out.push_str(&format!("\n• Phase: {}", phase));
                    }
                    if let Some(sandbox) = info.sandbox {
                        out.push_str(&format!(
                            "\n• Resources: {} CPU, {} MiB",
                            sandbox.cpu_cores, sandbox.memory_mb
                        ));
                    }
                    self.transport.send_message(thread, &out).await
                }
                Ok(None) => {
                    self.transport
                        .send_message(thread, "No session has been started in this thread.")
                        .await
                }
                Err(e) => self.lifecycle_error(thread, e).await,
            },
            Command::Help => self.transport.send_message(thread, HELP_TEXT).await,
            Command::AddUser { id, name } => {
                let name = name.unwrap_or_else(|| id.clone());
                let result = self
                    .directory
                    .add_user(Requester::Chat(&user.id), &id, &name)
                    .await
                    .map(|added| format!("✅ Added **{}** ({}) as a user.", added.username, added.id));
                self.admin_reply(thread, result).await
            }
            Command::AddOwner { id } => {
                let result = self
                    .directory
                    .promote_to_owner(Requester::Chat(&user.id), &id)
                    .await
                    .map(|_| format!("✅ Promoted {} to owner.", id));
                self.admin_reply(thread, result).await
            }
            Command::DeleteUser { id } => {
                let result = self
                    .directory
                    .remove_user(Requester::Chat(&user.id), &id)
                    .await
                    .map(|_| format!("✅ Removed user {}.", id));
                self.admin_reply(thread, result).await
            }
            Command::DeleteOwner { id } => {
                let result = self
                    .directory
                    .demote_from_owner(Requester::Chat(&user.id), &id)
                    .await
                    .map(|_| format!("✅ Demoted {} to user.", id));
                self.admin_reply(thread, result).await
            }
            Command::Usage(usage) => {
                self.transport
                    .send_error(thread, &format!("Usage: {}", usage))
                    .await
            }
            Command::Unknown(sub) => {
                self.transport
                    .send_error(thread, &format!("Unknown command: `{}`. Try `/claude help`.", sub))
                    .await
            }
        }
    }

    /// Plain message in a thread; ignored unless the thread has an active session
    async fn forward(&self, event: &InboundEvent) -> Result<()> {
        let thread = event.thread_id.as_str();
        match self
            .coordinator
            .route_message(thread, &event.sender_id, &event.content)
            .await
        {
            Ok(reply) => self.transport.send_message(thread, &reply).await,
            Err(LifecycleError::NotFound(_)) => Ok(()),
            Err(e) => self.lifecycle_error(thread, e).await,
        }
    }

    async fn handle_unregistered(&self, event: &InboundEvent, is_command: bool) -> Result<()> {
        let thread = event.thread_id.as_str();
        let answer = event.content.trim().to_lowercase();
        let was_prompted = self.prompted.lock().await.contains(&event.sender_id);

        if was_prompted && matches!(answer.as_str(), "yes" | "y") {
            self.prompted.lock().await.remove(&event.sender_id);
            return match self
                .directory
                .initialize_user(&event.sender_id, &event.sender_name, true)
                .await
            {
                Ok(user) => {
                    info!(user_id = %user.id, "Owner registered through chat");
                    self.transport
                        .send_message(
                            thread,
                            &format!(
                                "✅ Registered as owner, {}!\nYou can now use Claude Code sandboxes. See `/claude help`.",
                                user.username
                            ),
                        )
                        .await
                }
                Err(AuthError::OwnerExists) => {
                    self.transport
                        .send_error(thread, "An owner is already registered. Ask an owner to add you.")
                        .await
                }
                Err(e) => {
                    error!(sender = %event.sender_id, error = %e, "Failed to register owner");
                    self.transport.send_error(thread, "Owner registration failed.").await
                }
            };
        }

        if was_prompted && matches!(answer.as_str(), "no" | "n") {
            self.prompted.lock().await.remove(&event.sender_id);
            return self
                .transport
                .send_message(
                    thread,
                    "Owner registration cancelled. Ask an owner to add you to use Claude Code sandboxes.",
                )
                .await;
        }

        if !is_command {
            return Ok(());
        }

        match self.directory.has_owner().await {
            Ok(false) => {
                self.prompted.lock().await.insert(event.sender_id.clone());
                self.transport
                    .send_message(
                        thread,
                        &format!(
                            "Hello {}!\n\n🤖 **Are you my owner?**\n\n✅ Reply `Yes` if you are\n❌ Reply `No` if you are not\n\nOwners can manage users.",
                            event.sender_name
                        ),
                    )
                    .await
            }
            Ok(true) => {
                self.transport
                    .send_error(thread, "You are not registered. Ask an owner to add you.")
                    .await
            }
            Err(e) => {
                error!(error = %e, "Failed to check owner registration");
                self.transport
                    .send_error(thread, "Failed to load user information.")
                    .await
            }
        }
    }

    async fn lifecycle_error(&self, thread: &str, e: LifecycleError) -> Result<()> {
        match &e {
            LifecycleError::Storage(_) => error!(thread_id = %thread, error = %e, "Lifecycle operation failed"),
            _ => debug!(thread_id = %thread, error = %e, "Lifecycle operation rejected"),
        }
        self.transport.send_error(thread, &e.user_message()).await
    }

    async fn admin_reply(
        &self,
        thread: &str,
        result: std::result::Result<String, AuthError>,
    ) -> Result<()> {
        match result {
            Ok(text) => self.transport.send_message(thread, &text).await,
            Err(e) => self.transport.send_error(thread, &e.to_string()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::storage::SandboxStorage;
    use crate::testing::{MockProvider, RecordingTransport};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    struct Fixture {
        router: CommandRouter,
        transport: Arc<RecordingTransport>,
        provider: Arc<MockProvider>,
        directory: Arc<UserDirectory>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(SandboxStorage::connect("sqlite::memory:").await.unwrap());
        let directory = Arc::new(UserDirectory::new(storage.clone()));
        let provider = Arc::new(MockProvider::new());
        let coordinator = LifecycleCoordinator::new(
            storage,
            provider.clone(),
            directory.clone(),
            &SandboxConfig::default(),
        )
        .with_poll_interval(Duration::from_millis(10));
        coordinator.ledger().set_maximum(3).await.unwrap();

        let transport = Arc::new(RecordingTransport::new());
        let router = CommandRouter::new(Arc::new(coordinator), directory.clone(), transport.clone());
        Fixture {
            router,
            transport,
            provider,
            directory,
        }
    }

    fn event(thread: &str, sender: &str, content: &str) -> InboundEvent {
        InboundEvent {
            thread_id: thread.to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            content: content.to_string(),
        }
    }

    #[rstest]
    #[case("/claude", Some(Command::Help))]
    #[case("/claude start", Some(Command::Start))]
    #[case("  /claude   close  ", Some(Command::Close))]
    #[case("/claude add user 42 Alice", Some(Command::AddUser { id: "42".into(), name: Some("Alice".into()) }))]
    #[case("/claude delete owner 7", Some(Command::DeleteOwner { id: "7".into() }))]
    #[case("/claude frobnicate", Some(Command::Unknown("frobnicate".into())))]
    #[case("hello there", None)]
    #[case("/claudex start", None)]
    fn test_parse(#[case] input: &str, #[case] expected: Option<Command>) {
        assert_eq!(Command::parse(input), expected);
    }

    #[test]
    fn test_parse_incomplete_admin_commands() {
        assert!(matches!(Command::parse("/claude add user"), Some(Command::Usage(_))));
        assert!(matches!(Command::parse("/claude delete"), Some(Command::Usage(_))));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(5)), "5s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(format_duration(chrono::Duration::seconds(3725)), "1h 2m 5s");
    }

    #[tokio::test]
    async fn test_owner_bootstrap_flow() {
        let f = fixture().await;

        f.router.handle(&event("t1", "u1", "/claude start")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("Are you my owner?"));

        f.router.handle(&event("t1", "u1", "Yes")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("Registered as owner"));
        assert_eq!(f.directory.get_user("u1").await.unwrap().unwrap().role, Role::Owner);

        // later strangers are not offered ownership
        f.router.handle(&event("t1", "u2", "/claude start")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("not registered"));
        f.router.handle(&event("t1", "u2", "yes")).await.unwrap();
        assert!(f.directory.get_user("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_talk_close() {
        let f = fixture().await;
        f.directory.initialize_user("u1", "Ada", true).await.unwrap();

        f.router.handle(&event("t1", "u1", "/claude start")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("Sandbox ready"));

        f.provider.set_exec_output("4\n", "");
        f.router.handle(&event("t1", "u1", "what is 2+2?")).await.unwrap();
        assert_eq!(f.transport.last("t1").unwrap(), "4");

        f.router.handle(&event("t1", "u1", "/claude close")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("Session ended"));
        assert!(f.provider.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_messages_without_session_are_ignored() {
        let f = fixture().await;
        f.directory.initialize_user("u1", "Ada", true).await.unwrap();

        f.router.handle(&event("t1", "u1", "just chatting")).await.unwrap();
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_prefixed() {
        let f = fixture().await;
        f.directory.initialize_user("u1", "Ada", true).await.unwrap();

        f.router.handle(&event("t1", "u1", "/claude close")).await.unwrap();
        let reply = f.transport.last("t1").unwrap();
        assert!(reply.starts_with(crate::transport::ERROR_PREFIX));
        assert!(reply.contains("no active session"));
    }

    #[tokio::test]
    async fn test_status_shows_owner_commands() {
        let f = fixture().await;
        f.directory.initialize_user("u1", "Ada", true).await.unwrap();

        f.router.handle(&event("t1", "u1", "/claude status")).await.unwrap();
        let reply = f.transport.last("t1").unwrap();
        assert!(reply.contains("In use: 0/3"));
        assert!(reply.contains("Owner commands"));
    }

    #[tokio::test]
    async fn test_admin_commands() {
        let f = fixture().await;
        f.directory.initialize_user("u1", "Ada", true).await.unwrap();

        f.router.handle(&event("t1", "u1", "/claude add user u2 Bob")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("Added **Bob**"));

        f.router.handle(&event("t1", "u2", "/claude add user u3")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("requires owner permission"));

        f.router.handle(&event("t1", "u1", "/claude delete owner u1")).await.unwrap();
        assert!(f.transport.last("t1").unwrap().contains("Cannot demote yourself"));
    }
}
