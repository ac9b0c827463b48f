// ABOUTME: Authorization service and sqlite-backed user directory for chat identities
// ABOUTME: Roles are user and owner; owners administer users and may manage any session

use crate::storage::{Role, SandboxStorage, StorageError, User};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{action} requires {required} permission")]
    Unauthorized {
        action: Action,
        required: Permission,
    },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("An owner is already registered")]
    OwnerExists,

    #[error("User {0} is already an owner")]
    AlreadyOwner(String),

    #[error("User {0} is not an owner")]
    NotOwner(String),

    #[error("Cannot {0} yourself")]
    SelfModification(&'static str),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Permission level, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    None,
    User,
    Owner,
}

impl From<Role> for Permission {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Permission::User,
            Role::Owner => Permission::Owner,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "no",
            Self::User => "user",
            Self::Owner => "owner",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateSession,
    CloseSession,
    AddUser,
    AddOwner,
    DeleteUser,
    DeleteOwner,
}

impl Action {
    pub fn required_permission(&self) -> Permission {
        match self {
            Self::CreateSession | Self::CloseSession => Permission::User,
            Self::AddUser | Self::AddOwner | Self::DeleteUser | Self::DeleteOwner => {
                Permission::Owner
            }
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CreateSession => "Creating a sandbox",
            Self::CloseSession => "Closing a sandbox",
            Self::AddUser => "Adding a user",
            Self::AddOwner => "Adding an owner",
            Self::DeleteUser => "Removing a user",
            Self::DeleteOwner => "Removing an owner",
        })
    }
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn permission(&self, caller: &str) -> Result<Permission>;

    /// Owners manage every session; users only their own
    async fn can_manage_session(&self, caller: &str, session_owner: &str) -> Result<bool> {
        Ok(match self.permission(caller).await? {
            Permission::Owner => true,
            Permission::User => caller == session_owner,
            Permission::None => false,
        })
    }

    async fn validate_action(&self, caller: &str, action: Action) -> Result<()> {
        let required = action.required_permission();
        if self.permission(caller).await? < required {
            return Err(AuthError::Unauthorized { action, required });
        }
        Ok(())
    }
}

/// Who asks for a directory change
#[derive(Debug, Clone, Copy)]
pub enum Requester<'a> {
    /// Local operator at the CLI; skips role checks
    Console,
    Chat(&'a str),
}

pub struct UserDirectory {
    storage: Arc<SandboxStorage>,
}

impl UserDirectory {
    pub fn new(storage: Arc<SandboxStorage>) -> Self {
        Self { storage }
    }

    pub async fn has_owner(&self) -> Result<bool> {
        Ok(self
            .storage
            .list_users()
            .await?
            .iter()
            .any(|u| u.role == Role::Owner))
    }

    /// First-contact registration. An existing user is returned unchanged;
    /// registering as owner only succeeds while no owner exists.
    pub async fn initialize_user(&self, id: &str, username: &str, as_owner: bool) -> Result<User> {
        if let Some(existing) = self.storage.get_user(id).await? {
            return Ok(existing);
        }

        if as_owner {
            if !self.storage.insert_first_owner(id, username).await? {
                return Err(AuthError::OwnerExists);
            }
            info!(user_id = %id, "Initial owner registered");
        } else {
            self.insert(id, username, Role::User).await?;
            info!(user_id = %id, "User registered");
        }

        self.storage
            .get_user(id)
            .await?
            .ok_or_else(|| AuthError::UserNotFound(id.to_string()))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.storage.get_user(id).await?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.storage.list_users().await?)
    }

    pub async fn add_user(&self, requester: Requester<'_>, id: &str, username: &str) -> Result<User> {
        self.require(requester, Action::AddUser).await?;
        let user = self.insert(id, username, Role::User).await?;
        info!(user_id = %id, "User added");
        Ok(user)
    }

    pub async fn promote_to_owner(&self, requester: Requester<'_>, id: &str) -> Result<()> {
        self.require(requester, Action::AddOwner).await?;

        let target = self.existing(id).await?;
        if target.role == Role::Owner {
            return Err(AuthError::AlreadyOwner(id.to_string()));
        }

        self.storage.update_user_role(id, Role::Owner).await?;
        info!(user_id = %id, "User promoted to owner");
        Ok(())
    }

    pub async fn demote_from_owner(&self, requester: Requester<'_>, id: &str) -> Result<()> {
        self.require(requester, Action::DeleteOwner).await?;
        if matches!(requester, Requester::Chat(caller) if caller == id) {
            return Err(AuthError::SelfModification("demote"));
        }

        let target = self.existing(id).await?;
        if target.role != Role::Owner {
            return Err(AuthError::NotOwner(id.to_string()));
        }

        self.storage.update_user_role(id, Role::User).await?;
        info!(user_id = %id, "Owner demoted to user");
        Ok(())
    }

    pub async fn remove_user(&self, requester: Requester<'_>, id: &str) -> Result<()> {
        self.require(requester, Action::DeleteUser).await?;
        if matches!(requester, Requester::Chat(caller) if caller == id) {
            return Err(AuthError::SelfModification("remove"));
        }

        self.existing(id).await?;
        self.storage.delete_user(id).await?;
        info!(user_id = %id, "User removed");
        Ok(())
    }

    async fn require(&self, requester: Requester<'_>, action: Action) -> Result<()> {
        match requester {
            Requester::Console => Ok(()),
            Requester::Chat(caller) => self.validate_action(caller, action).await,
        }
    }

    async fn existing(&self, id: &str) -> Result<User> {
        self.storage
            .get_user(id)
            .await?
            .ok_or_else(|| AuthError::UserNotFound(id.to_string()))
    }

    async fn insert(&self, id: &str, username: &str, role: Role) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: id.to_string(),
            username: username.to_string(),
            role,
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_user(&user).await.map_err(|e| match e {
            StorageError::Conflict(_) => AuthError::UserExists(id.to_string()),
            other => AuthError::Storage(other),
        })?;

        Ok(user)
    }
}

#[async_trait]
impl AuthorizationService for UserDirectory {
    async fn permission(&self, caller: &str) -> Result<Permission> {
        Ok(self
            .storage
            .get_user(caller)
            .await?
            .map_or(Permission::None, |u| u.role.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    async fn setup_directory() -> UserDirectory {
        let storage = SandboxStorage::connect("sqlite::memory:").await.unwrap();
        let directory = UserDirectory::new(Arc::new(storage));
        directory.initialize_user("owner", "Olive", true).await.unwrap();
        directory
            .add_user(Requester::Chat("owner"), "member", "Max")
            .await
            .unwrap();
        directory
    }

    #[tokio::test]
    async fn test_only_first_owner_bootstraps() {
        let directory = setup_directory().await;
        assert!(directory.has_owner().await.unwrap());

        let err = directory.initialize_user("late", "Late", true).await.unwrap_err();
        assert!(matches!(err, AuthError::OwnerExists));

        // existing identities are returned as-is
        let owner = directory.initialize_user("owner", "Other", false).await.unwrap();
        assert_eq!(owner.role, Role::Owner);
        assert_eq!(owner.username, "Olive");
    }

    #[rstest]
    #[case("owner", Permission::Owner)]
    #[case("member", Permission::User)]
    #[case("stranger", Permission::None)]
    #[tokio::test]
    async fn test_permission_levels(#[case] caller: &str, #[case] expected: Permission) {
        let directory = setup_directory().await;
        assert_eq!(directory.permission(caller).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_session_management_rules() {
        let directory = setup_directory().await;

        assert!(directory.can_manage_session("owner", "member").await.unwrap());
        assert!(directory.can_manage_session("member", "member").await.unwrap());
        assert!(!directory.can_manage_session("member", "owner").await.unwrap());
        assert!(!directory.can_manage_session("stranger", "stranger").await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_action_thresholds() {
        let directory = setup_directory().await;

        directory.validate_action("member", Action::CreateSession).await.unwrap();
        let err = directory
            .validate_action("member", Action::AddUser)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Unauthorized {
                required: Permission::Owner,
                ..
            }
        ));
        assert!(directory
            .validate_action("stranger", Action::CloseSession)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_members_cannot_administer() {
        let directory = setup_directory().await;
        let err = directory
            .add_user(Requester::Chat("member"), "x", "X")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_promote_demote_and_remove() {
        let directory = setup_directory().await;

        directory
            .promote_to_owner(Requester::Chat("owner"), "member")
            .await
            .unwrap();
        assert!(matches!(
            directory.promote_to_owner(Requester::Chat("owner"), "member").await,
            Err(AuthError::AlreadyOwner(_))
        ));

        directory
            .demote_from_owner(Requester::Chat("owner"), "member")
            .await
            .unwrap();
        assert!(matches!(
            directory.demote_from_owner(Requester::Chat("owner"), "member").await,
            Err(AuthError::NotOwner(_))
        ));

        directory
            .remove_user(Requester::Chat("owner"), "member")
            .await
            .unwrap();
        assert!(directory.get_user("member").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_owner_cannot_target_self() {
        let directory = setup_directory().await;

        assert!(matches!(
            directory.demote_from_owner(Requester::Chat("owner"), "owner").await,
            Err(AuthError::SelfModification("demote"))
        ));
        assert!(matches!(
            directory.remove_user(Requester::Chat("owner"), "owner").await,
            Err(AuthError::SelfModification("remove"))
        ));
    }

    #[tokio::test]
    async fn test_console_requester_skips_role_checks() {
        let directory = setup_directory().await;
        directory.add_user(Requester::Console, "cli", "Cli").await.unwrap();
        directory.promote_to_owner(Requester::Console, "cli").await.unwrap();
        assert_eq!(directory.list_users().await.unwrap().len(), 3);

        assert!(matches!(
            directory.add_user(Requester::Console, "cli", "Again").await,
            Err(AuthError::UserExists(_))
        ));
    }
}
