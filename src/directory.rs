//! User directory collaborator: who exists, who is active, who may do what.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "reservation.review")]
    ReviewReservations,
    #[serde(rename = "ban.manage")]
    ManageBans,
    #[serde(rename = "config.manage")]
    ManageConfig,
    #[serde(rename = "catalog.manage")]
    ManageCatalog,
}

impl Capability {
    pub fn code(self) -> &'static str {
        match self {
            Capability::ReviewReservations => "reservation.review",
            Capability::ManageBans => "ban.manage",
            Capability::ManageConfig => "config.manage",
            Capability::ManageCatalog => "catalog.manage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCheck {
    pub all_exist: bool,
    /// Ids that are unknown, inactive or deleted, in request order.
    pub missing: Vec<Ulid>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn has_capability(&self, actor: Ulid, capability: Capability) -> bool;

    async fn active_users(&self, ids: &[Ulid]) -> UserCheck;
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Ulid,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl UserRecord {
    pub fn member(id: Ulid) -> Self {
        Self {
            id,
            active: true,
            deleted: false,
            capabilities: Vec::new(),
        }
    }

    pub fn staff(id: Ulid, capabilities: &[Capability]) -> Self {
        Self {
            capabilities: capabilities.to_vec(),
            ..Self::member(id)
        }
    }

    fn is_active(&self) -> bool {
        self.active && !self.deleted
    }
}

/// In-memory directory, optionally loaded from a JSON array of [`UserRecord`]s.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: DashMap<Ulid, UserRecord>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let dir = Self::new();
        for user in users {
            dir.upsert(user);
        }
        dir
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let users: Vec<UserRecord> = serde_json::from_str(json)?;
        Ok(Self::with_users(users))
    }

    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn upsert(&self, user: UserRecord) {
        self.users.insert(user.id, user);
    }

    pub fn deactivate(&self, id: &Ulid) {
        if let Some(mut user) = self.users.get_mut(id) {
            user.active = false;
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn has_capability(&self, actor: Ulid, capability: Capability) -> bool {
        self.users
            .get(&actor)
            .is_some_and(|u| u.is_active() && u.capabilities.contains(&capability))
    }

    async fn active_users(&self, ids: &[Ulid]) -> UserCheck {
        let missing: Vec<Ulid> = ids
            .iter()
            .filter(|id| !self.users.get(id).is_some_and(|u| u.is_active()))
            .copied()
            .collect();
        UserCheck {
            all_exist: missing.is_empty(),
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inactive_and_unknown_users_are_missing() {
        let alice = Ulid::new();
        let bob = Ulid::new();
        let ghost = Ulid::new();
        let dir = StaticDirectory::with_users([UserRecord::member(alice), UserRecord::member(bob)]);
        dir.deactivate(&bob);

        let check = dir.active_users(&[alice, bob, ghost]).await;
        assert!(!check.all_exist);
        assert_eq!(check.missing, vec![bob, ghost]);

        let check = dir.active_users(&[alice]).await;
        assert!(check.all_exist);
    }

    #[tokio::test]
    async fn capabilities_require_active_account() {
        let staff = Ulid::new();
        let dir = StaticDirectory::with_users([UserRecord::staff(staff, &[Capability::ManageBans])]);
        assert!(dir.has_capability(staff, Capability::ManageBans).await);
        assert!(!dir.has_capability(staff, Capability::ReviewReservations).await);

        dir.deactivate(&staff);
        assert!(!dir.has_capability(staff, Capability::ManageBans).await);
    }

    #[test]
    fn loads_from_json() {
        let id = Ulid::new();
        let json = format!(
            r#"[{{"id": "{id}", "capabilities": ["reservation.review", "ban.manage"]}}, {{"id": "{}", "deleted": true}}]"#,
            Ulid::new()
        );
        let dir = StaticDirectory::from_json(&json).unwrap();
        assert_eq!(dir.len(), 2);
        let user = dir.users.get(&id).unwrap();
        assert!(user.active);
        assert_eq!(
            user.capabilities,
            vec![Capability::ReviewReservations, Capability::ManageBans]
        );
    }
}
