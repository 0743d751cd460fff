use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo::UserStore;

/// Named role a user may hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: i64,
    pub name: String,
}

/// Bookkeeping columns of the `role_user` join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pivot {
    pub user_id: Uuid,
    pub role_id: i64,
    pub created_at: OffsetDateTime,
}

/// Role loaded through the join table. Only the role itself is serialized.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedRole {
    #[serde(flatten)]
    pub role: Role,
    #[serde(skip)]
    pub pivot: Pivot,
}

/// Roles required by an authorization check: a single name or any of a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleRequirement {
    One(String),
    Any(Vec<String>),
}

impl RoleRequirement {
    pub fn names(&self) -> &[String] {
        match self {
            RoleRequirement::One(name) => std::slice::from_ref(name),
            RoleRequirement::Any(names) => names,
        }
    }

    pub fn denial_message(&self) -> String {
        format!(
            "This action is unauthorized. Only {} can access this action.",
            self.names().join(",")
        )
    }
}

impl From<&str> for RoleRequirement {
    fn from(name: &str) -> Self {
        RoleRequirement::One(name.to_owned())
    }
}

impl From<String> for RoleRequirement {
    fn from(name: String) -> Self {
        RoleRequirement::One(name)
    }
}

impl From<&[&str]> for RoleRequirement {
    fn from(names: &[&str]) -> Self {
        RoleRequirement::Any(names.iter().map(|n| (*n).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RoleRequirement {
    fn from(names: [&str; N]) -> Self {
        RoleRequirement::from(&names[..])
    }
}

impl From<Vec<String>> for RoleRequirement {
    fn from(names: Vec<String>) -> Self {
        RoleRequirement::Any(names)
    }
}

/// Query handle over one user's side of the user/role relation.
///
/// Every call goes to the store; nothing is cached on the handle.
pub struct RoleRelation<'a> {
    store: &'a dyn UserStore,
    user_id: Uuid,
}

impl<'a> RoleRelation<'a> {
    pub fn new(store: &'a dyn UserStore, user_id: Uuid) -> Self {
        Self { store, user_id }
    }

    pub async fn list(&self) -> anyhow::Result<Vec<AttachedRole>> {
        self.store.roles_of(self.user_id).await
    }

    /// First attached role whose name is exactly one of `names`.
    pub async fn first_named(&self, names: &[String]) -> anyhow::Result<Option<Role>> {
        if names.is_empty() {
            return Ok(None);
        }
        self.store.first_role_named(self.user_id, names).await
    }

    pub async fn attach(&self, role_ids: &[i64]) -> anyhow::Result<()> {
        self.store.attach_roles(self.user_id, role_ids).await
    }

    pub async fn detach(&self, role_ids: &[i64]) -> anyhow::Result<()> {
        self.store.detach_roles(self.user_id, role_ids).await
    }

    /// Replace the attached set with exactly `role_ids`.
    pub async fn sync(&self, role_ids: &[i64]) -> anyhow::Result<()> {
        self.store.sync_roles(self.user_id, role_ids).await
    }
}
