//! In-process [`UserStore`], used by the fake application state.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::model::User;
use super::repo::{Scope, UniqueViolation, UserStore};
use super::roles::{AttachedRole, Pivot, Role};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    roles: BTreeMap<i64, Role>,
    role_user: Vec<Pivot>,
}

impl Tables {
    fn clash(&self, user: &User) -> Option<UniqueViolation> {
        let active = self
            .users
            .values()
            .filter(|u| u.id != user.id && u.deleted_at.is_none());
        for other in active {
            if other.username == user.username {
                return Some(UniqueViolation { column: "username" });
            }
            if other.email == user.email {
                return Some(UniqueViolation { column: "email" });
            }
        }
        None
    }

    fn attach(&mut self, user_id: Uuid, role_ids: &[i64]) {
        let now = OffsetDateTime::now_utc();
        for &role_id in role_ids {
            let present = self
                .role_user
                .iter()
                .any(|p| p.user_id == user_id && p.role_id == role_id);
            if !present && self.roles.contains_key(&role_id) {
                self.role_user.push(Pivot {
                    user_id,
                    role_id,
                    created_at: now,
                });
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn with_roles<'a>(roles: impl IntoIterator<Item = (i64, &'a str)>) -> Self {
        let tables = Tables {
            roles: roles
                .into_iter()
                .map(|(id, name)| (id, Role { id, name: name.to_owned() }))
                .collect(),
            ..Tables::default()
        };
        Self {
            tables: RwLock::new(tables),
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert(&self, user: &User, role_ids: &[i64]) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(&user.id) {
            anyhow::bail!("duplicate user id {}", user.id);
        }
        if let Some(violation) = tables.clash(user) {
            return Err(violation.into());
        }
        tables.users.insert(user.id, user.clone());
        tables.attach(user.id, role_ids);
        Ok(())
    }

    async fn update(&self, user: &User) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(violation) = tables.clash(user) {
            return Err(violation.into());
        }
        match tables.users.get_mut(&user.id) {
            Some(stored) => {
                let deleted_at = stored.deleted_at;
                *stored = user.clone();
                stored.deleted_at = deleted_at;
                Ok(())
            }
            None => anyhow::bail!("unknown user {}", user.id),
        }
    }

    async fn find(&self, id: Uuid, scope: Scope) -> anyhow::Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .get(&id)
            .filter(|u| scope.admits(u.deleted_at))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.email == email && u.deleted_at.is_none())
            .cloned())
    }

    async fn list(&self, scope: Scope) -> anyhow::Result<Vec<User>> {
        let tables = self.tables.read().await;
        let mut users: Vec<User> = tables
            .users
            .values()
            .filter(|u| scope.admits(u.deleted_at))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.users.get_mut(&id) {
            Some(user) if user.deleted_at.is_none() => {
                user.deleted_at = Some(at);
                user.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.get(&id).filter(|u| u.deleted_at.is_some()) else {
            return Ok(false);
        };
        if let Some(violation) = tables.clash(user) {
            return Err(violation.into());
        }
        if let Some(user) = tables.users.get_mut(&id) {
            user.deleted_at = None;
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(true)
    }

    async fn is_taken(
        &self,
        column: &str,
        value: &str,
        ignore: Option<Uuid>,
    ) -> anyhow::Result<bool> {
        let tables = self.tables.read().await;
        let mut active = tables
            .users
            .values()
            .filter(|u| u.deleted_at.is_none() && Some(u.id) != ignore);
        Ok(match column {
            "username" => active.any(|u| u.username == value),
            "email" => active.any(|u| u.email == value),
            other => anyhow::bail!("no uniqueness check for column {other}"),
        })
    }

    async fn existing_role_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<i64>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| tables.roles.contains_key(id))
            .collect())
    }

    async fn roles_of(&self, user_id: Uuid) -> anyhow::Result<Vec<AttachedRole>> {
        let tables = self.tables.read().await;
        let mut attached: Vec<AttachedRole> = tables
            .role_user
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| {
                tables.roles.get(&p.role_id).map(|role| AttachedRole {
                    role: role.clone(),
                    pivot: p.clone(),
                })
            })
            .collect();
        attached.sort_by_key(|a| a.role.id);
        Ok(attached)
    }

    async fn first_role_named(
        &self,
        user_id: Uuid,
        names: &[String],
    ) -> anyhow::Result<Option<Role>> {
        let tables = self.tables.read().await;
        Ok(tables
            .role_user
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| tables.roles.get(&p.role_id))
            .find(|role| names.contains(&role.name))
            .cloned())
    }

    async fn attach_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()> {
        self.tables.write().await.attach(user_id, role_ids);
        Ok(())
    }

    async fn detach_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .role_user
            .retain(|p| !(p.user_id == user_id && role_ids.contains(&p.role_id)));
        Ok(())
    }

    async fn sync_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .role_user
            .retain(|p| p.user_id != user_id || role_ids.contains(&p.role_id));
        tables.attach(user_id, role_ids);
        Ok(())
    }
}
