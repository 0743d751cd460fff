use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::User;
use super::roles::{AttachedRole, Pivot, Role};

/// Which records a query sees with respect to soft deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    Active,
    WithTrashed,
    OnlyTrashed,
}

impl Scope {
    fn sql_filter(self) -> &'static str {
        match self {
            Scope::Active => "deleted_at IS NULL",
            Scope::WithTrashed => "TRUE",
            Scope::OnlyTrashed => "deleted_at IS NOT NULL",
        }
    }

    pub fn admits(self, deleted_at: Option<OffsetDateTime>) -> bool {
        match self {
            Scope::Active => deleted_at.is_none(),
            Scope::WithTrashed => true,
            Scope::OnlyTrashed => deleted_at.is_some(),
        }
    }
}

/// Write rejected because another active user holds the value.
#[derive(Debug, thiserror::Error)]
#[error("{column} already taken")]
pub struct UniqueViolation {
    pub column: &'static str,
}

/// Persistence for users and their role relation.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Write `user` together with its initial roles, all or nothing.
    ///
    /// Fails with [`UniqueViolation`] when username or email clash with an
    /// active user.
    async fn insert(&self, user: &User, role_ids: &[i64]) -> anyhow::Result<()>;
    async fn update(&self, user: &User) -> anyhow::Result<()>;
    async fn find(&self, id: Uuid, scope: Scope) -> anyhow::Result<Option<User>>;
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn list(&self, scope: Scope) -> anyhow::Result<Vec<User>>;
    /// Set the deletion marker. False when no active user has `id`.
    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<bool>;
    /// Clear the deletion marker. False when no trashed user has `id`.
    async fn restore(&self, id: Uuid) -> anyhow::Result<bool>;

    /// Whether an active user other than `ignore` holds `value` in `column`.
    async fn is_taken(&self, column: &str, value: &str, ignore: Option<Uuid>)
        -> anyhow::Result<bool>;
    /// Subset of `ids` naming existing roles.
    async fn existing_role_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<i64>>;

    async fn roles_of(&self, user_id: Uuid) -> anyhow::Result<Vec<AttachedRole>>;
    async fn first_role_named(&self, user_id: Uuid, names: &[String])
        -> anyhow::Result<Option<Role>>;
    async fn attach_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()>;
    async fn detach_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()>;
    async fn sync_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()>;
}

const USER_COLUMNS: &str = "id, username, email, password, firstname, lastname, avatar, \
                            remember_token, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Map a unique index violation onto the column it guards.
fn unique_violation(err: sqlx::Error) -> anyhow::Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            match db_err.constraint() {
                Some("users_username_active_key") => {
                    return UniqueViolation { column: "username" }.into()
                }
                Some("users_email_active_key") => return UniqueViolation { column: "email" }.into(),
                _ => {}
            }
        }
    }
    anyhow::Error::new(err)
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert(&self, user: &User, role_ids: &[i64]) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password, firstname, lastname, avatar,
                               remember_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.firstname)
        .bind(&user.lastname)
        .bind(&user.avatar)
        .bind(&user.remember_token)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(unique_violation)?;
        sqlx::query(
            r#"
            INSERT INTO role_user (user_id, role_id)
            SELECT $1, r.id FROM roles r WHERE r.id = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user.id)
        .bind(role_ids)
        .execute(&mut *tx)
        .await
        .context("attach initial roles")?;
        tx.commit().await.context("commit tx")?;
        Ok(())
    }

    async fn update(&self, user: &User) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET username = $2, email = $3, password = $4, firstname = $5, lastname = $6,
                   avatar = $7, remember_token = $8, updated_at = $9
             WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.firstname)
        .bind(&user.lastname)
        .bind(&user.avatar)
        .bind(&user.remember_token)
        .bind(user.updated_at)
        .execute(&self.db)
        .await
        .map_err(unique_violation)?;
        Ok(())
    }

    async fn find(&self, id: Uuid, scope: Scope) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND {}",
            scope.sql_filter()
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("find user")?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .context("find user by email")?;
        Ok(user)
    }

    async fn list(&self, scope: Scope) -> anyhow::Result<Vec<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {} ORDER BY created_at ASC",
            scope.sql_filter()
        );
        let users = sqlx::query_as::<_, User>(&sql)
            .fetch_all(&self.db)
            .await
            .context("list users")?;
        Ok(users)
    }

    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE users SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.db)
        .await
        .context("soft delete user")?;
        Ok(res.rows_affected() == 1)
    }

    async fn restore(&self, id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE users SET deleted_at = NULL, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NOT NULL",
        )
        .bind(id)
        .execute(&self.db)
        .await
        .map_err(unique_violation)?;
        Ok(res.rows_affected() == 1)
    }

    async fn is_taken(
        &self,
        column: &str,
        value: &str,
        ignore: Option<Uuid>,
    ) -> anyhow::Result<bool> {
        let column = match column {
            "username" => "username",
            "email" => "email",
            other => anyhow::bail!("no uniqueness check for column {other}"),
        };
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM users WHERE {column} = $1 AND deleted_at IS NULL \
             AND ($2::uuid IS NULL OR id <> $2))"
        );
        let (taken,) = sqlx::query_as::<_, (bool,)>(&sql)
            .bind(value)
            .bind(ignore)
            .fetch_one(&self.db)
            .await
            .with_context(|| format!("check users.{column}"))?;
        Ok(taken)
    }

    async fn existing_role_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query_as::<_, (i64,)>("SELECT id FROM roles WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.db)
            .await
            .context("look up roles")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn roles_of(&self, user_id: Uuid) -> anyhow::Result<Vec<AttachedRole>> {
        let rows = sqlx::query_as::<_, (i64, String, OffsetDateTime)>(
            r#"
            SELECT r.id, r.name, ru.created_at
              FROM roles r
              JOIN role_user ru ON ru.role_id = r.id
             WHERE ru.user_id = $1
             ORDER BY r.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("list roles of user")?;

        Ok(rows
            .into_iter()
            .map(|(id, name, created_at)| AttachedRole {
                role: Role { id, name },
                pivot: Pivot {
                    user_id,
                    role_id: id,
                    created_at,
                },
            })
            .collect())
    }

    async fn first_role_named(
        &self,
        user_id: Uuid,
        names: &[String],
    ) -> anyhow::Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.id, r.name
              FROM roles r
              JOIN role_user ru ON ru.role_id = r.id
             WHERE ru.user_id = $1 AND r.name = ANY($2)
             LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(names)
        .fetch_optional(&self.db)
        .await
        .context("find named role of user")?;
        Ok(role)
    }

    async fn attach_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO role_user (user_id, role_id)
            SELECT $1, r.id FROM roles r WHERE r.id = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_ids)
        .execute(&self.db)
        .await
        .context("attach roles")?;
        Ok(())
    }

    async fn detach_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM role_user WHERE user_id = $1 AND role_id = ANY($2)")
            .bind(user_id)
            .bind(role_ids)
            .execute(&self.db)
            .await
            .context("detach roles")?;
        Ok(())
    }

    async fn sync_roles(&self, user_id: Uuid, role_ids: &[i64]) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        sqlx::query("DELETE FROM role_user WHERE user_id = $1 AND NOT (role_id = ANY($2))")
            .bind(user_id)
            .bind(role_ids)
            .execute(&mut *tx)
            .await
            .context("detach stale roles")?;
        sqlx::query(
            r#"
            INSERT INTO role_user (user_id, role_id)
            SELECT $1, r.id FROM roles r WHERE r.id = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_ids)
        .execute(&mut *tx)
        .await
        .context("attach roles")?;
        tx.commit().await.context("commit tx")?;
        Ok(())
    }
}
