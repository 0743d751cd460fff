//! Account flows: validation, hashing, avatar storage, persistence, audit.

use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::audit::{Activity, AuditEvent};
use super::avatar::AvatarError;
use super::dto::{AssignRolesRequest, CreateUserRequest, UpdateUserRequest};
use super::model::{User, FILLABLE};
use super::notify::Notification;
use super::repo::{Scope, UniqueViolation};
use super::roles::AttachedRole;
use super::rules::{rules_for, validate, FieldValue, Fields, Flow, ValidationErrors};
use crate::auth::password::{hash_password, verify_password};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

async fn check(
    st: &AppState,
    input: &(impl Fields + Sync),
    flow: Flow,
    ignore: Option<Uuid>,
) -> AppResult<()> {
    validate(input, &rules_for(flow), st.store.as_ref(), ignore).await??;
    Ok(())
}

fn field_error(field: &str, message: String) -> AppError {
    let mut errors = ValidationErrors::default();
    errors.add(field, message);
    AppError::Validation(errors)
}

/// Turn a unique index race into the error the `unique` rule would give.
fn store_error(err: anyhow::Error) -> AppError {
    match err.downcast_ref::<UniqueViolation>() {
        Some(v) => field_error(v.column, format!("The {} has already been taken.", v.column)),
        None => AppError::Internal(err),
    }
}

fn avatar_error(err: AvatarError) -> AppError {
    match err {
        AvatarError::Malformed | AvatarError::Undecodable(_) => {
            field_error("avatar", "The avatar must be a valid image.".into())
        }
        AvatarError::Storage(e) => AppError::Internal(e),
    }
}

/// Copy present fillable fields from `input` onto `user`.
fn apply_fillable(user: &mut User, input: &impl Fields) -> AppResult<()> {
    for &name in FILLABLE {
        let FieldValue::Text(value) = input.field(name) else {
            continue;
        };
        if name == "password" {
            user.password_hash = hash_password(value)?;
        } else {
            user.set_attribute(name, value);
        }
    }
    Ok(())
}

async fn log_activity(
    st: &AppState,
    user: &User,
    event: AuditEvent,
    before: Option<&User>,
    causer: Option<Uuid>,
) {
    let Some(activity) = Activity::record(user, event, before, causer) else {
        return;
    };
    if let Err(e) = st.audit.write(activity).await {
        warn!(error = %e, user_id = %user.id, %event, "activity not recorded");
    }
}

/// Best-effort removal of avatar files no record points at.
async fn discard_avatar(st: &AppState, user_id: Uuid, filename: &str) {
    if let Err(e) = st.avatars.remove(user_id, filename).await {
        warn!(error = %e, %user_id, %filename, "stale avatar not removed");
    }
}

async fn load(st: &AppState, id: Uuid, scope: Scope) -> AppResult<User> {
    st.store.find(id, scope).await?.ok_or(AppError::NotFound)
}

#[instrument(skip(st, input), fields(username = ?input.username))]
pub async fn create_user(
    st: &AppState,
    mut input: CreateUserRequest,
    causer: Option<Uuid>,
) -> AppResult<User> {
    input.normalize();
    check(st, &input, Flow::Create, None).await?;

    let mut user = User::new(st.ids.generate());
    apply_fillable(&mut user, &input)?;

    if let Some(data) = input.avatar().filter(|d| !d.is_empty()) {
        user.avatar = Some(st.avatars.store(user.id, data).await.map_err(avatar_error)?);
    }

    if let Err(e) = st.store.insert(&user, input.role_ids()).await {
        if let Some(filename) = &user.avatar {
            discard_avatar(st, user.id, filename).await;
        }
        return Err(store_error(e));
    }

    log_activity(st, &user, AuditEvent::Created, None, causer).await;
    let welcome = Notification::Welcome {
        username: user.username.clone(),
    };
    if let Err(e) = st.notifier.notify(&user, welcome).await {
        warn!(error = %e, user_id = %user.id, "welcome notification failed");
    }

    info!(user_id = %user.id, "user created");
    Ok(user)
}

#[instrument(skip(st, input))]
pub async fn update_user(
    st: &AppState,
    id: Uuid,
    mut input: UpdateUserRequest,
    causer: Option<Uuid>,
) -> AppResult<User> {
    let before = load(st, id, Scope::Active).await?;
    input.normalize();
    check(st, &input, Flow::Update, Some(id)).await?;

    let mut user = before.clone();
    apply_fillable(&mut user, &input)?;

    let mut uploaded = None;
    let replaced_avatar = match input.avatar() {
        Some("") => user.avatar.take(),
        Some(data) => {
            let filename = st.avatars.store(id, data).await.map_err(avatar_error)?;
            uploaded = Some(filename.clone());
            user.avatar.replace(filename)
        }
        None => None,
    };

    user.updated_at = OffsetDateTime::now_utc();
    if let Err(e) = st.store.update(&user).await {
        if let Some(filename) = &uploaded {
            discard_avatar(st, id, filename).await;
        }
        return Err(store_error(e));
    }

    if let Some(old) = replaced_avatar {
        discard_avatar(st, id, &old).await;
    }

    log_activity(st, &user, AuditEvent::Updated, Some(&before), causer).await;
    Ok(user)
}

#[instrument(skip(st, input))]
pub async fn assign_roles(
    st: &AppState,
    id: Uuid,
    input: AssignRolesRequest,
) -> AppResult<Vec<AttachedRole>> {
    let user = load(st, id, Scope::Active).await?;
    check(st, &input, Flow::AssignRoles, Some(id)).await?;

    let relation = user.roles(st.store.as_ref());
    relation.sync(input.role_ids()).await?;
    let roles = relation.list().await?;
    info!(user_id = %id, roles = ?roles.iter().map(|r| &r.role.name).collect::<Vec<_>>(), "roles assigned");
    Ok(roles)
}

#[instrument(skip(st))]
pub async fn delete_user(st: &AppState, id: Uuid, causer: Option<Uuid>) -> AppResult<()> {
    let mut user = load(st, id, Scope::Active).await?;
    let now = OffsetDateTime::now_utc();
    if !st.store.soft_delete(id, now).await? {
        return Err(AppError::NotFound);
    }
    user.deleted_at = Some(now);
    log_activity(st, &user, AuditEvent::Deleted, None, causer).await;
    info!(user_id = %id, "user soft deleted");
    Ok(())
}

#[instrument(skip(st))]
pub async fn restore_user(st: &AppState, id: Uuid, causer: Option<Uuid>) -> AppResult<User> {
    if !st.store.restore(id).await.map_err(store_error)? {
        return Err(AppError::NotFound);
    }
    let user = load(st, id, Scope::Active).await?;
    log_activity(st, &user, AuditEvent::Restored, None, causer).await;
    info!(user_id = %id, "user restored");
    Ok(user)
}

pub async fn find_user(st: &AppState, id: Uuid, scope: Scope) -> AppResult<User> {
    load(st, id, scope).await
}

pub async fn list_users(st: &AppState, scope: Scope) -> AppResult<Vec<User>> {
    Ok(st.store.list(scope).await?)
}

/// Active user matching `email` and `password`.
#[instrument(skip(st, password))]
pub async fn authenticate(st: &AppState, email: &str, password: &str) -> AppResult<User> {
    let invalid = || AppError::Unauthorized("Invalid credentials".into());
    let Some(user) = st.store.find_by_email(email).await? else {
        warn!("login unknown email");
        return Err(invalid());
    };
    if !verify_password(password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(invalid());
    }
    Ok(user)
}
