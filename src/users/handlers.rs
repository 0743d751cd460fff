use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use tracing::instrument;
use uuid::Uuid;

use super::avatar::Variant;
use super::dto::{AssignRolesRequest, CreateUserRequest, ListQuery, UpdateUserRequest};
use super::model::{User, UserView};
use super::repo::Scope;
use super::roles::AttachedRole;
use super::service;
use crate::{
    auth::jwt::AuthUser,
    error::{AppError, AppResult},
    state::AppState,
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/user", get(list_users).post(create_user))
        .route(
            "/user/:id",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/user/:id/roles", put(assign_roles))
        .route("/user/:id/restore", post(restore_user))
        .route("/user/:id/avatar/:file", get(get_avatar))
}

/// The authenticated caller as an active user.
async fn actor(st: &AppState, AuthUser(id): AuthUser) -> AppResult<User> {
    st.store
        .find(id, Scope::Active)
        .await?
        .ok_or_else(|| AppError::Unauthorized("User not found".into()))
}

async fn require_admin(st: &AppState, auth: AuthUser) -> AppResult<User> {
    let actor = actor(st, auth).await?;
    actor.authorize_roles(st.store.as_ref(), "admin").await?;
    Ok(actor)
}

fn view(st: &AppState, user: User) -> AppResult<UserView> {
    UserView::new(user, &st.config.app_url)
}

#[instrument(skip(st, auth))]
pub async fn list_users(
    State(st): State<AppState>,
    auth: AuthUser,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<UserView>>> {
    require_admin(&st, auth).await?;
    let users = service::list_users(&st, q.scope()).await?;
    let views = users
        .into_iter()
        .map(|u| view(&st, u))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Json(views))
}

#[instrument(skip(st, auth, input))]
pub async fn create_user(
    State(st): State<AppState>,
    auth: AuthUser,
    Json(input): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<UserView>)> {
    let admin = require_admin(&st, auth).await?;
    let user = service::create_user(&st, input, Some(admin.id)).await?;
    let roles = user.roles(st.store.as_ref()).list().await?;
    Ok((StatusCode::CREATED, Json(view(&st, user)?.with_roles(roles))))
}

#[instrument(skip(st, auth))]
pub async fn get_user(
    State(st): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserView>> {
    let caller = actor(&st, auth).await?;
    let scope = if caller.id == id {
        Scope::Active
    } else {
        caller.authorize_roles(st.store.as_ref(), "admin").await?;
        Scope::WithTrashed
    };
    let user = service::find_user(&st, id, scope).await?;
    let roles = user.roles(st.store.as_ref()).list().await?;
    Ok(Json(view(&st, user)?.with_roles(roles)))
}

#[instrument(skip(st, auth, input))]
pub async fn update_user(
    State(st): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateUserRequest>,
) -> AppResult<Json<UserView>> {
    let caller = actor(&st, auth).await?;
    if caller.id != id {
        caller.authorize_roles(st.store.as_ref(), "admin").await?;
    }
    let user = service::update_user(&st, id, input, Some(caller.id)).await?;
    Ok(Json(view(&st, user)?))
}

#[instrument(skip(st, auth, input))]
pub async fn assign_roles(
    State(st): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(input): Json<AssignRolesRequest>,
) -> AppResult<Json<Vec<AttachedRole>>> {
    require_admin(&st, auth).await?;
    let roles = service::assign_roles(&st, id, input).await?;
    Ok(Json(roles))
}

#[instrument(skip(st, auth))]
pub async fn delete_user(
    State(st): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let admin = require_admin(&st, auth).await?;
    service::delete_user(&st, id, Some(admin.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(st, auth))]
pub async fn restore_user(
    State(st): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserView>> {
    let admin = require_admin(&st, auth).await?;
    let user = service::restore_user(&st, id, Some(admin.id)).await?;
    Ok(Json(view(&st, user)?))
}

/// Serves `original@<file>` and `thumbnail@<file>` of an active user.
#[instrument(skip(st))]
pub async fn get_avatar(
    State(st): State<AppState>,
    Path((id, file)): Path<(Uuid, String)>,
) -> AppResult<Response> {
    let (variant, filename) = Variant::parse_segment(&file).ok_or(AppError::NotFound)?;
    let user = service::find_user(&st, id, Scope::Active).await?;
    if user.avatar.as_deref() != Some(filename) {
        return Err(AppError::NotFound);
    }
    let (bytes, content_type) = st
        .avatars
        .fetch(id, variant, filename)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, content_type)], Body::from(bytes)).into_response())
}
