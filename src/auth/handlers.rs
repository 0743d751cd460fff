use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, RefreshRequest},
        jwt::{AuthUser, JwtKeys},
    },
    error::{AppError, AppResult},
    state::AppState,
    users::{repo::Scope, service, User, UserView},
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn issue(state: &AppState, user: User) -> AppResult<AuthResponse> {
    let keys = JwtKeys::from_ref(state);
    let access_token = keys.sign_access(&user)?;
    let refresh_token = keys.sign_refresh(&user)?;
    Ok(AuthResponse {
        access_token,
        refresh_token,
        token_type: "Bearer",
        user: UserView::new(user, &state.config.app_url)?,
    })
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();
    let user = service::authenticate(&state, &email, &payload.password).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(Json(issue(&state, user)?))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<AuthResponse>> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys.verify_refresh(&payload.refresh_token).map_err(|e| {
        warn!(error = %e, "refresh rejected");
        AppError::Unauthorized("Invalid or expired token".into())
    })?;

    // Deleted accounts cannot renew their session.
    let user = state
        .store
        .find(claims.sub, Scope::Active)
        .await?
        .ok_or_else(|| AppError::Unauthorized("User not found".into()))?;
    Ok(Json(issue(&state, user)?))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<UserView>> {
    let user = state
        .store
        .find(user_id, Scope::Active)
        .await?
        .ok_or_else(|| AppError::Unauthorized("User not found".into()))?;
    let roles = user.roles(state.store.as_ref()).list().await?;
    Ok(Json(UserView::new(user, &state.config.app_url)?.with_roles(roles)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::build_app;
    use crate::users::service::tests::create_request;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn post_json(state: &AppState, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = build_app(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn seeded() -> (AppState, User) {
        let state = AppState::fake();
        let user = service::create_user(&state, create_request("jdoe", "john@example.com", vec![3]), None)
            .await
            .unwrap();
        (state, user)
    }

    #[tokio::test]
    async fn login_issues_token_pair() {
        let (state, user) = seeded().await;
        let (status, body) = post_json(
            &state,
            "/api/auth/login",
            json!({ "email": " John@Example.com", "password": "secret" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["user"]["id"], user.id.to_string());
        assert_eq!(body["user"]["fullname"], "John Doe");
        assert!(body["user"].get("password").is_none());

        let keys = JwtKeys::from_ref(&state);
        let claims = keys.verify(body["access_token"].as_str().unwrap()).unwrap();
        assert_eq!(claims.sub, user.id);
    }

    #[tokio::test]
    async fn login_rejects_bad_password() {
        let (state, _) = seeded().await;
        let (status, body) = post_json(
            &state,
            "/api/auth/login",
            json!({ "email": "john@example.com", "password": "nope" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid credentials");
    }

    #[tokio::test]
    async fn refresh_requires_refresh_token_of_active_user() {
        let (state, user) = seeded().await;
        let keys = JwtKeys::from_ref(&state);

        let access = keys.sign_access(&user).unwrap();
        let (status, _) = post_json(&state, "/api/auth/refresh", json!({ "refresh_token": access })).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let refresh = keys.sign_refresh(&user).unwrap();
        let (status, body) =
            post_json(&state, "/api/auth/refresh", json!({ "refresh_token": refresh.clone() })).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["access_token"].is_string());

        service::delete_user(&state, user.id, None).await.unwrap();
        let (status, _) = post_json(&state, "/api/auth/refresh", json!({ "refresh_token": refresh })).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_returns_roles() {
        let (state, user) = seeded().await;
        let token = JwtKeys::from_ref(&state).sign_access(&user).unwrap();
        let req = Request::builder()
            .uri("/api/me")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let res = build_app(state).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["email"], "john@example.com");
        assert_eq!(body["roles"], json!([{ "id": 3, "name": "user" }]));
    }
}
