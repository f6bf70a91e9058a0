use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::tokens::TokenKind;
use crate::auth::{AuthUser, Role, MIN_PASSWORD_LENGTH};
use crate::error::{internal_error, map_db_error, AppError, AppResult};
use crate::state::AppState;
use crate::time::to_iso;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct UserResponse {
    pub(crate) id: String,
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) role: Role,
    pub(crate) active: bool,
    pub(crate) created_at: String,
    pub(crate) last_login: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct LoginResponse {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: i64,
    user: UserResponse,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct RefreshResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct MessageResponse {
    message: String,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    pub(crate) id: Uuid,
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) password_hash: String,
    pub(crate) role: String,
    pub(crate) active: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_login: Option<DateTime<Utc>>,
}

pub(crate) const USER_COLUMNS: &str =
    "id, username, email, password_hash, role, active, created_at, last_login";

pub(crate) fn user_row_to_response(row: &UserRow) -> UserResponse {
    UserResponse {
        id: row.id.to_string(),
        username: row.username.clone(),
        email: row.email.clone(),
        role: Role::parse(&row.role).unwrap_or(Role::Viewer),
        active: row.active,
        created_at: to_iso(row.created_at),
        last_login: row.last_login.map(to_iso),
    }
}

pub(crate) async fn fetch_user_by_id(
    db: &sqlx::PgPool,
    id: Uuid,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(db)
        .await
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token pair", body = LoginResponse),
        (status = 401, description = "Invalid credentials or inactive user"),
        (status = 429, description = "Too many attempts")
    )
)]
pub(crate) async fn login(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let username = payload.username.trim().to_lowercase();
    if username.is_empty() || payload.password.trim().is_empty() {
        return Err(AppError::validation("Username and password are required"));
    }

    if let Err(wait) = state.login_limiter.try_acquire(&username, 1) {
        return Err(AppError::rate_limited("Too many login attempts", wait));
    }

    let row: Option<UserRow> =
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
            .bind(&username)
            .fetch_optional(&state.db)
            .await
            .map_err(map_db_error)?;

    let Some(row) = row else {
        return Err(AppError::unauthorized("Invalid credentials"));
    };
    if !crate::auth::verify_password(&payload.password, &row.password_hash) {
        return Err(AppError::unauthorized("Invalid credentials"));
    }
    if !row.active {
        return Err(AppError::unauthorized("Inactive user"));
    }

    let _ = sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
        .bind(row.id)
        .execute(&state.db)
        .await;

    let role = Role::parse(&row.role).unwrap_or(Role::Viewer);
    let access_token = state
        .tokens
        .issue(row.id, &row.username, role, TokenKind::Access);
    let refresh_token = state
        .tokens
        .issue(row.id, &row.username, role, TokenKind::Refresh);

    Ok(Json(LoginResponse {
        access_token,
        refresh_token,
        token_type: "bearer".to_string(),
        expires_in: state.tokens.access_ttl_seconds(),
        user: user_row_to_response(&row),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    tag = "auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Fresh access token", body = RefreshResponse),
        (status = 401, description = "Invalid or expired refresh token")
    )
)]
pub(crate) async fn refresh(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<RefreshResponse>> {
    let claims = state
        .tokens
        .verify(&payload.refresh_token)
        .filter(|claims| claims.kind == TokenKind::Refresh)
        .ok_or_else(|| AppError::unauthorized("Invalid refresh token"))?;

    let access_token =
        state
            .tokens
            .issue(claims.sub, &claims.username, claims.role, TokenKind::Access);
    Ok(Json(RefreshResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: state.tokens.access_ttl_seconds(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "auth",
    responses((status = 200, description = "Logged out", body = MessageResponse))
)]
pub(crate) async fn logout() -> Json<MessageResponse> {
    // Tokens are stateless and honored until natural expiry; logout is an
    // idempotent acknowledgement for clients that discard their tokens.
    Json(MessageResponse {
        message: "Logged out".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "auth",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn me(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<UserResponse>> {
    let row = fetch_user_by_id(&state.db, user.id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    Ok(Json(user_row_to_response(&row)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/change-password",
    tag = "auth",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Wrong current password or weak new password"),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn change_password(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    if payload.new_password.trim().len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::validation(format!(
            "New password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    let row = fetch_user_by_id(&state.db, user.id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    if !crate::auth::verify_password(&payload.current_password, &row.password_hash) {
        return Err(AppError::validation("Current password is incorrect"));
    }

    let password_hash = crate::auth::hash_password(&payload.new_password).map_err(internal_error)?;
    sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
        .bind(row.id)
        .bind(password_hash)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;

    Ok(Json(MessageResponse {
        message: "Password changed".to_string(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/auth/change-password", post(change_password))
}
