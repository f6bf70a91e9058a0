use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use crate::auth::{require_admin, AuthUser, Role, MIN_PASSWORD_LENGTH};
use crate::error::{internal_error, map_db_conflict, map_db_error, AppError, AppResult};
use crate::routes::auth::{
    fetch_user_by_id, user_row_to_response, UserResponse, UserRow, USER_COLUMNS,
};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct UserCreateRequest {
    username: String,
    email: String,
    password: String,
    role: String,
}

#[derive(Debug, Clone, Default, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct UserPatchRequest {
    email: Option<String>,
    role: Option<String>,
    active: Option<bool>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct UserListQuery {
    skip: Option<i64>,
    limit: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/users",
    tag = "users",
    params(UserListQuery),
    responses(
        (status = 200, description = "Users", body = Vec<UserResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn list_users(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<UserListQuery>,
) -> AppResult<Json<Vec<UserResponse>>> {
    require_admin(&user)?;
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query
        .limit
        .unwrap_or(100)
        .clamp(1, crate::store::MAX_PAGE_LIMIT);

    let rows: Vec<UserRow> = sqlx::query_as(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY username ASC OFFSET $1 LIMIT $2"
    ))
    .bind(skip)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(rows.iter().map(user_row_to_response).collect()))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/users",
    tag = "users",
    request_body = UserCreateRequest,
    responses(
        (status = 201, description = "Created user", body = UserResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Username already in use")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn create_user(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<UserCreateRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    require_admin(&user)?;

    let username = payload.username.trim().to_lowercase();
    if username.is_empty() {
        return Err(AppError::validation("Username is required"));
    }
    if payload.password.trim().len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    let role = Role::parse(&payload.role)
        .ok_or_else(|| AppError::validation("Role must be admin, engineer, or viewer"))?;
    let password_hash = crate::auth::hash_password(&payload.password).map_err(internal_error)?;

    let row: UserRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO users (username, email, password_hash, role)
        VALUES ($1, $2, $3, $4)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(&username)
    .bind(payload.email.trim().to_lowercase())
    .bind(password_hash)
    .bind(role.as_str())
    .fetch_one(&state.db)
    .await
    .map_err(|err| map_db_conflict(err, "Username already in use"))?;

    Ok((StatusCode::CREATED, Json(user_row_to_response(&row))))
}

#[utoipa::path(
    patch,
    path = "/api/v1/auth/users/{user_id}",
    tag = "users",
    request_body = UserPatchRequest,
    params(("user_id" = String, Path, description = "User id")),
    responses(
        (status = 200, description = "Updated user", body = UserResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "User not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn patch_user(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Path(user_id): Path<String>,
    Json(payload): Json<UserPatchRequest>,
) -> AppResult<Json<UserResponse>> {
    require_admin(&user)?;

    let user_uuid = Uuid::parse_str(user_id.trim())
        .map_err(|_| AppError::not_found("User not found"))?;
    let existing = fetch_user_by_id(&state.db, user_uuid)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    let mut email = existing.email;
    let mut role = existing.role;
    let mut active = existing.active;

    if let Some(updated) = payload.email {
        if !updated.trim().is_empty() {
            email = updated.trim().to_lowercase();
        }
    }
    if let Some(updated) = payload.role {
        role = Role::parse(&updated)
            .ok_or_else(|| AppError::validation("Role must be admin, engineer, or viewer"))?
            .as_str()
            .to_string();
    }
    if let Some(updated) = payload.active {
        active = updated;
    }

    let row: UserRow = sqlx::query_as(&format!(
        r#"
        UPDATE users
        SET email = $2, role = $3, active = $4, updated_at = NOW()
        WHERE id = $1
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(user_uuid)
    .bind(&email)
    .bind(&role)
    .bind(active)
    .fetch_one(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(user_row_to_response(&row)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/auth/users/{user_id}",
    tag = "users",
    params(("user_id" = String, Path, description = "User id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 400, description = "Self-deletion is forbidden"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "User not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn delete_user(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Path(user_id): Path<String>,
) -> AppResult<StatusCode> {
    require_admin(&user)?;

    let user_uuid = Uuid::parse_str(user_id.trim())
        .map_err(|_| AppError::not_found("User not found"))?;
    if user_uuid == user.id {
        return Err(AppError::validation("Cannot delete your own account"));
    }

    let result = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_uuid)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("User not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/users", get(list_users).post(create_user))
        .route(
            "/auth/users/{user_id}",
            axum::routing::patch(patch_user).delete(delete_user),
        )
}
