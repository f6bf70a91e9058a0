mod password;
pub mod tokens;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use tokens::{TokenKind, TokenSigner};

pub use password::{hash_password, verify_password, MIN_PASSWORD_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Engineer,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Engineer => "engineer",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "engineer" => Some(Role::Engineer),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

/// Extractor for protected routes: verifies the bearer access token and
/// exposes the embedded subject and role. Refresh tokens are not accepted
/// here.
#[derive(Debug, Clone)]
pub struct AuthUser(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<TokenSigner>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let signer = Arc::<TokenSigner>::from_ref(state);
        let token_result: Result<String, AppError> = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::unauthorized("Missing or invalid token"));

        async move {
            let token = token_result?;
            let user = resolve_access_token(&signer, &token)?;
            Ok(AuthUser(user))
        }
    }
}

pub fn resolve_access_token(signer: &TokenSigner, token: &str) -> AppResult<AuthenticatedUser> {
    let claims = signer
        .verify(token)
        .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))?;
    if claims.kind != TokenKind::Access {
        return Err(AppError::unauthorized("Missing or invalid token"));
    }
    Ok(AuthenticatedUser {
        id: claims.sub,
        username: claims.username,
        role: claims.role,
    })
}

pub fn require_engineer(user: &AuthenticatedUser) -> AppResult<()> {
    match user.role {
        Role::Admin | Role::Engineer => Ok(()),
        Role::Viewer => Err(AppError::forbidden("Engineer access required")),
    }
}

pub fn require_admin(user: &AuthenticatedUser) -> AppResult<()> {
    match user.role {
        Role::Admin => Ok(()),
        _ => Err(AppError::forbidden("Admin access required")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn user(role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            id: Uuid::new_v4(),
            username: "someone".to_string(),
            role,
        }
    }

    #[test]
    fn viewer_is_not_an_engineer() {
        let err = require_engineer(&user(Role::Viewer)).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.message, "Engineer access required");
    }

    #[test]
    fn admin_passes_both_gates() {
        assert!(require_engineer(&user(Role::Admin)).is_ok());
        assert!(require_admin(&user(Role::Admin)).is_ok());
    }

    #[test]
    fn engineer_is_not_an_admin() {
        let err = require_admin(&user(Role::Engineer)).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.message, "Admin access required");
    }

    #[test]
    fn refresh_tokens_do_not_authenticate_requests() {
        let signer = TokenSigner::new("0123456789abcdef0123456789abcdef", 30, 7);
        let token = signer.issue(Uuid::new_v4(), "eng", Role::Engineer, TokenKind::Refresh);
        assert!(resolve_access_token(&signer, &token).is_err());
    }

    #[test]
    fn role_parse_is_lenient_on_case() {
        assert_eq!(Role::parse(" Admin "), Some(Role::Admin));
        assert_eq!(Role::parse("VIEWER"), Some(Role::Viewer));
        assert_eq!(Role::parse("operator"), None);
    }
}
