//! Authentication Middleware
//!
//! JWT verification shared by the HTTP routes and the WebSocket upgrade.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::shared::error::AppError;
use crate::startup::AppState;

/// Roles that grant administrative access.
pub const ADMIN_ROLES: &[&str] = &["admin", "chat_admin"];

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject user id
    pub user_id: String,
    /// Display name, defaults to the user id
    #[serde(default)]
    pub name: String,
    pub roles: Vec<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Authenticated user extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub name: String,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| ADMIN_ROLES.contains(&r.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingToken,

    #[error("token expired")]
    Expired,

    #[error("invalid token")]
    Invalid,
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingToken => AppError::Unauthorized("Missing authorization token".into()),
            AuthError::Expired => AppError::Unauthorized("Token expired".into()),
            AuthError::Invalid => AppError::Unauthorized("Authentication failed".into()),
        }
    }
}

/// Verifies HMAC-signed bearer tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// The secret must already have passed settings validation.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => {
                    tracing::debug!(error = %e, "Token rejected");
                    AuthError::Invalid
                }
            }
        })?;

        let claims = data.claims;
        if claims.user_id.trim().is_empty() {
            return Err(AuthError::Invalid);
        }

        let name = if claims.name.trim().is_empty() {
            claims.user_id.clone()
        } else {
            claims.name
        };

        Ok(AuthUser {
            user_id: claims.user_id,
            name,
            roles: claims.roles,
        })
    }
}

/// Extract a bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Authentication middleware that validates JWT tokens
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers()).ok_or(AuthError::MissingToken)?;
    let user = state.jwt.verify(token)?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Requires an admin role. Must run after [`auth_middleware`].
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or_else(|| AppError::Unauthorized("Missing authorization token".into()))?;

    if !user.is_admin() {
        tracing::warn!(user_id = %user.user_id, "Non-admin user attempted admin access");
        return Err(AppError::Forbidden("Forbidden".into()));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use pretty_assertions::assert_eq;

    const SECRET: &str = "q8Zr2vN4kLw9XyT1mPb7Hc3Jd6Fg0Su5";

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let user = verifier
            .verify(&token(serde_json::json!({
                "user_id": "u1",
                "name": "Ada",
                "roles": ["user"],
                "exp": future_exp(),
            })))
            .unwrap();

        assert_eq!(user.user_id, "u1");
        assert_eq!(user.name, "Ada");
        assert!(!user.is_admin());
    }

    #[test]
    fn test_name_defaults_to_user_id() {
        let verifier = JwtVerifier::new(SECRET);
        let user = verifier
            .verify(&token(serde_json::json!({
                "user_id": "u1",
                "roles": ["chat_admin"],
                "exp": future_exp(),
            })))
            .unwrap();

        assert_eq!(user.name, "u1");
        assert!(user.is_admin());
    }

    #[test]
    fn test_missing_roles_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&token(serde_json::json!({
            "user_id": "u1",
            "exp": future_exp(),
        })));
        assert_eq!(result.unwrap_err(), AuthError::Invalid);
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&token(serde_json::json!({
            "user_id": "u1",
            "roles": [],
            "exp": chrono::Utc::now().timestamp() - 3600,
        })));
        assert_eq!(result.unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("another-Strong-Key-9f8e7d6c5b4a3f2e1d0c");
        let result = verifier.verify(&token(serde_json::json!({
            "user_id": "u1",
            "roles": [],
            "exp": future_exp(),
        })));
        assert_eq!(result.unwrap_err(), AuthError::Invalid);
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
