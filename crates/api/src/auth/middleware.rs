//! Authentication and subscription guard middleware for Axum

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        header::{ACCEPT, AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use billgate_billing::{evaluate_access, AccessDecision, SubscriptionStore};
use billgate_shared::Account;
use serde_json::json;
use time::OffsetDateTime;

use super::jwt::JwtManager;

/// Cookie carrying the bearer token for browser clients
pub const AUTH_COOKIE_NAME: &str = "billgate_auth_token";

/// Where denied users are sent
pub const SUBSCRIPTION_REQUIRED_PATH: &str = "/subscription/required";

/// Authenticated user, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account: Account,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    BearerHeader,
    Cookie,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub store: Arc<dyn SubscriptionStore>,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(AUTH_COOKIE_NAME)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(String::from)
            })
        })
}

/// Authorization header first, then the auth cookie
fn extract_bearer_token(request: &Request) -> Option<(String, AuthMethod)> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some((token.to_string(), AuthMethod::BearerHeader));
        }
    }

    extract_token_from_cookie(request).map(|token| (token, AuthMethod::Cookie))
}

fn wants_html(request: &Request) -> bool {
    request
        .headers()
        .get(ACCEPT)
        .and_then(|h| h.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

/// Middleware that requires a valid token for a known, active account
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some((token, auth_method)) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no token (header or cookie)");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate(&auth_state, &token).await {
        Ok(account) => {
            tracing::debug!(
                path = %path,
                user_id = %account.id,
                auth_method = ?auth_method,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(AuthUser {
                account,
                auth_method,
            });
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

async fn authenticate(auth_state: &AuthState, token: &str) -> Result<Account, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_token(token)
        .map_err(|_| AuthError::InvalidToken)?;

    let account = auth_state
        .store
        .find_account(claims.sub)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %claims.sub, error = %e, "Failed to load account");
            AuthError::DatabaseError
        })?
        .ok_or(AuthError::UnknownAccount)?;

    if !account.is_active {
        return Err(AuthError::InactiveAccount);
    }

    Ok(account)
}

/// Middleware that lets a request through only when the access guard allows
/// it. Must run after [`require_auth`].
pub async fn require_active_subscription(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>().cloned() else {
        return AuthError::MissingAuth.into_response();
    };
    let account = &auth_user.account;

    // Elevated accounts never need the record
    let record = if account.is_elevated() {
        None
    } else {
        match auth_state.store.find_by_user(account.id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    user_id = %account.id,
                    error = %e,
                    "Failed to load subscription for access check"
                );
                return AuthError::DatabaseError.into_response();
            }
        }
    };

    match evaluate_access(account, record.as_ref(), OffsetDateTime::now_utc()) {
        AccessDecision::Allow(reason) => {
            tracing::debug!(
                user_id = %account.id,
                reason = ?reason,
                "Access granted"
            );
            next.run(request).await
        }
        AccessDecision::Deny(reason) => {
            tracing::info!(
                user_id = %account.id,
                path = %request.uri().path(),
                reason = ?reason,
                "Access denied: subscription required"
            );
            if wants_html(&request) {
                Redirect::to(SUBSCRIPTION_REQUIRED_PATH).into_response()
            } else {
                subscription_required_response()
            }
        }
    }
}

fn subscription_required_response() -> Response {
    let body = Json(json!({
        "error": "subscription_required",
        "message": "An active subscription is required to access this resource.",
        "code": 402,
        "subscription_url": SUBSCRIPTION_REQUIRED_PATH
    }));

    (StatusCode::PAYMENT_REQUIRED, body).into_response()
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Unknown account")]
    UnknownAccount,
    #[error("Account is disabled")]
    InactiveAccount,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::UnknownAccount | AuthError::InactiveAccount => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token")
            }
            AuthError::DatabaseError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
