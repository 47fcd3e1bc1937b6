//! Example protected resource behind the subscription guard

use axum::{extract::Extension, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthUser;

#[derive(Debug, Serialize)]
pub struct WorkspaceResponse {
    pub user_id: Uuid,
    pub email: String,
}

/// GET /api/v1/workspace
pub async fn get_workspace(Extension(auth_user): Extension<AuthUser>) -> Json<WorkspaceResponse> {
    Json(WorkspaceResponse {
        user_id: auth_user.account.id,
        email: auth_user.account.email,
    })
}
