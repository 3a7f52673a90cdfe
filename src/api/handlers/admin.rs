//! Administrative operations. Every route requires an admin session.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::{principal::kind_from_path, require_auth, AuthState, PrincipalKind};
use crate::api::error::{respond, ApiError};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeactivateResponse {
    pub id: Uuid,
    pub kind: PrincipalKind,
    pub is_active: bool,
}

#[utoipa::path(
    post,
    path = "/v1/admin/principals/{kind}/{id}/deactivate",
    params(
        ("kind" = String, Path, description = "sender, receiver or admin"),
        ("id" = Uuid, Path, description = "Principal id")
    ),
    responses(
        (status = 200, description = "Principal deactivated", body = DeactivateResponse),
        (status = 401, description = "Admin session required"),
        (status = 404, description = "Unknown principal")
    ),
    tag = "admin"
)]
pub async fn deactivate_principal(
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, ApiError> {
    let admin = require_auth(&headers, &auth_state, PrincipalKind::Admin).await?;
    let kind = kind_from_path(&kind)?;
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::validation("Invalid principal id"))?;

    if !auth_state.store().deactivate_principal(kind, id).await? {
        return Err(ApiError::NotFound("Principal not found".to_string()));
    }

    info!(admin_id = %admin.id, kind = %kind, principal_id = %id, "principal deactivated");
    auth_state
        .audit(&headers, Some(kind), Some(id), "deactivate", Utc::now())
        .await;
    Ok(respond(
        StatusCode::OK,
        DeactivateResponse {
            id,
            kind,
            is_active: false,
        },
    ))
}
