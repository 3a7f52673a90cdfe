use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::{AuthState, PrincipalKind};
use crate::api::error::{respond, ApiError};

/// Receiver fields safe to show donors. Contact details stay private.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ReceiverProfile {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/v1/receivers/{id}",
    params(("id" = Uuid, Path, description = "Receiver id")),
    responses(
        (status = 200, description = "Receiver profile", body = ReceiverProfile),
        (status = 404, description = "Unknown or inactive receiver")
    ),
    tag = "receivers"
)]
pub async fn receiver_profile(
    Path(id): Path<String>,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::NotFound("Receiver not found".to_string());
    let id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let receiver = auth_state
        .store()
        .find_principal(PrincipalKind::Receiver, id)
        .await?
        .filter(|receiver| receiver.is_active)
        .ok_or_else(not_found)?;

    Ok(respond(
        StatusCode::OK,
        ReceiverProfile {
            id: receiver.id,
            display_name: receiver.display_name,
            created_at: receiver.created_at,
        },
    ))
}
