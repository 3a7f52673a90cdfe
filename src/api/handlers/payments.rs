//! Payment order creation and signature verification for senders.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::auth::{enforce_rate_limit, require_auth, AuthState, PrincipalKind, RateLimitAction};
use crate::{
    api::error::{respond, ApiError},
    payments::{verify_payment_signature, NewOrder, PaymentOrder, PaymentsState},
};

const MAX_RECEIPT_LENGTH: usize = 40;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateOrderRequest {
    /// Amount in minor units (e.g. paise, cents).
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OrderResponse {
    pub order: PaymentOrder,
    /// Public gateway key id for the client checkout.
    pub key_id: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyPaymentRequest {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyPaymentResponse {
    pub verified: bool,
    pub order_id: String,
    pub payment_id: String,
}

fn valid_currency(currency: &str) -> bool {
    currency.len() == 3 && currency.bytes().all(|b| b.is_ascii_uppercase())
}

/// Validate an order request into the gateway payload.
fn new_order(request: CreateOrderRequest) -> Result<NewOrder, ApiError> {
    if request.amount <= 0 {
        return Err(ApiError::validation("Amount must be greater than zero"));
    }
    let currency = request.currency.trim().to_string();
    if !valid_currency(&currency) {
        return Err(ApiError::validation(
            "Currency must be a 3-letter uppercase code",
        ));
    }
    let receipt = request
        .receipt
        .map(|receipt| receipt.trim().to_string())
        .filter(|receipt| !receipt.is_empty());
    if receipt
        .as_ref()
        .is_some_and(|receipt| receipt.chars().count() > MAX_RECEIPT_LENGTH)
    {
        return Err(ApiError::validation("Receipt is too long"));
    }
    Ok(NewOrder {
        amount: request.amount,
        currency,
        receipt,
    })
}

#[utoipa::path(
    post,
    path = "/v1/payments/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = OrderResponse),
        (status = 400, description = "Invalid amount or currency"),
        (status = 401, description = "Sender session required"),
        (status = 429, description = "Rate limited")
    ),
    tag = "payments"
)]
pub async fn create_order(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(payments): Extension<Arc<PaymentsState>>,
    payload: Option<Json<CreateOrderRequest>>,
) -> Result<Response, ApiError> {
    let sender = require_auth(&headers, &auth_state, PrincipalKind::Sender).await?;
    enforce_rate_limit(&auth_state, &headers, RateLimitAction::OrderCreate).await?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let order = new_order(request)?;

    let created = payments.gateway().create_order(&order).await?;
    info!(
        sender_id = %sender.id,
        order_id = %created.id,
        amount = created.amount,
        "payment order created"
    );
    auth_state
        .audit(
            &headers,
            Some(PrincipalKind::Sender),
            Some(sender.id),
            "order_create",
            Utc::now(),
        )
        .await;
    Ok(respond(
        StatusCode::CREATED,
        OrderResponse {
            order: created,
            key_id: payments.key_id().to_string(),
        },
    ))
}

#[utoipa::path(
    post,
    path = "/v1/payments/verify",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Signature verified", body = VerifyPaymentResponse),
        (status = 400, description = "Invalid signature"),
        (status = 401, description = "Sender session required")
    ),
    tag = "payments"
)]
pub async fn verify_payment(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(payments): Extension<Arc<PaymentsState>>,
    payload: Option<Json<VerifyPaymentRequest>>,
) -> Result<Response, ApiError> {
    let sender = require_auth(&headers, &auth_state, PrincipalKind::Sender).await?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    if request.order_id.trim().is_empty() || request.payment_id.trim().is_empty() {
        return Err(ApiError::validation("order_id and payment_id are required"));
    }

    if !verify_payment_signature(
        payments.key_secret(),
        &request.order_id,
        &request.payment_id,
        &request.signature,
    ) {
        warn!(sender_id = %sender.id, order_id = %request.order_id, "payment signature mismatch");
        return Err(ApiError::validation("Invalid payment signature"));
    }

    auth_state
        .audit(
            &headers,
            Some(PrincipalKind::Sender),
            Some(sender.id),
            "payment_verified",
            Utc::now(),
        )
        .await;
    Ok(respond(
        StatusCode::OK,
        VerifyPaymentResponse {
            verified: true,
            order_id: request.order_id,
            payment_id: request.payment_id,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: i64, currency: &str) -> CreateOrderRequest {
        CreateOrderRequest {
            amount,
            currency: currency.to_string(),
            receipt: Some("  rcpt-1 ".to_string()),
        }
    }

    #[test]
    fn order_validation() {
        let order = new_order(request(500, "INR"));
        assert!(matches!(
            order,
            Ok(NewOrder { amount: 500, ref currency, receipt: Some(ref receipt) })
                if currency == "INR" && receipt == "rcpt-1"
        ));
        assert!(matches!(new_order(request(0, "INR")), Err(ApiError::Validation(_))));
        assert!(matches!(new_order(request(-5, "INR")), Err(ApiError::Validation(_))));
        assert!(matches!(new_order(request(100, "inr")), Err(ApiError::Validation(_))));
        assert!(matches!(new_order(request(100, "RUPEE")), Err(ApiError::Validation(_))));
    }

    #[test]
    fn long_receipts_are_rejected() {
        let mut long = request(100, "USD");
        long.receipt = Some("r".repeat(MAX_RECEIPT_LENGTH + 1));
        assert!(new_order(long).is_err());
    }
}
