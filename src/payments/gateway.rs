//! Payment gateway client.
//!
//! Orders are created at the gateway's `POST {base_url}/orders` with HTTP basic
//! auth (key id / key secret). Amounts are integer minor units.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info_span, Instrument};
use url::Url;
use utoipa::ToSchema;

use crate::APP_USER_AGENT;

/// Order request sent to the gateway.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NewOrder {
    pub amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

/// Order as returned by the gateway.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct PaymentOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, order: &NewOrder) -> Result<PaymentOrder>;
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    base_url: Url,
    key_id: String,
    key_secret: SecretString,
}

impl GatewayConfig {
    #[must_use]
    pub fn new(base_url: Url, key_id: String, key_secret: SecretString) -> Self {
        Self {
            base_url,
            key_id,
            key_secret,
        }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn key_secret(&self) -> &SecretString {
        &self.key_secret
    }

    fn orders_url(&self) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/orders")).context("invalid payment gateway URL")
    }
}

#[derive(Clone, Debug)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build payment gateway HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_order(&self, order: &NewOrder) -> Result<PaymentOrder> {
        let url = self.config.orders_url()?;
        self.client
            .post(url.clone())
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(order)
            .send()
            .instrument(info_span!("payments.create_order", url = %url))
            .await
            .context("payment gateway request failed")?
            .error_for_status()
            .context("payment gateway rejected the order")?
            .json()
            .await
            .context("invalid payment gateway response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_url_tolerates_trailing_slash() -> Result<()> {
        for base in ["https://api.gateway.test/v1", "https://api.gateway.test/v1/"] {
            let config = GatewayConfig::new(
                Url::parse(base)?,
                "key_id".to_string(),
                SecretString::from("secret".to_string()),
            );
            assert_eq!(
                config.orders_url()?.as_str(),
                "https://api.gateway.test/v1/orders"
            );
        }
        Ok(())
    }

    #[test]
    fn new_order_omits_missing_receipt() -> Result<()> {
        let order = NewOrder {
            amount: 50_000,
            currency: "INR".to_string(),
            receipt: None,
        };
        let value = serde_json::to_value(&order)?;
        assert_eq!(value, serde_json::json!({"amount": 50_000, "currency": "INR"}));
        Ok(())
    }

    #[test]
    fn payment_order_parses_gateway_payload() -> Result<()> {
        let order: PaymentOrder = serde_json::from_value(serde_json::json!({
            "id": "order_9A33XWu170gUtm",
            "entity": "order",
            "amount": 50_000,
            "currency": "INR",
            "receipt": null,
            "status": "created"
        }))?;
        assert_eq!(order.id, "order_9A33XWu170gUtm");
        assert_eq!(order.status, "created");
        assert!(order.receipt.is_none());
        Ok(())
    }
}
