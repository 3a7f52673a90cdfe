//! Payment orders and gateway signature verification.

mod gateway;
mod signature;

pub use gateway::{GatewayConfig, HttpPaymentGateway, NewOrder, PaymentGateway, PaymentOrder};
pub use signature::{sign_payment, verify_payment_signature};

use secrecy::SecretString;
use std::sync::Arc;

/// Gateway client plus the credentials the handlers need.
#[derive(Clone)]
pub struct PaymentsState {
    gateway: Arc<dyn PaymentGateway>,
    key_id: String,
    key_secret: SecretString,
}

impl PaymentsState {
    pub fn new(gateway: Arc<dyn PaymentGateway>, key_id: String, key_secret: SecretString) -> Self {
        Self {
            gateway,
            key_id,
            key_secret,
        }
    }

    #[must_use]
    pub fn gateway(&self) -> &dyn PaymentGateway {
        self.gateway.as_ref()
    }

    /// Public key id; clients pass it to the gateway's checkout.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub(crate) fn key_secret(&self) -> &SecretString {
        &self.key_secret
    }
}
