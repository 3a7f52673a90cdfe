//! Gateway payment signatures: `hex(HMAC_SHA256(key_secret, order_id|payment_id))`.

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(key_secret: &SecretString, order_id: &str, payment_id: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key_secret.expose_secret().as_bytes())
        .map_err(|e| anyhow!("invalid HMAC key: {e}"))?;
    mac.update(order_id.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    Ok(mac)
}

/// Signature the gateway attaches to a completed payment.
///
/// # Errors
/// Returns an error if the key cannot initialize the MAC.
pub fn sign_payment(key_secret: &SecretString, order_id: &str, payment_id: &str) -> Result<String> {
    Ok(hex::encode(
        mac(key_secret, order_id, payment_id)?.finalize().into_bytes(),
    ))
}

/// Constant-time check of a hex signature. Malformed hex never verifies.
#[must_use]
pub fn verify_payment_signature(
    key_secret: &SecretString,
    order_id: &str,
    payment_id: &str,
    signature: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    match mac(key_secret, order_id, payment_id) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}
