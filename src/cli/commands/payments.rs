use crate::payments::GatewayConfig;
use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use url::Url;

pub const ARG_PAYMENTS_GATEWAY_URL: &str = "payments-gateway-url";
pub const ARG_PAYMENTS_KEY_ID: &str = "payments-key-id";
pub const ARG_PAYMENTS_KEY_SECRET: &str = "payments-key-secret";

/// Gateway settings; `None` when no key id is configured.
///
/// # Errors
/// Returns an error if a key id is given without a secret, or the URL does not parse.
pub fn parse(matches: &ArgMatches) -> anyhow::Result<Option<GatewayConfig>> {
    let get_non_empty = |id: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .filter(|v| !v.trim().is_empty())
    };

    let Some(key_id) = get_non_empty(ARG_PAYMENTS_KEY_ID) else {
        return Ok(None);
    };
    let key_secret = get_non_empty(ARG_PAYMENTS_KEY_SECRET).with_context(|| {
        format!(
            "missing required argument: --{ARG_PAYMENTS_KEY_SECRET} \
             (required with --{ARG_PAYMENTS_KEY_ID})"
        )
    })?;
    let base_url = get_non_empty(ARG_PAYMENTS_GATEWAY_URL)
        .with_context(|| format!("missing required argument: --{ARG_PAYMENTS_GATEWAY_URL}"))?;
    let base_url = Url::parse(&base_url).context("invalid --payments-gateway-url")?;

    Ok(Some(GatewayConfig::new(
        base_url,
        key_id,
        SecretString::from(key_secret),
    )))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PAYMENTS_GATEWAY_URL)
                .long(ARG_PAYMENTS_GATEWAY_URL)
                .help("Payment gateway API base URL")
                .env("AIDLINK_PAYMENTS_GATEWAY_URL")
                .default_value("https://api.razorpay.com/v1"),
        )
        .arg(
            Arg::new(ARG_PAYMENTS_KEY_ID)
                .long(ARG_PAYMENTS_KEY_ID)
                .help("Payment gateway key id; enables the payment routes")
                .env("AIDLINK_PAYMENTS_KEY_ID"),
        )
        .arg(
            Arg::new(ARG_PAYMENTS_KEY_SECRET)
                .long(ARG_PAYMENTS_KEY_SECRET)
                .help("Payment gateway key secret, also used to verify payment signatures")
                .env("AIDLINK_PAYMENTS_KEY_SECRET")
                .hide_env_values(true),
        )
}
