use crate::api::handlers::auth::OAuthConfig;
use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use url::Url;

pub const ARG_OAUTH_CLIENT_ID: &str = "oauth-client-id";
pub const ARG_OAUTH_CLIENT_SECRET: &str = "oauth-client-secret";
pub const ARG_OAUTH_TOKEN_URL: &str = "oauth-token-url";
pub const ARG_OAUTH_USERINFO_URL: &str = "oauth-userinfo-url";
pub const ARG_OAUTH_REDIRECT_URI: &str = "oauth-redirect-uri";

/// Provider settings; `None` when no client id is configured.
///
/// # Errors
/// Returns an error if a client id is given without the remaining settings,
/// or a URL does not parse.
pub fn parse(matches: &ArgMatches) -> anyhow::Result<Option<OAuthConfig>> {
    let get_non_empty = |id: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .filter(|v| !v.trim().is_empty())
    };

    let Some(client_id) = get_non_empty(ARG_OAUTH_CLIENT_ID) else {
        return Ok(None);
    };
    let require = |id: &str| {
        get_non_empty(id).with_context(|| {
            format!("missing required argument: --{id} (required with --{ARG_OAUTH_CLIENT_ID})")
        })
    };

    let client_secret = SecretString::from(require(ARG_OAUTH_CLIENT_SECRET)?);
    let token_url =
        Url::parse(&require(ARG_OAUTH_TOKEN_URL)?).context("invalid --oauth-token-url")?;
    let userinfo_url =
        Url::parse(&require(ARG_OAUTH_USERINFO_URL)?).context("invalid --oauth-userinfo-url")?;
    let redirect_uri = require(ARG_OAUTH_REDIRECT_URI)?;
    if Url::parse(&redirect_uri).is_err() {
        bail!("invalid --{ARG_OAUTH_REDIRECT_URI}: {redirect_uri}");
    }

    Ok(Some(OAuthConfig::new(
        client_id,
        client_secret,
        token_url,
        userinfo_url,
        redirect_uri,
    )))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OAUTH_CLIENT_ID)
                .long(ARG_OAUTH_CLIENT_ID)
                .help("OAuth client id; enables sender login through the identity provider")
                .env("AIDLINK_OAUTH_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_OAUTH_CLIENT_SECRET)
                .long(ARG_OAUTH_CLIENT_SECRET)
                .help("OAuth client secret")
                .env("AIDLINK_OAUTH_CLIENT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_OAUTH_TOKEN_URL)
                .long(ARG_OAUTH_TOKEN_URL)
                .help("Provider token endpoint")
                .env("AIDLINK_OAUTH_TOKEN_URL")
                .default_value("https://oauth2.googleapis.com/token"),
        )
        .arg(
            Arg::new(ARG_OAUTH_USERINFO_URL)
                .long(ARG_OAUTH_USERINFO_URL)
                .help("Provider userinfo endpoint")
                .env("AIDLINK_OAUTH_USERINFO_URL")
                .default_value("https://openidconnect.googleapis.com/v1/userinfo"),
        )
        .arg(
            Arg::new(ARG_OAUTH_REDIRECT_URI)
                .long(ARG_OAUTH_REDIRECT_URI)
                .help("Redirect URI registered with the provider")
                .env("AIDLINK_OAUTH_REDIRECT_URI"),
        )
}
