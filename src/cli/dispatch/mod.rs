//! Maps validated CLI matches to an [`Action`].

use crate::cli::{
    actions::{create_admin, server, Action},
    commands::{
        self, auth, oauth, payments, rate_limit, ARG_ADMIN_DISPLAY_NAME, ARG_ADMIN_EMAIL,
        ARG_ADMIN_PASSWORD, ARG_DSN, CMD_CREATE_ADMIN,
    },
};
use anyhow::{Context, Result};
use clap::ArgMatches;
use secrecy::SecretString;

fn non_empty(matches: &ArgMatches, id: &str) -> Option<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .filter(|v| !v.trim().is_empty())
}

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    if let Some((CMD_CREATE_ADMIN, sub)) = matches.subcommand() {
        let dsn = non_empty(sub, ARG_DSN)
            .or_else(|| non_empty(matches, ARG_DSN))
            .context("missing required argument: --dsn (create-admin writes to the database)")?;
        let email = non_empty(sub, ARG_ADMIN_EMAIL).context("missing required argument: --email")?;
        let password = non_empty(sub, ARG_ADMIN_PASSWORD)
            .map(SecretString::from)
            .context("missing required argument: --password")?;
        return Ok(Action::CreateAdmin(create_admin::Args {
            dsn,
            email,
            password,
            display_name: non_empty(sub, ARG_ADMIN_DISPLAY_NAME),
        }));
    }

    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);

    Ok(Action::Server(server::Args {
        port,
        dsn: non_empty(matches, ARG_DSN),
        auth: auth::Options::parse(matches)?,
        rate_limits: rate_limit::policies(matches),
        oauth: oauth::parse(matches)?,
        payments: payments::parse(matches)?,
    }))
}
