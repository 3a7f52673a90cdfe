use crate::{
    api::handlers::auth::{
        hash_password_blocking, normalize_email, valid_email, valid_password, AuthStore,
        CreateOutcome, NewPrincipal, Principal, PrincipalKind,
    },
    cli::actions::server::connect,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub dsn: String,
    pub email: String,
    pub password: SecretString,
    pub display_name: Option<String>,
}

/// Create an admin principal with a hashed password.
///
/// # Errors
/// Returns an error for an invalid email or weak password, an existing admin
/// with the same email, or a storage failure.
pub async fn create_admin(
    store: &dyn AuthStore,
    email: &str,
    password: &SecretString,
    display_name: Option<String>,
) -> Result<Principal> {
    let email = normalize_email(email);
    if !valid_email(&email) {
        bail!("invalid admin email: {email}");
    }
    if !valid_password(password.expose_secret()) {
        bail!("admin password is too short");
    }

    let password_hash = hash_password_blocking(password.expose_secret().to_string()).await?;
    let new = NewPrincipal {
        identifier: email.clone(),
        display_name: display_name.filter(|name| !name.trim().is_empty()),
        phone: None,
        password_hash: Some(password_hash),
    };
    match store
        .create_principal(PrincipalKind::Admin, new, Utc::now())
        .await
        .context("failed to store admin")?
    {
        CreateOutcome::Created(principal) => Ok(principal),
        CreateOutcome::Conflict => bail!("an admin with email {email} already exists"),
    }
}

/// Execute the create-admin action.
/// # Errors
/// Returns an error if the database is unreachable or the admin cannot be created.
pub async fn execute(args: Args) -> Result<()> {
    let store = connect(&args.dsn).await?;
    let admin = create_admin(&store, &args.email, &args.password, args.display_name).await?;
    info!(principal_id = %admin.id, "admin created");
    println!("{}", admin.id);
    Ok(())
}
