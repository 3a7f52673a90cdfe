pub mod auth;
pub mod logging;
pub mod oauth;
pub mod payments;
pub mod rate_limit;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const CMD_CREATE_ADMIN: &str = "create-admin";
pub const ARG_ADMIN_EMAIL: &str = "email";
pub const ARG_ADMIN_PASSWORD: &str = "password";
pub const ARG_ADMIN_DISPLAY_NAME: &str = "display-name";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("aidlink")
        .about("Sessions, OTP login and payment verification for a donation platform")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("AIDLINK_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .long_help(
                    "Postgres connection string. Without it the server keeps everything in memory, which is only suitable for development.",
                )
                .env("AIDLINK_DSN")
                .global(true),
        )
        .subcommand(create_admin());

    let command = auth::with_args(command);
    let command = rate_limit::with_args(command);
    let command = oauth::with_args(command);
    let command = payments::with_args(command);
    logging::with_args(command)
}

fn create_admin() -> Command {
    Command::new(CMD_CREATE_ADMIN)
        .about("Create an administrator account in the database")
        .arg(
            Arg::new(ARG_ADMIN_EMAIL)
                .long(ARG_ADMIN_EMAIL)
                .help("Administrator email")
                .env("AIDLINK_ADMIN_EMAIL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Administrator password (at least 8 characters)")
                .env("AIDLINK_ADMIN_PASSWORD")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ADMIN_DISPLAY_NAME)
                .long(ARG_ADMIN_DISPLAY_NAME)
                .help("Administrator display name")
                .env("AIDLINK_ADMIN_DISPLAY_NAME"),
        )
}
