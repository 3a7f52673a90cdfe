use crate::api::handlers::auth::{AuthConfig, KindConfig, PrincipalKind};
use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};

pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_SENDER_ACCESS_TTL: &str = "sender-access-ttl-seconds";
pub const ARG_RECEIVER_ACCESS_TTL: &str = "receiver-access-ttl-seconds";
pub const ARG_ADMIN_ACCESS_TTL: &str = "admin-access-ttl-seconds";
pub const ARG_OTP_TTL: &str = "otp-ttl-seconds";
pub const ARG_OTP_MAX_ATTEMPTS: &str = "otp-max-attempts";
pub const ARG_TRUSTED_PROXY_HOPS: &str = "trusted-proxy-hops";

const MAX_TTL_SECONDS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Options {
    pub frontend_base_url: String,
    pub sender_access_ttl_seconds: i64,
    pub receiver_access_ttl_seconds: i64,
    pub admin_access_ttl_seconds: i64,
    pub otp_ttl_seconds: i64,
    pub otp_max_attempts: u32,
    pub trusted_proxy_hops: usize,
}

impl Options {
    /// Parse session and OTP arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a value is missing, not positive, or a TTL exceeds one year.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let frontend_base_url = matches
            .get_one::<String>(ARG_FRONTEND_BASE_URL)
            .cloned()
            .filter(|value| !value.trim().is_empty())
            .context("missing required argument: --frontend-base-url")?;

        let ttl = |id: &str| -> anyhow::Result<i64> {
            match matches.get_one::<i64>(id).copied() {
                Some(value) if (1..=MAX_TTL_SECONDS).contains(&value) => Ok(value),
                Some(value) => {
                    bail!("--{id} must be between 1 and {MAX_TTL_SECONDS} seconds, got {value}")
                }
                None => bail!("missing required argument: --{id}"),
            }
        };

        let otp_max_attempts = matches
            .get_one::<u32>(ARG_OTP_MAX_ATTEMPTS)
            .copied()
            .filter(|attempts| *attempts > 0)
            .context("--otp-max-attempts must be at least 1")?;

        Ok(Self {
            frontend_base_url,
            sender_access_ttl_seconds: ttl(ARG_SENDER_ACCESS_TTL)?,
            receiver_access_ttl_seconds: ttl(ARG_RECEIVER_ACCESS_TTL)?,
            admin_access_ttl_seconds: ttl(ARG_ADMIN_ACCESS_TTL)?,
            otp_ttl_seconds: ttl(ARG_OTP_TTL)?,
            otp_max_attempts,
            trusted_proxy_hops: matches
                .get_one::<usize>(ARG_TRUSTED_PROXY_HOPS)
                .copied()
                .unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        let kind = |kind, ttl| KindConfig::defaults(kind).with_access_ttl_seconds(ttl);
        AuthConfig::new(self.frontend_base_url.clone())
            .with_kind_config(kind(PrincipalKind::Sender, self.sender_access_ttl_seconds))
            .with_kind_config(kind(
                PrincipalKind::Receiver,
                self.receiver_access_ttl_seconds,
            ))
            .with_kind_config(kind(PrincipalKind::Admin, self.admin_access_ttl_seconds))
            .with_otp_ttl_seconds(self.otp_ttl_seconds)
            .with_otp_max_attempts(self.otp_max_attempts)
            .with_trusted_proxy_hops(self.trusted_proxy_hops)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    with_otp_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL, used as the CORS origin and to decide Secure cookies")
                .env("AIDLINK_FRONTEND_BASE_URL")
                .default_value("https://aidlink.org"),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXY_HOPS)
                .long(ARG_TRUSTED_PROXY_HOPS)
                .help("Reverse proxies in front of the service whose X-Forwarded-For is trusted")
                .long_help(
                    "Number of reverse proxies in front of the service. The client address is \
                     taken from that many X-Forwarded-For entries from the right. With 0, \
                     forwarding headers are ignored and the socket peer is used.",
                )
                .env("AIDLINK_TRUSTED_PROXY_HOPS")
                .default_value("0")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_SENDER_ACCESS_TTL)
                .long(ARG_SENDER_ACCESS_TTL)
                .help("Sender access token TTL in seconds")
                .env("AIDLINK_SENDER_ACCESS_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_RECEIVER_ACCESS_TTL)
                .long(ARG_RECEIVER_ACCESS_TTL)
                .help("Receiver access token TTL in seconds")
                .env("AIDLINK_RECEIVER_ACCESS_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_ADMIN_ACCESS_TTL)
                .long(ARG_ADMIN_ACCESS_TTL)
                .help("Admin access token TTL in seconds")
                .env("AIDLINK_ADMIN_ACCESS_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_otp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OTP_TTL)
                .long(ARG_OTP_TTL)
                .help("One-time code lifetime in seconds")
                .env("AIDLINK_OTP_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_OTP_MAX_ATTEMPTS)
                .long(ARG_OTP_MAX_ATTEMPTS)
                .help("Wrong codes accepted before a challenge is discarded")
                .env("AIDLINK_OTP_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_args(Command::new("aidlink"))
    }

    #[test]
    fn defaults_match_kind_defaults() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec!["aidlink"]);
        let options = Options::parse(&matches)?;
        let config = options.auth_config();
        assert_eq!(config.kind(PrincipalKind::Sender).access_ttl_seconds(), 3600);
        assert_eq!(config.kind(PrincipalKind::Admin).access_ttl_seconds(), 900);
        assert_eq!(config.otp_ttl_seconds(), 600);
        assert_eq!(config.otp_max_attempts(), 5);
        assert_eq!(config.trusted_proxy_hops(), 0);
        Ok(())
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        let matches =
            command().get_matches_from(vec!["aidlink", "--admin-access-ttl-seconds", "0"]);
        assert!(Options::parse(&matches).is_err());

        let matches = command().get_matches_from(vec!["aidlink", "--otp-max-attempts", "0"]);
        assert!(Options::parse(&matches).is_err());
    }

    #[test]
    fn oversized_ttl_is_rejected() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec![
            "aidlink",
            "--sender-access-ttl-seconds",
            "9300000000000000",
        ]);
        assert!(Options::parse(&matches).is_err());

        let max = i64::MAX.to_string();
        let matches =
            command().get_matches_from(vec!["aidlink", "--otp-ttl-seconds", max.as_str()]);
        assert!(Options::parse(&matches).is_err());

        let year = MAX_TTL_SECONDS.to_string();
        let matches =
            command().get_matches_from(vec!["aidlink", "--otp-ttl-seconds", year.as_str()]);
        assert_eq!(Options::parse(&matches)?.otp_ttl_seconds, MAX_TTL_SECONDS);
        Ok(())
    }

    #[test]
    fn trusted_proxy_hops_reach_the_config() -> anyhow::Result<()> {
        let matches = command().get_matches_from(vec!["aidlink", "--trusted-proxy-hops", "2"]);
        let options = Options::parse(&matches)?;
        assert_eq!(options.auth_config().trusted_proxy_hops(), 2);
        Ok(())
    }
}
