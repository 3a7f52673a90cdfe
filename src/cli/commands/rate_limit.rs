use crate::api::handlers::auth::{RateLimitAction, RateLimitPolicies, RateLimitPolicy};
use clap::{builder::ValueParser, Arg, ArgMatches, Command};

const ACTIONS: [RateLimitAction; 6] = [
    RateLimitAction::Login,
    RateLimitAction::Register,
    RateLimitAction::OtpSend,
    RateLimitAction::OtpVerify,
    RateLimitAction::Refresh,
    RateLimitAction::OrderCreate,
];

/// Argument id for an action, e.g. `rate-limit-otp-send`.
#[must_use]
pub const fn arg_id(action: RateLimitAction) -> &'static str {
    match action {
        RateLimitAction::Login => "rate-limit-login",
        RateLimitAction::Register => "rate-limit-register",
        RateLimitAction::OtpSend => "rate-limit-otp-send",
        RateLimitAction::OtpVerify => "rate-limit-otp-verify",
        RateLimitAction::Refresh => "rate-limit-refresh",
        RateLimitAction::OrderCreate => "rate-limit-order-create",
    }
}

const fn env_name(action: RateLimitAction) -> &'static str {
    match action {
        RateLimitAction::Login => "AIDLINK_RATE_LIMIT_LOGIN",
        RateLimitAction::Register => "AIDLINK_RATE_LIMIT_REGISTER",
        RateLimitAction::OtpSend => "AIDLINK_RATE_LIMIT_OTP_SEND",
        RateLimitAction::OtpVerify => "AIDLINK_RATE_LIMIT_OTP_VERIFY",
        RateLimitAction::Refresh => "AIDLINK_RATE_LIMIT_REFRESH",
        RateLimitAction::OrderCreate => "AIDLINK_RATE_LIMIT_ORDER_CREATE",
    }
}

fn validator_policy() -> ValueParser {
    ValueParser::from(RateLimitPolicy::parse)
}

/// Defaults overridden by whichever policies were given.
#[must_use]
pub fn policies(matches: &ArgMatches) -> RateLimitPolicies {
    ACTIONS
        .into_iter()
        .fold(RateLimitPolicies::default(), |policies, action| {
            match matches.get_one::<RateLimitPolicy>(arg_id(action)) {
                Some(policy) => policies.with_policy(action, *policy),
                None => policies,
            }
        })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    ACTIONS.into_iter().fold(command, |command, action| {
        command.arg(
            Arg::new(arg_id(action))
                .long(arg_id(action))
                .help(format!(
                    "Rate limit for {} as max/window_ms, e.g. 5/900000",
                    action.as_str()
                ))
                .env(env_name(action))
                .value_parser(validator_policy()),
        )
    })
}
