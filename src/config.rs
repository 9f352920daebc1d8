//! Reads the engine's environment variables into a typed [`Config`],
//! the bootstrap binary's only configuration source (besides
//! `--version`, handled entirely by `clap`).

use std::net::{IpAddr, SocketAddr};

use snafu::Snafu;
use stevedore_core::container::ExclusionLabel;
use stevedore_core::supervisor::SupervisorConfig;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("invalid {var}={value:?}: {reason}"))]
    InvalidValue { var: &'static str, value: String, reason: String },
}

/// Everything the bootstrap binary needs to construct its
/// dependency-injected context, gathered from the process environment.
pub struct Config {
    pub bind_address: SocketAddr,
    pub routes_path: String,
    pub route_uris: Vec<String>,
    pub supervisor: SupervisorConfig,
    pub debug: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => InvalidValueSnafu { var, value: other.to_string(), reason: "expected a boolean" }.fail(),
    }
}

impl Config {
    /// Loads configuration from the environment, applying defaults of
    /// port 80, bind address `0.0.0.0`, routes directory `/mnt/routes`,
    /// backlog tailing enabled, no tail truncation, no inactivity
    /// rewind.
    pub fn from_env() -> Result<Config, ConfigError> {
        let port: u16 = match env_var("PORT").or_else(|| env_var("HTTP_PORT")) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "PORT",
                value: raw,
                reason: "expected a 16-bit port number".to_string(),
            })?,
            None => 80,
        };
        let host: IpAddr = match env_var("HTTP_BIND_ADDRESS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "HTTP_BIND_ADDRESS",
                value: raw,
                reason: "expected an IPv4 or IPv6 address".to_string(),
            })?,
            None => "0.0.0.0".parse().unwrap(),
        };
        let bind_address = SocketAddr::new(host, port);

        let routes_path = env_var("ROUTESPATH").unwrap_or_else(|| "/mnt/routes".to_string());

        let route_uris = env_var("ROUTE_URIS")
            .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let exclude_spec = env_var("EXCLUDE_LABEL").or_else(|| env_var("EXCLUDE_LABELS"));
        let exclusions = exclude_spec.map(|spec| ExclusionLabel::parse_all(&spec)).unwrap_or_default();

        let allow_tty = match env_var("ALLOW_TTY") {
            Some(raw) => parse_bool("ALLOW_TTY", &raw)?,
            None => false,
        };
        let backlog = match env_var("BACKLOG") {
            Some(raw) => parse_bool("BACKLOG", &raw)?,
            None => true,
        };
        let tail = match env_var("TAIL") {
            Some(raw) if raw.eq_ignore_ascii_case("all") => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                var: "TAIL",
                value: raw,
                reason: "expected \"all\" or a non-negative integer".to_string(),
            })?),
            None => None,
        };
        let inactivity_timeout = env_var("INACTIVITY_TIMEOUT")
            .map(|raw| {
                humantime::parse_duration(&raw).map_err(|err| ConfigError::InvalidValue {
                    var: "INACTIVITY_TIMEOUT",
                    value: raw,
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        let debug = match env_var("DEBUG") {
            Some(raw) => parse_bool("DEBUG", &raw).unwrap_or(true),
            None => false,
        };

        Ok(Config {
            bind_address,
            routes_path,
            route_uris,
            supervisor: SupervisorConfig {
                exclusions,
                allow_tty,
                backlog,
                tail,
                inactivity_timeout,
            },
            debug,
        })
    }
}
