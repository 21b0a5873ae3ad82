use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use ipnetwork::{Ipv4Network, Ipv6Network};
use thiserror::Error;

/// Deployment configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub interface: String,
    pub subnet: Ipv4Network,
    pub ipv6_enabled: bool,
    pub ipv6_subnet: Option<Ipv6Network>,
    pub server_public_key: String,
    pub server_public_ip: String,
    pub listen_port: u16,
    pub dns: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub mtu: u32,
    pub persistent_keepalive: u16,
    pub data_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar { var })
}

fn env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = env_or(var, default);
    value.parse().map_err(|_| ConfigError::Invalid { var, value })
}

/// Split a comma-separated list, dropping whitespace and empty items.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let ipv6_subnet = match env::var("WG_IPV6_SUBNET") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse().map_err(|_| {
                ConfigError::Invalid { var: "WG_IPV6_SUBNET", value: raw }
            })?),
            _ => None,
        };

        Ok(Self {
            interface: env_or("WG_INTERFACE", "wg0"),
            subnet: parse_env("WG_SUBNET", "10.0.0.0/24")?,
            ipv6_enabled: parse_bool(&env_or("WG_IPV6_ENABLED", "true")),
            ipv6_subnet,
            server_public_key: require_env("WG_SERVER_PUBLIC_KEY")?,
            server_public_ip: require_env("SERVER_PUBLIC_IP")?,
            listen_port: parse_env("WG_SERVER_PORT", "51820")?,
            dns: split_list(&env_or("WG_DNS", "1.1.1.1,1.0.0.1")),
            allowed_ips: split_list(&env_or("WG_ALLOWED_IPS", "0.0.0.0/0,::/0")),
            mtu: parse_env("WG_MTU", "1420")?,
            persistent_keepalive: parse_env("WG_PERSISTENT_KEEPALIVE", "25")?,
            data_dir: PathBuf::from(env_or("DATA_DIR", "./data")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1.1.1.1,1.0.0.1", &["1.1.1.1", "1.0.0.1"] ; "plain list")]
    #[test_case("0.0.0.0/0, ::/0", &["0.0.0.0/0", "::/0"] ; "spaces trimmed")]
    #[test_case("", &[] ; "empty input")]
    #[test_case("10.0.0.0/24,,", &["10.0.0.0/24"] ; "empty items dropped")]
    fn split_list_cases(raw: &str, expected: &[&str]) {
        assert_eq!(split_list(raw), expected);
    }

    #[test_case("true", true ; "lowercase true")]
    #[test_case("True", true ; "capitalized true")]
    #[test_case(" TRUE ", true ; "whitespace and caps")]
    #[test_case("false", false ; "lowercase false")]
    #[test_case("1", false ; "numeric is not true")]
    fn parse_bool_cases(raw: &str, expected: bool) {
        assert_eq!(parse_bool(raw), expected);
    }
}
