//! Bridge configuration
//!
//! All knobs come from the environment with production defaults matching
//! the partner deployment. `dotenv` is loaded by the binaries.

use crate::error::{BridgeError, Result};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Built-in rotating User-Agent pool for header variation.
    pub static ref DEFAULT_USER_AGENTS: Vec<String> = vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
    ];
}

/// Remote partner endpoints, relative to the configured origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    SignIn,
    RegisterPlayer,
    Statistics,
    Deposit,
    Withdraw,
    Balance,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::SignIn => "/global/api/User/signIn",
            Endpoint::RegisterPlayer => "/global/api/Player/registerPlayer",
            Endpoint::Statistics => "/global/api/Statistics/getPlayersStatisticsPro",
            Endpoint::Deposit => "/global/api/Player/depositToPlayer",
            Endpoint::Withdraw => "/global/api/Player/withdrawFromPlayer",
            Endpoint::Balance => "/global/api/Player/getPlayerBalanceById",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Single service credential used against the partner platform.
    pub agent_username: String,
    pub agent_password: String,
    /// Tenant/parent identifier new remote accounts are registered under.
    pub parent_id: String,
    pub origin: String,

    pub min_amount: f64,
    pub min_password_len: usize,
    pub max_password_len: usize,

    pub session_ttl: Duration,
    pub login_failure_threshold: u32,
    pub login_lockout_window: Duration,

    pub max_retries: u32,
    /// Challenge-class blocks abort after this many attempts.
    pub protection_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub rate_limit_default_wait: Duration,
    pub request_timeout: Duration,
    pub pacing_min: Duration,
    pub pacing_max: Duration,

    pub user_agents: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent_username: String::new(),
            agent_password: String::new(),
            parent_id: String::new(),
            origin: "https://agents.example.com".to_string(),
            min_amount: 10.0,
            min_password_len: 8,
            max_password_len: 11,
            session_ttl: Duration::from_secs(3600),
            login_failure_threshold: 3,
            login_lockout_window: Duration::from_secs(300),
            max_retries: 3,
            protection_max_attempts: 2,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            rate_limit_default_wait: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            pacing_min: Duration::from_millis(1500),
            pacing_max: Duration::from_millis(3500),
            user_agents: DEFAULT_USER_AGENTS.clone(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            agent_username: env_str("AGENT_USERNAME", ""),
            agent_password: env_str("AGENT_PASSWORD", ""),
            parent_id: env_str("PARENT_ID", ""),
            origin: env_str("PARTNER_ORIGIN", &defaults.origin),
            min_amount: env_parse("MIN_AMOUNT", defaults.min_amount),
            session_ttl: Duration::from_secs(env_parse(
                "SESSION_TTL_SECS",
                defaults.session_ttl.as_secs(),
            )),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            ..defaults
        }
    }

    /// Ensure the credentials required for remote traffic are present.
    pub fn validate(&self) -> Result<()> {
        if self.agent_username.is_empty() || self.agent_password.is_empty() {
            return Err(BridgeError::Validation {
                field: "credentials",
                reason: "AGENT_USERNAME / AGENT_PASSWORD not configured".to_string(),
            });
        }
        if self.parent_id.is_empty() {
            return Err(BridgeError::Validation {
                field: "parent_id",
                reason: "PARENT_ID not configured".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.origin, endpoint.path())
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.endpoint_url(Endpoint::SignIn),
            "https://agents.example.com/global/api/User/signIn"
        );
        assert_eq!(
            config.endpoint_url(Endpoint::Balance),
            "https://agents.example.com/global/api/Player/getPlayerBalanceById"
        );
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_err());

        let config = BridgeConfig {
            agent_username: "agent".to_string(),
            agent_password: "secret".to_string(),
            parent_id: "42".to_string(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
