//! Logging - the CLI's stderr subscriber and the span account operations run in.
//!
//! Library code only emits events; installing a subscriber is left to the host.

use tracing::{info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Network;

pub const LOG_ENV: &str = "MULTISIG_VAULT_LOG";
pub const LOG_JSON_ENV: &str = "MULTISIG_VAULT_LOG_JSON";
/// This crate at info, dependencies (reqwest, hyper) at warn.
pub const DEFAULT_DIRECTIVE: &str = "multisig_vault=info,warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub directive: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self { Self { directive: DEFAULT_DIRECTIVE.to_string(), json: false } }
}

impl LogConfig {
    /// `MULTISIG_VAULT_LOG` (falling back to `RUST_LOG`) and `MULTISIG_VAULT_LOG_JSON`.
    pub fn from_env() -> Self {
        let directive = std::env::var(LOG_ENV).or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV)).ok();
        let json = std::env::var(LOG_JSON_ENV).ok();
        Self::from_values(directive.as_deref(), json.as_deref())
    }

    pub fn from_values(directive: Option<&str>, json: Option<&str>) -> Self {
        let directive = directive
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DIRECTIVE)
            .to_string();
        let json = matches!(json.map(|v| v.trim().to_ascii_lowercase()).as_deref(), Some("1" | "true"));
        Self { directive, json }
    }

    /// An unparsable directive falls back to the default one.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
    }
}

/// Install the stderr subscriber. A second call is a no-op.
pub fn init_logging(config: &LogConfig) {
    if config.json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(config.filter())
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(config.filter())
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// First eight hex chars of an account id, enough to tell accounts apart in logs.
pub fn short_id(account_id: &str) -> &str { account_id.get(..8).unwrap_or(account_id) }

/// Sync and spend events of one account nest under this span.
pub fn account_span(account_id: &str, network: Network) -> Span {
    info_span!("account", id = %short_id(account_id), network = network.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset_or_blank() {
        assert_eq!(LogConfig::from_values(None, None), LogConfig::default());
        assert_eq!(LogConfig::from_values(Some("  "), Some("0")), LogConfig::default());
    }

    #[test]
    fn explicit_values_win() {
        let config = LogConfig::from_values(Some("multisig_vault=debug"), Some("TRUE"));
        assert_eq!(config.directive, "multisig_vault=debug");
        assert!(config.json);
        assert!(LogConfig::from_values(None, Some("1")).json);
    }

    #[test]
    fn bad_directive_still_builds_a_filter() {
        let config = LogConfig::from_values(Some("multisig_vault=loud"), None);
        assert_eq!(config.filter().to_string(), EnvFilter::new(DEFAULT_DIRECTIVE).to_string());
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
