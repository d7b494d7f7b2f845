//! Process configuration read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | none; required when `USE_PERSISTENT_STORES=true` |
//! | `USE_PERSISTENT_STORES` | `false` (`true`/`false`/`1`/`0`) |
//! | `DATABASE_MAX_CONNECTIONS` | `5` |
//! | `INVITATION_TTL_HOURS` | `72` (at most one year) |
//! | `INVITATION_SWEEP_INTERVAL_SECS` | `300` |
//! | `LOG_FORMAT` | `json` |

use std::time::Duration;

use staybase_auth::InvitationPolicy;
use staybase_observability::{LogFormat, ObservabilityConfig};

pub const DEFAULT_INVITATION_TTL_HOURS: i64 = 72;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaybaseConfig {
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub max_connections: u32,
    pub invitation_ttl_hours: i64,
    pub sweep_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for StaybaseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            use_persistent_stores: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            invitation_ttl_hours: DEFAULT_INVITATION_TTL_HOURS,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            log_format: LogFormat::Json,
        }
    }
}

impl StaybaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let use_persistent_stores = match lookup("USE_PERSISTENT_STORES") {
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::Invalid {
                name: "USE_PERSISTENT_STORES",
                value: raw,
            })?,
            None => defaults.use_persistent_stores,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "DATABASE_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }

        let invitation_ttl_hours =
            parse_or(&lookup, "INVITATION_TTL_HOURS", defaults.invitation_ttl_hours)?;
        policy_for(invitation_ttl_hours)?;

        let sweep_secs = parse_or(&lookup, "INVITATION_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "INVITATION_SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let log_format = match lookup("LOG_FORMAT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "LOG_FORMAT",
                value: raw,
            })?,
            None => defaults.log_format,
        };

        Ok(Self {
            database_url,
            use_persistent_stores,
            max_connections,
            invitation_ttl_hours,
            sweep_interval: Duration::from_secs(sweep_secs),
            log_format,
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self.use_persistent_stores = true;
        self
    }

    pub fn with_invitation_ttl_hours(mut self, hours: i64) -> Self {
        self.invitation_ttl_hours = hours;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn invitation_policy(&self) -> Result<InvitationPolicy, ConfigError> {
        policy_for(self.invitation_ttl_hours)
    }

    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig::default().with_format(self.log_format)
    }
}

fn policy_for(ttl_hours: i64) -> Result<InvitationPolicy, ConfigError> {
    InvitationPolicy::default()
        .with_ttl_hours(ttl_hours)
        .map_err(|_| ConfigError::Invalid {
            name: "INVITATION_TTL_HOURS",
            value: ttl_hours.to_string(),
        })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => {
            tracing::warn!("{name} not set; using default {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = StaybaseConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StaybaseConfig::default());
        assert_eq!(config.invitation_policy().unwrap().ttl, chrono::Duration::hours(72));
    }

    #[test]
    fn persistent_stores_need_a_database_url() {
        let err = StaybaseConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let config = StaybaseConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/staybase"),
        ]))
        .unwrap();
        assert!(config.use_persistent_stores);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/staybase"));

        let config = StaybaseConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "TRUE"),
            ("DATABASE_URL", "postgres://localhost/staybase"),
        ]))
        .unwrap();
        assert!(config.use_persistent_stores);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = StaybaseConfig::from_lookup(lookup(&[
            ("INVITATION_TTL_HOURS", "24"),
            ("INVITATION_SWEEP_INTERVAL_SECS", "60"),
            ("LOG_FORMAT", "pretty"),
        ]))
        .unwrap();
        assert_eq!(config.invitation_ttl_hours, 24);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_invalid_values() {
        for vars in [
            [("INVITATION_TTL_HOURS", "soon")],
            [("INVITATION_TTL_HOURS", "0")],
            [("INVITATION_TTL_HOURS", "9999999999999")],
            [("INVITATION_TTL_HOURS", "8761")],
            [("USE_PERSISTENT_STORES", "yes")],
            [("INVITATION_SWEEP_INTERVAL_SECS", "0")],
            [("LOG_FORMAT", "xml")],
        ] {
            assert!(
                matches!(StaybaseConfig::from_lookup(lookup(&vars)), Err(ConfigError::Invalid { .. })),
                "{vars:?}"
            );
        }
    }

    #[test]
    fn unchecked_ttl_surfaces_as_an_error() {
        let config = StaybaseConfig::default().with_invitation_ttl_hours(i64::MAX);
        assert_eq!(
            config.invitation_policy().unwrap_err(),
            ConfigError::Invalid {
                name: "INVITATION_TTL_HOURS",
                value: i64::MAX.to_string(),
            }
        );
    }
}
