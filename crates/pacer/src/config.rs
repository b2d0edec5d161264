//! Runtime configuration.
//!
//! Values come from JSON (all fields optional) and can be overridden through
//! `PACER_*` environment variables. Every numeric setting must be positive.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_MAX_CONCURRENCY: &str = "PACER_MAX_CONCURRENCY";
pub const ENV_DEFAULT_TTL_MS: &str = "PACER_DEFAULT_TTL_MS";
pub const ENV_SWEEP_INTERVAL_MS: &str = "PACER_SWEEP_INTERVAL_MS";

/// Deserializing goes through the same validation as [`Config::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct Config {
    /// Permits for [`crate::BoundedExecutor::from_config`].
    pub max_concurrency: usize,
    /// Default entry lifetime for [`crate::ExpiringMap::from_config`].
    pub default_ttl_ms: u64,
    /// Period of the expiring-map background sweep.
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_ttl_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Wire shape: signed so that negative values reach validation instead of
/// failing as a type mismatch.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    max_concurrency: Option<i64>,
    default_ttl_ms: Option<i64>,
    sweep_interval_ms: Option<i64>,
}

fn positive(name: &'static str, value: i64) -> Result<u64> {
    if value <= 0 {
        tracing::warn!(setting = name, value, "Rejected non-positive setting");
        return Err(Error::invalid(name, format!("must be positive, got {value}")));
    }
    Ok(value as u64)
}

fn parse_positive(name: &'static str, raw: &str) -> Result<u64> {
    let value = raw
        .trim()
        .parse::<i64>()
        .map_err(|e| Error::invalid(name, format!("'{raw}' is not an integer: {e}")))?;
    positive(name, value)
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Defaults overridden by `PACER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (an environment-like key/value source).
    ///
    /// All or nothing: on error `self` is left unchanged.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut next = self.clone();
        if let Some(raw) = lookup(ENV_MAX_CONCURRENCY) {
            next.max_concurrency = parse_positive("max_concurrency", &raw)? as usize;
        }
        if let Some(raw) = lookup(ENV_DEFAULT_TTL_MS) {
            next.default_ttl_ms = parse_positive("default_ttl_ms", &raw)?;
        }
        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL_MS) {
            next.sweep_interval_ms = parse_positive("sweep_interval_ms", &raw)?;
        }
        *self = next;
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = raw.max_concurrency {
            config.max_concurrency = positive("max_concurrency", v)? as usize;
        }
        if let Some(v) = raw.default_ttl_ms {
            config.default_ttl_ms = positive("default_ttl_ms", v)?;
        }
        if let Some(v) = raw.sweep_interval_ms {
            config.sweep_interval_ms = positive("sweep_interval_ms", v)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_serialize() {
        insta::assert_json_snapshot!(Config::default(), @r#"
        {
          "max_concurrency": 4,
          "default_ttl_ms": 30000,
          "sweep_interval_ms": 1000
        }
        "#);
    }

    #[test]
    fn json_fields_are_optional() {
        let config = Config::from_json(r#"{"max_concurrency": 8}"#).unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.default_ttl_ms, 30_000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn json_rejects_zero_and_negative_capacity() {
        for json in [r#"{"max_concurrency": 0}"#, r#"{"max_concurrency": -3}"#] {
            let err = Config::from_json(json).unwrap_err();
            assert!(
                matches!(err, Error::InvalidArgument { name: "max_concurrency", .. }),
                "unexpected error for {json}: {err}"
            );
        }
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let err = Config::from_json(r#"{"max": 3}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_defaults() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                (ENV_MAX_CONCURRENCY, "16"),
                (ENV_DEFAULT_TTL_MS, " 500 "),
            ]))
            .unwrap();

        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.default_ttl(), Duration::from_millis(500));
        assert_eq!(config.sweep_interval_ms, 1_000);
    }

    #[test]
    fn env_rejects_bad_values() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[(ENV_MAX_CONCURRENCY, "-1")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument 'max_concurrency': must be positive, got -1"
        );

        let err = config
            .apply_env(env(&[(ENV_SWEEP_INTERVAL_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "sweep_interval_ms", .. }));
    }

    #[test]
    fn failed_env_override_leaves_config_untouched() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[
                (ENV_MAX_CONCURRENCY, "12"),
                (ENV_SWEEP_INTERVAL_MS, "0"),
            ]))
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument { name: "sweep_interval_ms", .. }));
        assert_eq!(config, Config::default());
    }

    #[derive(Debug, Deserialize)]
    struct ServiceSettings {
        name: String,
        pacer: Config,
    }

    #[test]
    fn nested_config_deserializes_with_validation() {
        let settings: ServiceSettings = serde_json::from_str(
            r#"{"name": "chat-sync", "pacer": {"max_concurrency": 6}}"#,
        )
        .unwrap();
        assert_eq!(settings.name, "chat-sync");
        assert_eq!(settings.pacer.max_concurrency, 6);
        assert_eq!(settings.pacer.default_ttl_ms, 30_000);

        let err = serde_json::from_str::<ServiceSettings>(
            r#"{"name": "chat-sync", "pacer": {"max_concurrency": -1}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be positive"), "{err}");
    }

    #[test]
    fn serialized_config_reads_back() {
        let config = Config {
            max_concurrency: 9,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }
}
