use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Service configuration, loaded from a YAML file at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub internal_grpc_port: u16,
    pub monitoring_port: u16,
    pub jwks_url: String,
    /// Cadence of the background JWKS refresh. The key set is fetched once at
    /// startup regardless; omit to disable refresh.
    #[serde(default, with = "duration::option")]
    pub jwks_refresh_interval: Option<Duration>,
    #[serde(with = "duration")]
    pub graceful_shutdown_delay: Duration,
    pub cache: CacheConfig,
    #[serde(default)]
    pub role_scopes_map: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(with = "duration")]
    pub sync_interval: Duration,
    pub user_manager_server_internal_addr: String,
    pub cluster_manager_server_internal_addr: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.internal_grpc_port == 0 {
            bail!("internalGrpcPort must be set");
        }
        if self.monitoring_port == 0 {
            bail!("monitoringPort must be set");
        }
        if self.jwks_url.is_empty() {
            bail!("jwksUrl must be set");
        }
        if self.graceful_shutdown_delay.is_zero() {
            bail!("gracefulShutdownDelay must be non-zero");
        }
        if self.cache.sync_interval.is_zero() {
            bail!("cache.syncInterval must be non-zero");
        }
        if self.cache.user_manager_server_internal_addr.is_empty() {
            bail!("cache.userManagerServerInternalAddr must be set");
        }
        if self.cache.cluster_manager_server_internal_addr.is_empty() {
            bail!("cache.clusterManagerServerInternalAddr must be set");
        }
        Ok(())
    }
}

/// Serde adapter for durations written as `250ms`, `30s`, `5m` or `1h30m`.
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }

    pub(super) fn parse(raw: &str) -> Result<Duration, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        let mut digits = String::new();
        let mut chars = trimmed.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let mut unit = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphabetic() {
                    unit.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("invalid number in duration '{raw}'"))?;
            digits.clear();
            total += match unit.as_str() {
                "ms" => Duration::from_millis(value),
                "s" => Duration::from_secs(value),
                "m" => Duration::from_secs(value * 60),
                "h" => Duration::from_secs(value * 3600),
                other => return Err(format!("unsupported duration unit '{other}' in '{raw}'")),
            };
        }
        if !digits.is_empty() {
            return Err(format!("missing unit in duration '{raw}'"));
        }
        Ok(total)
    }
}
