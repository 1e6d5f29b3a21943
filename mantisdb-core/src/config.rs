//! MantisDB configuration.
//!
//! Configuration is loaded the way this corpus actually loads it: read
//! `config.json` from disk, fall back to compiled-in defaults and persist
//! them back out. A second pass then applies `MANTIS_`-prefixed environment
//! variable overrides. Precedence, highest first: environment variables,
//! then `config.json`, then defaults.

use crate::error::MantisError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration object for a MantisDB process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MantisConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub health: HealthConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub admin_port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
    /// Max resident cache bytes. Parsed from human-readable suffixes
    /// (`K`/`M`/`G`, binary ×1024) both in `config.json` and in env overrides.
    #[serde(with = "byte_size")]
    pub cache_size: u64,
    #[serde(with = "byte_size")]
    pub buffer_size: u64,
    pub sync_writes: bool,
    #[serde(with = "duration_secs")]
    pub query_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub eviction_policy: String,
    pub gc_percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub admin_token: Option<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Accepts either a bare JSON number or a `K`/`M`/`G`-suffixed string, so
/// `cache_size`/`buffer_size` can be written as `"256M"` in `config.json`
/// (§10.3), matching the `MANTIS_*` env-override parsing via `parse_size`.
mod byte_size {
    use super::parse_size;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(*v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64().ok_or_else(|| {
                serde::de::Error::custom(format!("byte size out of range: {n}"))
            }),
            Value::String(s) => parse_size(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid byte size: {s:?}"))),
            other => Err(serde::de::Error::custom(format!(
                "expected a number or size string, got {other}"
            ))),
        }
    }
}

impl Default for MantisConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 7700,
                admin_port: 7701,
                host: "127.0.0.1".to_string(),
            },
            database: DatabaseConfig {
                data_dir: PathBuf::from("./data"),
                cache_size: 256 * 1024 * 1024,
                buffer_size: 4 * 1024 * 1024,
                sync_writes: false,
                query_timeout: Duration::from_secs(30),
            },
            memory: MemoryConfig {
                eviction_policy: "lru".to_string(),
                gc_percent: 100,
            },
            health: HealthConfig {
                enabled: true,
                check_interval: Duration::from_secs(10),
                timeout: Duration::from_secs(2),
            },
            security: SecurityConfig { admin_token: None },
        }
    }
}

impl MantisConfig {
    const CONFIG_PATH: &'static str = "config.json";

    /// Load configuration from `config.json`, falling back to defaults and
    /// persisting them if the file is absent, then apply `MANTIS_*` env
    /// overrides and validate the result.
    pub async fn load() -> Result<Self> {
        let mut config = match tokio::fs::read_to_string(Self::CONFIG_PATH).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", Self::CONFIG_PATH))?,
            Err(_) => {
                let default_config = Self::default();
                default_config.save().await?;
                default_config
            }
        };

        config.apply_env_overrides();
        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    /// Persist the current configuration as pretty-printed JSON.
    pub async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(Self::CONFIG_PATH, content).await?;
        Ok(())
    }

    /// Apply `MANTIS_<KEY_UPPER_UNDERSCORED>` overrides for every key named
    /// in the configuration table. Unset variables leave the loaded value
    /// untouched.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u16("MANTIS_SERVER_PORT") {
            self.server.port = v;
        }
        if let Some(v) = env_u16("MANTIS_SERVER_ADMIN_PORT") {
            self.server.admin_port = v;
        }
        if let Ok(v) = std::env::var("MANTIS_SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("MANTIS_DATABASE_DATA_DIR") {
            self.database.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_size("MANTIS_DATABASE_CACHE_SIZE") {
            self.database.cache_size = v;
        }
        if let Some(v) = env_size("MANTIS_DATABASE_BUFFER_SIZE") {
            self.database.buffer_size = v;
        }
        if let Some(v) = env_bool("MANTIS_DATABASE_SYNC_WRITES") {
            self.database.sync_writes = v;
        }
        if let Some(v) = env_u64("MANTIS_DATABASE_QUERY_TIMEOUT") {
            self.database.query_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("MANTIS_MEMORY_EVICTION_POLICY") {
            self.memory.eviction_policy = v;
        }
        if let Some(v) = env_u64("MANTIS_MEMORY_GC_PERCENT") {
            self.memory.gc_percent = v as u32;
        }
        if let Some(v) = env_bool("MANTIS_HEALTH_ENABLED") {
            self.health.enabled = v;
        }
        if let Some(v) = env_u64("MANTIS_HEALTH_CHECK_INTERVAL") {
            self.health.check_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("MANTIS_HEALTH_TIMEOUT") {
            self.health.timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("MANTIS_SECURITY_ADMIN_TOKEN") {
            self.security.admin_token = Some(v);
        }
    }

    fn validate(&self) -> Result<(), MantisError> {
        if self.server.port == 0 || self.server.admin_port == 0 {
            return Err(MantisError::SchemaViolation(
                "server ports must be non-zero".to_string(),
            ));
        }
        if self.database.cache_size == 0 {
            return Err(MantisError::SchemaViolation(
                "database.cache_size must be non-zero".to_string(),
            ));
        }
        if self.memory.eviction_policy != "lru" {
            return Err(MantisError::SchemaViolation(format!(
                "unsupported eviction policy: {}",
                self.memory.eviction_policy
            )));
        }
        Ok(())
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn env_size(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| parse_size(&v))
}

/// Parse a human-readable byte size, accepting a bare integer or a value
/// suffixed with `K`/`M`/`G` (binary, ×1024), case-insensitive.
pub fn parse_size(input: &str) -> Option<u64> {
    let s = input.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let (digits, multiplier) = match s.chars().last()? {
        c @ ('k' | 'K') => (&s[..s.len() - c.len_utf8()], 1024),
        c @ ('m' | 'M') => (&s[..s.len() - c.len_utf8()], 1024 * 1024),
        c @ ('g' | 'G') => (&s[..s.len() - c.len_utf8()], 1024 * 1024 * 1024),
        _ => return None,
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_integer() {
        assert_eq!(parse_size("1024"), Some(1024));
    }

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("4K"), Some(4 * 1024));
        assert_eq!(parse_size("256M"), Some(256 * 1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_size("not-a-size"), None);
    }

    #[test]
    fn default_config_validates() {
        assert!(MantisConfig::default().validate().is_ok());
    }

    #[test]
    fn database_config_accepts_suffixed_size_strings_from_json() {
        let json = r#"{
            "data_dir": "./data",
            "cache_size": "256M",
            "buffer_size": 4194304,
            "sync_writes": false,
            "query_timeout": 30
        }"#;
        let config: DatabaseConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache_size, 256 * 1024 * 1024);
        assert_eq!(config.buffer_size, 4 * 1024 * 1024);
    }

    #[test]
    fn database_config_rejects_unparsable_size_string() {
        let json = r#"{
            "data_dir": "./data",
            "cache_size": "not-a-size",
            "buffer_size": 4194304,
            "sync_writes": false,
            "query_timeout": 30
        }"#;
        assert!(serde_json::from_str::<DatabaseConfig>(json).is_err());
    }
}
