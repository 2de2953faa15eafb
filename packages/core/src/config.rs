// ============================================================================
// File: packages/core/src/config.rs
// ----------------------------------------------------------------------------
// Per-resource configuration, loaded from config_resource_<name>.toml.
// Reserved keys (§6.2) are typed fields; everything else is passed verbatim
// to the resource factory as a serde_json::Map.
// ============================================================================

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cache::EvictionPolicy;

fn parse_policy(s: &str) -> anyhow::Result<EvictionPolicy> {
    match s {
        "lru" => Ok(EvictionPolicy::Lru),
        "lfu" => Ok(EvictionPolicy::Lfu),
        "weight" => Ok(EvictionPolicy::Weight),
        "useless" => Ok(EvictionPolicy::Useless),
        "old" => Ok(EvictionPolicy::Old),
        "random" => Ok(EvictionPolicy::Random),
        other => anyhow::bail!("unknown pool__cache_policy '{other}'"),
    }
}

/// Raw deserialization target: every reserved key optional, everything else
/// swallowed by `#[serde(flatten)]` into `extra`.
#[derive(Debug, Deserialize)]
struct RawResourceConfig {
    #[serde(rename = "pool__size")]
    pool_size: Option<usize>,
    #[serde(rename = "pool__standby")]
    pool_standby: Option<usize>,
    #[serde(rename = "pool__cache_size")]
    pool_cache_size: Option<usize>,
    #[serde(rename = "pool__cache_policy")]
    pool_cache_policy: Option<String>,
    #[serde(rename = "pool__cache_default_ttl")]
    pool_cache_default_ttl: Option<f64>,
    #[serde(rename = "pool__cache_evict_period")]
    pool_cache_evict_period: Option<f64>,
    #[serde(rename = "pool__cache_group_interval")]
    pool_cache_group_interval: Option<f64>,
    #[serde(rename = "pool__idle_timeout")]
    pool_idle_timeout: Option<f64>,
    #[serde(rename = "pool__max_age")]
    pool_max_age: Option<f64>,
    #[serde(rename = "pool__min_time")]
    pool_min_time: Option<f64>,
    #[serde(rename = "pool__max_time")]
    pool_max_time: Option<f64>,
    #[serde(rename = "pool__resource_name")]
    pool_resource_name: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Typed view of a resource's configuration file, with the reserved
/// `pool__*` keys pulled out and every other key left for the resource
/// factory to interpret itself.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub pool_size: usize,
    pub pool_standby: usize,
    pub cache_size: Option<usize>,
    pub cache_policy: EvictionPolicy,
    pub cache_default_ttl: Option<Duration>,
    pub cache_evict_period: Duration,
    pub cache_group_interval: Duration,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub min_time: Duration,
    pub max_time: Option<Duration>,
    /// Present only for double-underscored resource names (e.g.
    /// `rpc__cagename`), injected as the constructor parameter.
    pub resource_name: Option<String>,
    pub extra: Map<String, Value>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            pool_standby: 0,
            cache_size: None,
            cache_policy: EvictionPolicy::Lru,
            cache_default_ttl: None,
            cache_evict_period: Duration::from_secs_f64(10.0),
            cache_group_interval: Duration::ZERO,
            idle_timeout: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
            min_time: Duration::ZERO,
            max_time: None,
            resource_name: None,
            extra: Map::new(),
        }
    }
}

impl ResourceConfig {
    fn from_raw(raw: RawResourceConfig) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            pool_size: raw.pool_size.unwrap_or(defaults.pool_size),
            pool_standby: raw.pool_standby.unwrap_or(defaults.pool_standby),
            cache_size: raw.pool_cache_size,
            cache_policy: match raw.pool_cache_policy {
                Some(s) => parse_policy(&s)?,
                None => defaults.cache_policy,
            },
            cache_default_ttl: raw.pool_cache_default_ttl.map(Duration::from_secs_f64),
            cache_evict_period: raw.pool_cache_evict_period.map(Duration::from_secs_f64).unwrap_or(defaults.cache_evict_period),
            cache_group_interval: raw.pool_cache_group_interval.map(Duration::from_secs_f64).unwrap_or(defaults.cache_group_interval),
            idle_timeout: raw.pool_idle_timeout.map(Duration::from_secs_f64).unwrap_or(defaults.idle_timeout),
            max_age: raw.pool_max_age.map(Duration::from_secs_f64).unwrap_or(defaults.max_age),
            min_time: raw.pool_min_time.map(Duration::from_secs_f64).unwrap_or(defaults.min_time),
            max_time: raw.pool_max_time.map(Duration::from_secs_f64),
            resource_name: raw.pool_resource_name,
            extra: raw.extra,
        })
    }

    /// Load and parse `config_resource_<name>.toml` from `dir`.
    pub fn load(dir: &Path, name: &str) -> anyhow::Result<Self> {
        let path = dir.join(format!("config_resource_{name}.toml"));
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let raw: RawResourceConfig = toml::from_str(text)?;
        Self::from_raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_keys_absent() {
        let cfg = ResourceConfig::parse("").unwrap();
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert!(cfg.cache_size.is_none());
    }

    #[test]
    fn reserved_keys_parse_and_extra_keys_survive() {
        let toml = r#"
            pool__size = 4
            pool__standby = 1
            pool__cache_size = 8
            pool__cache_policy = "lfu"
            pool__cache_default_ttl = 30.0
            pool__idle_timeout = 120.0
            pool__max_age = 7200.0
            pool__min_time = 0.1
            pool__max_time = 5.0
            host = "db.internal"
            port = 5432
        "#;
        let cfg = ResourceConfig::parse(toml).unwrap();
        assert_eq!(cfg.pool_size, 4);
        assert_eq!(cfg.pool_standby, 1);
        assert_eq!(cfg.cache_size, Some(8));
        assert!(matches!(cfg.cache_policy, EvictionPolicy::Lfu));
        assert_eq!(cfg.cache_default_ttl, Some(Duration::from_secs_f64(30.0)));
        assert_eq!(cfg.idle_timeout, Duration::from_secs_f64(120.0));
        assert_eq!(cfg.max_time, Some(Duration::from_secs_f64(5.0)));
        assert_eq!(cfg.extra.get("host").unwrap(), "db.internal");
        assert_eq!(cfg.extra.get("port").unwrap(), 5432);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = ResourceConfig::parse(r#"pool__cache_policy = "bogus""#).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn load_reads_named_file_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config_resource_db.toml"), "pool__size = 3\n").unwrap();
        let cfg = ResourceConfig::load(dir.path(), "db").unwrap();
        assert_eq!(cfg.pool_size, 3);
    }
}
