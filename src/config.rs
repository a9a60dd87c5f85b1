//! Hub configuration.
//!
//! Runtime knobs come from `HUB_*` environment variables (a `.env` file is
//! loaded first). Declarative rule documents (sanitization rules, notification
//! rules) are JSON files whose paths are given by the environment.

use crate::models::{ChannelKind, NotificationRule, Severity};
use crate::sanitizer::SanitizationRuleSet;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Bounds for each per-source connection pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub checkout_timeout: Duration,
    /// Attempts to open a connection before surfacing a `Connection` error.
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            idle_timeout: Duration::from_secs(300),
            checkout_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(200),
        }
    }
}

/// Limits shared by ad-hoc queries and sync extracts.
#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub timeout: Duration,
    pub default_row_limit: usize,
    /// Safety cap on rows pulled by a single sync job.
    pub sync_row_cap: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            default_row_limit: 1000,
            sync_row_cap: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Hard wall-clock limit for one job.
    pub job_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            job_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: String,
    pub state_db: PathBuf,
    pub production_db: PathBuf,
    pub training_db: PathBuf,
    pub pool: PoolSettings,
    pub query: QuerySettings,
    pub scheduler: SchedulerSettings,
    pub notify_backoff: Duration,
    pub sanitization_rules: SanitizationRuleSet,
    /// Key for hashed fields; a random per-process key when unset.
    pub hash_key: Option<String>,
    pub notification_rules: Vec<NotificationRule>,
}

impl HubConfig {
    /// Build the configuration from `HUB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let pool = PoolSettings {
            max_size: env_or("HUB_POOL_MAX_SIZE", 5)?,
            idle_timeout: Duration::from_secs(env_or("HUB_POOL_IDLE_TIMEOUT_SECS", 300)?),
            checkout_timeout: Duration::from_secs(env_or("HUB_POOL_CHECKOUT_TIMEOUT_SECS", 10)?),
            connect_attempts: env_or("HUB_CONNECT_RETRIES", 3)?,
            connect_backoff: Duration::from_millis(env_or("HUB_CONNECT_BACKOFF_MS", 200)?),
        };
        if pool.max_size == 0 {
            anyhow::bail!("HUB_POOL_MAX_SIZE must be at least 1");
        }

        let query = QuerySettings {
            timeout: Duration::from_secs(env_or("HUB_QUERY_TIMEOUT_SECS", 30)?),
            default_row_limit: env_or("HUB_QUERY_ROW_LIMIT", 1000)?,
            sync_row_cap: env_or("HUB_SYNC_ROW_CAP", 100_000)?,
        };

        let scheduler = SchedulerSettings {
            tick_interval: Duration::from_secs(env_or("HUB_SCHEDULER_TICK_SECS", 60)?),
            job_timeout: Duration::from_secs(env_or("HUB_JOB_TIMEOUT_SECS", 3600)?),
        };
        if scheduler.tick_interval.is_zero() {
            anyhow::bail!("HUB_SCHEDULER_TICK_SECS must be > 0");
        }

        let sanitization_rules = match std::env::var("HUB_SANITIZATION_RULES") {
            Ok(path) => load_json::<SanitizationRuleSet>(Path::new(&path))?,
            Err(_) => {
                warn!("HUB_SANITIZATION_RULES not set, using built-in rule set");
                SanitizationRuleSet::builtin()
            }
        };

        let notification_rules = match std::env::var("HUB_NOTIFICATION_RULES") {
            Ok(path) => load_json::<Vec<NotificationRule>>(Path::new(&path))?,
            Err(_) => default_notification_rules(),
        };

        let config = Self {
            bind_addr: env_or("HUB_BIND_ADDR", "0.0.0.0:3000".to_string())?,
            state_db: env_or("HUB_STATE_DB", PathBuf::from("hub_state.sqlite"))?,
            production_db: env_or("HUB_PRODUCTION_DB", PathBuf::from("tier_production.sqlite"))?,
            training_db: env_or("HUB_TRAINING_DB", PathBuf::from("tier_training.sqlite"))?,
            pool,
            query,
            scheduler,
            notify_backoff: Duration::from_millis(env_or("HUB_NOTIFY_BACKOFF_MS", 500)?),
            sanitization_rules,
            hash_key: std::env::var("HUB_HASH_KEY").ok().filter(|k| !k.is_empty()),
            notification_rules,
        };

        info!(
            "Loaded config: bind={} state_db={:?} rules=v{} channels={}",
            config.bind_addr,
            config.state_db,
            config.sanitization_rules.version,
            config.notification_rules.len()
        );
        Ok(config)
    }
}

/// Only the in-app inbox is enabled when no rules file is given.
fn default_notification_rules() -> Vec<NotificationRule> {
    vec![NotificationRule {
        channel: ChannelKind::InApp,
        min_severity: Severity::Info,
        enabled: true,
        endpoint: None,
        recipients: Vec::new(),
    }]
}

/// Read and parse a JSON document.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {:?}", path))?;
    let parsed = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config: {:?}", path))?;
    info!("Loaded config document from {:?}", path);
    Ok(parsed)
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_or_default_and_parse() {
        assert_eq!(env_or("HUB_TEST_UNSET_KEY_XYZ", 7usize).unwrap(), 7);
        std::env::set_var("HUB_TEST_SET_KEY_XYZ", " 42 ");
        assert_eq!(env_or("HUB_TEST_SET_KEY_XYZ", 7usize).unwrap(), 42);
        std::env::set_var("HUB_TEST_BAD_KEY_XYZ", "many");
        assert!(env_or("HUB_TEST_BAD_KEY_XYZ", 7usize).is_err());
    }

    #[test]
    fn test_load_notification_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"channel":"chat-webhook","minSeverity":"warning","endpoint":"http://hooks/x"}}]"#
        )
        .unwrap();

        let rules: Vec<NotificationRule> = load_json(file.path()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].channel, ChannelKind::ChatWebhook);
        assert!(rules[0].enabled);
    }

    #[test]
    fn test_load_json_missing_file() {
        let result: Result<Vec<NotificationRule>> = load_json(Path::new("/nonexistent/rules.json"));
        assert!(result.is_err());
    }
}
