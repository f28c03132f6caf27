use kp_quota::ledger::{
    default_exhaustion_markers, DEFAULT_DAILY_BUDGET_UNITS, DEFAULT_PERSISTENCE_RETRY_COUNT,
    DEFAULT_RETRY_BACKOFF,
};
use kp_quota::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use crate::credentials::{parse_key_list, CredentialConfig, ResolvedCredential, API_KEYS_ENV};
use crate::paths::ConfigPaths;

fn default_daily_budget_units() -> u64 {
    DEFAULT_DAILY_BUDGET_UNITS
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_persistence_retry_count() -> u32 {
    DEFAULT_PERSISTENCE_RETRY_COUNT
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_daily_budget_units")]
    pub daily_budget_units: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_persistence_retry_count")]
    pub persistence_retry_count: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub policy: SelectionStrategy,
    #[serde(default = "default_exhaustion_markers")]
    pub exhaustion_markers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(skip)]
    paths: Option<ConfigPaths>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            daily_budget_units: default_daily_budget_units(),
            timezone: default_timezone(),
            persistence_retry_count: default_persistence_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            policy: SelectionStrategy::default(),
            exhaustion_markers: default_exhaustion_markers(),
            database_path: None,
            credentials: Vec::new(),
            paths: None,
        }
    }
}

impl PoolConfig {
    pub fn paths(&self) -> anyhow::Result<ConfigPaths> {
        match &self.paths {
            Some(p) => Ok(p.clone()),
            None => ConfigPaths::new(),
        }
    }

    pub fn set_paths(&mut self, paths: ConfigPaths) {
        self.paths = Some(paths);
    }

    /// Load config from the default location (`~/.keypool/config.toml`).
    pub fn load() -> anyhow::Result<Self> {
        let paths = ConfigPaths::new()?;
        Self::load_from(&paths)
    }

    pub fn load_from(paths: &ConfigPaths) -> anyhow::Result<Self> {
        let config_file = paths.config_path();
        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)?;
            let config: PoolConfig = toml::from_str(&content)?;
            config
        } else {
            Self::default()
        };
        config.paths = Some(paths.clone());
        config.validate()?;
        Ok(config)
    }

    /// Validate config values. Called automatically by `load` / `load_from`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.daily_budget_units == 0 {
            anyhow::bail!("daily_budget_units must be greater than 0");
        }
        self.timezone()?;

        let mut seen = HashSet::new();
        for cred in &self.credentials {
            cred.validate()?;
            if !seen.insert(cred.index) {
                anyhow::bail!("duplicate credential index {}", cred.index);
            }
        }
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone {:?}: {}", self.timezone, e))
    }

    /// The SQLite file, defaulting to `quota.db` in the config directory.
    /// A relative `database_path` is taken from the config directory.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.paths()?.resolve_database(self.database_path.as_deref()))
    }

    /// Raw keys for the pool, from `[[credentials]]` or `KEYPOOL_API_KEYS`.
    pub fn resolve_credentials(&self) -> anyhow::Result<Vec<ResolvedCredential>> {
        self.resolve_credentials_with(|name| env::var(name).ok())
    }

    pub fn resolve_credentials_with<F>(&self, lookup: F) -> anyhow::Result<Vec<ResolvedCredential>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolved = if self.credentials.is_empty() {
            lookup(API_KEYS_ENV)
                .map(|raw| parse_key_list(&raw))
                .unwrap_or_default()
        } else {
            self.credentials
                .iter()
                .map(|c| c.resolve_with(&lookup))
                .collect::<anyhow::Result<Vec<_>>>()?
        };

        if resolved.is_empty() {
            anyhow::bail!(
                "no API keys configured: add [[credentials]] to the config file or set {}",
                API_KEYS_ENV
            );
        }
        Ok(resolved)
    }
}
