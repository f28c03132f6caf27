use std::path::{Path, PathBuf};

const HOME_DIR_NAME: &str = ".keypool";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "quota.db";

/// Where keypool keeps its config file and, unless configured otherwise, its
/// quota database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    base: PathBuf,
}

impl ConfigPaths {
    /// `~/.keypool`.
    pub fn new() -> anyhow::Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(Self::with_base(home.join(HOME_DIR_NAME)))
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    /// An explicit directory (`--config-dir` / `KEYPOOL_HOME`) wins over the
    /// home default.
    pub fn resolve(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        match explicit {
            Some(base) => Ok(Self::with_base(base)),
            None => Self::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.base.join(DATABASE_FILE)
    }

    /// The quota database for a configured `database_path`. Relative paths
    /// are taken from the config directory, not the working directory.
    pub fn resolve_database(&self, configured: Option<&Path>) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.base.join(path),
            None => self.database_path(),
        }
    }
}
