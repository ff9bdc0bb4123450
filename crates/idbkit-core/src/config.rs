//! Connection configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use idbkit_engine::{MemoryEngine, StorageEngine};
use idbkit_sqlite::SqliteEngine;

use crate::error::StoreError;
use crate::facade::{connect, Model};
use crate::Result;

/// Which storage engine backs the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineConfig {
    /// Volatile, process-local storage
    Memory,
    /// SQLite file on disk
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Name of the database to open
    pub database_name: String,
    /// Version to open at; `None` opens whatever is stored
    #[serde(default)]
    pub version: Option<u32>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_name: "demo".to_string(),
            version: None,
            engine: EngineConfig::Sqlite {
                path: data_dir.join("idbkit.db"),
            },
        }
    }

    pub fn in_memory(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            version: None,
            engine: EngineConfig::Memory,
        }
    }

    /// `IDBKIT_DATA_DIR` if set, else `idbkit` under the platform data directory
    pub fn data_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("IDBKIT_DATA_DIR") {
            return PathBuf::from(dir);
        }
        platform_data_dir()
            .map(|d| d.join("idbkit"))
            .unwrap_or_else(|| PathBuf::from(".idbkit"))
    }

    /// Read a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        if config.database_name.trim().is_empty() {
            return Err(StoreError::Config("database_name must not be empty".to_string()));
        }
        if config.version == Some(0) {
            return Err(StoreError::Config("version must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn build_engine(&self) -> Result<Arc<dyn StorageEngine>> {
        match &self.engine {
            EngineConfig::Memory => Ok(Arc::new(MemoryEngine::new())),
            EngineConfig::Sqlite { path } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Ok(Arc::new(SqliteEngine::open(path)?))
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

/// Build the configured engine and connect to the configured database.
pub async fn connect_with_config(config: &Config) -> Result<Model> {
    let engine = config.build_engine()?;
    connect(engine, &config.database_name, config.version).await
}

fn platform_data_dir() -> Option<PathBuf> {
    let var = |name: &str| std::env::var_os(name).map(PathBuf::from);

    if cfg!(target_os = "windows") {
        var("LOCALAPPDATA")
    } else if cfg!(target_os = "macos") {
        var("HOME").map(|home| home.join("Library/Application Support"))
    } else {
        var("XDG_DATA_HOME").or_else(|| var("HOME").map(|home| home.join(".local/share")))
    }
}
