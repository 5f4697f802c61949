//! # Module Table
//!
//! The JSON configuration that maps caller modules to capture settings, and
//! the store that holds it for the life of the process.
//!
//! ```json
//! {
//!   "name": "gateway",
//!   "modules": [
//!     { "module_name": "svcA", "profile_service_port": 9001,
//!       "profile_output_dir": "/var/profiles", "profile_seconds": 60 }
//!   ]
//! }
//! ```
//!
//! Entries keep file order; resolution depends on it (see [`resolve`]).

pub mod resolve;

pub use resolve::{caller_source_path, random_port, resolve, resolve_in, PortFallback};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::ConfigError;

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// One module entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(alias = "module_names")]
    pub module_name: ModuleNames,
    #[serde(default, alias = "module_ports")]
    pub profile_service_port: u16,
    #[serde(default)]
    pub profile_output_dir: String,
    #[serde(default)]
    pub profile_seconds: i64,
}

impl ModuleConfig {
    /// First module name that occurs inside `caller`
    ///
    /// Empty names never match, so a blank entry cannot capture every caller.
    #[must_use]
    pub fn matching_name(&self, caller: &str) -> Option<&str> {
        self.module_name.iter().find(|name| !name.is_empty() && caller.contains(name))
    }
}

/// A module entry names one module or several sharing the same settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleNames {
    One(String),
    Many(Vec<String>),
}

impl ModuleNames {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let names = match self {
            ModuleNames::One(name) => std::slice::from_ref(name),
            ModuleNames::Many(names) => names.as_slice(),
        };
        names.iter().map(String::as_str)
    }
}

impl From<&str> for ModuleNames {
    fn from(name: &str) -> Self {
        ModuleNames::One(name.to_string())
    }
}

/// Load the module table from a JSON file
///
/// # Errors
/// Returns an error if the file does not exist, cannot be read, or is not a
/// valid module table
pub fn load_config_file(file: impl AsRef<Path>) -> Result<SetupConfig, ConfigError> {
    let file = file.as_ref();
    let path = std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf());

    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }

    let bytes = std::fs::read(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    let config: SetupConfig =
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;

    info!("Loaded config {:?} with {} module(s) from {}", config.name, config.modules.len(), path.display());
    Ok(config)
}

/// Holds the loaded module table
///
/// Read-only for capture purposes; [`ConfigStore::reload`] swaps in a fresh
/// copy of the backing file.
#[derive(Debug, Default)]
pub struct ConfigStore {
    source: Option<PathBuf>,
    current: RwLock<Arc<SetupConfig>>,
}

impl ConfigStore {
    /// Store an already loaded table (no backing file, reload is a no-op)
    #[must_use]
    pub fn new(config: SetupConfig) -> Self {
        Self { source: None, current: RwLock::new(Arc::new(config)) }
    }

    /// Load a table from disk, keeping the path for later reloads
    ///
    /// # Errors
    /// Returns an error if the initial load fails
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = load_config_file(&path)?;
        Ok(Self { source: Some(path), current: RwLock::new(Arc::new(config)) })
    }

    /// Load a table from disk, falling back to an empty table on any error
    ///
    /// An empty table resolves every caller to the defaults.
    #[must_use]
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = load_config_file(&path).unwrap_or_else(|e| {
            warn!("{e}; using default profile settings");
            SetupConfig::default()
        });
        Self { source: Some(path), current: RwLock::new(Arc::new(config)) }
    }

    /// Current table
    #[must_use]
    pub fn snapshot(&self) -> Arc<SetupConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the backing file; the previous table stays in place on error
    ///
    /// # Errors
    /// Returns an error if the backing file cannot be loaded
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        let config = load_config_file(path)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("rp.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"name":"gw","modules":[{"module_name":"svcA","profile_service_port":9001,
                "profile_output_dir":"/out","profile_seconds":60}]}"#,
        );

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.name, "gw");
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].profile_service_port, 9001);
        assert_eq!(config.modules[0].profile_seconds, 60);
    }

    #[test]
    fn test_aliases_and_name_lists() {
        let config: SetupConfig = serde_json::from_str(
            r#"{"modules":[{"module_names":["billing","ledger"],"module_ports":7100}]}"#,
        )
        .unwrap();
        let module = &config.modules[0];
        assert_eq!(module.profile_service_port, 7100);
        assert_eq!(module.matching_name("src/ledger/main.rs"), Some("ledger"));
        assert_eq!(module.matching_name("src/other/main.rs"), None);
        assert!(module.profile_output_dir.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let err = load_config_file("/nonexistent/rp.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{ not json");
        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_empty_module_name_matches_nothing() {
        let module = ModuleConfig {
            module_name: ModuleNames::Many(vec![String::new(), "billing".to_string()]),
            profile_service_port: 9001,
            profile_output_dir: String::new(),
            profile_seconds: 0,
        };
        assert_eq!(module.matching_name("gateway/src/main.rs"), None);
        assert_eq!(module.matching_name("billing/src/main.rs"), Some("billing"));
    }

    #[test]
    fn test_load_or_default_degrades() {
        let store = ConfigStore::load_or_default("/nonexistent/rp.json");
        assert!(store.snapshot().modules.is_empty());
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"name":"v1","modules":[]}"#);
        let store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.snapshot().name, "v1");

        write_config(dir.path(), r#"{"name":"v2","modules":[]}"#);
        store.reload().unwrap();
        assert_eq!(store.snapshot().name, "v2");

        // A broken file leaves the previous table in place
        write_config(dir.path(), "garbage");
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().name, "v2");
    }
}
