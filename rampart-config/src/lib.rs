//! Configuration for the rampart fault tolerance engine
//!
//! [`ConfigManager`] collects properties from files (`.properties`, JSON,
//! TOML, `.env`) and from `RAMPART_FT_*` environment variables, then turns
//! the fault tolerance keys among them into a validated
//! [`FaultToleranceSettings`]. See [`keys`] for the key syntax.
//!
//! File sources are merged in load order, later files overriding earlier
//! ones. Environment variables override every file.
//!
//! ```no_run
//! use rampart_config::*;
//!
//! let manager = ConfigManager::new();
//! manager.load_file("fault-tolerance.properties", FileFormat::Properties)?;
//! manager.load_env()?;
//!
//! let settings = manager.load_settings()?;
//! # Ok::<(), ConfigError>(())
//! ```

pub mod env;
pub mod error;
pub mod keys;
pub mod loader;
pub mod validation;

pub use env::{DEFAULT_ENV_PREFIX, EnvLoader, env_key};
pub use error::{ConfigError, Result};
pub use keys::PropertyKey;
pub use loader::{ConfigLoader, FileFormat, flatten};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use rampart_core::FaultToleranceSettings;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

/// Main configuration manager
#[derive(Clone)]
pub struct ConfigManager {
    properties: Arc<RwLock<BTreeMap<String, Value>>>,
    environment: Arc<RwLock<HashMap<String, String>>>,
    env_prefix: String,
}

impl ConfigManager {
    /// Create a manager reading `RAMPART_FT_*` variables
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX.to_string())
    }

    /// Create with a different environment variable prefix
    pub fn with_prefix(prefix: String) -> Self {
        Self {
            properties: Arc::new(RwLock::new(BTreeMap::new())),
            environment: Arc::new(RwLock::new(HashMap::new())),
            env_prefix: prefix,
        }
    }

    /// Snapshot the prefixed process environment.
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(Some(self.env_prefix.clone()));
        *self.environment.write() = loader.load()?;
        Ok(())
    }

    /// Snapshot an explicit set of variables instead of the process
    /// environment.
    pub fn load_env_from<I, K, V>(&self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let loader = EnvLoader::new(Some(self.env_prefix.clone()));
        *self.environment.write() = loader.load_from(vars);
    }

    /// Load a .env file into the process environment, then snapshot it
    pub fn load_dotenv(&self, path: Option<&str>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok(); // a missing .env is fine
        }
        self.load_env()
    }

    /// Load configuration from file
    pub fn load_file(&self, path: &str, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).load_file(path)?;
        self.merge_value(&data);
        Ok(())
    }

    /// Load configuration from file, picking the format from its extension
    pub fn load_file_auto(&self, path: &str) -> Result<()> {
        let data = ConfigLoader::auto(path)?.load_file(path)?;
        self.merge_value(&data);
        Ok(())
    }

    /// Load configuration from an in-memory document
    pub fn load_str(&self, content: &str, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).parse(content)?;
        self.merge_value(&data);
        Ok(())
    }

    fn merge_value(&self, data: &Value) {
        let mut properties = self.properties.write();
        for (key, value) in flatten(data) {
            properties.insert(key, Value::String(value));
        }
    }

    /// Set a configuration value
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        self.properties.write().insert(key.to_string(), json_value);
        Ok(())
    }

    /// Get a value as JSON, without the environment layer
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let properties = self.properties.read();
        let value = properties
            .get(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Raw property value, the environment taking precedence over files.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(value) = self.environment.read().get(&env_key(key)) {
            return Some(value.clone());
        }
        self.properties
            .read()
            .get(key)
            .map(loader::scalar_string)
    }

    /// Parse a property value, from whichever source holds it
    pub fn parse<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self
            .lookup(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;
        raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
    }

    /// Check if a key exists in any source
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Get all file and programmatic property keys
    pub fn keys(&self) -> Vec<String> {
        self.properties.read().keys().cloned().collect()
    }

    /// Merge configuration from another manager
    pub fn merge(&self, other: &ConfigManager) {
        if Arc::ptr_eq(&self.properties, &other.properties) {
            return;
        }
        let other_properties = other.properties.read().clone();
        let other_environment = other.environment.read().clone();

        self.properties.write().extend(other_properties);
        self.environment.write().extend(other_environment);
    }

    /// Build settings from every fault tolerance key found.
    ///
    /// Method-specific environment variables are only picked up for methods
    /// that also appear in a file source; use
    /// [`load_settings_for`](Self::load_settings_for) to name others.
    pub fn load_settings(&self) -> Result<FaultToleranceSettings> {
        self.load_settings_for(&[])
    }

    /// Like [`load_settings`](Self::load_settings), also resolving
    /// environment overrides for `methods`.
    pub fn load_settings_for(&self, methods: &[&str]) -> Result<FaultToleranceSettings> {
        let mut entries: BTreeMap<String, (PropertyKey, String)> = BTreeMap::new();
        let mut known_methods: BTreeSet<String> =
            methods.iter().map(|m| m.to_string()).collect();

        for (key, value) in self.properties.read().iter() {
            if let Some(property) = PropertyKey::parse(key)? {
                if let Some(method) = property.method() {
                    known_methods.insert(method.to_string());
                }
                entries.insert(property.to_string(), (property, loader::scalar_string(value)));
            }
        }

        let environment = self.environment.read();
        let scopes = std::iter::once(None).chain(known_methods.iter().map(|m| Some(m.as_str())));
        for scope in scopes {
            for property in PropertyKey::all(scope) {
                let name = property.to_string();
                if let Some(value) = environment.get(&env_key(&name)) {
                    entries.insert(name, (property, value.clone()));
                }
            }
        }
        drop(environment);

        let mut settings = FaultToleranceSettings::new();
        for (property, value) in entries.values() {
            property.apply(&mut settings, value)?;
        }
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("env_prefix", &self.env_prefix)
            .field("properties", &self.properties.read().len())
            .field("environment", &self.environment.read().len())
            .finish()
    }
}
