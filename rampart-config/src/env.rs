// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;

/// Prefix for fault tolerance environment variables.
pub const DEFAULT_ENV_PREFIX: &str = "RAMPART_FT";

/// Environment variable name for a property key, without prefix.
///
/// Every character that is not ASCII alphanumeric becomes `_` and the
/// result is upper-cased, so `Orders.place/Retry/maxRetries` is read from
/// `ORDERS_PLACE_RETRY_MAXRETRIES`.
pub fn env_key(property: &str) -> String {
    property
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Environment variable loader
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load every variable carrying the prefix from the process environment.
    ///
    /// Keys are returned upper-cased with the prefix and its separator
    /// removed.
    pub fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.load_from(env::vars()))
    }

    /// Like [`load`](Self::load), over an explicit set of variables.
    pub fn load_from<I, K, V>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = HashMap::new();

        for (key, value) in vars {
            let key = key.as_ref().to_ascii_uppercase();
            let trimmed = match &self.prefix {
                Some(prefix) => match key.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest.trim_start_matches('_'),
                    None => continue,
                },
                None => key.as_str(),
            };
            if !trimmed.is_empty() {
                config.insert(trimmed.to_string(), value.into());
            }
        }

        config
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.full_key(key)).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, env_key(key)),
            None => env_key(key),
        }
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(Some(DEFAULT_ENV_PREFIX.to_string()))
    }
}
