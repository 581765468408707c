//! # PMOSSDP Configuration Module
//!
//! This module provides configuration management for the SSDP/GENA stack, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//! - Thread-safe singleton access pattern
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! // Get the global configuration
//! let config = get_config();
//!
//! // Access configuration values
//! let port = config.get_u16_or(&["upnp", "ssdp", "port"], 1900);
//!
//! // Update configuration values
//! config.set_value(&["upnp", "ssdp", "match_ip"], serde_yaml::Value::Bool(false))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::{
    env, fs,
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::{info, warn};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmoconfig.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Failed to load PMOSSDP configuration"));
}

const ENV_CONFIG_DIR: &str = "PMOSSDP_CONFIG";
const ENV_PREFIX: &str = "PMOSSDP_CONFIG__";
const DEFAULT_CONFIG_DIR: &str = ".pmossdp";

/// Configuration manager
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters/setters for configuration values
///
/// A configuration built with [`Config::from_yaml_str`] lives in memory only:
/// [`Config::save`] is a no-op for it.
#[derive(Debug)]
pub struct Config {
    path: String,
    data: Mutex<Value>,
}

// Implémentation manuelle de Clone
impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.lock_data().clone();
        Self {
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        // 1. Try provided directory
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Try environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var=ENV_CONFIG_DIR, path=%env_path, "Trying to load config from env");
            return env_path;
        }

        // 3. Try current directory
        if Path::new(DEFAULT_CONFIG_DIR).exists() {
            return DEFAULT_CONFIG_DIR.to_string();
        }

        // 4. Try home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(DEFAULT_CONFIG_DIR);
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        // Default fallback
        DEFAULT_CONFIG_DIR.to_string()
    }

    /// Validates and prepares a config directory
    fn validate_config_dir(path: &Path) -> Result<()> {
        // Create if doesn't exist
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        // Verify it's a directory
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        // Test write permission
        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `PMOSSDP_CONFIG` environment variable
    /// 3. `.pmossdp` in the current directory
    /// 4. `.pmossdp` in the user's home directory
    ///
    /// The directory is created if it doesn't exist, and validated for write permissions.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir_path = Self::find_config_dir(directory);
        Self::validate_config_dir(Path::new(&dir_path))?;
        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    /// 5. Saves the merged configuration
    ///
    /// # Arguments
    ///
    /// * `directory` - The directory containing the config.yaml file, or empty to use defaults
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        info!(config_dir=%config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file=%path, "Loaded config file");
            data
        } else {
            info!(config_file=%path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        let mut config_value = Self::merged_with_defaults(&serde_yaml::from_slice(&yaml_data)?)?;
        Self::apply_env_overrides(&mut config_value, env::vars());

        let config = Config {
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    /// Builds an in-memory configuration from a YAML document
    ///
    /// The document is merged over the embedded defaults. Environment
    /// overrides are not applied and nothing is ever written to disk.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let external: Value = serde_yaml::from_str(yaml)?;

        Ok(Config {
            path: String::new(),
            data: Mutex::new(Self::merged_with_defaults(&external)?),
        })
    }

    fn merged_with_defaults(external: &Value) -> Result<Value> {
        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        // un config.yaml vide se lit comme Null
        if !external.is_null() {
            merge_yaml(&mut default_value, &Self::lower_keys_value(external.clone()));
        }
        Ok(Self::lower_keys_value(default_value))
    }

    /// Saves the current configuration to the config.yaml file
    pub fn save(&self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(&*self.lock_data())?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, Value> {
        // Une valeur YAML reste cohérente même si un thread a paniqué en la tenant
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["upnp", "ssdp", "ttl"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.lock_data();
            Self::set_value_internal(&mut data, path, value)?;
        }
        self.save()
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key_value = Value::String(path[0].to_lowercase());
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("Current node is not a map"))
        }
    }

    /// Gets a configuration value at the specified path
    ///
    /// Returns an error if the path doesn't exist.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.lock_data();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                if let Some(next) = map.get(&Value::String(key.to_lowercase())) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a Config", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    /// Deserializes a whole configuration subtree into `T`
    pub fn get_section<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T> {
        let value = self.get_value(path)?;
        Ok(serde_yaml::from_value(value)?)
    }

    /// Reads a port-like number, accepting numbers and numeric strings
    pub fn get_u16_or(&self, path: &[&str], default: u16) -> u16 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => match n.as_u64().and_then(|v| u16::try_from(v).ok()) {
                Some(v) => v,
                None => {
                    warn!("Invalid value {} at {}, using default {}", n, path.join("."), default);
                    default
                }
            },
            Ok(Value::String(s)) => s.trim().parse::<u16>().unwrap_or_else(|_| {
                warn!("Invalid value '{}' at {}, using default {}", s, path.join("."), default);
                default
            }),
            Ok(_) => {
                warn!("{} is not a number, using default {}", path.join("."), default);
                default
            }
            Err(err) => {
                warn!("Failed to get {}: {}, using default {}", path.join("."), err, default);
                default
            }
        }
    }

    /// Reads a boolean, accepting booleans and the strings "true"/"false"
    pub fn get_bool_or(&self, path: &[&str], default: bool) -> bool {
        match self.get_value(path) {
            Ok(Value::Bool(b)) => b,
            Ok(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => default,
            },
            _ => default,
        }
    }

    fn apply_env_overrides<I>(config: &mut Value, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path = stripped.split("__").collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                if let Err(err) = Self::set_value_internal(config, &key_path, yaml_value) {
                    warn!(env_var=%key, "Ignoring environment override: {}", err);
                }
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        new_map.insert(Value::String(s.to_lowercase()), Self::lower_keys_value(v));
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }
}

/// Returns the global configuration instance
///
/// This function provides access to the singleton configuration instance,
/// which is lazily loaded on first access.
///
/// # Panics
///
/// Panics on first access if the configuration directory cannot be prepared.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Merges external YAML configuration into default configuration
///
/// - For mappings (objects), it merges keys from external into default
/// - For scalars and sequences, external values replace default values
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(), // pour les scalaires ou séquences, on remplace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_embedded() {
        let config = Config::from_yaml_str("").unwrap();

        assert_eq!(config.get_u16_or(&["upnp", "ssdp", "port"], 0), 1900);
        assert_eq!(config.get_u16_or(&["upnp", "ssdp", "search_port"], 0), 1901);
        assert!(config.get_bool_or(&["upnp", "ssdp", "match_ip"], false));
        assert_eq!(config.get_u16_or(&["upnp", "eventing", "callback_port"], 0), 9999);
    }

    #[test]
    fn external_yaml_overrides_defaults_and_keys_are_case_insensitive() {
        let config = Config::from_yaml_str("UPnP:\n  SSDP:\n    TTL: 8\n").unwrap();

        assert_eq!(config.get_u16_or(&["upnp", "ssdp", "ttl"], 0), 8);
        assert_eq!(config.get_u16_or(&["UPNP", "Ssdp", "mx"], 0), 3);
    }

    #[test]
    fn env_overrides_are_parsed_as_yaml_scalars() {
        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        Config::apply_env_overrides(
            &mut value,
            vec![
                ("PMOSSDP_CONFIG__UPNP__SSDP__MATCH_IP".to_string(), "false".to_string()),
                ("PMOSSDP_CONFIG__UPNP__EVENTING__CALLBACK_PORT".to_string(), "10001".to_string()),
                ("UNRELATED".to_string(), "1".to_string()),
            ],
        );
        let config = Config {
            path: String::new(),
            data: Mutex::new(value),
        };

        assert!(!config.get_bool_or(&["upnp", "ssdp", "match_ip"], true));
        assert_eq!(config.get_u16_or(&["upnp", "eventing", "callback_port"], 0), 10001);
    }

    #[test]
    fn invalid_numbers_fall_back_to_default() {
        let config = Config::from_yaml_str("upnp:\n  ssdp:\n    port: not-a-port\n").unwrap();

        assert_eq!(config.get_u16_or(&["upnp", "ssdp", "port"], 1900), 1900);
        assert_eq!(config.get_u16_or(&["upnp", "missing"], 42), 42);
    }

    #[test]
    fn set_value_creates_intermediate_maps() {
        let config = Config::from_yaml_str("").unwrap();
        config
            .set_value(&["custom", "nested", "flag"], Value::Bool(true))
            .unwrap();

        assert!(config.get_bool_or(&["custom", "nested", "flag"], false));
        assert!(config.get_value(&["custom", "other"]).is_err());
    }

    #[test]
    fn load_config_writes_merged_file() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_string_lossy().to_string();
        fs::write(dir.path().join("config.yaml"), "upnp:\n  ssdp:\n    mx: 5\n").unwrap();

        let config = Config::load_config(&dir_str).unwrap();
        assert_eq!(config.get_u16_or(&["upnp", "ssdp", "mx"], 0), 5);
        assert_eq!(config.get_u16_or(&["upnp", "ssdp", "ttl"], 0), 4);

        config
            .set_value(&["upnp", "ssdp", "ttl"], Value::Number(2.into()))
            .unwrap();
        let reloaded = Config::load_config(&dir_str).unwrap();
        assert_eq!(reloaded.get_u16_or(&["upnp", "ssdp", "ttl"], 0), 2);
    }
}
