// Configuration loader for the media queue
//
// This module handles loading configuration from the TOML configuration file
// and environment variables with appropriate precedence.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use toml::Value;

const CONFIG_FILE_PATH: &str = "media_queue.conf";

/// Environment variable overriding the configuration file location
const CONFIG_FILE_ENV: &str = "MEDIA_QUEUE_CONFIG";

/// Loads configuration from the TOML file and environment variables
///
/// Configuration precedence (highest to lowest):
/// 1. Environment variables
/// 2. Configuration file values
/// 3. Default values (not handled here - application defaults)
///
/// # Returns
///
/// Returns true if the config file was successfully loaded, false otherwise
pub fn load_config() -> bool {
    let path = env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| CONFIG_FILE_PATH.to_string());
    load_config_from(Path::new(&path))
}

/// Same as [`load_config`] with an explicit file path
pub fn load_config_from(config_path: &Path) -> bool {
    if !config_path.exists() {
        debug!("Configuration file not found at: {}", config_path.display());
        return false;
    }

    let config_content = match fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read configuration file: {}", e);
            return false;
        }
    };

    let config_map = match parse_flat_table(&config_content) {
        Ok(map) => map,
        Err(e) => {
            warn!("Failed to parse configuration file: {}", e);
            return false;
        }
    };

    // Set environment variables from config file if they don't already exist
    for (key, value) in config_map {
        if env::var(&key).is_err() {
            debug!("Setting env var from config file: {} = {}", key, value);
            env::set_var(key, value);
        } else {
            debug!("Env var already exists, skipping: {}", key);
        }
    }

    info!("Configuration loaded from {}", config_path.display());
    true
}

/// Convert a flat TOML document into key-value pairs
///
/// Arrays of scalars are joined with commas, which is the list format used by
/// the environment variables. Nested tables are skipped.
fn parse_flat_table(content: &str) -> Result<HashMap<String, String>, toml::de::Error> {
    let table: toml::Table = content.parse()?;
    let mut config_map = HashMap::new();

    for (key, value) in table {
        match value {
            Value::Array(items) => {
                let items: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
                config_map.insert(key, items.join(","));
            }
            other => match scalar_to_string(&other) {
                Some(s) => {
                    config_map.insert(key, s);
                }
                None => warn!("Skipping unsupported TOML value type for key: {}", key),
            },
        }
    }

    Ok(config_map)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}
