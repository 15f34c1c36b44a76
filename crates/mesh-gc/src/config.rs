//! GC configuration.
//!
//! Settings can be parsed from a TOML table or read from the environment.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MESH_GC_MIN_FREE_ENTRY_SIZE` | Smallest gap linked into the free list | 512 |
//! | `MESH_GC_IMPLICIT` | Run collections on the requesting thread | false |
//! | `MESH_GC_CONCURRENT_VM_ACCESS` | Hold VM access during concurrent phases | false |
//! | `MESH_GC_CONCURRENT_RESUMABLE` | Requests pause and later resume concurrent phases | false |
//! | `MESH_GC_THREAD_NAME` | Name of the main GC thread | mesh-gc-main |
//! | `MESH_GC_THREAD_STACK_SIZE` | Stack size of the main GC thread in bytes | platform |

use std::env;

use serde::Deserialize;
use thiserror::Error;

/// Default minimum size of a free-list entry, in bytes.
pub const DEFAULT_MINIMUM_FREE_ENTRY_SIZE: usize = 512;

/// Default name of the main GC thread.
pub const DEFAULT_MAIN_THREAD_NAME: &str = "mesh-gc-main";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse GC config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Collector driver and pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub minimum_free_entry_size: usize,
    pub run_as_implicit: bool,
    pub acquire_vm_access_during_concurrent: bool,
    pub concurrent_resumable: bool,
    pub main_thread_name: String,
    pub main_thread_stack_size: Option<usize>,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            minimum_free_entry_size: DEFAULT_MINIMUM_FREE_ENTRY_SIZE,
            run_as_implicit: false,
            acquire_vm_access_during_concurrent: false,
            concurrent_resumable: false,
            main_thread_name: DEFAULT_MAIN_THREAD_NAME.to_string(),
            main_thread_stack_size: None,
        }
    }
}

impl GcConfig {
    /// Parse a config from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<GcConfig, ConfigError> {
        let config: GcConfig = toml::from_str(content)?;
        config.validate()
    }

    /// Build a config from `MESH_GC_*` environment variables over defaults.
    pub fn from_env() -> Result<GcConfig, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Used by `from_env`.
    pub fn from_lookup<F>(lookup: F) -> Result<GcConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = GcConfig::default();

        if let Some(v) = lookup("MESH_GC_MIN_FREE_ENTRY_SIZE") {
            config.minimum_free_entry_size = parse_usize("MESH_GC_MIN_FREE_ENTRY_SIZE", &v)?;
        }
        if let Some(v) = lookup("MESH_GC_IMPLICIT") {
            config.run_as_implicit = parse_bool("MESH_GC_IMPLICIT", &v)?;
        }
        if let Some(v) = lookup("MESH_GC_CONCURRENT_VM_ACCESS") {
            config.acquire_vm_access_during_concurrent =
                parse_bool("MESH_GC_CONCURRENT_VM_ACCESS", &v)?;
        }
        if let Some(v) = lookup("MESH_GC_CONCURRENT_RESUMABLE") {
            config.concurrent_resumable = parse_bool("MESH_GC_CONCURRENT_RESUMABLE", &v)?;
        }
        if let Some(v) = lookup("MESH_GC_THREAD_NAME") {
            config.main_thread_name = v;
        }
        if let Some(v) = lookup("MESH_GC_THREAD_STACK_SIZE") {
            config.main_thread_stack_size = Some(parse_usize("MESH_GC_THREAD_STACK_SIZE", &v)?);
        }

        config.validate()
    }

    fn validate(self) -> Result<GcConfig, ConfigError> {
        if self.minimum_free_entry_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "minimum_free_entry_size",
                value: "0".to_string(),
            });
        }
        if self.main_thread_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "main_thread_name",
                value: String::new(),
            });
        }
        Ok(self)
    }
}

fn parse_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
