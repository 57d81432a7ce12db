//! Global config for the runtime
//! Includes the repository location, the worker count and the table sizes.
use std::collections::HashMap;

use camino::Utf8PathBuf;
use config::{Config, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::storage::DEFAULT_CAPACITY;

/// Global config variable for `Settings`
pub static FIX_CONFIG: OnceCell<Settings> = OnceCell::new();

/// Global path variable for configuration file
pub static FIX_CONFIG_FILE: OnceCell<Utf8PathBuf> = OnceCell::new();

/// Gets the `FIX_CONFIG` settings. If uninitialized, sets the global variable
/// in the following order (greatest to least precedence):
/// - `settings` map if provided, e.g. with key ("threads", "4")
/// - Env var per setting, e.g. `FIX_THREADS`
/// - Config file, which also has a configurable location (see `fix_config_file()`),
///   and has the following syntax for e.g. TOML:
///   ```toml
///   repository_dir = "/path/to/project"
///   threads = 8
///   ```
/// - Default values, e.g. the current directory and one thread per cpu
pub fn fix_config(
    file: Option<&Utf8PathBuf>,
    settings: Option<&HashMap<&str, String>>,
) -> &'static Settings {
    FIX_CONFIG
        .get_or_init(|| Settings::from_config(fix_config_file(file), settings).unwrap_or_default())
}

/// Gets the `FIX_CONFIG_FILE` path. If uninitialized, sets the global variable
/// in the following order (greatest to least precedence):
/// - `config_file` parameter if provided
/// - `FIX_CONFIG_FILE` env var
/// - Default location at `$HOME/.fix/fix.toml`
pub fn fix_config_file(config_file: Option<&Utf8PathBuf>) -> &'static Utf8PathBuf {
    FIX_CONFIG_FILE.get_or_init(|| {
        if let Some(file) = config_file {
            file.clone()
        } else if let Ok(file) = std::env::var("FIX_CONFIG_FILE") {
            Utf8PathBuf::from(file)
        } else {
            fix_default_dir().join("fix.toml")
        }
    })
}

/// Contains the runtime config settings
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding (or above) the `.fix` repository
    pub repository_dir: Utf8PathBuf,

    /// Executor worker threads
    pub threads: usize,

    /// Slots per storage table; tables never grow
    pub table_capacity: usize,
}

impl Settings {
    /// Loads config settings from a file or env vars
    pub fn from_config(
        config_file: &Utf8PathBuf,
        settings: Option<&HashMap<&str, String>>,
    ) -> Result<Self, ConfigError> {
        let override_of = |key: &str| settings.and_then(|s| s.get(key).map(|v| v.to_owned()));
        // Settings are read first to last, in order of increasing precedence.
        Config::builder()
            .set_default("repository_dir", ".")?
            .set_default("threads", num_cpus::get() as u64)?
            .set_default("table_capacity", DEFAULT_CAPACITY as u64)?
            .add_source(File::with_name(config_file.as_str()).required(false))
            .add_source(Environment::with_prefix("FIX"))
            .set_override_option("repository_dir", override_of("repository_dir"))?
            .set_override_option("threads", override_of("threads"))?
            .set_override_option("table_capacity", override_of("table_capacity"))?
            .build()
            .and_then(|c| c.try_deserialize())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repository_dir: Utf8PathBuf::from("."),
            threads: num_cpus::get(),
            table_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// `$HOME/.fix`, or `.fix` if there is no usable home directory
pub fn fix_default_dir() -> Utf8PathBuf {
    home::home_dir()
        .and_then(|home| Utf8PathBuf::from_path_buf(home).ok())
        .unwrap_or_default()
        .join(".fix")
}
