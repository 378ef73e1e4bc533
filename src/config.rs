//! Configuration for the `gpiod` binary.
//!
//! Layers, later ones win:
//! 1. built-in defaults
//! 2. a TOML file (`gpiod.toml`, or the path given with `--config`)
//! 3. environment variables prefixed with `GPIOD_`, nested keys separated
//!    by `__`, e.g. `GPIOD_CHIP=/dev/gpiochip1` or
//!    `GPIOD_LINES__LED__PIN=17`
//!
//! ```toml
//! chip = "/dev/gpiochip0"
//! consumer = "doorbell"
//! log_level = "debug"
//!
//! [lines.button]
//! direction = "input"
//! pin = "GPIO17"
//! bias = "pull-up"
//! falling_edge = true
//! debounce_us = 5000
//!
//! [lines.led]
//! direction = "output"
//! pin = 4
//! initial_value = false
//! final_value = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GpioError, Result};
use crate::group::{LineConfig, Pin};
use crate::logging::{parse_log_level, OutputFormat};
use crate::request::{validate_label, MAX_LINES};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "gpiod.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "GPIOD_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpiodConfig {
    /// Chip device to use
    pub chip: PathBuf,
    /// Consumer label for requested lines
    pub consumer: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: OutputFormat,
    /// Named line definitions for `gpiod run`
    pub lines: BTreeMap<String, LineConfig>,
}

impl Default for GpiodConfig {
    fn default() -> Self {
        Self {
            chip: PathBuf::from("/dev/gpiochip0"),
            consumer: "gpiod".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
            lines: BTreeMap::new(),
        }
    }
}

impl GpiodConfig {
    /// Load from `gpiod.toml`, if present, and the environment.
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment(Path::new(DEFAULT_CONFIG_PATH)))
    }

    /// Load from a specific file, which must exist, and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(GpioError::Config {
                message: format!("Configuration file not found: {}", path.display()),
            });
        }
        Self::extract(Self::figment(path))
    }

    /// The provider stack, for callers that want to merge more layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment.extract().map_err(|e| GpioError::Config {
            message: e.to_string(),
        })
    }

    /// Check settings before any device is touched.
    pub fn validate(&self) -> Result<()> {
        parse_log_level(&self.log_level)?;
        validate_label(&self.consumer)?;

        if self.lines.len() > MAX_LINES {
            return Err(GpioError::Config {
                message: format!(
                    "{} lines configured, at most {MAX_LINES} can be requested together",
                    self.lines.len()
                ),
            });
        }

        for (name, line) in &self.lines {
            if let Pin::Name(pin) = line.pin() {
                if pin.is_empty() {
                    return Err(GpioError::Config {
                        message: format!("Line '{name}' has an empty pin name"),
                    });
                }
            }
            if let LineConfig::Input(input) = line {
                if input.debounce_us == Some(0) {
                    return Err(GpioError::Config {
                        message: format!("Line '{name}': debounce_us must be positive"),
                    });
                }
            }
        }

        Ok(())
    }
}
