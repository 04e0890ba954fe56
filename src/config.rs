//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/demod.toml` by default)
//! 2. environment variables prefixed with `DEMOD_` (nested keys use `__`)
//!
//! Every section has defaults, so a missing file yields a usable simulated
//! setup.
//!
//! # Example
//! ```no_run
//! use demod_char::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Backend: {:?}", config.backend.kind);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DaqError, DaqResult};
use crate::instrument::{BackendKind, Role};
use crate::measurement::sweep::SettlingPolicy;
use crate::params::DeviceProfile;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/demod.toml";

/// Device selected when none is given
pub const DEFAULT_DEVICE: &str = "demodulator";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument backend selection
    #[serde(default)]
    pub backend: BackendConfig,
    /// Instrument addresses per role
    #[serde(default)]
    pub instruments: InstrumentAddresses,
    /// Settling delay overrides
    #[serde(default)]
    pub settling: SettlingOverrides,
    /// Persistence locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Known device profiles keyed by selector
    #[serde(default = "default_devices")]
    pub devices: BTreeMap<String, DeviceProfile>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Log span open/close events
    #[serde(default)]
    pub log_span_events: bool,
    /// Prefix each line with the source file and line
    #[serde(default)]
    pub log_file_and_line: bool,
    /// Colored output for the pretty format
    #[serde(default = "default_true")]
    pub log_ansi: bool,
}

/// Instrument backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind
    #[serde(default)]
    pub kind: BackendKind,
    /// Canned reading file replayed by the simulated backend
    #[serde(default)]
    pub canned_readings: Option<PathBuf>,
}

/// Address of each instrument role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentAddresses {
    /// LO signal generator
    pub lo_generator: String,
    /// RF signal generator
    pub rf_generator: String,
    /// DC power source
    pub source: String,
    /// Multimeter
    pub multimeter: String,
    /// Spectrum analyzer
    pub analyzer: String,
}

/// Optional settling delay overrides, in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlingOverrides {
    /// Delay after enabling the generator outputs
    pub output_ms: Option<u64>,
    /// Delay after moving the analyzer marker
    pub marker_ms: Option<u64>,
    /// Delay between generator and source shutdown on cancel
    pub shutdown_ms: Option<u64>,
}

/// Where persisted state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Secondary parameter record
    #[serde(default = "default_params_path")]
    pub secondary_params: PathBuf,
    /// RF offset list
    #[serde(default = "default_offsets_path")]
    pub rf_offsets: PathBuf,
    /// Adjustment template; empty means no adjustment
    #[serde(default)]
    pub adjustment: PathBuf,
    /// Expected-value table source
    #[serde(default)]
    pub expected_table: Option<PathBuf>,
    /// Raw sweep dump written after real-hardware runs
    #[serde(default = "default_raw_dump")]
    pub raw_dump: PathBuf,
    /// Directory for exported tables
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

fn default_name() -> String {
    "Demodulator characterization".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_params_path() -> PathBuf {
    PathBuf::from("params.toml")
}

fn default_offsets_path() -> PathBuf {
    PathBuf::from("deltas.toml")
}

fn default_raw_dump() -> PathBuf {
    PathBuf::from("out.txt")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("export")
}

fn default_devices() -> BTreeMap<String, DeviceProfile> {
    let mut devices = BTreeMap::new();
    devices.insert(DEFAULT_DEVICE.to_string(), DeviceProfile::default());
    devices
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            backend: BackendConfig::default(),
            instruments: InstrumentAddresses::default(),
            settling: SettlingOverrides::default(),
            paths: PathsConfig::default(),
            devices: default_devices(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_span_events: false,
            log_file_and_line: false,
            log_ansi: true,
        }
    }
}

impl Default for InstrumentAddresses {
    fn default() -> Self {
        Self {
            lo_generator: "192.168.0.6:5025".to_string(),
            rf_generator: "192.168.0.20:5025".to_string(),
            source: "192.168.0.3:5025".to_string(),
            multimeter: "192.168.0.22:5025".to_string(),
            analyzer: "192.168.0.7:5025".to_string(),
        }
    }
}

impl InstrumentAddresses {
    /// Address configured for `role`.
    pub fn address(&self, role: Role) -> &str {
        match role {
            Role::LoGenerator => &self.lo_generator,
            Role::RfGenerator => &self.rf_generator,
            Role::Source => &self.source,
            Role::Multimeter => &self.multimeter,
            Role::Analyzer => &self.analyzer,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            secondary_params: default_params_path(),
            rf_offsets: default_offsets_path(),
            adjustment: PathBuf::new(),
            expected_table: None,
            raw_dump: default_raw_dump(),
            export_dir: default_export_dir(),
        }
    }
}

impl PathsConfig {
    /// Adjustment template path, `None` when unset.
    pub fn adjustment_path(&self) -> Option<&Path> {
        if self.adjustment.as_os_str().is_empty() {
            None
        } else {
            Some(&self.adjustment)
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables override the file, e.g.
    /// `DEMOD_BACKEND__KIND=scpi` or `DEMOD_APPLICATION__LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DEMOD_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::InvalidParams(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::InvalidParams(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.backend.kind == BackendKind::Scpi {
            let mut seen = HashSet::new();
            for role in Role::ALL {
                let address = self.instruments.address(role);
                if address.is_empty() {
                    return Err(DaqError::InvalidParams(format!(
                        "Missing address for {role}"
                    )));
                }
                if !seen.insert(address) {
                    return Err(DaqError::InvalidParams(format!(
                        "Duplicate instrument address: {address}"
                    )));
                }
            }
        }

        if self.devices.is_empty() {
            return Err(DaqError::InvalidParams(
                "At least one device profile is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Settling policy: backend defaults with configured overrides applied.
    pub fn settling_policy(&self) -> SettlingPolicy {
        let mut policy = self.backend.kind.default_settling();
        if let Some(ms) = self.settling.output_ms {
            policy.output = Duration::from_millis(ms);
        }
        if let Some(ms) = self.settling.marker_ms {
            policy.marker = Duration::from_millis(ms);
        }
        if let Some(ms) = self.settling.shutdown_ms {
            policy.shutdown = Duration::from_millis(ms);
        }
        policy
    }

    /// Look up a device profile by selector.
    pub fn device(&self, selector: &str) -> DaqResult<&DeviceProfile> {
        self.devices
            .get(selector)
            .ok_or_else(|| DaqError::UnknownDevice(selector.to_string()))
    }
}
