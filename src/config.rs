use crate::supervisor::{DiskPolicy, DurationPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Output formats understood by the capture utility's `--output-format` flag.
pub const SUPPORTED_OUTPUT_FORMATS: &[&str] =
    &["pcap", "ivs", "csv", "gps", "kismet", "netxml", "logcsv"];

/// Capture settings loaded from `utility_config.json` (or a `.toml` file).
///
/// Every key is optional; missing keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Monitor-mode interface handed to the capture utility.
    pub interface: String,
    pub use_band: bool,
    /// Band selector such as `a`, `bg` or `abg`. Ignored unless `use_band` is set.
    pub band: String,
    /// Dwell time per channel, in seconds.
    pub channel_hop_time: u32,
    /// Seconds to capture for, or the literal `"infinite"`.
    pub duration: DurationPolicy,
    /// Filename prefix for the utility's output files.
    pub output_prefix: String,
    pub min_free_space_mb: u64,
    pub use_gpsd: bool,
    pub output_formats: Vec<String>,
    /// Seconds between free-space checks when running indefinitely.
    pub space_check_interval: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: "mon0".to_string(),
            use_band: false,
            band: "a".to_string(),
            channel_hop_time: 2,
            duration: DurationPolicy::Fixed(10),
            output_prefix: "testcapture".to_string(),
            min_free_space_mb: 100,
            use_gpsd: false,
            output_formats: vec!["pcap".to_string(), "csv".to_string(), "netxml".to_string()],
            space_check_interval: 30,
        }
    }
}

impl CaptureConfig {
    /// The disk budget enforced while the capture runs.
    pub fn disk_policy(&self) -> DiskPolicy {
        DiskPolicy {
            min_free_mb: self.min_free_space_mb,
            poll_interval_secs: self.space_check_interval,
        }
    }

    /// Apply command-line overrides on top of the file values.
    pub fn apply_overrides(&mut self, interface: Option<String>, duration: Option<DurationPolicy>) {
        if let Some(interface) = interface {
            self.interface = interface;
        }
        if let Some(duration) = duration {
            self.duration = duration;
        }
    }

    /// Check the values serde cannot express as types.
    pub fn validate(&self) -> Result<(), String> {
        if self.interface.trim().is_empty() {
            return Err("interface must not be empty".to_string());
        }
        if self.channel_hop_time == 0 {
            return Err("channel_hop_time must be a positive number of seconds".to_string());
        }
        if self.space_check_interval == 0 {
            return Err("space_check_interval must be a positive number of seconds".to_string());
        }
        if self.output_prefix.is_empty() || self.output_prefix.contains('/') {
            return Err(format!(
                "output_prefix {:?} must be a non-empty file name",
                self.output_prefix
            ));
        }
        if let Some(bad) = self
            .output_formats
            .iter()
            .find(|fmt| !SUPPORTED_OUTPUT_FORMATS.contains(&fmt.as_str()))
        {
            return Err(format!(
                "unsupported output format {bad:?} (expected one of {})",
                SUPPORTED_OUTPUT_FORMATS.join(", ")
            ));
        }
        Ok(())
    }
}

/// Errors raised while loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file is missing or unreadable.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid JSON/TOML, or a value has the wrong type.
    Parse { path: PathBuf, message: String },
    /// The file parsed but a value is out of range.
    Invalid { path: PathBuf, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "failed to parse config {}: {}", path.display(), message)
            }
            ConfigError::Invalid { path, message } => {
                write!(f, "invalid config {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load the configuration at `path`.
///
/// Files ending in `.toml` are parsed as TOML, everything else as JSON.
/// Range checks are left to `CaptureConfig::validate`, run once command-line
/// overrides have been applied.
pub fn load_config(path: &Path) -> Result<CaptureConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let parsed = if is_toml {
        toml::from_str::<CaptureConfig>(&contents).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<CaptureConfig>(&contents).map_err(|e| e.to_string())
    };
    let config = parsed.map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })?;

    tracing::debug!(path = %path.display(), ?config, "configuration loaded");
    Ok(config)
}
