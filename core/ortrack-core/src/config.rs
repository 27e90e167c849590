//! Runtime configuration, read from `~/.ortrack/config.toml`.
//!
//! Every field has a default, so an absent file or a partial file is fine:
//!
//! ```toml
//! [verification]
//! scan_duration_secs = 2
//! cycle_interval_secs = 5
//!
//! [reader]
//! port = "/dev/ttyUSB0"
//! location = "OR-3"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};

const DATA_DIR_NAME: &str = ".ortrack";
const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "ortrack.db";
const LOG_DIR_NAME: &str = "logs";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Scan window for each continuous-mode cycle.
    #[serde(default = "default_cycle_scan_secs")]
    pub scan_duration_secs: u64,
    /// Wait between continuous-mode cycles.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Overall budget for continuous mode.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// Scan window for a one-off verification.
    #[serde(default = "default_single_scan_secs")]
    pub single_scan_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            scan_duration_secs: default_cycle_scan_secs(),
            cycle_interval_secs: default_cycle_interval_secs(),
            max_duration_secs: default_max_duration_secs(),
            single_scan_secs: default_single_scan_secs(),
        }
    }
}

impl VerificationConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn single_scan(&self) -> Duration {
        Duration::from_secs(self.single_scan_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_outbound_scan_secs")]
    pub scan_duration_secs: u64,
    /// Stored checks older than this are not reported as current.
    #[serde(default = "default_status_max_age_secs")]
    pub status_max_age_secs: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            scan_duration_secs: default_outbound_scan_secs(),
            status_max_age_secs: default_status_max_age_secs(),
        }
    }
}

impl OutboundConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}

/// The reader a scan is taken with; also stamped onto tag detections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_reader_name")]
    pub name: String,
    #[serde(default = "default_reader_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub location: Option<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            name: default_reader_name(),
            port: default_reader_port(),
            baud_rate: default_baud_rate(),
            location: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Defaults to `~/.ortrack/ortrack.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join(DATABASE_FILE_NAME)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Defaults to `~/.ortrack/logs`.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn resolved_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join(LOG_DIR_NAME)),
        }
    }
}

fn default_cycle_scan_secs() -> u64 {
    2
}

fn default_cycle_interval_secs() -> u64 {
    5
}

fn default_max_duration_secs() -> u64 {
    3600
}

fn default_single_scan_secs() -> u64 {
    5
}

fn default_outbound_scan_secs() -> u64 {
    3
}

fn default_status_max_age_secs() -> u64 {
    60
}

fn default_reader_name() -> String {
    "default-reader".to_string()
}

fn default_reader_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

/// `~/.ortrack`
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| TrackError::Io {
        context: "resolving data directory".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "Home directory not found"),
    })?;
    Ok(home.join(DATA_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads `path` (or the default location). A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| TrackError::Io {
        context: format!("reading config {}", config_path.display()),
        source,
    })?;
    toml::from_str::<EngineConfig>(&content).map_err(|err| TrackError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = load_config(Some(&path)).expect("load config");

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.verification.scan_duration(), Duration::from_secs(2));
        assert_eq!(config.verification.cycle_interval(), Duration::from_secs(5));
        assert_eq!(config.verification.max_duration(), Duration::from_secs(3600));
        assert_eq!(config.outbound.scan_duration(), Duration::from_secs(3));
        assert_eq!(config.outbound.status_max_age_secs, 60);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[verification]
cycle_interval_secs = 1

[reader]
port = "/dev/ttyACM0"
location = "OR-3"

[storage]
database_path = "/tmp/ortrack-test.db"
"#,
        )
        .expect("write config");

        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config.verification.cycle_interval_secs, 1);
        assert_eq!(config.verification.scan_duration_secs, 2);
        assert_eq!(config.reader.port, "/dev/ttyACM0");
        assert_eq!(config.reader.baud_rate, 115_200);
        assert_eq!(config.reader.location.as_deref(), Some("OR-3"));
        assert_eq!(
            config.storage.resolved_database_path().expect("db path"),
            PathBuf::from("/tmp/ortrack-test.db")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[verification]\nscan_duration_secs = \"soon\"\n")
            .expect("write config");

        let err = load_config(Some(&path)).expect_err("malformed");
        assert!(matches!(err, TrackError::ConfigMalformed { .. }));
        assert_eq!(err.code(), "config_malformed");
    }
}
