//! # Configuration
//!
//! Settings read from `tessera.toml`.
//!
//! ```toml
//! data_dir = "/var/lib/tessera"
//! backup_dir = "/var/lib/tessera/backups"
//! integrity_check = "full"        # none | references | full
//! log_format = "json"             # text | json
//! ```
//!
//! Every key is optional. Command-line flags override the file, and the
//! `TESSERA_LOG_FORMAT` environment variable overrides `log_format`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tessera_core::{IntegrityCheck, SessionConfig, TesseraError};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "tessera.toml";

/// Data directory used when neither the file nor the flags name one.
pub const DEFAULT_DATA_DIR: &str = "tessera-data";

/// Maximum size of a configuration file (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Parse the value of `TESSERA_LOG_FORMAT`. Unknown values mean text.
    #[must_use]
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Contents of `tessera.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TesseraConfig {
    /// Directory holding one `<graph>.redb` file per graph.
    pub data_dir: Option<PathBuf>,
    /// Directory receiving safety exports. Defaults to `<data_dir>/backups`.
    pub backup_dir: Option<PathBuf>,
    pub integrity_check: IntegrityCheck,
    pub log_format: LogFormat,
}

impl TesseraConfig {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, `tessera.toml` in the
    /// working directory is used if present, and defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, TesseraError> {
        match explicit {
            Some(path) => Self::read(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::read(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, TesseraError> {
        toml::from_str(text)
            .map_err(|e| TesseraError::Deserialization(format!("invalid configuration: {e}")))
    }

    fn read(path: &Path) -> Result<Self, TesseraError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            TesseraError::StorageIo(format!("cannot read config '{}': {e}", path.display()))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(TesseraError::InvalidOperation(format!(
                "config '{}' is {} bytes, limit is {MAX_CONFIG_FILE_SIZE}",
                path.display(),
                metadata.len()
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::StorageIo(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Data directory after applying an optional override.
    #[must_use]
    pub fn data_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Backup directory for the given data directory.
    #[must_use]
    pub fn backup_dir(&self, data_dir: &Path) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("backups"))
    }

    /// Session settings for on-disk graphs under `data_dir`.
    #[must_use]
    pub fn session_config(&self, data_dir: &Path) -> SessionConfig {
        SessionConfig::on_disk(data_dir, self.backup_dir(data_dir))
            .with_integrity(self.integrity_check)
    }
}
