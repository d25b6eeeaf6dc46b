//! Configuration for one transfer-capable process, and a loader that reads
//! any serde config struct from a `.ron`, `.toml` or `.json` file.
//!
//! Every section is `#[serde(default)]`, so a file only needs to name the
//! values it changes.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::TransportConfig;
use crate::job::SchedulerConfig;
use crate::lock::LockConfig;
use crate::validation::ToleranceConfig;

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Configuration
// ===========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub lock: LockConfig,
    pub tolerance: ToleranceConfig,
}

// ===========================================================================
// Loading
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<ConfigFormat, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(ConfigFormat::Ron),
        Some("toml") => Ok(ConfigFormat::Toml),
        Some("json") => Ok(ConfigFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

/// Read a file and deserialize it according to its extension.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let parse = |detail: String| ConfigError::Parse {
        file: path.to_path_buf(),
        detail,
    };
    match format {
        ConfigFormat::Ron => ron::from_str(&content).map_err(|e| parse(e.to_string())),
        ConfigFormat::Json => serde_json::from_str(&content).map_err(|e| parse(e.to_string())),
        ConfigFormat::Toml => toml::from_str(&content).map_err(|e| parse(e.to_string())),
    }
}
