//! Engine configuration

use crate::types::{Address, MetadataVersion};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Upper bound on the size of a configuration file
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Settings for one resolution session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides the version declared by the metadata header
    pub metadata_version: Option<MetadataVersion>,
    /// Address of the code registration structure, for builds where
    /// neither symbols nor the data scan can find it
    #[serde(with = "hex_address")]
    pub code_registration: Option<Address>,
    /// Worker threads for table parsing and per-module resolution
    pub worker_threads: Option<usize>,
}

impl EngineConfig {
    /// Load configuration from file
    ///
    /// A missing or empty file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let size = std::fs::metadata(path)?.len();
        if size > MAX_CONFIG_SIZE {
            return Err(Error::config(format!(
                "config file is {size} bytes, limit is {MAX_CONFIG_SIZE}"
            )));
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            warn!("Config file {:?} is empty, using defaults", path);
            return Ok(Self::default());
        }

        let config: Self =
            serde_json::from_str(&content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks values that serde accepts but the engine cannot use
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(Error::config("worker_threads must be at least 1"));
        }
        if self.code_registration == Some(Address::ZERO) {
            return Err(Error::config("code_registration must be non-zero"));
        }
        Ok(())
    }
}

/// Addresses are written as `"0x…"` strings; plain integers are accepted too
mod hex_address {
    use crate::types::Address;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &Option<Address>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(address) => serializer.serialize_str(&address.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Address>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(value)) => Ok(Some(Address(value))),
            Some(Raw::Text(text)) => text.parse::<Address>().map(Some).map_err(de::Error::custom),
        }
    }
}
