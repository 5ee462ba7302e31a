//! Runtime configuration, loaded from a JSON file with defaults for every field
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::types::Currency;

/// Largest page the ledger browser will return.
pub const MAX_LEDGER_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// sled database directory
    pub data_dir: String,
    /// currency applied to ledger amounts recorded without one
    pub base_currency: Currency,
    pub ledger_page_size: usize,
    pub max_description_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "card-offer.db".to_string(),
            base_currency: Currency::INR,
            ledger_page_size: MAX_LEDGER_PAGE_SIZE,
            max_description_len: 500,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_page_size == 0 || self.ledger_page_size > MAX_LEDGER_PAGE_SIZE {
            return Err(ConfigError::PageSize {
                got: self.ledger_page_size,
                max: MAX_LEDGER_PAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Clamp a caller-supplied page size to what the browser allows.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.ledger_page_size)
            .clamp(1, self.ledger_page_size)
    }
}
