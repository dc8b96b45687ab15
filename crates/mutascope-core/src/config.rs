use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default number of rows per output batch.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 65_536;

/// Settings for reading system tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemTablesConfig {
    /// Upper bound on rows per returned batch.
    pub max_block_size: usize,
    /// Accepted for interface compatibility; reads are single-stream.
    pub num_streams: usize,
}

impl Default for SystemTablesConfig {
    fn default() -> Self {
        SystemTablesConfig {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            num_streams: 1,
        }
    }
}

impl SystemTablesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_block_size(mut self, rows: usize) -> Self {
        self.max_block_size = rows;
        self
    }

    pub fn with_num_streams(mut self, streams: usize) -> Self {
        self.num_streams = streams;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_block_size == 0 {
            return Err(EngineError::Configuration(
                "max_block_size must be greater than zero".into(),
            ));
        }
        if self.num_streams == 0 {
            return Err(EngineError::Configuration(
                "num_streams must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse settings from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        let config: SystemTablesConfig = toml::from_str(s)
            .map_err(|e| EngineError::Configuration(format!("invalid settings: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
