use clap::ValueEnum;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Defaults loaded from ~/.mutascoperc (TOML format)
#[derive(Debug, Default, Deserialize)]
pub struct RcConfig {
    /// Default output format (table, json)
    #[serde(default)]
    pub format: Option<String>,
    /// Rows per output block
    #[serde(default)]
    pub max_block_size: Option<usize>,
}

impl RcConfig {
    /// Load ~/.mutascoperc, falling back to defaults when it is missing or
    /// cannot be parsed.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable rc file");
                Self::default()
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read rc file");
                Self::default()
            }
        }
    }

    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|h| h.join(".mutascoperc"))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn output_format(&self) -> OutputFormat {
        match self.format.as_deref() {
            Some("json") => OutputFormat::Json,
            _ => OutputFormat::Table,
        }
    }
}
