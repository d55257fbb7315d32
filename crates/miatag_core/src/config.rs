use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MiaError, Result};

pub const DEFAULT_INDEX_URL: &str = "http://wiki.redump.org/index.php?title=MIA_Lists";
pub const DEFAULT_USER_AGENT: &str = "miatag/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SUFFIX: &str = " [mia-fixed]";
pub const DEFAULT_EXTENSION: &str = "dat";
pub const DEFAULT_CONFIG_PATH: &str = ".miatag/config.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MiaConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    /// A single MIA list applied to every input DAT.
    pub list_url: Option<String>,
    /// The "MIA Lists" index page linking one list per system.
    pub index_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct OutputSection {
    pub suffix: Option<String>,
    pub extension: Option<String>,
}

/// Where MIA status comes from for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePlan {
    Single { url: String },
    Index { url: String },
}

impl SourcePlan {
    pub fn url(&self) -> &str {
        match self {
            Self::Single { url } | Self::Index { url } => url,
        }
    }
}

impl MiaConfig {
    /// An explicit list URL wins over the index page.
    pub fn source_plan(&self) -> SourcePlan {
        if let Some(url) = non_empty(self.source.list_url.as_deref()) {
            return SourcePlan::Single {
                url: url.to_string(),
            };
        }
        SourcePlan::Index {
            url: non_empty(self.source.index_url.as_deref())
                .unwrap_or(DEFAULT_INDEX_URL)
                .to_string(),
        }
    }

    pub fn user_agent(&self) -> &str {
        non_empty(self.source.user_agent.as_deref()).unwrap_or(DEFAULT_USER_AGENT)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.source.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn suffix(&self) -> &str {
        self.output.suffix.as_deref().unwrap_or(DEFAULT_SUFFIX)
    }

    pub fn extension(&self) -> &str {
        non_empty(self.output.extension.as_deref())
            .map(|value| value.trim_start_matches('.'))
            .unwrap_or(DEFAULT_EXTENSION)
    }

    /// Apply `MIATAG_*` process environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = read("MIATAG_LIST_URL") {
            self.source.list_url = Some(value);
        }
        if let Some(value) = read("MIATAG_INDEX_URL") {
            self.source.index_url = Some(value);
        }
        if let Some(value) = read("MIATAG_USER_AGENT") {
            self.source.user_agent = Some(value);
        }
        if let Some(value) = read("MIATAG_TIMEOUT_MS") {
            let parsed = value
                .parse::<u64>()
                .map_err(|_| MiaError::Config(format!("MIATAG_TIMEOUT_MS is not a number: {value}")))?;
            self.source.timeout_ms = Some(parsed);
        }
        if let Some(value) = lookup("MIATAG_SUFFIX") {
            self.output.suffix = Some(value);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.suffix().trim().is_empty() {
            // An empty suffix would make the tagged copy collide with the original.
            return Err(MiaError::Config("output suffix cannot be empty".to_string()));
        }
        if self.suffix().contains(['/', '\\']) {
            return Err(MiaError::Config(format!(
                "output suffix cannot contain path separators: {}",
                self.suffix()
            )));
        }
        Ok(())
    }
}

/// Load and parse a MiaConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MiaConfig> {
    if !config_path.exists() {
        return Ok(MiaConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .map_err(|error| MiaError::Config(format!("failed to read {}: {error}", config_path.display())))?;
    toml::from_str(&content)
        .map_err(|error| MiaError::Config(format!("failed to parse {}: {error}", config_path.display())))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
