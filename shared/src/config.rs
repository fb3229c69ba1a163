use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::capabilities::http::ValidatedUrl;
use crate::schema::FieldRules;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const MAX_DATASET_FILES: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_label_keys() -> Vec<String> {
    vec!["nom".into(), "name".into()]
}

impl RepoConfig {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: None,
            api_base: default_api_base(),
        }
    }
}

/// Everything the editor needs to know about where datasets live and how
/// their attributes should be edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditorConfig {
    pub repo: RepoConfig,
    pub files: Vec<String>,
    #[serde(default)]
    pub fields: FieldRules,
    /// Attribute keys tried in order when naming a feature in commit messages.
    #[serde(default = "default_label_keys")]
    pub label_keys: Vec<String>,
}

impl EditorConfig {
    pub fn new(repo: RepoConfig, files: Vec<String>) -> Self {
        Self {
            repo,
            files,
            fields: FieldRules::default(),
            label_keys: default_label_keys(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo.owner.trim().is_empty() || self.repo.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "repository owner and name must be set".into(),
            ));
        }
        if self.repo.owner.contains('/') || self.repo.name.contains('/') {
            return Err(ConfigError::Invalid(
                "repository owner and name cannot contain '/'".into(),
            ));
        }
        if matches!(&self.repo.branch, Some(b) if b.trim().is_empty()) {
            return Err(ConfigError::Invalid("branch cannot be empty".into()));
        }
        ValidatedUrl::new(self.repo.api_base.as_str())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.files.is_empty() {
            return Err(ConfigError::Invalid("at least one dataset file is required".into()));
        }
        if self.files.len() > MAX_DATASET_FILES {
            return Err(ConfigError::Invalid(format!(
                "too many dataset files: {} exceeds maximum of {MAX_DATASET_FILES}",
                self.files.len()
            )));
        }
        for (i, file) in self.files.iter().enumerate() {
            if file.trim().is_empty() || file.starts_with('/') || file.split('/').any(|s| s == "..") {
                return Err(ConfigError::Invalid(format!("invalid dataset path '{file}'")));
            }
            if self.files[..i].contains(file) {
                return Err(ConfigError::Invalid(format!("duplicate dataset path '{file}'")));
            }
        }

        self.fields.validate().map_err(ConfigError::Invalid)
    }
}
