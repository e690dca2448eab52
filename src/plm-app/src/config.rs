// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Name of the shared configuration file.
pub const CONFIG_FILE_NAME: &str = "plm-rs.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, String),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),

    #[error("config file {0} has no [{1}] section")]
    MissingSection(PathBuf, &'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Search order: current directory, then the XDG config dir, then /etc.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("plm-rs").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from("/etc/plm-rs").join(CONFIG_FILE_NAME));
    paths
}

/// Deserialize one top-level table of a TOML document.
///
/// `Ok(None)` means the table is absent.
pub fn parse_section<T: DeserializeOwned>(
    content: &str,
    key: &str,
    origin: &Path,
) -> Result<Option<T>, ConfigError> {
    let mut table: toml::Table = toml::from_str(content)
        .map_err(|e| ConfigError::Parse(origin.to_path_buf(), e.to_string()))?;
    let Some(section) = table.remove(key) else {
        return Ok(None);
    };
    section
        .try_into::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Parse(origin.to_path_buf(), e.to_string()))
}

fn load_section_from_file<T: DeserializeOwned>(
    path: &Path,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
    parse_section(&content, key, path)
}

/// A configuration struct stored as one section of `plm-rs.toml`.
pub trait ConfigFile: Sized + Default + DeserializeOwned {
    /// Section key, e.g. `"plm-server"`.
    fn section_key() -> &'static str;

    /// Check cross-field constraints after parsing.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let cfg = load_section_from_file::<Self>(path, Self::section_key())?
            .ok_or_else(|| ConfigError::MissingSection(path.to_path_buf(), Self::section_key()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load the first default-path file that has our section, or fall back
    /// to `Default` when none does.
    fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in config_search_paths() {
            if !path.exists() {
                continue;
            }
            if let Some(cfg) = load_section_from_file::<Self>(&path, Self::section_key())? {
                cfg.validate()?;
                return Ok((cfg, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Load from `explicit` when given, otherwise search the default paths.
    fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match explicit {
            Some(path) => Ok((Self::load_from_file(path)?, Some(path.to_path_buf()))),
            None => Self::load_from_default_paths(),
        }
    }
}
