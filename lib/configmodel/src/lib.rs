/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Configuration model: the `Config` trait read by every crate that has
//! a tunable knob, and `ConfigSet`, a layered in-memory implementation
//! with a minimal ini-style text loader.
//!
//! On-disk config discovery (user/system rc files) belongs to the
//! front-end; the core only consumes values through the trait.

use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {section}.{name}: {message}")]
    Invalid {
        section: String,
        name: String,
        message: String,
    },

    #[error("config error: line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Read access to configuration.
pub trait Config {
    /// The raw string value of `section.name`, if set.
    fn get(&self, section: &str, name: &str) -> Option<&str>;

    /// A parsed value. `Ok(None)` when unset; `Err` when set but
    /// unparsable, reported before any state changes.
    fn get_opt<T: FromStr>(&self, section: &str, name: &str) -> Result<Option<T>, ConfigError> {
        match self.get(section, name) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|_| {
                ConfigError::Invalid {
                    section: section.to_string(),
                    name: name.to_string(),
                    message: format!("invalid value {:?}", value),
                }
            }),
        }
    }

    /// A parsed value with a default.
    fn get_or<T: FromStr>(
        &self,
        section: &str,
        name: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get_opt(section, name)?.unwrap_or(default))
    }

    /// A boolean value. Accepts true/false, yes/no, on/off, 1/0.
    fn get_bool(&self, section: &str, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(section, name) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    section: section.to_string(),
                    name: name.to_string(),
                    message: format!("invalid boolean {:?}", value),
                }),
            },
        }
    }
}

/// Layered key-value store. Later sets win. Section and key order is
/// preserved for reproducible listing.
#[derive(Debug, Default, Clone)]
pub struct ConfigSet {
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set(
        &mut self,
        section: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.sections
            .entry(section.into())
            .or_default()
            .insert(name.into(), value.into());
    }

    pub fn unset(&mut self, section: &str, name: &str) {
        if let Some(keys) = self.sections.get_mut(section) {
            keys.shift_remove(name);
        }
    }

    /// Parse ini-style text: `[section]` headers and `name = value`
    /// lines; `#` and `;` start comments.
    pub fn load_text(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut section: Option<String> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or(ConfigError::Parse {
                    line: idx + 1,
                    message: "unclosed section header".to_string(),
                })?;
                section = Some(name.trim().to_string());
                continue;
            }
            let (name, value) = line.split_once('=').ok_or(ConfigError::Parse {
                line: idx + 1,
                message: format!("expected name = value, got {:?}", line),
            })?;
            let section = section.as_deref().ok_or(ConfigError::Parse {
                line: idx + 1,
                message: "value outside any [section]".to_string(),
            })?;
            self.set(section, name.trim(), value.trim());
        }
        Ok(())
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(|s| s.as_str())
    }

    pub fn keys(&self, section: &str) -> impl Iterator<Item = &str> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|keys| keys.keys().map(|k| k.as_str()))
    }
}

impl Config for ConfigSet {
    fn get(&self, section: &str, name: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(name))
            .map(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut config = ConfigSet::new();
        config.set("revlog", "chain-len-cap", "500");
        assert_eq!(config.get("revlog", "chain-len-cap"), Some("500"));
        assert_eq!(
            config.get_opt::<u32>("revlog", "chain-len-cap").unwrap(),
            Some(500)
        );
        assert_eq!(config.get_or("revlog", "missing", 7u32).unwrap(), 7);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let mut config = ConfigSet::new();
        config.set("lock", "timeout", "soon");
        assert!(config.get_opt::<u64>("lock", "timeout").is_err());
    }

    #[test]
    fn test_bool_spellings() {
        let mut config = ConfigSet::new();
        for (value, expected) in
            [("yes", true), ("off", false), ("1", true), ("False", false)]
        {
            config.set("ui", "interactive", value);
            assert_eq!(config.get_bool("ui", "interactive", false).unwrap(), expected);
        }
        config.set("ui", "interactive", "maybe");
        assert!(config.get_bool("ui", "interactive", false).is_err());
    }

    #[test]
    fn test_load_text() {
        let mut config = ConfigSet::new();
        config
            .load_text(
                "# comment\n[merge]\nsimilarity = 80\ntool = :merge\n\n[lock]\ntimeout = 10\n",
            )
            .unwrap();
        assert_eq!(config.get("merge", "similarity"), Some("80"));
        assert_eq!(config.get("lock", "timeout"), Some("10"));
        assert!(config.load_text("orphan = 1").is_err());
        assert!(config.load_text("[unclosed\n").is_err());
    }

    #[test]
    fn test_later_sets_win() {
        let mut config = ConfigSet::new();
        config.load_text("[merge]\nsimilarity = 80\n").unwrap();
        config.load_text("[merge]\nsimilarity = 95\n").unwrap();
        assert_eq!(config.get("merge", "similarity"), Some("95"));
    }
}
