//! Configuration file support for testman
//!
//! Reads from .testman/config.toml. The file is a set of named sections of
//! string options, mirroring the tracker's ini layout:
//!
//! ```toml
//! [testcase-custom]
//! priority = "select"
//! "priority.options" = "|low|medium|high"
//!
//! [testcase-resource_workflow]
//! submit = "draft -> review"
//! "submit.permissions" = "TEST_EDIT"
//! ```
//!
//! Option order inside a section is preserved; it breaks ties when
//! ordering custom fields.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Ordered options of one configuration section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    options: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, option: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(name, _)| name == option)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_int(&self, option: &str) -> Option<i64> {
        self.get(option).and_then(|v| v.trim().parse().ok())
    }

    /// Split an option on `sep`, trimming every item. Empty items are kept.
    pub fn get_list(&self, option: &str, sep: char) -> Vec<String> {
        self.get(option)
            .map(|v| v.split(sep).map(|s| s.trim().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn set(&mut self, option: impl Into<String>, value: impl Into<String>) {
        let option = option.into();
        let value = value.into();
        match self.options.iter_mut().find(|(n, _)| *n == option) {
            Some(entry) => entry.1 = value,
            None => self.options.push((option, value)),
        }
    }
}

/// Configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: Vec<(String, Section)>,
}

impl Config {
    /// Load config from .testman/config.toml
    /// Returns default config if file doesn't exist or can't be parsed
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            match Self::load_from(&path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("ignoring {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse TOML text. Top-level tables become sections; scalar values are
    /// kept in their string form.
    pub fn parse(contents: &str) -> Result<Self> {
        let table: toml::Table = contents
            .parse()
            .map_err(|e: toml::de::Error| Error::Config(e.message().to_string()))?;

        let mut config = Config::default();
        for (name, value) in table {
            let toml::Value::Table(options) = value else {
                return Err(Error::Config(format!("'{}' is not a section", name)));
            };
            let mut section = Section::default();
            for (option, value) in options {
                let value = match value {
                    toml::Value::String(s) => s,
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    other => {
                        return Err(Error::Config(format!(
                            "option '{}.{}' must be a scalar, found {}",
                            name,
                            option,
                            other.type_str()
                        )))
                    }
                };
                section.set(option, value);
            }
            config.sections.push((name, section));
        }
        Ok(config)
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".testman").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Section by name, empty when absent
    pub fn section(&self, name: &str) -> Section {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(n, _)| n.as_str())
    }

    pub fn get(&self, section: &str, option: &str) -> Option<String> {
        self.sections
            .iter()
            .find(|(n, _)| n == section)
            .and_then(|(_, s)| s.get(option).map(str::to_string))
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        match self.sections.iter_mut().find(|(n, _)| n == section) {
            Some((_, s)) => s.set(option, value),
            None => {
                let mut s = Section::default();
                s.set(option, value);
                self.sections.push((section.to_string(), s));
            }
        }
    }
}
