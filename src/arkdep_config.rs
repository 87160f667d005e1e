//! Patching of arkdep's own configuration file.
//!
//! `<root>/arkdep/config` is a sourced shell fragment made of assignments
//! like `repo_url='https://...'`. Only quoted assignments are recognized and
//! rewritten; every other line (comments, unquoted values, shell logic) is
//! kept byte for byte. Keys that are not present are not added.

use crate::error::{DeployError, Result};
use crate::templates::write_file;
use std::fmt;
use std::path::Path;

pub const REPO_URL_KEY: &str = "repo_url";
pub const REPO_IMAGE_KEY: &str = "repo_default_image";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Assignment {
        /// Leading whitespace and an optional `export `
        prefix: String,
        key: String,
        value: String,
        /// Whatever followed the closing quote (usually a comment)
        rest: String,
        /// Original text, reproduced while the value is unchanged
        raw: String,
    },
    Other(String),
}

impl Line {
    fn parse(raw: &str) -> Self {
        Self::parse_assignment(raw).unwrap_or_else(|| Self::Other(raw.to_string()))
    }

    fn parse_assignment(raw: &str) -> Option<Self> {
        let body = raw.trim_start();
        let mut prefix = raw[..raw.len() - body.len()].to_string();
        let body = match body.strip_prefix("export ") {
            Some(stripped) => {
                prefix.push_str("export ");
                stripped.trim_start()
            }
            None => body,
        };

        let key_len = body
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(body.len());
        if key_len == 0 {
            return None;
        }
        let (key, after_key) = body.split_at(key_len);

        let after_eq = after_key.trim_start().strip_prefix('=')?.trim_start();
        let quote = after_eq.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let quoted = &after_eq[1..];
        let end = quoted.find(['\'', '"'])?;
        if quoted[end..].chars().next() != Some(quote) {
            return None;
        }

        Some(Self::Assignment {
            prefix,
            key: key.to_string(),
            value: quoted[..end].to_string(),
            rest: quoted[end + 1..].to_string(),
            raw: raw.to_string(),
        })
    }
}

/// Line-structured view of arkdep's config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArkdepConfig {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl ArkdepConfig {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(Line::parse).collect(),
            trailing_newline: content.ends_with('\n'),
        }
    }

    /// Current value of a quoted assignment
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Assignment { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Rewrite every quoted assignment of `key` to `key='value'`.
    /// Returns whether anything matched.
    pub fn set(&mut self, key: &str, new_value: &str) -> bool {
        let mut matched = false;
        for line in &mut self.lines {
            if let Line::Assignment {
                prefix,
                key: k,
                value,
                rest,
                raw,
            } = line
            {
                if k == key {
                    *value = new_value.to_string();
                    *raw = format!("{}{}='{}'{}", prefix, k, new_value, rest);
                    matched = true;
                }
            }
        }
        matched
    }
}

impl fmt::Display for ArkdepConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            match line {
                Line::Assignment { raw, .. } | Line::Other(raw) => f.write_str(raw)?,
            }
        }
        if self.trailing_newline {
            f.write_str("\n")?;
        }
        Ok(())
    }
}

/// Point arkdep at a different repository and/or default image.
///
/// Nothing to do (and `Ok(false)`) when no override is given or when arkdep
/// did not create a config file.
pub fn apply_repo_overrides(
    path: &Path,
    repo_url: Option<&str>,
    repo_image: Option<&str>,
) -> Result<bool> {
    let repo_url = repo_url.filter(|v| !v.is_empty());
    let repo_image = repo_image.filter(|v| !v.is_empty());
    if repo_url.is_none() && repo_image.is_none() {
        log::debug!("No arkdep repository overrides configured");
        return Ok(false);
    }
    if !path.exists() {
        log::info!("{} does not exist, leaving arkdep defaults", path.display());
        return Ok(false);
    }

    let content = std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
    let mut config = ArkdepConfig::parse(&content);

    for (key, value) in [(REPO_URL_KEY, repo_url), (REPO_IMAGE_KEY, repo_image)] {
        if let Some(value) = value {
            if config.set(key, value) {
                log::info!("arkdep config: {} set to '{}'", key, value);
            } else {
                log::warn!("arkdep config has no quoted {} assignment, not changed", key);
            }
        }
    }

    write_file(path, &config.to_string())?;
    Ok(true)
}
