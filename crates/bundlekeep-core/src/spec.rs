use std::fmt;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::package::normalized_name;

/// A parsed `name=version=build` package spec. Version and build are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionSpec {
    pub package_name: String,
    pub version: String,
    pub build_string: String,
}

impl VersionSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("package spec must not be empty"));
        }

        let (name, rest) = match trimmed.split_once('=') {
            Some((name, rest)) => (name.trim(), rest.trim_start_matches('=')),
            None => (trimmed, ""),
        };
        validate_package_name(name)?;

        let (version, build) = match rest.split_once('=') {
            Some((version, build)) => (version.trim(), build.trim()),
            None => (rest.trim(), ""),
        };

        let version = clean_version(version);
        if version
            .chars()
            .any(|c| c == '-' || c == '/' || c == '\\' || c.is_whitespace())
        {
            return Err(anyhow!("invalid version in package spec: {version}"));
        }

        Ok(Self {
            package_name: normalized_name(name),
            version,
            build_string: build.trim_matches('*').to_string(),
        })
    }

    pub fn new(package_name: &str, version: &str) -> Self {
        Self {
            package_name: normalized_name(package_name),
            version: clean_version(version),
            build_string: String::new(),
        }
    }

    pub fn with_version(&self, version: &str) -> Self {
        Self {
            package_name: self.package_name.clone(),
            version: clean_version(version),
            build_string: self.build_string.clone(),
        }
    }

    /// Spec string handed to the backend: `name=version=*build*`.
    pub fn pinned(&self) -> String {
        match (self.version.is_empty(), self.build_string.is_empty()) {
            (true, true) => self.package_name.clone(),
            (true, false) => format!("{}=*=*{}*", self.package_name, self.build_string),
            (false, true) => format!("{}={}", self.package_name, self.version),
            (false, false) => format!(
                "{}={}=*{}*",
                self.package_name, self.version, self.build_string
            ),
        }
    }

    pub fn env_name(&self) -> String {
        format!("{}-{}", self.package_name, self.version)
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pinned())
    }
}

fn clean_version(version: &str) -> String {
    let version = version.trim();
    let version = version.strip_suffix(".*").unwrap_or(version);
    if version == "*" {
        return String::new();
    }
    version.to_string()
}

fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("package name must not be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(anyhow!("invalid package name: {name}"));
    }
    Ok(())
}
