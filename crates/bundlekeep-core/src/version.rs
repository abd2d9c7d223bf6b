use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use pep440_rs::Version;

/// A package version ordered by Python packaging rules.
///
/// Strings that are not valid PEP 440 versions are kept as `Legacy` and sort
/// before every valid release, lexically among themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PackageVersion {
    Legacy(String),
    Release(Version),
}

impl PackageVersion {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match Version::from_str(trimmed) {
            Ok(version) => Self::Release(version),
            Err(_) => Self::Legacy(trimmed.to_string()),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(raw) => f.write_str(raw),
            Self::Release(version) => write!(f, "{version}"),
        }
    }
}

/// A version is stable when its last dot-separated segment carries no letters.
///
/// `0.4.15` is stable; `0.4.15rc1`, `0.4.15dev0` and `0.4.15beta` are not.
pub fn is_stable_version(version: &str) -> bool {
    let last = version.rsplit('.').next().unwrap_or(version);
    !last.chars().any(|c| c.is_ascii_alphabetic())
}

pub fn sort_versions<I, S>(versions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut sorted = versions
        .into_iter()
        .map(Into::into)
        .filter(|version: &String| seen.insert(version.clone()))
        .collect::<Vec<String>>();
    sorted.sort_by_cached_key(|version| PackageVersion::parse(version));
    sorted
}

/// Whether `latest` is strictly newer than `current`. An empty `latest` never is.
pub fn is_update(latest: &str, current: &str) -> bool {
    if latest.trim().is_empty() {
        return false;
    }
    PackageVersion::parse(latest) > PackageVersion::parse(current)
}
