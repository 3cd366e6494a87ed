//! Plugin version and compatibility rules

use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Plugin version: `MAJOR.MINOR.PATCH[-PRERELEASE]`.
///
/// Ordering compares `(major, minor, patch)` and places any pre-release
/// before the matching release. Pre-releases of the same triple compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginVersion {
    /// Major version
    pub major: u64,
    /// Minor version
    pub minor: u64,
    /// Patch version
    pub patch: u64,
    /// Pre-release label, empty for releases
    pub pre_release: String,
}

impl PluginVersion {
    /// Create a release version
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: String::new(),
        }
    }

    /// Attach a pre-release label
    pub fn with_pre_release(mut self, label: impl Into<String>) -> Self {
        self.pre_release = label.into();
        self
    }

    /// Whether this version satisfies a `required` version.
    ///
    /// Majors must match and this minor must be at least the required minor.
    pub fn is_compatible_with(&self, required: &PluginVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }

    /// `0.0.0` is reserved and never valid for a plugin
    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.patch == 0
    }

    /// Whether a pre-release label is present
    pub fn is_pre_release(&self) -> bool {
        !self.pre_release.is_empty()
    }
}

impl PartialEq for PluginVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PluginVersion {}

impl PartialOrd for PluginVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| self.pre_release.is_empty().cmp(&other.pre_release.is_empty()))
    }
}

impl FromStr for PluginVersion {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = semver::Version::parse(s.trim())
            .map_err(|e| PluginError::InvalidVersion(format!("{s}: {e}")))?;

        Ok(Self {
            major: parsed.major,
            minor: parsed.minor,
            patch: parsed.patch,
            pre_release: parsed.pre.as_str().to_string(),
        })
    }
}

impl TryFrom<String> for PluginVersion {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PluginVersion> for String {
    fn from(version: PluginVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre_release.is_empty() {
            write!(f, "-{}", self.pre_release)?;
        }
        Ok(())
    }
}
