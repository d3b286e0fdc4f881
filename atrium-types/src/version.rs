//! Plugin versions and the dependency compatibility rule.

use crate::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A semantic plugin version (`major.minor.patch[-prerelease]`).
///
/// Parsing is delegated to `semver`; build metadata is accepted and kept,
/// but neither pre-release tags nor build metadata take part in
/// [`PluginVersion::satisfies`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginVersion(semver::Version);

impl PluginVersion {
    /// Creates a release version from its numeric components.
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Parses a version string.
    pub fn parse(input: &str) -> Result<Self, Error> {
        semver::Version::parse(input.trim())
            .map(Self)
            .map_err(|source| Error::InvalidVersion {
                input: input.to_string(),
                source,
            })
    }

    #[must_use]
    pub fn major(&self) -> u64 {
        self.0.major
    }

    #[must_use]
    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    #[must_use]
    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Pre-release tag, empty for release versions.
    #[must_use]
    pub fn pre_release(&self) -> &str {
        self.0.pre.as_str()
    }

    /// Returns true if this (installed) version satisfies `required`.
    ///
    /// The major version must match exactly. The minor version must be at
    /// least the required one, and when the minors are equal the patch must
    /// be at least the required patch.
    #[must_use]
    pub fn satisfies(&self, required: &PluginVersion) -> bool {
        if self.major() != required.major() {
            return false;
        }
        if self.minor() != required.minor() {
            return self.minor() > required.minor();
        }
        self.patch() >= required.patch()
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PluginVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PluginVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PluginVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
