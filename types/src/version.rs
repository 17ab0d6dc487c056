//! Server API versions and the capability table derived from them.
//!
//! Optional protocol behavior is decided once per server instance: the
//! negotiated [`ApiVersion`] is turned into a [`CapabilitySet`] and every
//! call site asks for a named [`Capability`] instead of comparing versions.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// A `major.minor.patch` server version. Pre-release and build suffixes are
/// ignored when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid server version {0:?}")]
pub struct VersionParseError(String);

impl ApiVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    #[must_use]
    pub fn gte(self, other: Self) -> bool {
        self >= other
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ApiVersion {
    type Err = VersionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let core = raw
            .trim()
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u32, VersionParseError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| VersionParseError(raw.to_string())),
                None if required => Err(VersionParseError(raw.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(VersionParseError(raw.to_string()));
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for ApiVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Optional server behavior gated on the running version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    LogFile,
    CancellationPipe,
    NpmLocation,
    PluginProbeLocations,
    /// `open` accepts a `projectRootPath` hint.
    OpenProjectRootPath,
    Telemetry,
    Locale,
    InferredProjectPerProjectRoot,
    ValidateDefaultNpmLocation,
    NoGetErrOnBackgroundUpdate,
    ProjectLoadingEvents,
}

/// Minimum version for each capability.
const CAPABILITY_TABLE: &[(Capability, ApiVersion)] = &[
    (Capability::LogFile, ApiVersion::new(2, 2, 0)),
    (Capability::CancellationPipe, ApiVersion::new(2, 2, 2)),
    (Capability::NpmLocation, ApiVersion::new(2, 3, 0)),
    (Capability::PluginProbeLocations, ApiVersion::new(2, 3, 0)),
    (Capability::OpenProjectRootPath, ApiVersion::new(2, 3, 0)),
    (Capability::Telemetry, ApiVersion::new(2, 5, 0)),
    (Capability::Locale, ApiVersion::new(2, 7, 0)),
    (
        Capability::InferredProjectPerProjectRoot,
        ApiVersion::new(2, 7, 0),
    ),
    (
        Capability::ValidateDefaultNpmLocation,
        ApiVersion::new(3, 0, 0),
    ),
    (
        Capability::NoGetErrOnBackgroundUpdate,
        ApiVersion::new(3, 1, 0),
    ),
    (Capability::ProjectLoadingEvents, ApiVersion::new(3, 3, 0)),
];

impl Capability {
    const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Minimum server version supporting this capability.
    #[must_use]
    pub fn minimum_version(self) -> ApiVersion {
        CAPABILITY_TABLE
            .iter()
            .find(|(cap, _)| *cap == self)
            .map(|(_, v)| *v)
            .unwrap_or(ApiVersion::new(u32::MAX, 0, 0))
    }
}

/// Set of capabilities, computed once from a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    #[must_use]
    pub fn for_version(version: ApiVersion) -> Self {
        let bits = CAPABILITY_TABLE
            .iter()
            .filter(|(_, min)| version.gte(*min))
            .fold(0, |acc, (cap, _)| acc | cap.bit());
        Self(bits)
    }

    #[must_use]
    pub fn has(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("5.4.2".parse(), Ok(ApiVersion::new(5, 4, 2)));
        assert_eq!("3.1".parse(), Ok(ApiVersion::new(3, 1, 0)));
        assert_eq!("5.5.0-dev.20240601".parse(), Ok(ApiVersion::new(5, 5, 0)));
        assert_eq!(" 4.9.5 ".parse(), Ok(ApiVersion::new(4, 9, 5)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ApiVersion>().is_err());
        assert!("5".parse::<ApiVersion>().is_err());
        assert!("five.0.0".parse::<ApiVersion>().is_err());
        assert!("1.2.3.4".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn test_ordering_and_display() {
        assert!(ApiVersion::new(2, 10, 0) > ApiVersion::new(2, 9, 9));
        assert!(ApiVersion::new(3, 0, 0).gte(ApiVersion::new(3, 0, 0)));
        assert_eq!(ApiVersion::new(5, 4, 2).to_string(), "5.4.2");
    }

    #[test]
    fn test_deserialize_from_string() {
        let v: ApiVersion = serde_json::from_str("\"4.2.1\"").unwrap();
        assert_eq!(v, ApiVersion::new(4, 2, 1));
        assert!(serde_json::from_str::<ApiVersion>("\"nope\"").is_err());
    }

    #[test]
    fn test_capabilities_follow_table() {
        let old = CapabilitySet::for_version(ApiVersion::new(2, 2, 1));
        assert!(old.has(Capability::LogFile));
        assert!(!old.has(Capability::CancellationPipe));

        let mid = CapabilitySet::for_version(ApiVersion::new(2, 7, 0));
        assert!(mid.has(Capability::CancellationPipe));
        assert!(mid.has(Capability::Locale));
        assert!(!mid.has(Capability::NoGetErrOnBackgroundUpdate));

        let modern = CapabilitySet::for_version(ApiVersion::new(5, 4, 0));
        for (cap, _) in CAPABILITY_TABLE {
            assert!(modern.has(*cap), "{cap:?} missing on 5.4.0");
        }
    }

    #[test]
    fn test_minimum_version_lookup() {
        assert_eq!(
            Capability::Telemetry.minimum_version(),
            ApiVersion::new(2, 5, 0)
        );
    }
}
