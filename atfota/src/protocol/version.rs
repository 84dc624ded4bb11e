//! Firmware version ordering.
//!
//! Versions are `major.minor.patch` with numeric fields. Anything else is treated
//! as unparseable, and an unparseable version is never considered newer, so a
//! malformed server record cannot cause an update loop.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A parsed `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl FromStr for FirmwareVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtocolError::MalformedMetadata(format!("invalid version {s:?}"));
        let mut fields = s.trim().split('.');
        let mut next = || -> Result<u32, ProtocolError> {
            let field = fields.next().ok_or_else(bad)?;
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            field.parse().map_err(|_| bad())
        };
        let version = Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if fields.next().is_some() {
            return Err(bad());
        }
        Ok(version)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compare two version strings numerically, field by field.
///
/// Returns `None` if either side does not parse.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a: FirmwareVersion = a.parse().ok()?;
    let b: FirmwareVersion = b.parse().ok()?;
    Some(a.cmp(&b))
}

/// Whether `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Some(Ordering::Greater)
}
