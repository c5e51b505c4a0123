//! `MAJOR.MINOR.PATCH` version numbers for deployment history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{KeelError, KeelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    /// Version assigned to the first revision of every deployment.
    pub const INITIAL: SemVer = SemVer { major: 1, minor: 0, patch: 0 };

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Largest component the store can hold.
    pub const MAX_PART: u64 = i64::MAX as u64;

    /// Every component fits a signed 64-bit column.
    pub fn in_range(self) -> bool {
        self.major <= Self::MAX_PART && self.minor <= Self::MAX_PART && self.patch <= Self::MAX_PART
    }

    fn step(self, part: u64) -> KeelResult<u64> {
        part.checked_add(1)
            .filter(|n| *n <= Self::MAX_PART)
            .ok_or_else(|| KeelError::Validation(format!("version {} cannot be bumped further", self)))
    }

    pub fn bump_major(self) -> KeelResult<Self> {
        Ok(Self::new(self.step(self.major)?, 0, 0))
    }

    pub fn bump_minor(self) -> KeelResult<Self> {
        Ok(Self::new(self.major, self.step(self.minor)?, 0))
    }

    pub fn bump_patch(self) -> KeelResult<Self> {
        Ok(Self::new(self.major, self.minor, self.step(self.patch)?))
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KeelError::Validation(format!("invalid version {:?} (expect MAJOR.MINOR.PATCH)", s));
        let parts: Vec<&str> = s.trim().split('.').collect();
        let [major, minor, patch] = parts.as_slice() else { return Err(bad()) };
        let num = |p: &str| -> Result<u64, KeelError> {
            // Leading zeros and signs are not valid semver components.
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) || (p.len() > 1 && p.starts_with('0')) {
                return Err(bad());
            }
            match p.parse::<u64>() {
                Ok(n) if n <= Self::MAX_PART => Ok(n),
                Ok(_) => Err(KeelError::Validation(format!(
                    "invalid version {:?}: components must not exceed {}",
                    s,
                    Self::MAX_PART
                ))),
                Err(_) => Err(bad()),
            }
        };
        Ok(Self::new(num(major)?, num(minor)?, num(patch)?))
    }
}

impl Serialize for SemVer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
