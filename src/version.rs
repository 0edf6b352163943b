use crate::error::{Result, TelemetryError};
use std::fmt;
use std::str::FromStr;

/// Dotted client version `major.minor[.build[.revision]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: Option<u32>,
    pub revision: Option<u32>,
}

impl Version {
    /// `major.minor.build`, the form peers are scoped by.
    pub fn short(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.build.unwrap_or(0))
    }

    /// `major.minor.build.revision` with absent components as zero.
    pub fn full(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.major,
            self.minor,
            self.build.unwrap_or(0),
            self.revision.unwrap_or(0)
        )
    }
}

impl FromStr for Version {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TelemetryError::InvalidVersion(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(invalid());
        }
        let mut numbers = Vec::with_capacity(parts.len());
        for part in parts {
            // Reject signs and whitespace that u32::from_str would otherwise accept or choke on
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            numbers.push(part.parse::<u32>().map_err(|_| invalid())?);
        }
        Ok(Version {
            major: numbers[0],
            minor: numbers[1],
            build: numbers.get(2).copied(),
            revision: numbers.get(3).copied(),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(build) = self.build {
            write!(f, ".{build}")?;
        }
        if let Some(revision) = self.revision {
            write!(f, ".{revision}")?;
        }
        Ok(())
    }
}
