//! Domain slug and upload filename validation.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::types::DomainError;

const MAX_NAME_LEN: usize = 64;

/// Validated domain slug: 1-64 chars of `[a-z0-9-]`, starting and ending alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DomainName(String);

impl DomainName {
    /// Normalize (trim, lowercase) and validate a raw domain name.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let normalized = raw.trim().to_lowercase();
        if is_valid_slug(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(DomainError::InvalidName(raw.to_string()))
        }
    }

    /// Borrow the slug.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_slug(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    bytes.len() <= MAX_NAME_LEN
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || *byte == b'-')
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DomainName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Reject filenames that could escape the domain's `pdfs/` directory.
pub fn validate_filename(filename: &str) -> Result<(), DomainError> {
    let invalid = filename.trim().is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        Err(DomainError::InvalidFilename(filename.to_string()))
    } else {
        Ok(())
    }
}
