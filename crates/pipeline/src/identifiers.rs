//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive, so a [`RepositoryId`] can never be confused with some
//! other integer that happens to flow through the same code path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers: GitHub-integer-backed
// ---------------------------------------------------------------------------

/// Identifies a repository by the numeric id the hosting platform assigned to it.
///
/// This is the identity of a [`crate::RepositoryRef`] and the key of every
/// durable [`crate::RepositoryRecord`]. Names can change on rename; ids cannot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RepositoryId(u64);

impl RepositoryId {
    /// Creates a new identifier from a raw integer.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying integer value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single orchestration run.
///
/// Generated fresh for every run; propagated through spans and returned by the
/// trigger surface so callers can poll for the terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`RunId`] from an existing UUID (e.g. parsed from a request path).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed
// ---------------------------------------------------------------------------

/// The login of the organization whose repositories are tallied (e.g. `"acme"`).
///
/// Only valid GitHub logins are representable, so the name can be placed in a
/// URL path without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct OrganizationName(String);

impl OrganizationName {
    /// Human-readable form of the accepted syntax.
    pub const REQUIREMENTS: &'static str =
        "Organization name must be 1-39 ASCII letters, digits or hyphens, not starting with a hyphen";

    const MAX_LEN: usize = 39;

    /// Creates a new organization name from a GitHub login.
    ///
    /// Surrounding whitespace is trimmed. Returns `None` unless what remains is
    /// 1 to 39 ASCII alphanumerics or hyphens and does not start with a hyphen.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        let trimmed = v.trim();
        if !Self::is_valid_login(trimmed) {
            None
        } else if trimmed.len() == v.len() {
            Some(Self(v))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    fn is_valid_login(login: &str) -> bool {
        !login.is_empty()
            && login.len() <= Self::MAX_LEN
            && !login.starts_with('-')
            && login.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    }

    /// Returns the organization name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrganizationName {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(Self::REQUIREMENTS)
    }
}

impl std::fmt::Display for OrganizationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
