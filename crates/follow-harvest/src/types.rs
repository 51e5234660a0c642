//! Core data types: member identities, per-source records, and the merged
//! canonical record handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A member's handle. Case-sensitive; the only join key across stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberIdentity(String);

impl MemberIdentity {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MemberIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MemberIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one physical rendered fragment, assigned by the surface the
/// first time it sees the element. Unrelated to [`MemberIdentity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentToken(pub u64);

impl fmt::Display for FragmentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the DOM told us about a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identity: MemberIdentity,
    pub display_name: String,
    pub avatar_ref: String,
    pub profile_ref: String,
    /// Sticky: once true, never reset.
    pub reciprocal: bool,
}

/// What intercepted network payloads told us about a member.
///
/// Every field is filled at most once; the first non-null value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub reciprocal: Option<bool>,
}

/// The merged, caller-facing view of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub identity: MemberIdentity,
    pub display_name: String,
    pub avatar_ref: String,
    pub profile_ref: String,
    pub reciprocal: bool,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}
