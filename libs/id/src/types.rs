//! Typed ID definitions for releases and the jobs that apply them.
//!
//! Upstream publishes numeric identifiers, so every ID here is a non-zero
//! integer. The `Cursor` is the exception: it is opaque and may be zero.

use crate::define_id;

// =============================================================================
// Release Model
// =============================================================================

define_id!(AppId, "app", u32);
define_id!(ReleaseId, "rel", u32);
define_id!(ContentItemId, "ci", u32);

// =============================================================================
// Scheduling
// =============================================================================

define_id!(JobId, "job", u64);

// =============================================================================
// Upstream Cursor
// =============================================================================

/// Opaque upstream position correlating a job with the event that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor(u64);

impl Cursor {
    /// Creates a cursor from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Cursor {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Cursor> for u64 {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

impl serde::Serialize for Cursor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Cursor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = u64::deserialize(deserializer)?;
        Ok(Self(raw))
    }
}

// =============================================================================
// Tests
// =============================================================================
