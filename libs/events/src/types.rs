//! Release data model carried by upstream events.
//!
//! A `ReleaseDescriptor` is immutable once decoded; every consumer shares it
//! behind an `Arc`. Validation happens once, at decode time.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use cfgsync_id::{AppId, ContentItemId, ReleaseId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const RELEASE_CHANGED: &str = "release.changed";
}

/// Envelope schema version understood by this agent.
pub const RELEASE_CHANGED_VERSION: i32 = 1;

// =============================================================================
// Storage
// =============================================================================

/// Where a release's content lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// HTTP blob repository with range support.
    #[default]
    Repository,
    /// Object storage bucket, whole-object reads only.
    ObjectStore,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Repository => write!(f, "repository"),
            StorageMode::ObjectStore => write!(f, "object_store"),
        }
    }
}

/// TLS material for reaching the repository.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("ca_pem", &self.ca_pem.as_ref().map(|_| "<pem>"))
            .field("cert_pem", &self.cert_pem.as_ref().map(|_| "<pem>"))
            .field("key_pem", &self.key_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Root address of the repository plus optional TLS material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLocation {
    pub root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
}

impl RepositoryLocation {
    /// Builds the absolute URL of an object under this repository.
    pub fn url_for(&self, repository_path: &str) -> String {
        format!(
            "{}/{}",
            self.root.trim_end_matches('/'),
            repository_path.trim_start_matches('/')
        )
    }
}

// =============================================================================
// Content Items
// =============================================================================

/// Declared format of a content item. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Json,
    Yaml,
    Xml,
    Toml,
    #[default]
    Text,
    Binary,
}

/// Expected size and SHA-256 signature of a content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSpec {
    pub byte_size: u64,
    pub signature: String,
}

/// Where and how a content item lands on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementSpec {
    /// Directory relative to the release's content root (e.g. `/etc`).
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_group: String,
    /// Octal permission bits such as `644`; empty keeps the process umask.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub privilege: String,
}

impl PlacementSpec {
    /// Parses the permission bits, if any were declared.
    pub fn mode(&self) -> Result<Option<u32>, EventError> {
        let raw = self.privilege.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let mode = u32::from_str_radix(raw, 8)
            .map_err(|_| EventError::InvalidPayload(format!("invalid privilege '{raw}'")))?;
        if mode > 0o7777 {
            return Err(EventError::InvalidPayload(format!(
                "privilege '{raw}' out of range"
            )));
        }
        Ok(Some(mode))
    }
}

/// One file to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItemMeta {
    pub id: ContentItemId,
    pub content: ContentSpec,
    pub placement: PlacementSpec,
    pub repository_path: String,
}

impl ContentItemMeta {
    /// Path of the file relative to the release's content root.
    ///
    /// Leading separators in the placement path are dropped, so `/etc` and
    /// `etc` resolve to the same location.
    pub fn relative_path(&self) -> PathBuf {
        let mut out = PathBuf::new();
        for component in Path::new(&self.placement.path).components() {
            if let Component::Normal(part) = component {
                out.push(part);
            }
        }
        out.push(&self.placement.name);
        out
    }

    /// Checks the metadata for values that can never be materialized.
    pub fn validate(&self) -> Result<(), EventError> {
        let invalid = |reason: &str| EventError::InvalidContentItem {
            id: self.id.get(),
            reason: reason.to_string(),
        };

        let name = self.placement.name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(invalid("name must be a single path segment"));
        }
        if Path::new(&self.placement.path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(invalid("path must not contain '..'"));
        }
        if self.repository_path.trim().is_empty() {
            return Err(invalid("repository path is empty"));
        }
        let signature = self.content.signature.as_str();
        if signature.len() != 64 || !signature.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("signature must be a 64 character sha256 hex digest"));
        }
        self.placement
            .mode()
            .map_err(|e| invalid(&e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// Release Descriptor
// =============================================================================

/// One published release of an application's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub app_id: AppId,
    pub release_id: ReleaseId,
    #[serde(default)]
    pub storage_mode: StorageMode,
    pub repository: RepositoryLocation,
    #[serde(default)]
    pub content_items: Vec<ContentItemMeta>,
}

impl ReleaseDescriptor {
    /// Deep copy with repository transport secrets removed.
    #[must_use]
    pub fn without_secrets(&self) -> Self {
        let mut copy = self.clone();
        copy.repository.tls = None;
        copy
    }

    /// Total bytes across all content items.
    pub fn total_bytes(&self) -> u64 {
        self.content_items.iter().map(|i| i.content.byte_size).sum()
    }

    /// Validates every content item and rejects duplicate item IDs.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.repository.root.trim().is_empty() {
            return Err(EventError::InvalidPayload(
                "repository root is empty".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.content_items.len());
        let mut paths = HashSet::with_capacity(self.content_items.len());
        for item in &self.content_items {
            item.validate()?;
            if !seen.insert(item.id) {
                return Err(EventError::InvalidContentItem {
                    id: item.id.get(),
                    reason: "duplicate item id".to_string(),
                });
            }
            if !paths.insert(item.relative_path()) {
                return Err(EventError::InvalidContentItem {
                    id: item.id.get(),
                    reason: "duplicate target path".to_string(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
