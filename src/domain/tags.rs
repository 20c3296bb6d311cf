//! Entity Identifiers
//!
//! Typed, globally-unique tags distinguishing entity kind from an opaque
//! per-kind key. Tags are totally ordered so that batches assembled from
//! sets are deterministic. The wire form is `<kind>-<id>`, e.g.
//! `volume-100`, `filesystem-0/1`, `machine-2`.

use crate::error::Error;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Storage Kind
// =============================================================================

/// The two kinds of storage entity the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Volume,
    Filesystem,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Volume => write!(f, "volume"),
            StorageKind::Filesystem => write!(f, "filesystem"),
        }
    }
}

// =============================================================================
// Lifecycle State
// =============================================================================

/// Lifecycle state of an entity, owned by the controller.
///
/// Monotonic per entity: Alive -> Dying -> Dead, never regressing. The
/// engine only ever reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_alive(self) -> bool {
        self == Life::Alive
    }

    /// Dying and Dead are handled identically by the engine: the entity is
    /// on its way out and must be deprovisioned or removed.
    pub fn is_departing(self) -> bool {
        !self.is_alive()
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Life::Alive => write!(f, "alive"),
            Life::Dying => write!(f, "dying"),
            Life::Dead => write!(f, "dead"),
        }
    }
}

// =============================================================================
// Entity Tag
// =============================================================================

/// A typed entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Volume(String),
    Filesystem(String),
    Machine(String),
}

impl Tag {
    pub fn volume(id: impl Into<String>) -> Self {
        Tag::Volume(id.into())
    }

    pub fn filesystem(id: impl Into<String>) -> Self {
        Tag::Filesystem(id.into())
    }

    pub fn machine(id: impl Into<String>) -> Self {
        Tag::Machine(id.into())
    }

    /// The opaque per-kind key.
    pub fn id(&self) -> &str {
        match self {
            Tag::Volume(id) | Tag::Filesystem(id) | Tag::Machine(id) => id,
        }
    }

    /// The storage kind, if this tag names a storage entity.
    pub fn storage_kind(&self) -> Option<StorageKind> {
        match self {
            Tag::Volume(_) => Some(StorageKind::Volume),
            Tag::Filesystem(_) => Some(StorageKind::Filesystem),
            Tag::Machine(_) => None,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Tag::Volume(_) => "volume",
            Tag::Filesystem(_) => "filesystem",
            Tag::Machine(_) => "machine",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix(), self.id())
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidTag(s.to_string()))?;
        if id.is_empty() {
            return Err(Error::InvalidTag(s.to_string()));
        }
        match prefix {
            "volume" => Ok(Tag::Volume(id.to_string())),
            "filesystem" => Ok(Tag::Filesystem(id.to_string())),
            "machine" => Ok(Tag::Machine(id.to_string())),
            _ => Err(Error::InvalidTag(s.to_string())),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// =============================================================================
// Attachment Identifier
// =============================================================================

/// Identifies one (machine, storage entity) attachment pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttachmentId {
    pub machine_tag: Tag,
    pub attachment_tag: Tag,
}

impl AttachmentId {
    pub fn new(machine: Tag, storage: Tag) -> Self {
        Self {
            machine_tag: machine,
            attachment_tag: storage,
        }
    }

    pub fn storage_kind(&self) -> Option<StorageKind> {
        self.attachment_tag.storage_kind()
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine_tag, self.attachment_tag)
    }
}

// =============================================================================
// Provisioning Scope
// =============================================================================

/// The unit of reconciliation: either model-wide (resources created directly
/// against a backend) or bound to one machine (resources provisioned from
/// that machine's perspective, e.g. locally-attached block devices).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Model,
    Machine(Tag),
}

impl Scope {
    pub fn machine(&self) -> Option<&Tag> {
        match self {
            Scope::Model => None,
            Scope::Machine(tag) => Some(tag),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Model => write!(f, "model"),
            Scope::Machine(tag) => write!(f, "{tag}"),
        }
    }
}
