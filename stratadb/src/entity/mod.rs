//! Entity model and the version/publish state machine.
//!
//! Statuses are never stored authority: every transition is computed from
//! the latest/published pointers plus the requested operation, so the stored
//! status column can always be reconstructed and never drifts.

pub(crate) mod ops;

use crate::error::{RepositoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityStatus {
    /// Created but never published.
    Draft,
    /// The latest version is the published version.
    Published,
    /// Published, but the latest version has moved past the published one.
    Modified,
    /// Previously published, publication explicitly withdrawn.
    Withdrawn,
    /// Excluded from default queries; history retained.
    Archived,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Draft => "draft",
            EntityStatus::Published => "published",
            EntityStatus::Modified => "modified",
            EntityStatus::Withdrawn => "withdrawn",
            EntityStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Result<EntityStatus> {
        match value {
            "draft" => Ok(EntityStatus::Draft),
            "published" => Ok(EntityStatus::Published),
            "modified" => Ok(EntityStatus::Modified),
            "withdrawn" => Ok(EntityStatus::Withdrawn),
            "archived" => Ok(EntityStatus::Archived),
            other => Err(RepositoryError::generic(format!(
                "unknown entity status '{other}'"
            ))),
        }
    }
}

/// Status after a new version is accepted. Only a published entity moves;
/// everything else stays in its bucket.
pub fn status_after_update(current: EntityStatus) -> EntityStatus {
    match current {
        EntityStatus::Published => EntityStatus::Modified,
        other => other,
    }
}

/// Status after publishing one specific version. Publishing an older version
/// while a newer latest exists leaves the entity `Modified`.
pub fn status_after_publish(published_is_latest: bool) -> EntityStatus {
    if published_is_latest {
        EntityStatus::Published
    } else {
        EntityStatus::Modified
    }
}

pub fn status_after_unpublish() -> EntityStatus {
    EntityStatus::Withdrawn
}

/// Status implied purely by the pointers, used when unarchiving.
pub fn status_from_pointers(has_published: bool, published_is_latest: bool) -> EntityStatus {
    if !has_published {
        EntityStatus::Draft
    } else if published_is_latest {
        EntityStatus::Published
    } else {
        EntityStatus::Modified
    }
}

/// Dirty bits set when a schema change may have invalidated stored content.
pub const DIRTY_LATEST: i64 = 1;
pub const DIRTY_PUBLISHED: i64 = 2;

/// Caller-facing entity metadata. The internal numeric id never appears
/// here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInfo {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    pub version: i64,
    pub auth_key: Option<String>,
    pub status: EntityStatus,
    pub valid: bool,
    pub valid_published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A full entity: identity, metadata, and the latest version's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: Uuid,
    pub info: EntityInfo,
    pub fields: Map<String, Value>,
}

/// An authorization key together with its server-side resolved form. The
/// engine stores both and filters on the resolved value; it never resolves
/// raw keys itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAuthKey {
    pub key: String,
    pub resolved: String,
}

/// Input to [`crate::Repository::create_entity`].
#[derive(Debug, Clone)]
pub struct EntityCreate {
    pub entity_type: String,
    pub name: String,
    pub auth_key: Option<ResolvedAuthKey>,
    pub fields: Map<String, Value>,
}

/// Input to [`crate::Repository::update_entity`]. Field keys present here
/// replace the latest version's value for that key; absent keys carry over.
#[derive(Debug, Clone, Default)]
pub struct EntityUpdate {
    pub name: Option<String>,
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            EntityStatus::Draft,
            EntityStatus::Published,
            EntityStatus::Modified,
            EntityStatus::Withdrawn,
            EntityStatus::Archived,
        ] {
            assert_eq!(EntityStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(EntityStatus::parse("limbo").is_err());
    }

    #[test]
    fn test_update_only_moves_published() {
        assert_eq!(
            status_after_update(EntityStatus::Published),
            EntityStatus::Modified
        );
        assert_eq!(status_after_update(EntityStatus::Draft), EntityStatus::Draft);
        assert_eq!(
            status_after_update(EntityStatus::Modified),
            EntityStatus::Modified
        );
        assert_eq!(
            status_after_update(EntityStatus::Withdrawn),
            EntityStatus::Withdrawn
        );
        assert_eq!(
            status_after_update(EntityStatus::Archived),
            EntityStatus::Archived
        );
    }

    #[test]
    fn test_publish_depends_on_latest() {
        assert_eq!(status_after_publish(true), EntityStatus::Published);
        assert_eq!(status_after_publish(false), EntityStatus::Modified);
    }

    #[test]
    fn test_pointer_derived_status() {
        assert_eq!(status_from_pointers(false, false), EntityStatus::Draft);
        assert_eq!(status_from_pointers(true, true), EntityStatus::Published);
        assert_eq!(status_from_pointers(true, false), EntityStatus::Modified);
    }
}
