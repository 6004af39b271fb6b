//! A schema-driven, versioned content repository engine.
//!
//! Callers define typed entity schemas, create and update entities under
//! optimistic versioning, move them through a draft → published lifecycle,
//! and query them with cursor pagination, full-text search, and bounding-box
//! filters. Cross-entity uniqueness is enforced per named index, mutually
//! exclusive operations coordinate through leased advisory locks, and every
//! mutation lands in an append-only changelog that can replicate state
//! between independent instances.
//!
//! Storage goes through the [`backend::DatabaseAdapter`] contract;
//! [`SqliteAdapter`] is the bundled reference backend.
//!
//! ```
//! use stratadb::{Repository, Session, SqliteAdapter};
//!
//! # fn main() -> stratadb::Result<()> {
//! let repo = Repository::new(SqliteAdapter::open_in_memory()?)?;
//! let session = Session::new("docs");
//! assert!(repo.get_schema_specification().entity_types.is_empty());
//! # let _ = session;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod changelog;
pub mod entity;
pub mod error;
mod index;
pub mod lock;
pub mod query;
pub mod schema;
pub mod store;
pub mod validation;

pub use backend::{DatabaseAdapter, SqliteAdapter};
pub use changelog::{
    ChangelogEvent, ChangelogQuery, EntitySnapshot, EntityVersionRef, PublishRecord, SyncEvent,
    SyncEventPayload,
};
pub use entity::{
    Entity, EntityCreate, EntityInfo, EntityStatus, EntityUpdate, ResolvedAuthKey,
};
pub use error::{RepositoryError, Result};
pub use lock::{AdvisoryLock, AdvisoryLockOptions};
pub use query::{
    AuthFilter, BoundingBox, Connection, Edge, EntityPage, PageInfo, Paging, QueryOrder,
    SearchQuery,
};
pub use schema::{Schema, SchemaSpecification};
pub use store::{Repository, RepositoryConfig, Session, SCHEMA_UPDATE_LOCK};
pub use validation::{PathSegment, ValidationIssue, ValidationMode};
