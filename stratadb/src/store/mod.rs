//! The repository façade.
//!
//! [`Repository`] owns a [`DatabaseAdapter`] plus the current immutable
//! schema. The schema is replaced wholesale on update (never mutated), so
//! concurrent readers always see a consistent schema object. Schema updates
//! themselves are serialized through the advisory lock manager under
//! [`SCHEMA_UPDATE_LOCK`].

use crate::backend::{with_root_transaction, DatabaseAdapter, SqlValue, TransactionContext};
use crate::changelog::{append_event, SyncEventPayload};
use crate::entity::{Entity, EntityInfo, EntityStatus, DIRTY_LATEST, DIRTY_PUBLISHED};
use crate::error::{RepositoryError, Result};
use crate::lock::AdvisoryLockOptions;
use crate::schema::{Schema, SchemaSpecification};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Well-known lock name serializing schema updates across writers.
pub const SCHEMA_UPDATE_LOCK: &str = "schema-update";

/// Tunables. Defaults match production behavior; tests shrink them.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub default_page_size: i64,
    pub max_page_size: i64,
    /// How many suffixed retries a colliding entity name gets before the
    /// write fails as `Generic`.
    pub name_retry_attempts: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            default_page_size: 25,
            max_page_size: 100,
            name_retry_attempts: 10,
        }
    }
}

/// The caller identity attached to every mutating operation. The engine
/// does not authenticate; it records the already-authenticated session id
/// and enforces the read-only flag.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub readonly: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Session {
            session_id: session_id.into(),
            readonly: false,
        }
    }

    pub fn read_only(session_id: impl Into<String>) -> Self {
        Session {
            session_id: session_id.into(),
            readonly: true,
        }
    }
}

/// A schema-driven, versioned content repository over one storage backend.
pub struct Repository<A: DatabaseAdapter> {
    pub(crate) adapter: A,
    schema: RwLock<Arc<Schema>>,
    pub(crate) config: RepositoryConfig,
}

impl<A: DatabaseAdapter> Repository<A> {
    pub fn new(adapter: A) -> Result<Self> {
        Self::with_config(adapter, RepositoryConfig::default())
    }

    pub fn with_config(adapter: A, config: RepositoryConfig) -> Result<Self> {
        let schema = load_current_schema(&adapter)?;
        Ok(Repository {
            adapter,
            schema: RwLock::new(Arc::new(schema)),
            config,
        })
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// The current schema. Cheap to call; holds no lock after returning.
    pub fn schema(&self) -> Arc<Schema> {
        match self.schema.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub(crate) fn swap_schema(&self, schema: Arc<Schema>) {
        let mut guard = match self.schema.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = schema;
    }

    pub fn get_schema_specification(&self) -> SchemaSpecification {
        self.schema().spec().clone()
    }

    /// Validate and apply a new schema specification.
    ///
    /// The submitted version must be exactly one past the stored version;
    /// anything else is a `Conflict` (a concurrent writer got there first,
    /// or the caller edited a stale specification). Every entity is marked
    /// dirty so the revalidation sweep rechecks stored content against the
    /// new schema.
    pub fn update_schema_specification(
        &self,
        session: &Session,
        spec: SchemaSpecification,
    ) -> Result<()>
    where
        A: Sync,
    {
        self.require_writable(session)?;
        let schema = Schema::validate(spec)?;

        self.with_advisory_lock(SCHEMA_UPDATE_LOCK, &AdvisoryLockOptions::default(), || {
            with_root_transaction(&self.adapter, |ctx| {
                let current = current_schema_version(ctx)?;
                if schema.version() != current + 1 {
                    return Err(RepositoryError::conflict(
                        "schema-version",
                        format!("expected version {}, got {}", current + 1, schema.version()),
                    ));
                }
                let now = Utc::now();
                insert_schema_version(ctx, schema.spec(), &now)?;
                mark_all_entities_dirty(ctx)?;
                append_event(
                    ctx,
                    &session.session_id,
                    Uuid::new_v4(),
                    &now,
                    &SyncEventPayload::UpdateSchema {
                        specification: schema.spec().clone(),
                    },
                    &[],
                )?;
                Ok(())
            })
        })?;

        self.swap_schema(Arc::new(schema));
        Ok(())
    }

    pub(crate) fn require_writable(&self, session: &Session) -> Result<()> {
        if session.readonly {
            return Err(RepositoryError::bad_request("session is read-only"));
        }
        Ok(())
    }
}

fn load_current_schema<A: DatabaseAdapter>(adapter: &A) -> Result<Schema> {
    let row = adapter.query_opt(
        "SELECT specification FROM schema_versions ORDER BY version DESC LIMIT 1",
        &[],
    )?;
    match row {
        Some(row) => {
            let spec: SchemaSpecification = serde_json::from_str(row.text(0)?)?;
            Schema::validate(spec)
        }
        None => Ok(Schema::empty()),
    }
}

pub(crate) fn current_schema_version<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
) -> Result<u64> {
    let row = ctx.query_one("SELECT COALESCE(MAX(version), 0) FROM schema_versions", &[])?;
    Ok(row.integer(0)? as u64)
}

pub(crate) fn insert_schema_version<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    spec: &SchemaSpecification,
    now: &DateTime<Utc>,
) -> Result<()> {
    let serialized = serde_json::to_string(spec)?;
    let inserted = ctx.execute(
        "INSERT OR IGNORE INTO schema_versions (version, specification, created_at)
         VALUES (?1, ?2, ?3)",
        &[
            SqlValue::Integer(spec.version as i64),
            SqlValue::Text(serialized),
            SqlValue::text(format_time(now)),
        ],
    )?;
    if inserted == 0 {
        return Err(RepositoryError::conflict(
            "schema-version",
            format!("version {} already exists", spec.version),
        ));
    }
    Ok(())
}

/// Flag every entity for revalidation after a schema change. Entities
/// without a published pointer only need their latest content rechecked.
pub(crate) fn mark_all_entities_dirty<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
) -> Result<()> {
    ctx.execute(
        &format!(
            "UPDATE entities SET dirty = CASE
                 WHEN published_entity_versions_id IS NULL THEN {DIRTY_LATEST}
                 ELSE {both}
             END",
            both = DIRTY_LATEST | DIRTY_PUBLISHED
        ),
        &[],
    )?;
    Ok(())
}

// ── Time ──

pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339()
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| RepositoryError::generic(format!("bad stored timestamp '{raw}': {err}")))
}

// ── Sequences and principals ──

/// Atomic increment-and-return on a named counter row. The UPDATE
/// serializes allocators inside the owning transaction, so the counter is
/// consistent across process instances.
pub(crate) fn next_sequence<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    name: &str,
) -> Result<i64> {
    ctx.execute(
        "INSERT OR IGNORE INTO sequences (name, value) VALUES (?1, 0)",
        &[SqlValue::text(name)],
    )?;
    let row = ctx.query_one(
        "UPDATE sequences SET value = value + 1 WHERE name = ?1 RETURNING value",
        &[SqlValue::text(name)],
    )?;
    row.integer(0)
}

/// Map a session id to its stable internal principal id, creating the row
/// on first sight.
pub(crate) fn ensure_principal<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    session_id: &str,
) -> Result<i64> {
    ctx.execute(
        "INSERT OR IGNORE INTO principals (session_id, created_at) VALUES (?1, ?2)",
        &[
            SqlValue::text(session_id),
            SqlValue::text(format_time(&Utc::now())),
        ],
    )?;
    let row = ctx.query_one(
        "SELECT id FROM principals WHERE session_id = ?1",
        &[SqlValue::text(session_id)],
    )?;
    row.integer(0)
}

// ── Entity rows ──

/// Internal image of one `entities` row. Never leaves the crate; the
/// numeric id in particular is backend-private.
#[derive(Debug, Clone)]
pub(crate) struct EntityRow {
    pub id: i64,
    pub uuid: Uuid,
    pub entity_type: String,
    pub name: String,
    pub auth_key: Option<String>,
    pub resolved_auth_key: Option<String>,
    pub status: EntityStatus,
    pub valid: bool,
    pub valid_published: Option<bool>,
    pub dirty: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub latest_version_id: Option<i64>,
    pub published_version_id: Option<i64>,
}

const ENTITY_ROW_COLUMNS: &str = "id, uuid, type, name, auth_key, resolved_auth_key, status, \
     valid, valid_published, dirty, created_at, updated_at, \
     latest_entity_versions_id, published_entity_versions_id";

fn entity_row_from(row: &crate::backend::SqlRow) -> Result<EntityRow> {
    Ok(EntityRow {
        id: row.integer(0)?,
        uuid: parse_uuid(row.text(1)?)?,
        entity_type: row.text(2)?.to_string(),
        name: row.text(3)?.to_string(),
        auth_key: row.opt_text(4)?.map(str::to_string),
        resolved_auth_key: row.opt_text(5)?.map(str::to_string),
        status: EntityStatus::parse(row.text(6)?)?,
        valid: row.boolean(7)?,
        valid_published: row.opt_boolean(8)?,
        dirty: row.integer(9)?,
        created_at: parse_time(row.text(10)?)?,
        updated_at: parse_time(row.text(11)?)?,
        latest_version_id: row.opt_integer(12)?,
        published_version_id: row.opt_integer(13)?,
    })
}

pub(crate) fn load_entity_row<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    id: &Uuid,
) -> Result<EntityRow> {
    let row = ctx
        .query_opt(
            &format!("SELECT {ENTITY_ROW_COLUMNS} FROM entities WHERE uuid = ?1"),
            &[SqlValue::text(id.to_string())],
        )?
        .ok_or_else(|| RepositoryError::not_found(format!("entity {id}")))?;
    entity_row_from(&row)
}

pub(crate) fn load_entity_row_internal<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    internal_id: i64,
) -> Result<EntityRow> {
    let row = ctx
        .query_opt(
            &format!("SELECT {ENTITY_ROW_COLUMNS} FROM entities WHERE id = ?1"),
            &[SqlValue::Integer(internal_id)],
        )?
        .ok_or_else(|| RepositoryError::not_found("entity"))?;
    entity_row_from(&row)
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|err| RepositoryError::generic(format!("bad stored uuid '{raw}': {err}")))
}

/// Load one stored version's number and fields.
pub(crate) fn load_version<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    version_id: i64,
) -> Result<(i64, Map<String, Value>)> {
    let row = ctx.query_one(
        "SELECT version, fields FROM entity_versions WHERE id = ?1",
        &[SqlValue::Integer(version_id)],
    )?;
    let fields = parse_fields(row.text(1)?)?;
    Ok((row.integer(0)?, fields))
}

pub(crate) fn parse_fields(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(RepositoryError::generic("stored fields are not an object")),
    }
}

/// Assemble the caller-facing entity from its row plus latest version.
pub(crate) fn assemble_entity<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    row: &EntityRow,
) -> Result<Entity> {
    let (version, fields) = match row.latest_version_id {
        Some(version_id) => load_version(ctx, version_id)?,
        None => (0, Map::new()),
    };
    Ok(Entity {
        id: row.uuid,
        info: EntityInfo {
            entity_type: row.entity_type.clone(),
            name: row.name.clone(),
            version,
            auth_key: row.auth_key.clone(),
            status: row.status,
            valid: row.valid,
            valid_published: row.valid_published.unwrap_or(false),
            created_at: row.created_at,
            updated_at: row.updated_at,
        },
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteAdapter;
    use crate::schema::parse_spec_str;

    fn spec_v(version: u64) -> SchemaSpecification {
        parse_spec_str(&format!(
            r#"
version: {version}
entityTypes:
  - name: Article
    fields:
      - name: title
        type: string
        required: true
"#
        ))
        .unwrap()
    }

    fn repo() -> Repository<SqliteAdapter> {
        Repository::new(SqliteAdapter::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_schema_starts_empty() {
        let repo = repo();
        assert_eq!(repo.schema().version(), 0);
        assert!(repo.get_schema_specification().entity_types.is_empty());
    }

    #[test]
    fn test_schema_update_and_reload() {
        let repo = repo();
        let session = Session::new("tester");
        repo.update_schema_specification(&session, spec_v(1)).unwrap();
        assert_eq!(repo.schema().version(), 1);
        assert!(repo.schema().entity_type("Article").is_some());
    }

    #[test]
    fn test_schema_update_requires_next_version() {
        let repo = repo();
        let session = Session::new("tester");
        let err = repo
            .update_schema_specification(&session, spec_v(5))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));

        repo.update_schema_specification(&session, spec_v(1)).unwrap();
        // Replaying the same version is stale now.
        let err = repo
            .update_schema_specification(&session, spec_v(1))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));
    }

    #[test]
    fn test_schema_update_rejects_readonly_session() {
        let repo = repo();
        let err = repo
            .update_schema_specification(&Session::read_only("viewer"), spec_v(1))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::BadRequest(_)));
    }

    #[test]
    fn test_schema_persists_across_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.db");
        {
            let repo =
                Repository::new(SqliteAdapter::open(&path).unwrap()).unwrap();
            repo.update_schema_specification(&Session::new("tester"), spec_v(1))
                .unwrap();
        }
        let repo = Repository::new(SqliteAdapter::open(&path).unwrap()).unwrap();
        assert_eq!(repo.schema().version(), 1);
    }

    #[test]
    fn test_next_sequence_is_monotonic() {
        let repo = repo();
        let values = with_root_transaction(&repo.adapter, |ctx| {
            Ok((
                next_sequence(ctx, "a")?,
                next_sequence(ctx, "a")?,
                next_sequence(ctx, "b")?,
            ))
        })
        .unwrap();
        assert_eq!(values, (1, 2, 1));
    }

    #[test]
    fn test_ensure_principal_is_stable() {
        let repo = repo();
        let (first, second, other) = with_root_transaction(&repo.adapter, |ctx| {
            Ok((
                ensure_principal(ctx, "alice")?,
                ensure_principal(ctx, "alice")?,
                ensure_principal(ctx, "bob")?,
            ))
        })
        .unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
    }
}
