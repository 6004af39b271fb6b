//! Changelog and replication.
//!
//! Every mutating operation appends exactly one event row, in the same
//! transaction as the change it describes. Events are append-only; the head
//! is simply the uuid of the most recent row. Replication feeds a peer's
//! events through [`Repository::apply_sync_event`], which compare-and-swaps
//! on the head so two replicas can never silently diverge.

use crate::backend::{with_root_transaction, DatabaseAdapter, SqlValue, TransactionContext};
use crate::entity::{
    status_after_publish, status_after_update, status_from_pointers, Entity, EntityStatus,
    ResolvedAuthKey,
};
use crate::error::{RepositoryError, Result};
use crate::index::{clear_index_values, set_index_values, IndexTarget};
use crate::query::{encode_id_cursor, resolve_paging, Connection, Edge, PageInfo, Paging};
use crate::schema::{Schema, SchemaSpecification};
use crate::store::{
    ensure_principal, format_time, insert_schema_version, load_entity_row,
    mark_all_entities_dirty, parse_fields, parse_time, parse_uuid, Repository, Session,
};
use crate::validation::{analyze_fields, ContentAnalysis, ValidationMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

// ── Event payloads ──

/// Full entity image carried by create/update events, sufficient to replay
/// the write on a peer without consulting the origin again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    pub auth_key: Option<ResolvedAuthKey>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl EntitySnapshot {
    /// Capture an entity as just written. The resolved key is supplied
    /// separately because [`Entity`] only carries the raw key.
    pub(crate) fn of(entity: &Entity, resolved_auth_key: Option<&str>) -> EntitySnapshot {
        let auth_key = match (&entity.info.auth_key, resolved_auth_key) {
            (Some(key), Some(resolved)) => Some(ResolvedAuthKey {
                key: key.clone(),
                resolved: resolved.to_string(),
            }),
            _ => None,
        };
        EntitySnapshot {
            id: entity.id,
            entity_type: entity.info.entity_type.clone(),
            name: entity.info.name.clone(),
            auth_key,
            version: entity.info.version,
            created_at: entity.info.created_at,
            updated_at: entity.info.updated_at,
            fields: entity.fields.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    pub id: Uuid,
    pub version: i64,
}

/// The replayable description of one mutating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEventPayload {
    UpdateSchema {
        specification: SchemaSpecification,
    },
    CreateEntity {
        entity: EntitySnapshot,
    },
    UpdateEntity {
        entity: EntitySnapshot,
    },
    PublishEntities {
        entities: Vec<PublishRecord>,
    },
    UnpublishEntities {
        ids: Vec<Uuid>,
    },
    ArchiveEntity {
        id: Uuid,
    },
    UnarchiveEntity {
        id: Uuid,
    },
}

impl SyncEventPayload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            SyncEventPayload::UpdateSchema { .. } => "updateSchema",
            SyncEventPayload::CreateEntity { .. } => "createEntity",
            SyncEventPayload::UpdateEntity { .. } => "updateEntity",
            SyncEventPayload::PublishEntities { .. } => "publishEntities",
            SyncEventPayload::UnpublishEntities { .. } => "unpublishEntities",
            SyncEventPayload::ArchiveEntity { .. } => "archiveEntity",
            SyncEventPayload::UnarchiveEntity { .. } => "unarchiveEntity",
        }
    }
}

const SUPPORTED_EVENT_TYPES: [&str; 7] = [
    "updateSchema",
    "createEntity",
    "updateEntity",
    "publishEntities",
    "unpublishEntities",
    "archiveEntity",
    "unarchiveEntity",
];

/// One event as exchanged between replicas: envelope plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub id: Uuid,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SyncEventPayload,
}

impl SyncEvent {
    /// Parse an event received from a peer. An unrecognized type tag is a
    /// `BadRequest` before any deserialization of the rest.
    pub fn from_json(value: &Value) -> Result<SyncEvent> {
        let tag = value.get("type").and_then(Value::as_str).unwrap_or("");
        if !SUPPORTED_EVENT_TYPES.contains(&tag) {
            return Err(RepositoryError::bad_request(format!(
                "unsupported event type '{tag}'"
            )));
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}

// ── Read model ──

#[derive(Debug, Clone, PartialEq)]
pub struct EntityVersionRef {
    pub entity_id: Uuid,
    pub version: i64,
}

/// One changelog entry as read back by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangelogEvent {
    pub id: Uuid,
    pub event_type: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub entity_versions: Vec<EntityVersionRef>,
}

/// Filter for changelog reads.
#[derive(Debug, Clone, Default)]
pub struct ChangelogQuery {
    /// Restrict to these event type tags; empty means all.
    pub event_types: Vec<String>,
}

// ── Append ──

/// Append one event row plus its entity-version join rows. Returns the
/// internal event id.
pub(crate) fn append_event<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    session_id: &str,
    event_id: Uuid,
    created_at: &DateTime<Utc>,
    payload: &SyncEventPayload,
    version_ids: &[i64],
) -> Result<i64> {
    let principal = ensure_principal(ctx, session_id)?;
    let internal_id = ctx
        .query_one(
            "INSERT INTO events (uuid, type, created_by, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING id",
            &[
                SqlValue::text(event_id.to_string()),
                SqlValue::text(payload.type_tag()),
                SqlValue::Integer(principal),
                SqlValue::text(format_time(created_at)),
                SqlValue::Text(serde_json::to_string(payload)?),
            ],
        )?
        .integer(0)?;
    for version_id in version_ids {
        ctx.execute(
            "INSERT INTO event_entity_versions (events_id, entity_versions_id) VALUES (?1, ?2)",
            &[SqlValue::Integer(internal_id), SqlValue::Integer(*version_id)],
        )?;
    }
    Ok(internal_id)
}

fn head_event_id<A: DatabaseAdapter>(ctx: &TransactionContext<'_, A>) -> Result<Option<Uuid>> {
    match ctx.query_opt("SELECT uuid FROM events ORDER BY id DESC LIMIT 1", &[])? {
        Some(row) => Ok(Some(parse_uuid(row.text(0)?)?)),
        None => Ok(None),
    }
}

/// Structural analysis for sync replay: issues do not fail the apply, they
/// only drive the stored validity flags. `None` when the entity type is
/// unknown to the schema.
fn replay_analysis(
    schema: &Schema,
    entity_type: &str,
    mode: ValidationMode,
    fields: &Map<String, Value>,
) -> Option<ContentAnalysis> {
    schema
        .entity_type(entity_type)
        .map(|spec| analyze_fields(schema, mode, &spec.fields, fields))
}

impl<A: DatabaseAdapter> Repository<A> {
    /// The uuid of the most recently appended event, or `None` on an empty
    /// log.
    pub fn get_changelog_head_id(&self) -> Result<Option<Uuid>> {
        match self
            .adapter
            .query_opt("SELECT uuid FROM events ORDER BY id DESC LIMIT 1", &[])?
        {
            Some(row) => Ok(Some(parse_uuid(row.text(0)?)?)),
            None => Ok(None),
        }
    }

    /// Cursor-paginated changelog read, in append order.
    pub fn get_changelog_events(
        &self,
        query: &ChangelogQuery,
        paging: &Paging,
    ) -> Result<Connection<ChangelogEvent>> {
        let resolved = resolve_paging(
            &self.adapter,
            paging,
            self.config.default_page_size,
            self.config.max_page_size,
        )?;

        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if !query.event_types.is_empty() {
            let marks = vec!["?"; query.event_types.len()].join(", ");
            conditions.push(format!("e.type IN ({marks})"));
            params.extend(query.event_types.iter().map(SqlValue::text));
        }

        let count_sql = format!(
            "SELECT COUNT(*) FROM events e{}",
            where_clause(&conditions)
        );
        let total_count = self.adapter.query_one(&count_sql, &params)?.integer(0)?;

        let comparison = if resolved.backward { "<" } else { ">" };
        let direction = if resolved.backward { "DESC" } else { "ASC" };
        if let Some(cursor) = resolved.cursor {
            conditions.push(format!("e.id {comparison} ?"));
            params.push(SqlValue::Integer(cursor));
        }
        let sql = format!(
            "SELECT e.id, e.uuid, e.type, p.session_id, e.created_at
             FROM events e JOIN principals p ON p.id = e.created_by{}
             ORDER BY e.id {direction} LIMIT ?",
            where_clause(&conditions)
        );
        params.push(SqlValue::Integer(resolved.count + 1));

        let mut rows = self.adapter.query(&sql, &params)?;
        let has_more = rows.len() as i64 > resolved.count;
        rows.truncate(resolved.count as usize);
        if resolved.backward {
            rows.reverse();
        }

        let mut edges = Vec::with_capacity(rows.len());
        for row in &rows {
            let internal_id = row.integer(0)?;
            let refs = self.adapter.query(
                "SELECT en.uuid, ev.version
                 FROM event_entity_versions eev
                 JOIN entity_versions ev ON ev.id = eev.entity_versions_id
                 JOIN entities en ON en.id = ev.entities_id
                 WHERE eev.events_id = ?1
                 ORDER BY eev.id",
                &[SqlValue::Integer(internal_id)],
            )?;
            let mut entity_versions = Vec::with_capacity(refs.len());
            for r in &refs {
                entity_versions.push(EntityVersionRef {
                    entity_id: parse_uuid(r.text(0)?)?,
                    version: r.integer(1)?,
                });
            }
            edges.push(Edge {
                cursor: encode_id_cursor(&self.adapter, internal_id),
                node: ChangelogEvent {
                    id: parse_uuid(row.text(1)?)?,
                    event_type: row.text(2)?.to_string(),
                    created_by: row.text(3)?.to_string(),
                    created_at: parse_time(row.text(4)?)?,
                    entity_versions,
                },
            });
        }

        let page_info = PageInfo {
            has_next_page: if resolved.backward {
                resolved.cursor.is_some()
            } else {
                has_more
            },
            has_previous_page: if resolved.backward {
                has_more
            } else {
                resolved.cursor.is_some()
            },
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
        };
        Ok(Connection {
            edges,
            page_info,
            total_count,
        })
    }

    /// Read a batch of replayable events after `after` (or from the start),
    /// oldest first. This is the producer half of the replication loop; the
    /// consumer feeds each event to [`Repository::apply_sync_event`].
    pub fn get_sync_events(&self, after: Option<&Uuid>, limit: i64) -> Result<Vec<SyncEvent>> {
        if limit < 0 {
            return Err(RepositoryError::bad_request("limit must not be negative"));
        }
        let mut sql = String::from(
            "SELECT e.uuid, p.session_id, e.created_at, e.payload
             FROM events e JOIN principals p ON p.id = e.created_by",
        );
        let mut params = Vec::new();
        if let Some(after) = after {
            let known = self.adapter.query_opt(
                "SELECT id FROM events WHERE uuid = ?1",
                &[SqlValue::text(after.to_string())],
            )?;
            if known.is_none() {
                return Err(RepositoryError::not_found(format!("event {after}")));
            }
            sql.push_str(" WHERE e.id > (SELECT id FROM events WHERE uuid = ?)");
            params.push(SqlValue::text(after.to_string()));
        }
        sql.push_str(" ORDER BY e.id LIMIT ?");
        params.push(SqlValue::Integer(limit));

        let rows = self.adapter.query(&sql, &params)?;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(SyncEvent {
                id: parse_uuid(row.text(0)?)?,
                created_by: row.text(1)?.to_string(),
                created_at: parse_time(row.text(2)?)?,
                payload: serde_json::from_str(row.text(3)?)?,
            });
        }
        Ok(events)
    }

    /// Apply one event from a peer, compare-and-swapping on the changelog
    /// head.
    ///
    /// The head is re-read inside the transaction; if it differs from
    /// `expected_head` nothing is applied and the caller gets a
    /// `BadRequest` ("head mismatch") telling it to re-fetch and retry.
    /// Payload ids, versions, and timestamps are applied verbatim so both
    /// replicas end up with identical state; validity flags are recomputed
    /// structurally but never fail the apply.
    pub fn apply_sync_event(
        &self,
        session: &Session,
        expected_head: Option<&Uuid>,
        event: &SyncEvent,
    ) -> Result<()> {
        self.require_writable(session)?;
        let schema = self.schema();

        let new_schema = with_root_transaction(&self.adapter, |ctx| {
            let head = head_event_id(ctx)?;
            if head.as_ref() != expected_head {
                return Err(RepositoryError::bad_request("head mismatch"));
            }

            let mut new_schema = None;
            let mut version_ids = Vec::new();
            match &event.payload {
                SyncEventPayload::UpdateSchema { specification } => {
                    let validated = Schema::validate(specification.clone())?;
                    insert_schema_version(ctx, validated.spec(), &event.created_at)?;
                    mark_all_entities_dirty(ctx)?;
                    new_schema = Some(Arc::new(validated));
                }
                SyncEventPayload::CreateEntity { entity } => {
                    version_ids.push(replay_create(ctx, &schema, &event.created_by, entity)?);
                }
                SyncEventPayload::UpdateEntity { entity } => {
                    version_ids.push(replay_update(ctx, &schema, &event.created_by, entity)?);
                }
                SyncEventPayload::PublishEntities { entities } => {
                    for record in entities {
                        version_ids.push(replay_publish(ctx, &schema, record)?);
                    }
                }
                SyncEventPayload::UnpublishEntities { ids } => {
                    for id in ids {
                        if let Some(version_id) = replay_unpublish(ctx, id, &event.created_at)? {
                            version_ids.push(version_id);
                        }
                    }
                }
                SyncEventPayload::ArchiveEntity { id } => {
                    replay_set_status(ctx, id, EntityStatus::Archived, &event.created_at)?;
                }
                SyncEventPayload::UnarchiveEntity { id } => {
                    let row = load_entity_row(ctx, id)?;
                    let status = status_from_pointers(
                        row.published_version_id.is_some(),
                        row.published_version_id == row.latest_version_id,
                    );
                    replay_set_status(ctx, id, status, &event.created_at)?;
                }
            }

            append_event(
                ctx,
                &event.created_by,
                event.id,
                &event.created_at,
                &event.payload,
                &version_ids,
            )?;
            Ok(new_schema)
        })?;

        if let Some(schema) = new_schema {
            self.swap_schema(schema);
        }
        Ok(())
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

// ── Replay helpers ──

fn replay_create<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    schema: &Schema,
    created_by: &str,
    snapshot: &EntitySnapshot,
) -> Result<i64> {
    use crate::entity::ops::{insert_entity_rows, write_derived_rows, NewEntityRows};

    let analysis = replay_analysis(
        schema,
        &snapshot.entity_type,
        ValidationMode::Save,
        &snapshot.fields,
    );
    let principal = ensure_principal(ctx, created_by)?;
    let (entity_id, version_id) = insert_entity_rows(
        ctx,
        &NewEntityRows {
            uuid: snapshot.id,
            entity_type: &snapshot.entity_type,
            name: &snapshot.name,
            auth_key: snapshot.auth_key.as_ref(),
            status: EntityStatus::Draft,
            valid: analysis.as_ref().is_some_and(|a| a.is_valid()),
            version: snapshot.version,
            fields: &snapshot.fields,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            principal,
        },
    )?;
    if let Some(analysis) = &analysis {
        set_index_values(ctx, entity_id, IndexTarget::Latest, &analysis.index_values)?;
        write_derived_rows(ctx, entity_id, analysis)?;
    }
    Ok(version_id)
}

fn replay_update<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    schema: &Schema,
    created_by: &str,
    snapshot: &EntitySnapshot,
) -> Result<i64> {
    use crate::entity::ops::{insert_version_row, write_derived_rows};

    let row = load_entity_row(ctx, &snapshot.id)?;
    let principal = ensure_principal(ctx, created_by)?;
    let version_id = insert_version_row(
        ctx,
        row.id,
        snapshot.version,
        &snapshot.fields,
        &snapshot.created_at,
        principal,
    )?;
    let analysis = replay_analysis(
        schema,
        &row.entity_type,
        ValidationMode::Save,
        &snapshot.fields,
    );
    ctx.execute(
        "UPDATE entities SET name = ?1, status = ?2, valid = ?3, updated_at = ?4 WHERE id = ?5",
        &[
            SqlValue::text(&snapshot.name),
            SqlValue::text(status_after_update(row.status).as_str()),
            SqlValue::Integer(analysis.as_ref().is_some_and(|a| a.is_valid()) as i64),
            SqlValue::text(format_time(&snapshot.updated_at)),
            SqlValue::Integer(row.id),
        ],
    )?;
    if let Some(analysis) = &analysis {
        set_index_values(ctx, row.id, IndexTarget::Latest, &analysis.index_values)?;
        write_derived_rows(ctx, row.id, analysis)?;
    }
    Ok(version_id)
}

fn replay_publish<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    schema: &Schema,
    record: &PublishRecord,
) -> Result<i64> {
    let row = load_entity_row(ctx, &record.id)?;
    let version_row = ctx
        .query_opt(
            "SELECT id, fields FROM entity_versions WHERE entities_id = ?1 AND version = ?2",
            &[SqlValue::Integer(row.id), SqlValue::Integer(record.version)],
        )?
        .ok_or_else(|| {
            RepositoryError::not_found(format!(
                "version {} of entity {}",
                record.version, record.id
            ))
        })?;
    let version_id = version_row.integer(0)?;
    let fields = parse_fields(version_row.text(1)?)?;

    let analysis = replay_analysis(schema, &row.entity_type, ValidationMode::Publish, &fields);
    let status = status_after_publish(row.latest_version_id == Some(version_id));
    ctx.execute(
        "UPDATE entities
         SET published_entity_versions_id = ?1, status = ?2, valid_published = ?3
         WHERE id = ?4",
        &[
            SqlValue::Integer(version_id),
            SqlValue::text(status.as_str()),
            SqlValue::Integer(analysis.as_ref().is_some_and(|a| a.is_valid()) as i64),
            SqlValue::Integer(row.id),
        ],
    )?;
    if let Some(analysis) = &analysis {
        set_index_values(ctx, row.id, IndexTarget::Published, &analysis.index_values)?;
    }
    Ok(version_id)
}

fn replay_unpublish<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    id: &Uuid,
    at: &DateTime<Utc>,
) -> Result<Option<i64>> {
    let row = load_entity_row(ctx, id)?;
    let published_id = match row.published_version_id {
        Some(published_id) => published_id,
        None => return Ok(None),
    };
    ctx.execute(
        "UPDATE entities
         SET published_entity_versions_id = NULL, valid_published = NULL, status = ?1,
             updated_at = ?2
         WHERE id = ?3",
        &[
            SqlValue::text(EntityStatus::Withdrawn.as_str()),
            SqlValue::text(format_time(at)),
            SqlValue::Integer(row.id),
        ],
    )?;
    clear_index_values(ctx, row.id, IndexTarget::Published)?;
    Ok(Some(published_id))
}

fn replay_set_status<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    id: &Uuid,
    status: EntityStatus,
    at: &DateTime<Utc>,
) -> Result<()> {
    let row = load_entity_row(ctx, id)?;
    ctx.execute(
        "UPDATE entities SET status = ?1, updated_at = ?2 WHERE id = ?3",
        &[
            SqlValue::text(status.as_str()),
            SqlValue::text(format_time(at)),
            SqlValue::Integer(row.id),
        ],
    )?;
    Ok(())
}
