//! Entity operations on [`Repository`].
//!
//! Every mutation runs inside one root transaction: the entity row, its new
//! version, unique-index rows, FTS/location rows, and the changelog event
//! commit together or not at all.

use crate::backend::{with_root_transaction, DatabaseAdapter, SqlValue, TransactionContext};
use crate::changelog::{append_event, EntitySnapshot, PublishRecord, SyncEventPayload};
use crate::entity::{
    status_after_publish, status_after_update, status_from_pointers, Entity, EntityCreate,
    EntityStatus, EntityUpdate, ResolvedAuthKey, DIRTY_LATEST, DIRTY_PUBLISHED,
};
use crate::error::{RepositoryError, Result};
use crate::index::{clear_index_values, set_index_values, suffixed_name, IndexTarget};
use crate::query::AuthFilter;
use crate::schema::Schema;
use crate::store::{
    assemble_entity, ensure_principal, format_time, load_entity_row, load_entity_row_internal,
    load_version, EntityRow, Repository, Session,
};
use crate::validation::{
    analyze_fields, ContentAnalysis, ValidationIssue, ValidationMode,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Run the content analyzer against one entity type's field specifications.
pub(crate) fn analyze_entity(
    schema: &Schema,
    entity_type: &str,
    mode: ValidationMode,
    fields: &Map<String, Value>,
) -> Result<ContentAnalysis> {
    let spec = schema
        .entity_type(entity_type)
        .ok_or_else(|| RepositoryError::bad_request(format!("unknown entity type '{entity_type}'")))?;
    Ok(analyze_fields(schema, mode, &spec.fields, fields))
}

/// Storage-level reference checks: referenced entities must exist, and for
/// publishing must themselves be published.
pub(crate) fn reference_issues<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    analysis: &ContentAnalysis,
    publish: bool,
) -> Result<Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    for reference in &analysis.references {
        let row = ctx.query_opt(
            "SELECT published_entity_versions_id FROM entities WHERE uuid = ?1",
            &[SqlValue::text(reference.id.to_string())],
        )?;
        match row {
            None => issues.push(ValidationIssue::new(
                reference.path.clone(),
                format!("referenced entity {} does not exist", reference.id),
            )),
            Some(row) if publish && row.opt_integer(0)?.is_none() => {
                issues.push(ValidationIssue::new(
                    reference.path.clone(),
                    format!("referenced entity {} is not published", reference.id),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(issues)
}

/// Rebuild the FTS and location rows derived from the latest version.
pub(crate) fn write_derived_rows<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    entity_id: i64,
    analysis: &ContentAnalysis,
) -> Result<()> {
    ctx.execute(
        "DELETE FROM entities_latest_fts WHERE rowid = ?1",
        &[SqlValue::Integer(entity_id)],
    )?;
    ctx.execute(
        "INSERT INTO entities_latest_fts (rowid, content) VALUES (?1, ?2)",
        &[
            SqlValue::Integer(entity_id),
            SqlValue::text(&analysis.full_text),
        ],
    )?;
    ctx.execute(
        "DELETE FROM entity_latest_locations WHERE entities_id = ?1",
        &[SqlValue::Integer(entity_id)],
    )?;
    for (lat, lng) in &analysis.locations {
        ctx.execute(
            "INSERT INTO entity_latest_locations (entities_id, lat, lng) VALUES (?1, ?2, ?3)",
            &[
                SqlValue::Integer(entity_id),
                SqlValue::Real(*lat),
                SqlValue::Real(*lng),
            ],
        )?;
    }
    Ok(())
}

/// Raw inputs for inserting one entity plus its first stored version.
pub(crate) struct NewEntityRows<'a> {
    pub uuid: Uuid,
    pub entity_type: &'a str,
    pub name: &'a str,
    pub auth_key: Option<&'a ResolvedAuthKey>,
    pub status: EntityStatus,
    pub valid: bool,
    pub version: i64,
    pub fields: &'a Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub principal: i64,
}

/// Insert the entity row, its version row, and wire the latest pointer.
/// Returns `(internal entity id, version row id)`.
pub(crate) fn insert_entity_rows<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    rows: &NewEntityRows<'_>,
) -> Result<(i64, i64)> {
    let entity_id = ctx
        .query_one(
            "INSERT INTO entities
                 (uuid, type, name, auth_key, resolved_auth_key, status, valid,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             RETURNING id",
            &[
                SqlValue::text(rows.uuid.to_string()),
                SqlValue::text(rows.entity_type),
                SqlValue::text(rows.name),
                SqlValue::opt_text(rows.auth_key.map(|k| k.key.as_str())),
                SqlValue::opt_text(rows.auth_key.map(|k| k.resolved.as_str())),
                SqlValue::text(rows.status.as_str()),
                SqlValue::Integer(rows.valid as i64),
                SqlValue::text(format_time(&rows.created_at)),
                SqlValue::text(format_time(&rows.updated_at)),
            ],
        )?
        .integer(0)?;
    let version_id = insert_version_row(
        ctx,
        entity_id,
        rows.version,
        rows.fields,
        &rows.created_at,
        rows.principal,
    )?;
    Ok((entity_id, version_id))
}

/// Insert one version snapshot and move the latest pointer to it.
pub(crate) fn insert_version_row<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    entity_id: i64,
    version: i64,
    fields: &Map<String, Value>,
    created_at: &DateTime<Utc>,
    principal: i64,
) -> Result<i64> {
    let version_id = ctx
        .query_one(
            "INSERT INTO entity_versions (entities_id, version, created_at, created_by, fields)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING id",
            &[
                SqlValue::Integer(entity_id),
                SqlValue::Integer(version),
                SqlValue::text(format_time(created_at)),
                SqlValue::Integer(principal),
                SqlValue::Text(serde_json::to_string(&Value::Object(fields.clone()))?),
            ],
        )?
        .integer(0)?;
    ctx.execute(
        "UPDATE entities SET latest_entity_versions_id = ?1 WHERE id = ?2",
        &[SqlValue::Integer(version_id), SqlValue::Integer(entity_id)],
    )?;
    Ok(version_id)
}

fn authorize(auth: &AuthFilter<'_>, row: &EntityRow) -> Result<()> {
    match auth {
        AuthFilter::Unrestricted => Ok(()),
        AuthFilter::Keys(keys) => {
            if keys.is_empty() {
                return Err(RepositoryError::bad_request(
                    "no resolved authorization keys",
                ));
            }
            match &row.resolved_auth_key {
                Some(key) if !keys.contains(key) => Err(RepositoryError::not_authorized(
                    format!("entity {}", row.uuid),
                )),
                _ => Ok(()),
            }
        }
    }
}

fn merge_fields(base: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (key, value) in updates {
        if value.is_null() {
            base.remove(key);
        } else {
            base.insert(key.clone(), value.clone());
        }
    }
}

impl<A: DatabaseAdapter> Repository<A> {
    /// Create a new draft entity at version 0.
    ///
    /// A name collision is retried with a random `#<digits>` suffix up to
    /// the configured attempt cap; exhausting the cap fails as `Generic`.
    pub fn create_entity(&self, session: &Session, create: &EntityCreate) -> Result<Entity> {
        self.require_writable(session)?;
        let schema = self.schema();
        let analysis =
            analyze_entity(&schema, &create.entity_type, ValidationMode::Save, &create.fields)?;
        if !analysis.is_valid() {
            return Err(RepositoryError::Validation(analysis.issues));
        }

        let id = Uuid::new_v4();
        let mut attempts = 0u32;
        loop {
            let name = if attempts == 0 {
                create.name.clone()
            } else {
                suffixed_name(&create.name)
            };
            let now = Utc::now();

            let result = with_root_transaction(&self.adapter, |ctx| {
                let issues = reference_issues(ctx, &analysis, false)?;
                if !issues.is_empty() {
                    return Err(RepositoryError::Validation(issues));
                }
                let principal = ensure_principal(ctx, &session.session_id)?;
                let (entity_id, version_id) = insert_entity_rows(
                    ctx,
                    &NewEntityRows {
                        uuid: id,
                        entity_type: &create.entity_type,
                        name: &name,
                        auth_key: create.auth_key.as_ref(),
                        status: EntityStatus::Draft,
                        valid: true,
                        version: 0,
                        fields: &create.fields,
                        created_at: now,
                        updated_at: now,
                        principal,
                    },
                )?;
                set_index_values(ctx, entity_id, IndexTarget::Latest, &analysis.index_values)?;
                write_derived_rows(ctx, entity_id, &analysis)?;

                let entity = assemble_entity(ctx, &load_entity_row(ctx, &id)?)?;
                append_event(
                    ctx,
                    &session.session_id,
                    Uuid::new_v4(),
                    &now,
                    &SyncEventPayload::CreateEntity {
                        entity: EntitySnapshot::of(
                            &entity,
                            create.auth_key.as_ref().map(|k| k.resolved.as_str()),
                        ),
                    },
                    &[version_id],
                )?;
                Ok(entity)
            });

            match result {
                Err(err) if self.adapter.is_unique_violation(&err, "entities.name") => {
                    if attempts >= self.config.name_retry_attempts {
                        return Err(RepositoryError::generic("failed creating a unique name"));
                    }
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    /// Store a new version of an entity. Field keys present in the update
    /// replace the latest version's values; a null value removes the key.
    /// A published entity becomes `modified`.
    pub fn update_entity(&self, session: &Session, id: Uuid, update: &EntityUpdate) -> Result<Entity> {
        self.require_writable(session)?;
        let schema = self.schema();

        let mut attempts = 0u32;
        loop {
            let now = Utc::now();
            let result = with_root_transaction(&self.adapter, |ctx| {
                let row = load_entity_row(ctx, &id)?;
                let latest_id = row
                    .latest_version_id
                    .ok_or_else(|| RepositoryError::generic("entity has no latest version"))?;
                let (version, mut fields) = load_version(ctx, latest_id)?;
                merge_fields(&mut fields, &update.fields);

                let analysis =
                    analyze_entity(&schema, &row.entity_type, ValidationMode::Save, &fields)?;
                if !analysis.is_valid() {
                    return Err(RepositoryError::Validation(analysis.issues));
                }
                let issues = reference_issues(ctx, &analysis, false)?;
                if !issues.is_empty() {
                    return Err(RepositoryError::Validation(issues));
                }

                let name = match (&update.name, attempts) {
                    (Some(requested), 0) => requested.clone(),
                    (Some(requested), _) => suffixed_name(requested),
                    (None, _) => row.name.clone(),
                };
                let principal = ensure_principal(ctx, &session.session_id)?;
                let version_id =
                    insert_version_row(ctx, row.id, version + 1, &fields, &now, principal)?;
                ctx.execute(
                    "UPDATE entities SET name = ?1, status = ?2, valid = 1, updated_at = ?3
                     WHERE id = ?4",
                    &[
                        SqlValue::text(&name),
                        SqlValue::text(status_after_update(row.status).as_str()),
                        SqlValue::text(format_time(&now)),
                        SqlValue::Integer(row.id),
                    ],
                )?;
                set_index_values(ctx, row.id, IndexTarget::Latest, &analysis.index_values)?;
                write_derived_rows(ctx, row.id, &analysis)?;

                let entity = assemble_entity(ctx, &load_entity_row(ctx, &id)?)?;
                append_event(
                    ctx,
                    &session.session_id,
                    Uuid::new_v4(),
                    &now,
                    &SyncEventPayload::UpdateEntity {
                        entity: EntitySnapshot::of(&entity, row.resolved_auth_key.as_deref()),
                    },
                    &[version_id],
                )?;
                Ok(entity)
            });

            match result {
                Err(err)
                    if update.name.is_some()
                        && self.adapter.is_unique_violation(&err, "entities.name") =>
                {
                    if attempts >= self.config.name_retry_attempts {
                        return Err(RepositoryError::generic("failed creating a unique name"));
                    }
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    /// Promote each entity's latest version to its published pointer.
    ///
    /// All entities are validated in publish mode first; any issue anywhere
    /// fails the whole batch with the full issue list and nothing is
    /// published.
    pub fn publish_entities(&self, session: &Session, ids: &[Uuid]) -> Result<Vec<Entity>> {
        self.require_writable(session)?;
        let schema = self.schema();

        with_root_transaction(&self.adapter, |ctx| {
            let now = Utc::now();
            let mut issues = Vec::new();
            let mut staged = Vec::new();

            for id in ids {
                let row = load_entity_row(ctx, id)?;
                let latest_id = row
                    .latest_version_id
                    .ok_or_else(|| RepositoryError::generic("entity has no latest version"))?;
                let (version, fields) = load_version(ctx, latest_id)?;
                let analysis =
                    analyze_entity(&schema, &row.entity_type, ValidationMode::Publish, &fields)?;
                issues.extend(analysis.issues.iter().cloned());
                issues.extend(reference_issues(ctx, &analysis, true)?);
                staged.push((row, latest_id, version, analysis));
            }
            if !issues.is_empty() {
                return Err(RepositoryError::Validation(issues));
            }

            let mut entities = Vec::new();
            let mut records = Vec::new();
            let mut version_ids = Vec::new();
            for (row, latest_id, version, analysis) in staged {
                ctx.execute(
                    "UPDATE entities
                     SET published_entity_versions_id = ?1, status = ?2, valid_published = 1,
                         updated_at = ?3
                     WHERE id = ?4",
                    &[
                        SqlValue::Integer(latest_id),
                        SqlValue::text(status_after_publish(true).as_str()),
                        SqlValue::text(format_time(&now)),
                        SqlValue::Integer(row.id),
                    ],
                )?;
                set_index_values(ctx, row.id, IndexTarget::Published, &analysis.index_values)?;
                records.push(PublishRecord {
                    id: row.uuid,
                    version,
                });
                version_ids.push(latest_id);
                entities.push(assemble_entity(ctx, &load_entity_row(ctx, &row.uuid)?)?);
            }

            append_event(
                ctx,
                &session.session_id,
                Uuid::new_v4(),
                &now,
                &SyncEventPayload::PublishEntities { entities: records },
                &version_ids,
            )?;
            Ok(entities)
        })
    }

    /// Withdraw entities from publication. History is retained; only the
    /// published pointer is cleared.
    pub fn unpublish_entities(&self, session: &Session, ids: &[Uuid]) -> Result<Vec<Entity>> {
        self.require_writable(session)?;

        with_root_transaction(&self.adapter, |ctx| {
            let now = Utc::now();
            let mut entities = Vec::new();
            let mut version_ids = Vec::new();

            for id in ids {
                let row = load_entity_row(ctx, id)?;
                let published_id = row.published_version_id.ok_or_else(|| {
                    RepositoryError::bad_request(format!("entity {id} is not published"))
                })?;
                ctx.execute(
                    "UPDATE entities
                     SET published_entity_versions_id = NULL, valid_published = NULL,
                         status = ?1, updated_at = ?2
                     WHERE id = ?3",
                    &[
                        SqlValue::text(EntityStatus::Withdrawn.as_str()),
                        SqlValue::text(format_time(&now)),
                        SqlValue::Integer(row.id),
                    ],
                )?;
                clear_index_values(ctx, row.id, IndexTarget::Published)?;
                version_ids.push(published_id);
                entities.push(assemble_entity(ctx, &load_entity_row(ctx, id)?)?);
            }

            append_event(
                ctx,
                &session.session_id,
                Uuid::new_v4(),
                &now,
                &SyncEventPayload::UnpublishEntities {
                    ids: ids.to_vec(),
                },
                &version_ids,
            )?;
            Ok(entities)
        })
    }

    /// Exclude an entity from default queries without deleting anything.
    pub fn archive_entity(&self, session: &Session, id: Uuid) -> Result<Entity> {
        self.require_writable(session)?;
        with_root_transaction(&self.adapter, |ctx| {
            let now = Utc::now();
            let row = load_entity_row(ctx, &id)?;
            ctx.execute(
                "UPDATE entities SET status = ?1, updated_at = ?2 WHERE id = ?3",
                &[
                    SqlValue::text(EntityStatus::Archived.as_str()),
                    SqlValue::text(format_time(&now)),
                    SqlValue::Integer(row.id),
                ],
            )?;
            append_event(
                ctx,
                &session.session_id,
                Uuid::new_v4(),
                &now,
                &SyncEventPayload::ArchiveEntity { id },
                &[],
            )?;
            assemble_entity(ctx, &load_entity_row(ctx, &id)?)
        })
    }

    /// Restore an archived entity to the status its pointers imply.
    pub fn unarchive_entity(&self, session: &Session, id: Uuid) -> Result<Entity> {
        self.require_writable(session)?;
        with_root_transaction(&self.adapter, |ctx| {
            let now = Utc::now();
            let row = load_entity_row(ctx, &id)?;
            let status = status_from_pointers(
                row.published_version_id.is_some(),
                row.published_version_id == row.latest_version_id,
            );
            ctx.execute(
                "UPDATE entities SET status = ?1, updated_at = ?2 WHERE id = ?3",
                &[
                    SqlValue::text(status.as_str()),
                    SqlValue::text(format_time(&now)),
                    SqlValue::Integer(row.id),
                ],
            )?;
            append_event(
                ctx,
                &session.session_id,
                Uuid::new_v4(),
                &now,
                &SyncEventPayload::UnarchiveEntity { id },
                &[],
            )?;
            assemble_entity(ctx, &load_entity_row(ctx, &id)?)
        })
    }

    pub fn get_entity(&self, auth: &AuthFilter<'_>, id: Uuid) -> Result<Entity> {
        with_root_transaction(&self.adapter, |ctx| {
            let row = load_entity_row(ctx, &id)?;
            authorize(auth, &row)?;
            assemble_entity(ctx, &row)
        })
    }

    /// Look an entity up by the latest owner of a unique-index value.
    pub fn get_entity_by_index_value(
        &self,
        auth: &AuthFilter<'_>,
        index_name: &str,
        value: &str,
    ) -> Result<Entity> {
        with_root_transaction(&self.adapter, |ctx| {
            let owner = ctx
                .query_opt(
                    "SELECT entities_id FROM unique_index_values
                     WHERE index_name = ?1 AND value = ?2 AND latest = 1",
                    &[SqlValue::text(index_name), SqlValue::text(value)],
                )?
                .ok_or_else(|| {
                    RepositoryError::not_found(format!("no entity owns {index_name}='{value}'"))
                })?;
            let row = load_entity_row_internal(ctx, owner.integer(0)?)?;
            authorize(auth, &row)?;
            assemble_entity(ctx, &row)
        })
    }

    /// Batch read. Missing and unauthorized entities are silently skipped;
    /// results keep the input order.
    pub fn get_entities(&self, auth: &AuthFilter<'_>, ids: &[Uuid]) -> Result<Vec<Entity>> {
        with_root_transaction(&self.adapter, |ctx| {
            let mut entities = Vec::new();
            for id in ids {
                match load_entity_row(ctx, id) {
                    Ok(row) => match authorize(auth, &row) {
                        Ok(()) => entities.push(assemble_entity(ctx, &row)?),
                        Err(RepositoryError::NotAuthorized(_)) => {}
                        Err(err) => return Err(err),
                    },
                    Err(RepositoryError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(entities)
        })
    }

    /// Revalidate one dirty entity against the current schema, fixing up its
    /// `valid`/`valid_published` flags and derived rows. Returns the entity
    /// id, or `None` when nothing is dirty. Hosts call this from a poll loop
    /// after schema updates.
    pub fn revalidate_next_entity(&self) -> Result<Option<Uuid>> {
        let schema = self.schema();
        with_root_transaction(&self.adapter, |ctx| {
            let candidate = ctx.query_opt(
                "SELECT id FROM entities WHERE dirty != 0 ORDER BY id LIMIT 1",
                &[],
            )?;
            let internal_id = match candidate {
                Some(row) => row.integer(0)?,
                None => return Ok(None),
            };
            let row = load_entity_row_internal(ctx, internal_id)?;

            if row.dirty & DIRTY_LATEST != 0 {
                if let Some(latest_id) = row.latest_version_id {
                    let (_, fields) = load_version(ctx, latest_id)?;
                    let valid = match schema.entity_type(&row.entity_type) {
                        Some(spec) => {
                            let analysis = analyze_fields(
                                &schema,
                                ValidationMode::Save,
                                &spec.fields,
                                &fields,
                            );
                            // A new index can make stored content collide.
                            // The loser stays unclaimed and invalid; failing
                            // here would retry the same entity forever.
                            match set_index_values(
                                ctx,
                                row.id,
                                IndexTarget::Latest,
                                &analysis.index_values,
                            ) {
                                Ok(()) => {
                                    write_derived_rows(ctx, row.id, &analysis)?;
                                    analysis.is_valid()
                                }
                                Err(RepositoryError::Conflict { .. }) => false,
                                Err(err) => return Err(err),
                            }
                        }
                        // The type was removed from the schema.
                        None => false,
                    };
                    ctx.execute(
                        "UPDATE entities SET valid = ?1 WHERE id = ?2",
                        &[SqlValue::Integer(valid as i64), SqlValue::Integer(row.id)],
                    )?;
                }
            }

            if row.dirty & DIRTY_PUBLISHED != 0 {
                if let Some(published_id) = row.published_version_id {
                    let (_, fields) = load_version(ctx, published_id)?;
                    let valid_published = match schema.entity_type(&row.entity_type) {
                        Some(spec) => {
                            let analysis = analyze_fields(
                                &schema,
                                ValidationMode::Publish,
                                &spec.fields,
                                &fields,
                            );
                            match set_index_values(
                                ctx,
                                row.id,
                                IndexTarget::Published,
                                &analysis.index_values,
                            ) {
                                Ok(()) => analysis.is_valid(),
                                Err(RepositoryError::Conflict { .. }) => false,
                                Err(err) => return Err(err),
                            }
                        }
                        None => false,
                    };
                    ctx.execute(
                        "UPDATE entities SET valid_published = ?1 WHERE id = ?2",
                        &[
                            SqlValue::Integer(valid_published as i64),
                            SqlValue::Integer(row.id),
                        ],
                    )?;
                }
            }

            ctx.execute(
                "UPDATE entities SET dirty = 0 WHERE id = ?1",
                &[SqlValue::Integer(row.id)],
            )?;
            Ok(Some(row.uuid))
        })
    }
}
