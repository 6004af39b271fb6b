//! Unique index bookkeeping.
//!
//! Every entity write recomputes the full set of `(index, value)` pairs the
//! entity should own and diffs it against the stored rows, so index state is
//! always derivable from content and never accumulates stale entries. The
//! `latest` and `published` flags move independently: a value may still be
//! published for a superseded entity while already latest for its successor,
//! but no two entities may hold the same flag for the same pair.

use crate::backend::{DatabaseAdapter, SqlValue, TransactionContext};
use crate::error::{RepositoryError, Result};
use std::collections::BTreeSet;

/// Which view of an entity a set of index values belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexTarget {
    Latest,
    Published,
}

/// Replace the entity's owned `(index, value)` pairs for one target view.
/// Pairs owned under the other view are left untouched; rows that end up
/// owning neither view are deleted. Fails with `Conflict` (naming the index)
/// if another entity already owns a pair under the same view.
pub(crate) fn set_index_values<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    entity_id: i64,
    target: IndexTarget,
    values: &[(String, String)],
) -> Result<()> {
    let desired: BTreeSet<(&str, &str)> = values
        .iter()
        .map(|(index, value)| (index.as_str(), value.as_str()))
        .collect();

    let (flag_column, other_column) = match target {
        IndexTarget::Latest => ("latest", "published"),
        IndexTarget::Published => ("published", "latest"),
    };

    check_ownership(ctx, entity_id, flag_column, &desired)?;

    let stored = ctx.query(
        &format!(
            "SELECT index_name, value, {flag_column}, {other_column}
             FROM unique_index_values WHERE entities_id = ?1"
        ),
        &[SqlValue::Integer(entity_id)],
    )?;

    let mut existing: BTreeSet<(String, String)> = BTreeSet::new();
    for row in &stored {
        let index_name = row.text(0)?.to_string();
        let value = row.text(1)?.to_string();
        let flagged = row.boolean(2)?;
        let other = row.boolean(3)?;
        let wanted = desired.contains(&(index_name.as_str(), value.as_str()));

        if flagged != wanted {
            if !wanted && !other {
                ctx.execute(
                    "DELETE FROM unique_index_values
                     WHERE entities_id = ?1 AND index_name = ?2 AND value = ?3",
                    &[
                        SqlValue::Integer(entity_id),
                        SqlValue::text(&index_name),
                        SqlValue::text(&value),
                    ],
                )?;
            } else {
                ctx.execute(
                    &format!(
                        "UPDATE unique_index_values SET {flag_column} = ?1
                         WHERE entities_id = ?2 AND index_name = ?3 AND value = ?4"
                    ),
                    &[
                        SqlValue::Integer(wanted as i64),
                        SqlValue::Integer(entity_id),
                        SqlValue::text(&index_name),
                        SqlValue::text(&value),
                    ],
                )?;
            }
        }
        existing.insert((index_name, value));
    }

    for (index_name, value) in &desired {
        if existing.contains(&(index_name.to_string(), value.to_string())) {
            continue;
        }
        ctx.execute(
            &format!(
                "INSERT INTO unique_index_values
                     (entities_id, index_name, value, {flag_column})
                 VALUES (?1, ?2, ?3, 1)"
            ),
            &[
                SqlValue::Integer(entity_id),
                SqlValue::text(*index_name),
                SqlValue::text(*value),
            ],
        )?;
    }

    Ok(())
}

/// Drop every pair the entity owns under one view.
pub(crate) fn clear_index_values<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    entity_id: i64,
    target: IndexTarget,
) -> Result<()> {
    set_index_values(ctx, entity_id, target, &[])
}

fn check_ownership<A: DatabaseAdapter>(
    ctx: &TransactionContext<'_, A>,
    entity_id: i64,
    flag_column: &str,
    desired: &BTreeSet<(&str, &str)>,
) -> Result<()> {
    for (index_name, value) in desired {
        let taken = ctx.query_opt(
            &format!(
                "SELECT entities_id FROM unique_index_values
                 WHERE index_name = ?1 AND value = ?2 AND {flag_column} = 1
                   AND entities_id != ?3"
            ),
            &[
                SqlValue::text(*index_name),
                SqlValue::text(*value),
                SqlValue::Integer(entity_id),
            ],
        )?;
        if taken.is_some() {
            return Err(RepositoryError::conflict(
                *index_name,
                format!("value '{value}' is already in use"),
            ));
        }
    }
    Ok(())
}

const DIGITS: [char; 10] = ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];

/// Random digits appended to an entity name after a uniqueness collision.
pub(crate) fn random_name_suffix() -> String {
    nanoid::nanoid!(8, &DIGITS)
}

pub(crate) fn suffixed_name(name: &str) -> String {
    format!("{name}#{}", random_name_suffix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{with_root_transaction, SqliteAdapter};

    fn insert_entity(adapter: &SqliteAdapter, name: &str) -> i64 {
        adapter
            .execute(
                "INSERT INTO entities
                     (uuid, type, name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'draft', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                &[
                    SqlValue::text(uuid::Uuid::new_v4().to_string()),
                    SqlValue::text("Article"),
                    SqlValue::text(name),
                ],
            )
            .unwrap();
        adapter
            .query_one("SELECT id FROM entities WHERE name = ?1", &[SqlValue::text(name)])
            .unwrap()
            .integer(0)
            .unwrap()
    }

    fn pairs(values: &[(&str, &str)]) -> Vec<(String, String)> {
        values
            .iter()
            .map(|(i, v)| (i.to_string(), v.to_string()))
            .collect()
    }

    fn owned(adapter: &SqliteAdapter, entity_id: i64) -> Vec<(String, String, bool, bool)> {
        adapter
            .query(
                "SELECT index_name, value, latest, published FROM unique_index_values
                 WHERE entities_id = ?1 ORDER BY index_name, value",
                &[SqlValue::Integer(entity_id)],
            )
            .unwrap()
            .into_iter()
            .map(|row| {
                (
                    row.text(0).unwrap().to_string(),
                    row.text(1).unwrap().to_string(),
                    row.boolean(2).unwrap(),
                    row.boolean(3).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_diff_insert_update_delete() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let id = insert_entity(&adapter, "a");

        with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, id, IndexTarget::Latest, &pairs(&[("slug", "one"), ("slug", "two")]))
        })
        .unwrap();
        assert_eq!(owned(&adapter, id).len(), 2);

        // "one" dropped, "three" added, "two" kept.
        with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, id, IndexTarget::Latest, &pairs(&[("slug", "two"), ("slug", "three")]))
        })
        .unwrap();
        assert_eq!(
            owned(&adapter, id),
            vec![
                ("slug".into(), "three".into(), true, false),
                ("slug".into(), "two".into(), true, false),
            ]
        );
    }

    #[test]
    fn test_published_flag_is_independent() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let id = insert_entity(&adapter, "a");

        with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, id, IndexTarget::Latest, &pairs(&[("slug", "one")]))?;
            set_index_values(ctx, id, IndexTarget::Published, &pairs(&[("slug", "one")]))
        })
        .unwrap();

        // Latest moves on; the published value survives on the same row set.
        with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, id, IndexTarget::Latest, &pairs(&[("slug", "two")]))
        })
        .unwrap();
        assert_eq!(
            owned(&adapter, id),
            vec![
                ("slug".into(), "one".into(), false, true),
                ("slug".into(), "two".into(), true, false),
            ]
        );

        // Unpublish clears the old row entirely.
        with_root_transaction(&adapter, |ctx| {
            clear_index_values(ctx, id, IndexTarget::Published)
        })
        .unwrap();
        assert_eq!(
            owned(&adapter, id),
            vec![("slug".into(), "two".into(), true, false)]
        );
    }

    #[test]
    fn test_conflict_names_the_index() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let a = insert_entity(&adapter, "a");
        let b = insert_entity(&adapter, "b");

        with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, a, IndexTarget::Latest, &pairs(&[("slug", "taken")]))
        })
        .unwrap();

        let err = with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, b, IndexTarget::Latest, &pairs(&[("slug", "taken")]))
        })
        .unwrap_err();
        match err {
            RepositoryError::Conflict { name, .. } => assert_eq!(name, "slug"),
            other => panic!("expected conflict, got {other:?}"),
        }

        // The same value under the other view is allowed.
        with_root_transaction(&adapter, |ctx| {
            set_index_values(ctx, b, IndexTarget::Published, &pairs(&[("slug", "taken")]))
        })
        .unwrap();
    }

    #[test]
    fn test_name_suffix_shape() {
        let suffixed = suffixed_name("Foo");
        let (base, suffix) = suffixed.split_once('#').unwrap();
        assert_eq!(base, "Foo");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
