//! Cursor-paginated query generation.
//!
//! Queries are built backend-agnostically as SQL text plus positional
//! parameters ([`BackendQuery`]). Rows are always ordered by the requested
//! sort column plus the internal numeric id as a tie-breaker, which gives a
//! total order and therefore stable pagination even across duplicate sort
//! keys. Cursors are opaque to callers; internally they carry the internal
//! id of the row they point at, and pagination resumes with a row-value
//! comparison against that row's sort key.

mod search;

pub use search::EntityPage;

use crate::backend::{DatabaseAdapter, SqlValue};
use crate::entity::EntityStatus;
use crate::error::{RepositoryError, Result};

/// Relay-style paging arguments.
#[derive(Debug, Clone, Default)]
pub struct Paging {
    pub first: Option<i64>,
    pub after: Option<String>,
    pub last: Option<i64>,
    pub before: Option<String>,
}

impl Paging {
    pub fn first(count: i64) -> Self {
        Paging {
            first: Some(count),
            ..Paging::default()
        }
    }

    pub fn last(count: i64) -> Self {
        Paging {
            last: Some(count),
            ..Paging::default()
        }
    }
}

/// Paging after validation and cursor decoding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedPaging {
    pub count: i64,
    /// Internal id of the row the page starts after (forward) or before
    /// (backward).
    pub cursor: Option<i64>,
    pub backward: bool,
}

/// Validate paging arguments and decode the relevant cursor.
///
/// `first` and `last` together are rejected: a single cursor window cannot
/// page both directions consistently, and callers rely on that restriction.
pub(crate) fn resolve_paging<A: DatabaseAdapter>(
    adapter: &A,
    paging: &Paging,
    default_page_size: i64,
    max_page_size: i64,
) -> Result<ResolvedPaging> {
    if paging.first.is_some() && paging.last.is_some() {
        return Err(RepositoryError::bad_request(
            "first and last cannot be combined",
        ));
    }
    for count in [paging.first, paging.last].into_iter().flatten() {
        if count < 0 {
            return Err(RepositoryError::bad_request(
                "page size must not be negative",
            ));
        }
    }

    let backward = paging.last.is_some();
    let count = paging
        .first
        .or(paging.last)
        .unwrap_or(default_page_size)
        .min(max_page_size);
    let raw_cursor = if backward {
        paging.before.as_deref()
    } else {
        paging.after.as_deref()
    };
    let cursor = match raw_cursor {
        Some(encoded) => Some(decode_id_cursor(adapter, encoded)?),
        None => None,
    };

    Ok(ResolvedPaging {
        count,
        cursor,
        backward,
    })
}

pub(crate) fn encode_id_cursor<A: DatabaseAdapter>(adapter: &A, id: i64) -> String {
    adapter.encode_cursor(&id.to_string())
}

pub(crate) fn decode_id_cursor<A: DatabaseAdapter>(adapter: &A, encoded: &str) -> Result<i64> {
    adapter
        .decode_cursor(encoded)?
        .parse()
        .map_err(|_| RepositoryError::bad_request(format!("malformed cursor: {encoded}")))
}

/// Sort key for entity searches. The internal id is always appended as a
/// tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    #[default]
    CreatedAt,
    UpdatedAt,
    Name,
}

impl QueryOrder {
    fn column(&self) -> &'static str {
        match self {
            QueryOrder::CreatedAt => "e.created_at",
            QueryOrder::UpdatedAt => "e.updated_at",
            QueryOrder::Name => "e.name",
        }
    }

    fn bare_column(&self) -> &'static str {
        match self {
            QueryOrder::CreatedAt => "created_at",
            QueryOrder::UpdatedAt => "updated_at",
            QueryOrder::Name => "name",
        }
    }
}

/// Geographic containment filter over location fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

/// Caller-facing search filter.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Restrict to these entity types; empty means all.
    pub entity_types: Vec<String>,
    /// Restrict to these statuses; empty means everything except archived.
    pub statuses: Vec<EntityStatus>,
    /// Free-text search, delegated to the backend's FTS index.
    pub text: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    pub order: QueryOrder,
    pub reverse: bool,
}

/// Authorization filter for a search. `Unrestricted` is for internal and
/// administrative callers; `Keys` holds already-resolved keys (never raw
/// caller input) and an empty list is a caller error.
#[derive(Debug, Clone)]
pub enum AuthFilter<'a> {
    Unrestricted,
    Keys(&'a [String]),
}

/// One generated statement: SQL text plus positional parameters.
#[derive(Debug, Clone)]
pub struct BackendQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

const ENTITY_COLUMNS: &str = "e.id, e.uuid, e.type, e.name, e.auth_key, e.status, \
     e.valid, e.valid_published, e.created_at, e.updated_at, lv.version, lv.fields";

/// Build the windowed page query. Fetches one row beyond the page size so
/// the caller can tell whether another page exists. Backward paging inverts
/// the SQL order; the caller restores presentation order in memory.
pub(crate) fn build_search_query(
    query: &SearchQuery,
    auth: &AuthFilter<'_>,
    paging: ResolvedPaging,
) -> Result<BackendQuery> {
    let (mut conditions, mut params) = build_filters(query, auth)?;

    let descending = query.reverse != paging.backward;
    let (comparison, direction) = if descending {
        ("<", "DESC")
    } else {
        (">", "ASC")
    };
    let column = query.order.column();

    if let Some(cursor) = paging.cursor {
        conditions.push(format!(
            "({column}, e.id) {comparison} \
             (SELECT {bare}, id FROM entities WHERE id = ?)",
            bare = query.order.bare_column(),
        ));
        params.push(SqlValue::Integer(cursor));
    }

    let mut sql = format!("SELECT {ENTITY_COLUMNS} {}", from_clause(&conditions));
    sql.push_str(&format!(
        " ORDER BY {column} {direction}, e.id {direction} LIMIT ?"
    ));
    params.push(SqlValue::Integer(paging.count + 1));

    Ok(BackendQuery { sql, params })
}

/// Build the unpaged total-count companion of [`build_search_query`].
pub(crate) fn build_count_query(
    query: &SearchQuery,
    auth: &AuthFilter<'_>,
) -> Result<BackendQuery> {
    let (conditions, params) = build_filters(query, auth)?;
    let sql = format!("SELECT COUNT(*) {}", from_clause(&conditions));
    Ok(BackendQuery { sql, params })
}

/// Build a fixed window into the result set, used by sampling.
pub(crate) fn build_window_query(
    query: &SearchQuery,
    auth: &AuthFilter<'_>,
    offset: i64,
    count: i64,
) -> Result<BackendQuery> {
    let (conditions, mut params) = build_filters(query, auth)?;
    let direction = if query.reverse { "DESC" } else { "ASC" };
    let column = query.order.column();
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} {} ORDER BY {column} {direction}, e.id {direction} \
         LIMIT ? OFFSET ?",
        from_clause(&conditions)
    );
    params.push(SqlValue::Integer(count));
    params.push(SqlValue::Integer(offset));
    Ok(BackendQuery { sql, params })
}

fn from_clause(conditions: &[String]) -> String {
    let mut sql = String::from(
        "FROM entities e JOIN entity_versions lv ON lv.id = e.latest_entity_versions_id",
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql
}

fn build_filters(
    query: &SearchQuery,
    auth: &AuthFilter<'_>,
) -> Result<(Vec<String>, Vec<SqlValue>)> {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    match auth {
        AuthFilter::Unrestricted => {}
        AuthFilter::Keys(keys) => {
            if keys.is_empty() {
                return Err(RepositoryError::bad_request(
                    "no resolved authorization keys",
                ));
            }
            conditions.push(format!(
                "(e.resolved_auth_key IS NULL OR e.resolved_auth_key IN ({}))",
                placeholders(keys.len())
            ));
            params.extend(keys.iter().map(SqlValue::text));
        }
    }

    if !query.entity_types.is_empty() {
        conditions.push(format!(
            "e.type IN ({})",
            placeholders(query.entity_types.len())
        ));
        params.extend(query.entity_types.iter().map(SqlValue::text));
    }

    if query.statuses.is_empty() {
        conditions.push("e.status != 'archived'".to_string());
    } else {
        conditions.push(format!(
            "e.status IN ({})",
            placeholders(query.statuses.len())
        ));
        params.extend(query.statuses.iter().map(|s| SqlValue::text(s.as_str())));
    }

    if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
        conditions.push(
            "e.id IN (SELECT rowid FROM entities_latest_fts WHERE entities_latest_fts MATCH ?)"
                .to_string(),
        );
        params.push(SqlValue::text(text));
    }

    if let Some(bbox) = &query.bounding_box {
        conditions.push(
            "e.id IN (SELECT entities_id FROM entity_latest_locations \
             WHERE lat BETWEEN ? AND ? AND lng BETWEEN ? AND ?)"
                .to_string(),
        );
        params.push(SqlValue::Real(bbox.min_lat));
        params.push(SqlValue::Real(bbox.max_lat));
        params.push(SqlValue::Real(bbox.min_lng));
        params.push(SqlValue::Real(bbox.max_lng));
    }

    Ok((conditions, params))
}

fn placeholders(count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

// ── Connections ──

/// One page element with its resume cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

/// A paginated result window plus the unpaged total.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
    pub total_count: i64,
}

// ── Sampling ──

/// mulberry32: a 32-bit PRNG with a single u32 of state.
///
/// state += 0x6D2B79F5
/// t = (state ^ state >> 15) * (state | 1)
/// t ^= t + (t ^ t >> 7) * (t | 61)
/// output = (t ^ t >> 14) / 2^32
///
/// Chosen because it is trivially portable: any peer can reproduce a sample
/// from the seed alone.
#[derive(Debug, Clone)]
pub struct Mulberry32 {
    state: u32,
}

impl Mulberry32 {
    pub fn new(seed: u32) -> Self {
        Mulberry32 { state: seed }
    }

    /// Next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        f64::from(t ^ (t >> 14)) / 4_294_967_296.0
    }
}

/// Stable window start for sampling `count` of `total` rows.
pub(crate) fn sample_offset(seed: u32, total: i64, count: i64) -> i64 {
    let span = (total - count).max(0);
    (Mulberry32::new(seed).next_f64() * span as f64).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteAdapter;

    #[test]
    fn test_paging_validation() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();

        let err = resolve_paging(&adapter, &Paging::first(-1), 25, 100).unwrap_err();
        assert!(matches!(err, RepositoryError::BadRequest(_)));

        let both = Paging {
            first: Some(5),
            last: Some(5),
            ..Paging::default()
        };
        let err = resolve_paging(&adapter, &both, 25, 100).unwrap_err();
        assert!(matches!(err, RepositoryError::BadRequest(_)));

        let ok = resolve_paging(&adapter, &Paging::first(5), 25, 100).unwrap();
        assert_eq!(ok.count, 5);
        assert!(!ok.backward);
        assert_eq!(ok.cursor, None);

        let last = resolve_paging(&adapter, &Paging::last(5), 25, 100).unwrap();
        assert!(last.backward);

        let default = resolve_paging(&adapter, &Paging::default(), 25, 100).unwrap();
        assert_eq!(default.count, 25);

        let capped = resolve_paging(&adapter, &Paging::first(5000), 25, 100).unwrap();
        assert_eq!(capped.count, 100);
    }

    #[test]
    fn test_cursor_resolution() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let encoded = encode_id_cursor(&adapter, 42);
        assert_eq!(decode_id_cursor(&adapter, &encoded).unwrap(), 42);

        let paging = Paging {
            first: Some(2),
            after: Some(encoded),
            ..Paging::default()
        };
        let resolved = resolve_paging(&adapter, &paging, 25, 100).unwrap();
        assert_eq!(resolved.cursor, Some(42));

        let bogus = adapter.encode_cursor("not-a-number");
        let paging = Paging {
            first: Some(2),
            after: Some(bogus),
            ..Paging::default()
        };
        assert!(matches!(
            resolve_paging(&adapter, &paging, 25, 100),
            Err(RepositoryError::BadRequest(_))
        ));
    }

    #[test]
    fn test_search_query_filters() {
        let query = SearchQuery {
            entity_types: vec!["Article".into()],
            text: Some("fox".into()),
            bounding_box: Some(BoundingBox {
                min_lat: 55.0,
                max_lat: 56.0,
                min_lng: 12.0,
                max_lng: 14.0,
            }),
            ..SearchQuery::default()
        };
        let keys = vec!["k1".to_string(), "k2".to_string()];
        let built = build_search_query(
            &query,
            &AuthFilter::Keys(&keys),
            ResolvedPaging {
                count: 10,
                cursor: Some(7),
                backward: false,
            },
        )
        .unwrap();

        assert!(built.sql.contains("e.resolved_auth_key IN (?, ?)"));
        assert!(built.sql.contains("e.type IN (?)"));
        assert!(built.sql.contains("e.status != 'archived'"));
        assert!(built.sql.contains("entities_latest_fts MATCH ?"));
        assert!(built.sql.contains("lat BETWEEN ? AND ?"));
        assert!(built.sql.contains("(e.created_at, e.id) >"));
        assert!(built.sql.ends_with("LIMIT ?"));
        // keys, type, text, 4 bbox bounds, cursor, limit
        assert_eq!(built.params.len(), 10);
        assert_eq!(built.params.last(), Some(&SqlValue::Integer(11)));
    }

    #[test]
    fn test_backward_paging_inverts_order() {
        let query = SearchQuery {
            order: QueryOrder::Name,
            ..SearchQuery::default()
        };
        let built = build_search_query(
            &query,
            &AuthFilter::Unrestricted,
            ResolvedPaging {
                count: 5,
                cursor: Some(3),
                backward: true,
            },
        )
        .unwrap();
        assert!(built.sql.contains("(e.name, e.id) <"));
        assert!(built.sql.contains("ORDER BY e.name DESC, e.id DESC"));
    }

    #[test]
    fn test_empty_auth_keys_rejected() {
        let keys: Vec<String> = Vec::new();
        let err = build_count_query(&SearchQuery::default(), &AuthFilter::Keys(&keys)).unwrap_err();
        assert!(matches!(err, RepositoryError::BadRequest(_)));
    }

    #[test]
    fn test_count_query_has_no_window() {
        let built = build_count_query(&SearchQuery::default(), &AuthFilter::Unrestricted).unwrap();
        assert!(built.sql.starts_with("SELECT COUNT(*)"));
        assert!(!built.sql.contains("LIMIT"));
    }

    #[test]
    fn test_mulberry32_is_deterministic() {
        let mut a = Mulberry32::new(1234);
        let mut b = Mulberry32::new(1234);
        for _ in 0..100 {
            let va = a.next_f64();
            assert_eq!(va, b.next_f64());
            assert!((0.0..1.0).contains(&va));
        }
        let mut c = Mulberry32::new(1235);
        assert_ne!(Mulberry32::new(1234).next_f64(), c.next_f64());
    }

    #[test]
    fn test_sample_offset_bounds() {
        for seed in 0..50 {
            let offset = sample_offset(seed, 100, 10);
            assert!((0..=90).contains(&offset));
        }
        assert_eq!(sample_offset(7, 5, 10), 0);
    }
}
