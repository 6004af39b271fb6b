//! Search, counting, and sampling against the repository.

use crate::backend::{DatabaseAdapter, SqlRow};
use crate::entity::{Entity, EntityInfo, EntityStatus};
use crate::error::{RepositoryError, Result};
use crate::query::{
    build_count_query, build_search_query, build_window_query, encode_id_cursor, resolve_paging,
    sample_offset, AuthFilter, Connection, Edge, PageInfo, Paging, SearchQuery,
};
use crate::store::{parse_fields, parse_time, parse_uuid, Repository};

/// A page of entities. Alias kept for signature readability.
pub type EntityPage = Connection<Entity>;

/// Column order matches `ENTITY_COLUMNS` in the query builder.
fn entity_from_search_row(row: &SqlRow) -> Result<(i64, Entity)> {
    let internal_id = row.integer(0)?;
    let entity = Entity {
        id: parse_uuid(row.text(1)?)?,
        info: EntityInfo {
            entity_type: row.text(2)?.to_string(),
            name: row.text(3)?.to_string(),
            version: row.integer(10)?,
            auth_key: row.opt_text(4)?.map(str::to_string),
            status: EntityStatus::parse(row.text(5)?)?,
            valid: row.boolean(6)?,
            valid_published: row.opt_boolean(7)?.unwrap_or(false),
            created_at: parse_time(row.text(8)?)?,
            updated_at: parse_time(row.text(9)?)?,
        },
        fields: parse_fields(row.text(11)?)?,
    };
    Ok((internal_id, entity))
}

impl<A: DatabaseAdapter> Repository<A> {
    /// Cursor-paginated entity search.
    ///
    /// The window query and the total-count query run separately, so the
    /// total stays correct even though only a page of rows is materialized.
    pub fn search_entities(
        &self,
        auth: &AuthFilter<'_>,
        query: &SearchQuery,
        paging: &Paging,
    ) -> Result<EntityPage> {
        let resolved = resolve_paging(
            &self.adapter,
            paging,
            self.config.default_page_size,
            self.config.max_page_size,
        )?;
        let built = build_search_query(query, auth, resolved)?;
        let mut rows = self.adapter.query(&built.sql, &built.params)?;

        let has_more = rows.len() as i64 > resolved.count;
        rows.truncate(resolved.count as usize);
        if resolved.backward {
            rows.reverse();
        }

        let mut edges = Vec::with_capacity(rows.len());
        for row in &rows {
            let (internal_id, entity) = entity_from_search_row(row)?;
            edges.push(Edge {
                cursor: encode_id_cursor(&self.adapter, internal_id),
                node: entity,
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
            total_count: self.get_entities_total_count(auth, query)?,
        })
    }

    /// How many entities match the query, ignoring paging.
    pub fn get_entities_total_count(
        &self,
        auth: &AuthFilter<'_>,
        query: &SearchQuery,
    ) -> Result<i64> {
        let built = build_count_query(query, auth)?;
        self.adapter.query_one(&built.sql, &built.params)?.integer(0)
    }

    /// Up to `count` entities from a stable pseudo-random window of the
    /// result set. Reproducible: the same seed, query, and entity set give
    /// the same sample.
    pub fn sample_entities(
        &self,
        auth: &AuthFilter<'_>,
        query: &SearchQuery,
        seed: u32,
        count: i64,
    ) -> Result<Vec<Entity>> {
        if count < 0 {
            return Err(RepositoryError::bad_request(
                "sample size must not be negative",
            ));
        }
        let total = self.get_entities_total_count(auth, query)?;
        let offset = sample_offset(seed, total, count);
        let built = build_window_query(query, auth, offset, count)?;
        let rows = self.adapter.query(&built.sql, &built.params)?;
        rows.iter()
            .map(|row| entity_from_search_row(row).map(|(_, entity)| entity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteAdapter;
    use crate::entity::{EntityCreate, ResolvedAuthKey};
    use crate::query::{BoundingBox, QueryOrder};
    use crate::schema::parse_spec_str;
    use crate::store::Session;
    use serde_json::json;

    fn repo() -> Repository<SqliteAdapter> {
        let repo = Repository::new(SqliteAdapter::open_in_memory().unwrap()).unwrap();
        let spec = parse_spec_str(
            r#"
version: 1
entityTypes:
  - name: Place
    fields:
      - name: title
        type: string
        required: true
      - name: position
        type: location
  - name: Note
    fields:
      - name: text
        type: string
"#,
        )
        .unwrap();
        repo.update_schema_specification(&Session::new("admin"), spec)
            .unwrap();
        repo
    }

    fn place(name: &str, title: &str, position: Option<(f64, f64)>) -> EntityCreate {
        let mut fields = json!({"title": title}).as_object().unwrap().clone();
        if let Some((lat, lng)) = position {
            fields.insert("position".into(), json!({"lat": lat, "lng": lng}));
        }
        EntityCreate {
            entity_type: "Place".into(),
            name: name.into(),
            auth_key: None,
            fields,
        }
    }

    fn names(page: &EntityPage) -> Vec<String> {
        page.edges
            .iter()
            .map(|e| e.node.info.name.clone())
            .collect()
    }

    #[test]
    fn test_forward_and_backward_paging() {
        let repo = repo();
        let session = Session::new("writer");
        for name in ["a", "b", "c", "d", "e"] {
            repo.create_entity(&session, &place(name, name, None)).unwrap();
        }
        let query = SearchQuery {
            order: QueryOrder::Name,
            ..SearchQuery::default()
        };

        let first = repo
            .search_entities(&AuthFilter::Unrestricted, &query, &Paging::first(2))
            .unwrap();
        assert_eq!(names(&first), vec!["a", "b"]);
        assert_eq!(first.total_count, 5);
        assert!(first.page_info.has_next_page);
        assert!(!first.page_info.has_previous_page);

        let second = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &query,
                &Paging {
                    first: Some(2),
                    after: first.page_info.end_cursor.clone(),
                    ..Paging::default()
                },
            )
            .unwrap();
        assert_eq!(names(&second), vec!["c", "d"]);
        assert!(second.page_info.has_previous_page);

        let tail = repo
            .search_entities(&AuthFilter::Unrestricted, &query, &Paging::last(2))
            .unwrap();
        assert_eq!(names(&tail), vec!["d", "e"]);
        assert!(tail.page_info.has_previous_page);
        assert!(!tail.page_info.has_next_page);

        let before_tail = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &query,
                &Paging {
                    last: Some(2),
                    before: tail.page_info.start_cursor.clone(),
                    ..Paging::default()
                },
            )
            .unwrap();
        assert_eq!(names(&before_tail), vec!["b", "c"]);
    }

    #[test]
    fn test_reverse_order() {
        let repo = repo();
        let session = Session::new("writer");
        for name in ["a", "b", "c"] {
            repo.create_entity(&session, &place(name, name, None)).unwrap();
        }
        let query = SearchQuery {
            order: QueryOrder::Name,
            reverse: true,
            ..SearchQuery::default()
        };
        let page = repo
            .search_entities(&AuthFilter::Unrestricted, &query, &Paging::first(10))
            .unwrap();
        assert_eq!(names(&page), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_archived_excluded_by_default() {
        let repo = repo();
        let session = Session::new("writer");
        repo.create_entity(&session, &place("kept", "k", None)).unwrap();
        let gone = repo.create_entity(&session, &place("gone", "g", None)).unwrap();
        repo.archive_entity(&session, gone.id).unwrap();

        let page = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &SearchQuery::default(),
                &Paging::first(10),
            )
            .unwrap();
        assert_eq!(names(&page), vec!["kept"]);
        assert_eq!(page.total_count, 1);

        // An explicit status filter can reach archived entities.
        let archived = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &SearchQuery {
                    statuses: vec![EntityStatus::Archived],
                    ..SearchQuery::default()
                },
                &Paging::first(10),
            )
            .unwrap();
        assert_eq!(names(&archived), vec!["gone"]);
    }

    #[test]
    fn test_type_and_text_filters() {
        let repo = repo();
        let session = Session::new("writer");
        repo.create_entity(&session, &place("fox-place", "the quick brown fox", None))
            .unwrap();
        repo.create_entity(&session, &place("dog-place", "the lazy dog", None))
            .unwrap();
        repo.create_entity(
            &session,
            &EntityCreate {
                entity_type: "Note".into(),
                name: "fox-note".into(),
                auth_key: None,
                fields: json!({"text": "fox sighting"}).as_object().unwrap().clone(),
            },
        )
        .unwrap();

        let foxes = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &SearchQuery {
                    text: Some("fox".into()),
                    ..SearchQuery::default()
                },
                &Paging::first(10),
            )
            .unwrap();
        assert_eq!(foxes.total_count, 2);

        let fox_places = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &SearchQuery {
                    entity_types: vec!["Place".into()],
                    text: Some("fox".into()),
                    ..SearchQuery::default()
                },
                &Paging::first(10),
            )
            .unwrap();
        assert_eq!(names(&fox_places), vec!["fox-place"]);
    }

    #[test]
    fn test_bounding_box_filter() {
        let repo = repo();
        let session = Session::new("writer");
        repo.create_entity(&session, &place("inside", "a", Some((55.6, 13.0))))
            .unwrap();
        repo.create_entity(&session, &place("outside", "b", Some((48.9, 2.35))))
            .unwrap();
        repo.create_entity(&session, &place("nowhere", "c", None)).unwrap();

        let page = repo
            .search_entities(
                &AuthFilter::Unrestricted,
                &SearchQuery {
                    bounding_box: Some(BoundingBox {
                        min_lat: 55.0,
                        max_lat: 56.0,
                        min_lng: 12.0,
                        max_lng: 14.0,
                    }),
                    ..SearchQuery::default()
                },
                &Paging::first(10),
            )
            .unwrap();
        assert_eq!(names(&page), vec!["inside"]);
    }

    #[test]
    fn test_auth_key_filter() {
        let repo = repo();
        let session = Session::new("writer");
        repo.create_entity(&session, &place("public", "p", None)).unwrap();
        repo.create_entity(
            &session,
            &EntityCreate {
                auth_key: Some(ResolvedAuthKey {
                    key: "team".into(),
                    resolved: "team-resolved".into(),
                }),
                ..place("guarded", "g", None)
            },
        )
        .unwrap();

        let team = vec!["team-resolved".to_string()];
        let other = vec!["other".to_string()];
        let query = SearchQuery {
            order: QueryOrder::Name,
            ..SearchQuery::default()
        };

        let seen = repo
            .search_entities(&AuthFilter::Keys(&team), &query, &Paging::first(10))
            .unwrap();
        assert_eq!(names(&seen), vec!["guarded", "public"]);

        let filtered = repo
            .search_entities(&AuthFilter::Keys(&other), &query, &Paging::first(10))
            .unwrap();
        assert_eq!(names(&filtered), vec!["public"]);

        let none: Vec<String> = Vec::new();
        assert!(matches!(
            repo.search_entities(&AuthFilter::Keys(&none), &query, &Paging::first(10)),
            Err(RepositoryError::BadRequest(_))
        ));
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let repo = repo();
        let session = Session::new("writer");
        for i in 0..20 {
            repo.create_entity(&session, &place(&format!("p{i:02}"), "x", None))
                .unwrap();
        }
        let query = SearchQuery::default();

        let a = repo
            .sample_entities(&AuthFilter::Unrestricted, &query, 99, 5)
            .unwrap();
        let b = repo
            .sample_entities(&AuthFilter::Unrestricted, &query, 99, 5)
            .unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(
            a.iter().map(|e| e.id).collect::<Vec<_>>(),
            b.iter().map(|e| e.id).collect::<Vec<_>>()
        );

        assert!(matches!(
            repo.sample_entities(&AuthFilter::Unrestricted, &query, 99, -1),
            Err(RepositoryError::BadRequest(_))
        ));

        // Asking for more than exists returns everything.
        let all = repo
            .sample_entities(&AuthFilter::Unrestricted, &query, 7, 50)
            .unwrap();
        assert_eq!(all.len(), 20);
    }
}
