//! Schema model: specification types, validation, and the published
//! projection. A [`Schema`] is immutable once validated; schema updates
//! always build and swap in a whole new object.

mod parser;
mod types;
mod validator;

pub use parser::parse_spec_str;
pub use types::{
    ComponentTypeSpec, EntityTypeSpec, FieldSpec, FieldType, IndexSpec, IndexType, PatternSpec,
    SchemaSpecification,
};

use crate::error::{RepositoryError, Result};
use regex::Regex;
use std::collections::HashMap;

/// A validated, queryable schema with pre-compiled patterns.
#[derive(Debug)]
pub struct Schema {
    spec: SchemaSpecification,
    patterns: HashMap<String, Regex>,
}

impl Schema {
    /// Validate a specification into a usable schema. All problems are
    /// reported together as a `Validation` error.
    pub fn validate(spec: SchemaSpecification) -> Result<Schema> {
        let issues = validator::validate_spec(&spec);
        if !issues.is_empty() {
            return Err(RepositoryError::Validation(issues));
        }
        let mut patterns = HashMap::new();
        for pattern in &spec.patterns {
            // Compilation already succeeded during validation.
            let compiled = Regex::new(&pattern.pattern)
                .map_err(|err| RepositoryError::generic(format!("pattern compile: {err}")))?;
            patterns.insert(pattern.name.clone(), compiled);
        }
        Ok(Schema { spec, patterns })
    }

    /// An empty schema, used before the first specification update.
    pub fn empty() -> Schema {
        Schema {
            spec: SchemaSpecification::default(),
            patterns: HashMap::new(),
        }
    }

    pub fn spec(&self) -> &SchemaSpecification {
        &self.spec
    }

    pub fn version(&self) -> u64 {
        self.spec.version
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityTypeSpec> {
        self.spec.entity_types.iter().find(|t| t.name == name)
    }

    pub fn component_type(&self, name: &str) -> Option<&ComponentTypeSpec> {
        self.spec.component_types.iter().find(|t| t.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.spec.indexes.iter().find(|i| i.name == name)
    }

    pub fn pattern(&self, name: &str) -> Option<&Regex> {
        self.patterns.get(name)
    }

    /// Derive the read-only published projection: admin-only fields are
    /// dropped, and types that are admin-only (or end up with no fields at
    /// all) disappear entirely. References to dropped types are scrubbed so
    /// the projection re-validates cleanly.
    pub fn to_published(&self) -> Result<Schema> {
        let mut spec = self.spec.clone();

        spec.entity_types.retain(|t| !t.admin_only);
        spec.component_types.retain(|t| !t.admin_only);
        for entity_type in &mut spec.entity_types {
            entity_type.fields.retain(|f| !f.admin_only);
        }
        for component_type in &mut spec.component_types {
            component_type.fields.retain(|f| !f.admin_only);
        }
        spec.entity_types.retain(|t| !t.fields.is_empty());
        spec.component_types.retain(|t| !t.fields.is_empty());

        let entity_names: Vec<String> =
            spec.entity_types.iter().map(|t| t.name.clone()).collect();
        let component_names: Vec<String> = spec
            .component_types
            .iter()
            .map(|t| t.name.clone())
            .collect();
        for fields in spec
            .entity_types
            .iter_mut()
            .map(|t| &mut t.fields)
            .chain(spec.component_types.iter_mut().map(|t| &mut t.fields))
        {
            for field in fields {
                field.entity_types.retain(|n| entity_names.contains(n));
                field
                    .component_types
                    .retain(|n| component_names.contains(n));
            }
        }

        Schema::validate(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_spec() -> SchemaSpecification {
        parse_spec_str(
            r#"
version: 1
entityTypes:
  - name: Article
    fields:
      - name: title
        type: string
        required: true
      - name: internalNotes
        type: string
        adminOnly: true
      - name: related
        type: reference
        entityTypes: [Article, Draft]
  - name: Draft
    adminOnly: true
    fields:
      - name: note
        type: string
componentTypes:
  - name: Secret
    fields:
      - name: hidden
        type: string
        adminOnly: true
patterns:
  - name: slug
    pattern: "^[a-z0-9-]+$"
indexes:
  - name: slug
    type: unique
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_and_lookups() {
        let schema = Schema::validate(sample_spec()).unwrap();
        assert_eq!(schema.version(), 1);
        assert!(schema.entity_type("Article").is_some());
        assert!(schema.entity_type("Nope").is_none());
        assert!(schema.pattern("slug").unwrap().is_match("a-slug-1"));
        assert!(schema.index("slug").is_some());
    }

    #[test]
    fn test_validate_reports_all_issues() {
        let spec = parse_spec_str(
            r#"
entityTypes:
  - name: bad
    fields:
      - name: x
        type: string
        pattern: missing
"#,
        )
        .unwrap();
        let err = Schema::validate(spec).unwrap_err();
        let issues = err.issues().unwrap();
        assert!(issues.len() >= 2);
    }

    #[test]
    fn test_published_projection_drops_admin_only() {
        let schema = Schema::validate(sample_spec()).unwrap();
        let published = schema.to_published().unwrap();

        let article = published.entity_type("Article").unwrap();
        assert_eq!(
            article
                .fields
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>(),
            vec!["title", "related"]
        );
        // Draft is admin-only, Secret loses its only field: both gone, and
        // the dangling reference to Draft is scrubbed.
        assert!(published.entity_type("Draft").is_none());
        assert!(published.component_type("Secret").is_none());
        let related = article.fields.iter().find(|f| f.name == "related").unwrap();
        assert_eq!(related.entity_types, vec!["Article".to_string()]);
    }

    #[test]
    fn test_published_projection_idempotent() {
        let schema = Schema::validate(sample_spec()).unwrap();
        let published = schema.to_published().unwrap();
        let republished = published.to_published().unwrap();
        assert_eq!(published.spec(), republished.spec());
    }
}
