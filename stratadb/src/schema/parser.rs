use super::types::SchemaSpecification;
use crate::error::Result;

/// Parse a schema specification document. YAML is a superset of JSON, so
/// both serializations are accepted.
pub fn parse_spec_str(content: &str) -> Result<SchemaSpecification> {
    let spec: SchemaSpecification = serde_yaml::from_str(content)?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{FieldType, IndexType};

    #[test]
    fn test_parse_yaml_spec() {
        let spec = parse_spec_str(
            r#"
entityTypes:
  - name: Article
    fields:
      - name: title
        type: string
        required: true
      - name: slug
        type: string
        index: articleSlug
      - name: body
        type: richText
componentTypes:
  - name: Quote
    fields:
      - name: text
        type: string
patterns:
  - name: slug
    pattern: "^[a-z0-9-]+$"
indexes:
  - name: articleSlug
    type: unique
"#,
        )
        .unwrap();

        assert_eq!(spec.entity_types.len(), 1);
        assert_eq!(spec.entity_types[0].name, "Article");
        assert_eq!(spec.entity_types[0].fields[0].field_type, FieldType::String);
        assert!(spec.entity_types[0].fields[0].required);
        assert_eq!(
            spec.entity_types[0].fields[1].index.as_deref(),
            Some("articleSlug")
        );
        assert_eq!(spec.component_types[0].name, "Quote");
        assert_eq!(spec.indexes[0].index_type, IndexType::Unique);
    }

    #[test]
    fn test_parse_json_spec() {
        let spec = parse_spec_str(
            r#"{"entityTypes": [{"name": "Note", "fields": [{"name": "text", "type": "string"}]}]}"#,
        )
        .unwrap();
        assert_eq!(spec.entity_types[0].name, "Note");
    }

    #[test]
    fn test_parse_rejects_unknown_field_type() {
        assert!(parse_spec_str(
            r#"
entityTypes:
  - name: Note
    fields:
      - name: text
        type: blob
"#
        )
        .is_err());
    }
}
