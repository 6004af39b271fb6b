use super::types::{FieldSpec, FieldType, SchemaSpecification};
use crate::validation::{PathSegment, ValidationIssue};
use std::collections::HashSet;

/// Check a specification for internal consistency. Returns every problem
/// found, not just the first.
pub fn validate_spec(spec: &SchemaSpecification) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut type_names: HashSet<&str> = HashSet::new();
    let mut pattern_names: HashSet<&str> = HashSet::new();
    let mut index_names: HashSet<&str> = HashSet::new();

    for pattern in &spec.patterns {
        if !pattern_names.insert(&pattern.name) {
            issues.push(issue(
                vec![seg("patterns"), seg(&pattern.name)],
                format!("duplicate pattern name '{}'", pattern.name),
            ));
        }
        if let Err(err) = regex::Regex::new(&pattern.pattern) {
            issues.push(issue(
                vec![seg("patterns"), seg(&pattern.name)],
                format!("pattern does not compile: {err}"),
            ));
        }
    }

    for index in &spec.indexes {
        if !index_names.insert(&index.name) {
            issues.push(issue(
                vec![seg("indexes"), seg(&index.name)],
                format!("duplicate index name '{}'", index.name),
            ));
        }
    }

    let entity_type_names: HashSet<&str> =
        spec.entity_types.iter().map(|t| t.name.as_str()).collect();
    let component_type_names: HashSet<&str> = spec
        .component_types
        .iter()
        .map(|t| t.name.as_str())
        .collect();

    let all_types = spec
        .entity_types
        .iter()
        .map(|t| (t.name.as_str(), &t.fields))
        .chain(
            spec.component_types
                .iter()
                .map(|t| (t.name.as_str(), &t.fields)),
        );

    for (type_name, fields) in all_types {
        if !is_valid_type_name(type_name) {
            issues.push(issue(
                vec![seg(type_name)],
                format!("invalid type name '{type_name}': expected CamelCase"),
            ));
        }
        if !type_names.insert(type_name) {
            issues.push(issue(
                vec![seg(type_name)],
                format!("duplicate type name '{type_name}'"),
            ));
        }

        let mut field_names: HashSet<&str> = HashSet::new();
        for field in fields {
            let path = vec![seg(type_name), seg(&field.name)];
            if !is_valid_field_name(&field.name) {
                issues.push(issue(
                    path.clone(),
                    format!("invalid field name '{}': expected camelCase", field.name),
                ));
            }
            // "type" is the tag key on component and rich-text values.
            if field.name == "type" {
                issues.push(issue(
                    path.clone(),
                    "field name 'type' is reserved for type tags".into(),
                ));
            }
            if !field_names.insert(&field.name) {
                issues.push(issue(
                    path.clone(),
                    format!("duplicate field name '{}'", field.name),
                ));
            }
            validate_field(
                field,
                &path,
                &pattern_names,
                &index_names,
                &entity_type_names,
                &component_type_names,
                &mut issues,
            );
        }
    }

    issues
}

fn validate_field(
    field: &FieldSpec,
    path: &[PathSegment],
    pattern_names: &HashSet<&str>,
    index_names: &HashSet<&str>,
    entity_type_names: &HashSet<&str>,
    component_type_names: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    let is_string = field.field_type == FieldType::String;
    if field.multiline && !is_string {
        issues.push(issue(
            path.to_vec(),
            "multiline is only supported for string fields".into(),
        ));
    }
    if let Some(pattern) = &field.pattern {
        if !is_string {
            issues.push(issue(
                path.to_vec(),
                "pattern is only supported for string fields".into(),
            ));
        } else if !pattern_names.contains(pattern.as_str()) {
            issues.push(issue(
                path.to_vec(),
                format!("unknown pattern '{pattern}'"),
            ));
        }
    }
    if let Some(index) = &field.index {
        if !is_string {
            issues.push(issue(
                path.to_vec(),
                "index is only supported for string fields".into(),
            ));
        } else if !index_names.contains(index.as_str()) {
            issues.push(issue(path.to_vec(), format!("unknown index '{index}'")));
        }
    }

    let allows_entity_types = matches!(field.field_type, FieldType::Reference | FieldType::RichText);
    if !field.entity_types.is_empty() && !allows_entity_types {
        issues.push(issue(
            path.to_vec(),
            "entityTypes is only supported for reference and richText fields".into(),
        ));
    }
    for entity_type in &field.entity_types {
        if !entity_type_names.contains(entity_type.as_str()) {
            issues.push(issue(
                path.to_vec(),
                format!("unknown entity type '{entity_type}'"),
            ));
        }
    }

    let allows_component_types =
        matches!(field.field_type, FieldType::Component | FieldType::RichText);
    if !field.component_types.is_empty() && !allows_component_types {
        issues.push(issue(
            path.to_vec(),
            "componentTypes is only supported for component and richText fields".into(),
        ));
    }
    for component_type in &field.component_types {
        if !component_type_names.contains(component_type.as_str()) {
            issues.push(issue(
                path.to_vec(),
                format!("unknown component type '{component_type}'"),
            ));
        }
    }
}

fn is_valid_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric())
}

fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric())
}

fn seg(name: &str) -> PathSegment {
    PathSegment::Field(name.to_string())
}

fn issue(path: Vec<PathSegment>, message: String) -> ValidationIssue {
    ValidationIssue::new(path, message)
}
