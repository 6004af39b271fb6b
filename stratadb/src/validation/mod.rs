//! Content validation and traversal.
//!
//! [`analyze_fields`] walks entity field values against their field
//! specifications in one pass, producing path-addressed issues plus the
//! derived data every write needs anyway: collected entity references,
//! location points, full-text content, and unique-index values. Traversal is
//! iterative with an explicit work stack and a depth cap, so malformed or
//! deeply nested values cannot blow the stack; a bad sub-document becomes an
//! issue at its path instead of aborting the rest of the walk.

use crate::schema::{FieldSpec, FieldType, Schema};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// One step in a path to a value inside an entity's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Render a path as `title`, `items[2].name`, ...
pub fn format_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSegment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// A single validation problem at a path.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub path: Vec<PathSegment>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: Vec<PathSegment>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", format_path(&self.path), self.message)
    }
}

/// What the walk is checking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Structural correctness: required-ness, type match, pattern match.
    Save,
    /// Everything `Save` checks, plus publish policy: admin-only values are
    /// rejected. Reference publishability is checked by the caller against
    /// storage, using the references collected here.
    Publish,
}

/// An entity reference found during traversal, with the path it sits at so
/// storage-level checks can report usable issues.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedReference {
    pub path: Vec<PathSegment>,
    pub id: Uuid,
}

/// Everything one traversal of an entity's fields produces.
#[derive(Debug, Default)]
pub struct ContentAnalysis {
    pub issues: Vec<ValidationIssue>,
    pub references: Vec<CollectedReference>,
    pub locations: Vec<(f64, f64)>,
    pub full_text: String,
    /// `(index name, value)` pairs the entity should own.
    pub index_values: Vec<(String, String)>,
}

impl ContentAnalysis {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    fn issue(&mut self, path: &[PathSegment], message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path.to_vec(), message));
    }

    fn push_text(&mut self, text: &str) {
        if !self.full_text.is_empty() {
            self.full_text.push(' ');
        }
        self.full_text.push_str(text);
    }
}

/// Paths deeper than this are reported instead of descended into. Bounds
/// traversal of self-referential or absurdly nested documents.
const MAX_PATH_DEPTH: usize = 32;

struct Work<'a> {
    path: Vec<PathSegment>,
    spec: &'a FieldSpec,
    value: Option<&'a Value>,
    /// Set when this is one item of a list field, so the list wrapper is not
    /// expected again.
    list_item: bool,
}

/// Walk `fields` against the field specifications of one entity or component
/// type.
pub fn analyze_fields(
    schema: &Schema,
    mode: ValidationMode,
    specs: &[FieldSpec],
    fields: &Map<String, Value>,
) -> ContentAnalysis {
    let mut analysis = ContentAnalysis::default();
    let mut stack: Vec<Work<'_>> = Vec::new();

    push_type_fields(specs, fields, &[], &mut stack, &mut analysis);

    while let Some(work) = stack.pop() {
        let Work {
            path,
            spec,
            value,
            list_item,
        } = work;

        if path.len() > MAX_PATH_DEPTH {
            analysis.issue(&path, "value is nested too deeply");
            continue;
        }

        let value = match value {
            Some(Value::Null) | None => {
                if spec.required && !list_item {
                    analysis.issue(&path, "required field is missing");
                }
                continue;
            }
            Some(value) => value,
        };

        if mode == ValidationMode::Publish && spec.admin_only {
            analysis.issue(&path, "admin-only field is not allowed in published content");
            continue;
        }

        if spec.list && !list_item {
            let items = match value.as_array() {
                Some(items) => items,
                None => {
                    analysis.issue(&path, format!("expected list, got {}", type_name(value)));
                    continue;
                }
            };
            // Reverse keeps reporting order stable for a LIFO stack.
            for (index, item) in items.iter().enumerate().rev() {
                let mut item_path = path.clone();
                item_path.push(PathSegment::Index(index));
                stack.push(Work {
                    path: item_path,
                    spec,
                    value: Some(item),
                    list_item: true,
                });
            }
            continue;
        }

        match spec.field_type {
            FieldType::String => {
                let text = match value.as_str() {
                    Some(text) => text,
                    None => {
                        analysis
                            .issue(&path, format!("expected string, got {}", type_name(value)));
                        continue;
                    }
                };
                if !spec.multiline && text.contains('\n') {
                    analysis.issue(&path, "multiline value not allowed");
                }
                if let Some(pattern_name) = &spec.pattern {
                    if let Some(pattern) = schema.pattern(pattern_name) {
                        if !pattern.is_match(text) {
                            analysis.issue(
                                &path,
                                format!("value does not match pattern '{pattern_name}'"),
                            );
                        }
                    }
                }
                if let Some(index) = &spec.index {
                    analysis.index_values.push((index.clone(), text.to_string()));
                }
                analysis.push_text(text);
            }
            FieldType::Number => {
                if !value.is_number() {
                    analysis.issue(&path, format!("expected number, got {}", type_name(value)));
                }
            }
            FieldType::Boolean => {
                if !value.is_boolean() {
                    analysis
                        .issue(&path, format!("expected boolean, got {}", type_name(value)));
                }
            }
            FieldType::Location => match location_of(value) {
                Some(point) => analysis.locations.push(point),
                None => {
                    analysis.issue(&path, "expected location with numeric lat and lng");
                }
            },
            FieldType::Reference => match reference_id(value) {
                Some(id) => analysis.references.push(CollectedReference { path, id }),
                None => {
                    analysis.issue(&path, "expected entity reference with a uuid id");
                }
            },
            FieldType::Component => {
                descend_component(schema, mode, &path, spec, value, &mut stack, &mut analysis);
            }
            FieldType::RichText => {
                walk_rich_text(schema, mode, &path, spec, value, &mut stack, &mut analysis);
            }
        }
    }

    analysis
}

/// Queue every declared field of a type, and flag undeclared keys.
fn push_type_fields<'a>(
    specs: &'a [FieldSpec],
    fields: &'a Map<String, Value>,
    base_path: &[PathSegment],
    stack: &mut Vec<Work<'a>>,
    analysis: &mut ContentAnalysis,
) {
    for key in fields.keys() {
        if key != "type" && !specs.iter().any(|s| &s.name == key) {
            let mut path = base_path.to_vec();
            path.push(PathSegment::Field(key.clone()));
            analysis.issue(&path, format!("unknown field '{key}'"));
        }
    }
    for spec in specs.iter().rev() {
        let mut path = base_path.to_vec();
        path.push(PathSegment::Field(spec.name.clone()));
        stack.push(Work {
            path,
            spec,
            value: fields.get(&spec.name),
            list_item: false,
        });
    }
}

fn descend_component<'a>(
    schema: &'a Schema,
    mode: ValidationMode,
    path: &[PathSegment],
    spec: &FieldSpec,
    value: &'a Value,
    stack: &mut Vec<Work<'a>>,
    analysis: &mut ContentAnalysis,
) {
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            analysis.issue(path, format!("expected component, got {}", type_name(value)));
            return;
        }
    };
    let type_tag = match object.get("type").and_then(Value::as_str) {
        Some(tag) => tag,
        None => {
            analysis.issue(path, "component value is missing its type tag");
            return;
        }
    };
    let component_type = match schema.component_type(type_tag) {
        Some(component_type) => component_type,
        None => {
            analysis.issue(path, format!("unknown component type '{type_tag}'"));
            return;
        }
    };
    if !spec.component_types.is_empty() && !spec.component_types.iter().any(|t| t == type_tag) {
        analysis.issue(
            path,
            format!("component type '{type_tag}' is not allowed here"),
        );
        return;
    }
    if mode == ValidationMode::Publish && component_type.admin_only {
        analysis.issue(
            path,
            format!("admin-only component type '{type_tag}' is not allowed in published content"),
        );
        return;
    }
    push_type_fields(&component_type.fields, object, path, stack, analysis);
}

/// Walk a rich-text document. Nodes are objects with a `type` tag; `root`,
/// `paragraph` and `heading` carry `children`, `text` carries text,
/// `entity` carries an `id`, and `component` carries component `data`.
/// Anything else is reported at its path and skipped.
fn walk_rich_text<'a>(
    schema: &'a Schema,
    mode: ValidationMode,
    base_path: &[PathSegment],
    spec: &FieldSpec,
    value: &'a Value,
    field_stack: &mut Vec<Work<'a>>,
    analysis: &mut ContentAnalysis,
) {
    let mut nodes: Vec<(Vec<PathSegment>, &Value)> = vec![(base_path.to_vec(), value)];

    while let Some((path, node)) = nodes.pop() {
        if path.len() > MAX_PATH_DEPTH {
            analysis.issue(&path, "rich text is nested too deeply");
            continue;
        }
        let object = match node.as_object() {
            Some(object) => object,
            None => {
                analysis.issue(
                    &path,
                    format!("expected rich text node, got {}", type_name(node)),
                );
                continue;
            }
        };
        let node_type = match object.get("type").and_then(Value::as_str) {
            Some(node_type) => node_type,
            None => {
                analysis.issue(&path, "rich text node is missing its type tag");
                continue;
            }
        };

        match node_type {
            "root" | "paragraph" | "heading" => {
                match object.get("children") {
                    Some(Value::Array(children)) => {
                        for (index, child) in children.iter().enumerate().rev() {
                            let mut child_path = path.clone();
                            child_path.push(PathSegment::Field("children".into()));
                            child_path.push(PathSegment::Index(index));
                            nodes.push((child_path, child));
                        }
                    }
                    Some(other) => {
                        analysis.issue(
                            &path,
                            format!("expected children list, got {}", type_name(other)),
                        );
                    }
                    None => {}
                }
            }
            "text" => match object.get("text").and_then(Value::as_str) {
                Some(text) => analysis.push_text(text),
                None => analysis.issue(&path, "text node is missing its text"),
            },
            "entity" => match object.get("id").and_then(Value::as_str) {
                Some(raw) => match Uuid::parse_str(raw) {
                    Ok(id) => analysis.references.push(CollectedReference {
                        path: path.clone(),
                        id,
                    }),
                    Err(_) => analysis.issue(&path, "entity node has a malformed id"),
                },
                None => analysis.issue(&path, "entity node is missing its id"),
            },
            "component" => match object.get("data") {
                Some(data) => {
                    descend_component(schema, mode, &path, spec, data, field_stack, analysis);
                }
                None => analysis.issue(&path, "component node is missing its data"),
            },
            other => {
                analysis.issue(&path, format!("unknown rich text node type '{other}'"));
            }
        }
    }
}

fn location_of(value: &Value) -> Option<(f64, f64)> {
    let object = value.as_object()?;
    let lat = object.get("lat")?.as_f64()?;
    let lng = object.get("lng")?.as_f64()?;
    Some((lat, lng))
}

fn reference_id(value: &Value) -> Option<Uuid> {
    let raw = value.as_object()?.get("id")?.as_str()?;
    Uuid::parse_str(raw).ok()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
