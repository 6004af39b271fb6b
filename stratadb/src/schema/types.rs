use serde::{Deserialize, Serialize};

/// Top-level schema specification, supplied by callers and persisted
/// verbatim in `schema_versions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSpecification {
    /// Monotonic version, incremented by one on every accepted update.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeSpec>,
    #[serde(default)]
    pub component_types: Vec<ComponentTypeSpec>,
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

/// Definition of one entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeSpec {
    pub name: String,
    #[serde(default)]
    pub admin_only: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// Definition of one component type (a nested, non-entity value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTypeSpec {
    pub name: String,
    #[serde(default)]
    pub admin_only: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// Definition of a single field in an entity or component type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub admin_only: bool,
    /// Whether the value is a list of items of `field_type`.
    #[serde(default)]
    pub list: bool,
    /// String fields only: allow embedded line breaks.
    #[serde(default)]
    pub multiline: bool,
    /// String fields only: name of a declared pattern the value must match.
    #[serde(default)]
    pub pattern: Option<String>,
    /// String fields only: name of a declared unique index this field feeds.
    #[serde(default)]
    pub index: Option<String>,
    /// Reference and rich-text fields: allowed target entity types.
    #[serde(default)]
    pub entity_types: Vec<String>,
    /// Component and rich-text fields: allowed component types.
    #[serde(default)]
    pub component_types: Vec<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            required: false,
            admin_only: false,
            list: false,
            multiline: false,
            pattern: None,
            index: None,
            entity_types: Vec::new(),
            component_types: Vec::new(),
        }
    }
}

/// Closed union of supported field kinds. Adding a kind is a
/// compile-time-checked change everywhere fields are dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Location,
    RichText,
    Reference,
    Component,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Location => "location",
            FieldType::RichText => "richText",
            FieldType::Reference => "reference",
            FieldType::Component => "component",
        }
    }
}

/// A named regular expression referenced by string fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    pub pattern: String,
}

/// A named index referenced by string fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexType {
    Unique,
}
