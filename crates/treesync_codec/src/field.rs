//! Declared field types and typed field values.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The declared type of an entity field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Free text.
    Text,
    /// Signed integer.
    Integer,
    /// Boolean flag.
    Boolean,
    /// Point in time.
    Timestamp,
    /// Binary blob.
    Binary,
    /// One variant of a closed enumeration.
    Enum {
        /// Name of the enumeration.
        name: String,
        /// Accepted variant names.
        variants: Vec<String>,
    },
    /// String-to-string map.
    Map,
    /// Reference to an entity type by name.
    Class,
    /// Locale tag such as `en_US`.
    Locale,
    /// Reference to another entity, carried as its global id.
    Reference(String),
    /// Ordered collection of one element type.
    List(Box<FieldType>),
}

impl FieldType {
    /// Create an enum type.
    pub fn enumeration(name: impl Into<String>, variants: &[&str]) -> Self {
        FieldType::Enum {
            name: name.into(),
            variants: variants.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    /// Create a reference to the given entity type.
    pub fn reference(entity_type: impl Into<String>) -> Self {
        FieldType::Reference(entity_type.into())
    }

    /// Create a list of the given element type.
    pub fn list(element: FieldType) -> Self {
        FieldType::List(Box::new(element))
    }

    /// The normalized name used as the normalizer registry key.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Binary => "binary",
            FieldType::Enum { .. } => "enum",
            FieldType::Map => "map",
            FieldType::Class => "class",
            FieldType::Locale => "locale",
            FieldType::Reference(_) => "reference",
            FieldType::List(_) => "list",
        }
    }
}

/// A typed field value of a domain entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Field is unset.
    Null,
    /// Free text.
    Text(String),
    /// Signed integer.
    Integer(i64),
    /// Boolean flag.
    Boolean(bool),
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// Binary blob.
    Binary(Vec<u8>),
    /// Enumeration variant name.
    Enum(String),
    /// String-to-string map.
    Map(BTreeMap<String, String>),
    /// Entity type name.
    Class(String),
    /// Locale tag.
    Locale(String),
    /// Global id of a referenced entity.
    Reference(Uuid),
    /// Ordered collection.
    List(Vec<FieldValue>),
}

/// Field values of one entity instance, keyed by field name.
pub type EntityFields = BTreeMap<String, FieldValue>;

/// Looks up whether a referenced entity exists.
///
/// Decoding a reference consults this so that a payload pointing at an
/// entity the receiver has never seen fails up front.
pub trait ReferenceResolver {
    /// Returns true if an entity of `entity_type` with `id` exists.
    fn exists(&self, entity_type: &str, id: &Uuid) -> bool;
}

impl<F> ReferenceResolver for F
where
    F: Fn(&str, &Uuid) -> bool,
{
    fn exists(&self, entity_type: &str, id: &Uuid) -> bool {
        self(entity_type, id)
    }
}
