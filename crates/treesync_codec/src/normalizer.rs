//! Per-type normalization strategies.

use crate::error::{CodecError, CodecResult};
use crate::field::{FieldType, FieldValue, ReferenceResolver};
use crate::node::Node;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fallback layout accepted when a timestamp is not RFC 3339.
pub const TIMESTAMP_BACKUP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Converts one kind of field value to and from a [`Node`].
///
/// Null values never reach a normalizer; the registry handles them.
pub trait Normalizer: Send + Sync {
    /// Encode a typed value.
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node>;

    /// Decode a node back into a typed value.
    fn decode(
        &self,
        node: &Node,
        declared: &FieldType,
        resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue>;
}

fn value_mismatch(declared: &FieldType, value: &FieldValue) -> CodecError {
    CodecError::mismatch(declared.type_name(), format!("{value:?}"))
}

fn node_mismatch(expected: &str, node: &Node) -> CodecError {
    CodecError::mismatch(expected, node.kind())
}

fn expect_text<'a>(node: &'a Node) -> CodecResult<&'a str> {
    node.as_text().ok_or_else(|| node_mismatch("text", node))
}

/// Plain text.
#[derive(Debug, Default)]
pub struct TextNormalizer;

impl Normalizer for TextNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Text(s) => Ok(Node::Text(s.clone())),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        expect_text(node).map(|s| FieldValue::Text(s.to_string()))
    }
}

/// Signed integers.
#[derive(Debug, Default)]
pub struct IntegerNormalizer;

impl Normalizer for IntegerNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Integer(n) => Ok(Node::Integer(*n)),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        node.as_integer()
            .map(FieldValue::Integer)
            .ok_or_else(|| node_mismatch("integer", node))
    }
}

/// Booleans.
#[derive(Debug, Default)]
pub struct BooleanNormalizer;

impl Normalizer for BooleanNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Boolean(b) => Ok(Node::Bool(*b)),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        node.as_bool()
            .map(FieldValue::Boolean)
            .ok_or_else(|| node_mismatch("bool", node))
    }
}

/// Timestamps as RFC 3339 text in UTC.
///
/// Decoding also accepts the `yyyy-MM-dd HH:mm:ss.S` layout older peers
/// produce, read as UTC.
#[derive(Debug, Default)]
pub struct TimestampNormalizer;

impl TimestampNormalizer {
    fn parse(text: &str) -> CodecResult<DateTime<Utc>> {
        let text = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, TIMESTAMP_BACKUP_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|e| CodecError::invalid_value("timestamp", format!("{text:?}: {e}")))
    }
}

impl Normalizer for TimestampNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Timestamp(ts) => Ok(Node::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        Self::parse(expect_text(node)?).map(FieldValue::Timestamp)
    }
}

/// Binary blobs as byte strings.
#[derive(Debug, Default)]
pub struct BinaryNormalizer;

impl Normalizer for BinaryNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Binary(bytes) => Ok(Node::Bytes(bytes.clone())),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        node.as_bytes()
            .map(|b| FieldValue::Binary(b.to_vec()))
            .ok_or_else(|| node_mismatch("bytes", node))
    }
}

/// Enumeration variants by name, checked against the declared variants.
#[derive(Debug, Default)]
pub struct EnumNormalizer;

impl EnumNormalizer {
    fn check(declared: &FieldType, variant: &str) -> CodecResult<()> {
        match declared {
            FieldType::Enum { name, variants } if !variants.iter().any(|v| v == variant) => Err(
                CodecError::invalid_value("enum", format!("{variant:?} is not a variant of {name}")),
            ),
            _ => Ok(()),
        }
    }
}

impl Normalizer for EnumNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Enum(variant) => {
                Self::check(declared, variant)?;
                Ok(Node::Text(variant.clone()))
            }
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        let variant = expect_text(node)?;
        Self::check(declared, variant)?;
        Ok(FieldValue::Enum(variant.to_string()))
    }
}

/// String maps as map nodes with text values.
#[derive(Debug, Default)]
pub struct MapNormalizer;

impl Normalizer for MapNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Map(map) => Ok(Node::map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Node::Text(v.clone())))
                    .collect(),
            )),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        let entries = node.as_map().ok_or_else(|| node_mismatch("map", node))?;
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            let text = value.as_text().ok_or_else(|| {
                CodecError::invalid_value("map", format!("entry {key:?} is not text"))
            })?;
            map.insert(key.clone(), text.to_string());
        }
        Ok(FieldValue::Map(map))
    }
}

/// Entity type names.
#[derive(Debug, Default)]
pub struct ClassNormalizer;

impl Normalizer for ClassNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Class(name) => Ok(Node::Text(name.clone())),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        let name = expect_text(node)?;
        if name.is_empty() {
            return Err(CodecError::invalid_value("class", "empty type name"));
        }
        Ok(FieldValue::Class(name.to_string()))
    }
}

/// Locale tags of the form `lang`, `lang_COUNTRY` or `lang_COUNTRY_variant`.
#[derive(Debug, Default)]
pub struct LocaleNormalizer;

impl LocaleNormalizer {
    fn is_valid(tag: &str) -> bool {
        let mut parts = tag.split('_');
        let language_ok = parts
            .next()
            .map(|l| (2..=3).contains(&l.len()) && l.chars().all(|c| c.is_ascii_lowercase()))
            .unwrap_or(false);
        let country_ok = parts
            .next()
            .map(|c| c.len() == 2 && c.chars().all(|c| c.is_ascii_uppercase()))
            .unwrap_or(true);
        let variant_ok = parts.next().map(|v| !v.is_empty()).unwrap_or(true);
        language_ok && country_ok && variant_ok && parts.next().is_none()
    }
}

impl Normalizer for LocaleNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Locale(tag) if Self::is_valid(tag) => Ok(Node::Text(tag.clone())),
            FieldValue::Locale(tag) => Err(CodecError::invalid_value("locale", tag.clone())),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        _declared: &FieldType,
        _resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        let tag = expect_text(node)?;
        if !Self::is_valid(tag) {
            return Err(CodecError::invalid_value("locale", tag));
        }
        Ok(FieldValue::Locale(tag.to_string()))
    }
}

/// References to other entities, carried as the referent's global id only.
#[derive(Debug, Default)]
pub struct ReferenceNormalizer;

impl Normalizer for ReferenceNormalizer {
    fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        match value {
            FieldValue::Reference(id) => Ok(Node::Text(id.to_string())),
            other => Err(value_mismatch(declared, other)),
        }
    }

    fn decode(
        &self,
        node: &Node,
        declared: &FieldType,
        resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        let text = expect_text(node)?;
        let id = Uuid::parse_str(text)
            .map_err(|e| CodecError::invalid_value("reference", format!("{text:?}: {e}")))?;
        let entity_type = match declared {
            FieldType::Reference(entity_type) => entity_type.as_str(),
            other => return Err(CodecError::mismatch("reference", other.type_name())),
        };
        if !resolver.exists(entity_type, &id) {
            return Err(CodecError::ReferentNotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            });
        }
        Ok(FieldValue::Reference(id))
    }
}
