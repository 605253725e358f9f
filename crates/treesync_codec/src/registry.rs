//! Normalizer registry keyed by normalized type name.

use crate::error::{CodecError, CodecResult};
use crate::field::{FieldType, FieldValue, ReferenceResolver};
use crate::node::Node;
use crate::normalizer::{
    BinaryNormalizer, BooleanNormalizer, ClassNormalizer, EnumNormalizer, IntegerNormalizer,
    LocaleNormalizer, MapNormalizer, Normalizer, ReferenceNormalizer, TextNormalizer,
    TimestampNormalizer,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps normalized type names to their [`Normalizer`].
///
/// Lists are not registered: a list is encoded as the ordered encodings of
/// its elements, so only the element type needs a normalizer.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in normalizer.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("text", TextNormalizer);
        registry.register("integer", IntegerNormalizer);
        registry.register("boolean", BooleanNormalizer);
        registry.register("timestamp", TimestampNormalizer);
        registry.register("binary", BinaryNormalizer);
        registry.register("enum", EnumNormalizer);
        registry.register("map", MapNormalizer);
        registry.register("class", ClassNormalizer);
        registry.register("locale", LocaleNormalizer);
        registry.register("reference", ReferenceNormalizer);
        registry
    }

    /// Registers (or replaces) the normalizer for a type name.
    pub fn register(&mut self, type_name: impl Into<String>, normalizer: impl Normalizer + 'static) {
        self.normalizers.insert(type_name.into(), Arc::new(normalizer));
    }

    /// Returns true if a normalizer is registered for the type name.
    pub fn contains(&self, type_name: &str) -> bool {
        self.normalizers.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.normalizers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, declared: &FieldType) -> CodecResult<&Arc<dyn Normalizer>> {
        self.normalizers
            .get(declared.type_name())
            .ok_or_else(|| CodecError::unsupported(declared.type_name()))
    }

    /// Encodes a value of the declared type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPayloadType` if no normalizer handles the type.
    pub fn encode(&self, value: &FieldValue, declared: &FieldType) -> CodecResult<Node> {
        if let FieldType::List(element) = declared {
            return match value {
                FieldValue::List(items) => items
                    .iter()
                    .map(|item| self.encode(item, element))
                    .collect::<CodecResult<Vec<_>>>()
                    .map(Node::List),
                FieldValue::Null => Ok(Node::Null),
                other => Err(CodecError::mismatch("list", format!("{other:?}"))),
            };
        }

        let normalizer = self.lookup(declared)?;
        match value {
            FieldValue::Null => Ok(Node::Null),
            value => normalizer.encode(value, declared),
        }
    }

    /// Decodes a node of the declared type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPayloadType` if no normalizer handles the type and
    /// `ReferentNotFound` if a reference points at a missing entity.
    pub fn decode(
        &self,
        node: &Node,
        declared: &FieldType,
        resolver: &dyn ReferenceResolver,
    ) -> CodecResult<FieldValue> {
        if let FieldType::List(element) = declared {
            return match node {
                Node::List(items) => items
                    .iter()
                    .map(|item| self.decode(item, element, resolver))
                    .collect::<CodecResult<Vec<_>>>()
                    .map(FieldValue::List),
                Node::Null => Ok(FieldValue::Null),
                other => Err(CodecError::mismatch("list", other.kind())),
            };
        }

        let normalizer = self.lookup(declared)?;
        match node {
            Node::Null => Ok(FieldValue::Null),
            node => normalizer.decode(node, declared, resolver),
        }
    }
}

impl std::fmt::Debug for NormalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizerRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn everything_exists(_: &str, _: &Uuid) -> bool {
        true
    }

    fn roundtrip(value: FieldValue, declared: FieldType) {
        let registry = NormalizerRegistry::with_defaults();
        let node = registry.encode(&value, &declared).unwrap();
        let decoded = registry.decode(&node, &declared, &everything_exists).unwrap();
        assert_eq!(decoded, value, "roundtrip of {}", declared.type_name());
    }

    #[test]
    fn every_registered_type_roundtrips() {
        let mut map = BTreeMap::new();
        map.insert("ward".to_string(), "B".to_string());
        map.insert("bed".to_string(), "12".to_string());

        roundtrip(FieldValue::Text("Ana".into()), FieldType::Text);
        roundtrip(FieldValue::Integer(-42), FieldType::Integer);
        roundtrip(FieldValue::Boolean(true), FieldType::Boolean);
        roundtrip(
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2021, 6, 1, 9, 15, 30).unwrap()),
            FieldType::Timestamp,
        );
        roundtrip(FieldValue::Binary(vec![0, 1, 254, 255]), FieldType::Binary);
        roundtrip(
            FieldValue::Enum("F".into()),
            FieldType::enumeration("Gender", &["M", "F"]),
        );
        roundtrip(FieldValue::Map(map), FieldType::Map);
        roundtrip(FieldValue::Class("clinical.Obs".into()), FieldType::Class);
        roundtrip(FieldValue::Locale("fr_RW".into()), FieldType::Locale);
        roundtrip(
            FieldValue::Reference(Uuid::new_v4()),
            FieldType::reference("Encounter"),
        );
        roundtrip(
            FieldValue::List(vec![FieldValue::Integer(1), FieldValue::Integer(2)]),
            FieldType::list(FieldType::Integer),
        );
        roundtrip(FieldValue::Null, FieldType::Timestamp);
    }

    #[test]
    fn unregistered_type_is_unsupported() {
        let registry = NormalizerRegistry::new();
        let err = registry
            .encode(&FieldValue::Text("x".into()), &FieldType::Text)
            .unwrap_err();
        assert_eq!(err, CodecError::unsupported("text"));

        let err = registry
            .decode(&Node::Null, &FieldType::Locale, &everything_exists)
            .unwrap_err();
        assert_eq!(err, CodecError::unsupported("locale"));
    }

    #[test]
    fn list_elements_use_element_normalizer() {
        let registry = NormalizerRegistry::with_defaults();
        let declared = FieldType::list(FieldType::reference("Obs"));
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let value = FieldValue::List(ids.iter().copied().map(FieldValue::Reference).collect());

        let node = registry.encode(&value, &declared).unwrap();
        let texts: Vec<&str> = node
            .as_list()
            .unwrap()
            .iter()
            .filter_map(Node::as_text)
            .collect();
        assert_eq!(texts, vec![ids[0].to_string(), ids[1].to_string()]);
    }

    #[test]
    fn custom_normalizer_can_replace_builtin() {
        struct Upper;
        impl Normalizer for Upper {
            fn encode(&self, value: &FieldValue, _: &FieldType) -> CodecResult<Node> {
                match value {
                    FieldValue::Text(s) => Ok(Node::Text(s.to_uppercase())),
                    _ => Err(CodecError::mismatch("text", "other")),
                }
            }
            fn decode(
                &self,
                node: &Node,
                _: &FieldType,
                _: &dyn ReferenceResolver,
            ) -> CodecResult<FieldValue> {
                Ok(FieldValue::Text(node.as_text().unwrap_or_default().to_string()))
            }
        }

        let mut registry = NormalizerRegistry::with_defaults();
        registry.register("text", Upper);
        let node = registry
            .encode(&FieldValue::Text("abc".into()), &FieldType::Text)
            .unwrap();
        assert_eq!(node, Node::from("ABC"));
    }

    fn typed_value() -> impl Strategy<Value = (FieldType, FieldValue)> {
        prop_oneof![
            any::<String>().prop_map(|s| (FieldType::Text, FieldValue::Text(s))),
            any::<i64>().prop_map(|n| (FieldType::Integer, FieldValue::Integer(n))),
            any::<bool>().prop_map(|b| (FieldType::Boolean, FieldValue::Boolean(b))),
            (0i64..4_102_444_800_000).prop_map(|ms| {
                let ts = Utc.timestamp_millis_opt(ms).unwrap();
                (FieldType::Timestamp, FieldValue::Timestamp(ts))
            }),
            prop::collection::vec(any::<u8>(), 0..64)
                .prop_map(|b| (FieldType::Binary, FieldValue::Binary(b))),
            (prop::collection::vec("[A-Z]{1,6}", 1..5), any::<prop::sample::Index>()).prop_map(
                |(variants, pick)| {
                    let chosen = pick.get(&variants).clone();
                    let names: Vec<&str> = variants.iter().map(String::as_str).collect();
                    (FieldType::enumeration("Generated", &names), FieldValue::Enum(chosen))
                }
            ),
            prop::collection::btree_map("[a-z_]{1,8}", ".{0,12}", 0..6)
                .prop_map(|m| (FieldType::Map, FieldValue::Map(m))),
            "[a-z]{1,8}\\.[A-Z][a-zA-Z]{0,10}"
                .prop_map(|c| (FieldType::Class, FieldValue::Class(c))),
            "[a-z]{2,3}(_[A-Z]{2})?".prop_map(|l| (FieldType::Locale, FieldValue::Locale(l))),
            any::<u128>().prop_map(|n| {
                (FieldType::reference("Encounter"), FieldValue::Reference(Uuid::from_u128(n)))
            }),
            prop::collection::vec(any::<i64>(), 0..8).prop_map(|ns| {
                let items = ns.into_iter().map(FieldValue::Integer).collect();
                (FieldType::list(FieldType::Integer), FieldValue::List(items))
            }),
        ]
    }

    proptest! {
        #[test]
        fn generated_values_roundtrip((declared, value) in typed_value()) {
            let registry = NormalizerRegistry::with_defaults();
            let node = registry.encode(&value, &declared).unwrap();
            let decoded = registry.decode(&node, &declared, &everything_exists).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
