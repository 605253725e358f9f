//! Statically declared entity descriptors and the payload codec.

use crate::error::{CodecError, CodecResult};
use crate::field::{EntityFields, FieldType, FieldValue, ReferenceResolver};
use crate::node::Node;
use crate::registry::NormalizerRegistry;
use std::collections::HashMap;

/// One declared field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name as it appears in payloads.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

/// The replicated shape of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Entity type tag, e.g. `clinical.Patient`.
    pub type_name: String,
    /// Declared fields in declaration order.
    pub fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    /// Starts a descriptor with no fields.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds an optional field.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }

    /// Adds a required field.
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    /// Looks up a declared field by name.
    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Encodes and decodes whole entity payloads using registered descriptors.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    registry: NormalizerRegistry,
    descriptors: HashMap<String, EntityDescriptor>,
}

impl PayloadCodec {
    /// Creates a codec over the given normalizers with no entity types.
    pub fn new(registry: NormalizerRegistry) -> Self {
        Self {
            registry,
            descriptors: HashMap::new(),
        }
    }

    /// Registers an entity descriptor, replacing any previous one.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.descriptors
            .insert(descriptor.type_name.clone(), descriptor);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// The normalizer registry in use.
    pub fn registry(&self) -> &NormalizerRegistry {
        &self.registry
    }

    /// Looks up the descriptor for an entity type.
    pub fn descriptor(&self, type_name: &str) -> CodecResult<&EntityDescriptor> {
        self.descriptors
            .get(type_name)
            .ok_or_else(|| CodecError::unsupported(type_name))
    }

    /// Encodes the fields of one entity instance.
    ///
    /// # Errors
    ///
    /// Fails if the entity type is not registered, a field is undeclared, a
    /// required field is missing, or a value does not fit its declared type.
    pub fn encode_payload(&self, type_name: &str, fields: &EntityFields) -> CodecResult<Node> {
        let descriptor = self.descriptor(type_name)?;

        if let Some(unknown) = fields.keys().find(|name| descriptor.get(name).is_none()) {
            return Err(CodecError::invalid_payload(
                type_name,
                format!("undeclared field {unknown:?}"),
            ));
        }

        let mut entries = Vec::with_capacity(descriptor.fields.len());
        for field in &descriptor.fields {
            let value = fields.get(&field.name).unwrap_or(&FieldValue::Null);
            if field.required && *value == FieldValue::Null {
                return Err(CodecError::invalid_payload(
                    type_name,
                    format!("missing required field {:?}", field.name),
                ));
            }
            entries.push((field.name.clone(), self.registry.encode(value, &field.field_type)?));
        }
        Ok(Node::map(entries))
    }

    /// Decodes a payload node back into entity fields.
    ///
    /// Null fields are omitted from the result.
    ///
    /// # Errors
    ///
    /// Fails like [`encode_payload`](Self::encode_payload), and with
    /// `ReferentNotFound` when a reference cannot be resolved.
    pub fn decode_payload(
        &self,
        type_name: &str,
        node: &Node,
        resolver: &dyn ReferenceResolver,
    ) -> CodecResult<EntityFields> {
        let descriptor = self.descriptor(type_name)?;
        let entries = node
            .as_map()
            .ok_or_else(|| CodecError::mismatch("map", node.kind()))?;

        if let Some((unknown, _)) = entries.iter().find(|(name, _)| descriptor.get(name).is_none()) {
            return Err(CodecError::invalid_payload(
                type_name,
                format!("undeclared field {unknown:?}"),
            ));
        }

        let mut fields = EntityFields::new();
        for field in &descriptor.fields {
            let value = match node.get(&field.name) {
                Some(child) => self.registry.decode(child, &field.field_type, resolver)?,
                None => FieldValue::Null,
            };
            if value == FieldValue::Null {
                if field.required {
                    return Err(CodecError::invalid_payload(
                        type_name,
                        format!("missing required field {:?}", field.name),
                    ));
                }
                continue;
            }
            fields.insert(field.name.clone(), value);
        }
        Ok(fields)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(NormalizerRegistry::with_defaults())
    }
}
