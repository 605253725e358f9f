//! # treesync Codec
//!
//! Payload normalization and wire encoding for treesync.
//!
//! A change item carries the fields of one entity instance. Before leaving
//! the server those fields are normalized into a transport-neutral [`Node`]
//! tree by a per-type [`Normalizer`] looked up in a [`NormalizerRegistry`].
//! Which fields an entity type replicates is declared up front with an
//! [`EntityDescriptor`]; nothing is discovered at runtime.
//!
//! ## Rules
//!
//! - Unregistered types fail with `UnsupportedPayloadType`
//! - Lists encode as the ordered encodings of their elements
//! - References encode as the referent's global id, never a nested payload
//! - Decoding a reference checks that the referent exists
//!
//! ## Usage
//!
//! ```
//! use treesync_codec::{EntityDescriptor, EntityFields, FieldType, FieldValue, PayloadCodec};
//!
//! let codec = PayloadCodec::default()
//!     .with_entity(EntityDescriptor::new("Patient").required("given_name", FieldType::Text));
//!
//! let mut fields = EntityFields::new();
//! fields.insert("given_name".into(), FieldValue::Text("Ana".into()));
//!
//! let node = codec.encode_payload("Patient", &fields).unwrap();
//! let accept = |_: &str, _: &uuid::Uuid| true;
//! assert_eq!(codec.decode_payload("Patient", &node, &accept).unwrap(), fields);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod descriptor;
mod error;
mod field;
mod node;
mod normalizer;
mod registry;
mod wire;

pub use descriptor::{EntityDescriptor, FieldDescriptor, PayloadCodec};
pub use error::{CodecError, CodecResult};
pub use field::{EntityFields, FieldType, FieldValue, ReferenceResolver};
pub use node::Node;
pub use normalizer::{
    BinaryNormalizer, BooleanNormalizer, ClassNormalizer, EnumNormalizer, IntegerNormalizer,
    LocaleNormalizer, MapNormalizer, Normalizer, ReferenceNormalizer, TextNormalizer,
    TimestampNormalizer, TIMESTAMP_BACKUP_FORMAT,
};
pub use registry::NormalizerRegistry;
pub use wire::{from_wire, to_wire, MAX_WIRE_BYTES};
