//! Clinical entity fixtures.
//!
//! Three types with a reference chain: an observation belongs to an
//! encounter, which belongs to a patient.

use chrono::{DateTime, TimeZone, Utc};
use treesync_codec::{EntityDescriptor, EntityFields, FieldType, FieldValue, PayloadCodec};
use uuid::Uuid;

/// Patient entity type.
pub const PATIENT: &str = "clinical.Patient";
/// Encounter entity type; references a patient.
pub const ENCOUNTER: &str = "clinical.Encounter";
/// Observation entity type; references an encounter.
pub const OBS: &str = "clinical.Obs";

/// Codec with the three clinical types registered.
pub fn clinical_codec() -> PayloadCodec {
    PayloadCodec::default()
        .with_entity(
            EntityDescriptor::new(PATIENT)
                .required("given_name", FieldType::Text)
                .field("family_name", FieldType::Text)
                .field(
                    "gender",
                    FieldType::enumeration("Gender", &["F", "M", "U"]),
                )
                .field("birthdate", FieldType::Timestamp)
                .field("dead", FieldType::Boolean),
        )
        .with_entity(
            EntityDescriptor::new(ENCOUNTER)
                .required("patient", FieldType::reference(PATIENT))
                .required("encounter_type", FieldType::Text)
                .field("encounter_datetime", FieldType::Timestamp),
        )
        .with_entity(
            EntityDescriptor::new(OBS)
                .required("encounter", FieldType::reference(ENCOUNTER))
                .required("concept", FieldType::Text)
                .field("value_numeric", FieldType::Integer)
                .field("comments", FieldType::Text),
        )
}

/// A fixed point in time for reproducible payloads.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Fields of a patient.
pub fn patient_fields(given_name: &str) -> EntityFields {
    let mut fields = EntityFields::new();
    fields.insert("given_name".into(), FieldValue::Text(given_name.into()));
    fields.insert("gender".into(), FieldValue::Enum("F".into()));
    fields.insert("birthdate".into(), FieldValue::Timestamp(fixed_time()));
    fields.insert("dead".into(), FieldValue::Boolean(false));
    fields
}

/// Fields of an encounter of `patient`.
pub fn encounter_fields(patient: Uuid, encounter_type: &str) -> EntityFields {
    let mut fields = EntityFields::new();
    fields.insert("patient".into(), FieldValue::Reference(patient));
    fields.insert("encounter_type".into(), FieldValue::Text(encounter_type.into()));
    fields.insert("encounter_datetime".into(), FieldValue::Timestamp(fixed_time()));
    fields
}

/// Fields of a numeric observation made during `encounter`.
pub fn obs_fields(encounter: Uuid, concept: &str, value: i64) -> EntityFields {
    let mut fields = EntityFields::new();
    fields.insert("encounter".into(), FieldValue::Reference(encounter));
    fields.insert("concept".into(), FieldValue::Text(concept.into()));
    fields.insert("value_numeric".into(), FieldValue::Integer(value));
    fields
}
