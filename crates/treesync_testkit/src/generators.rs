//! Property-based test generators using proptest.

use crate::fixtures::{patient_fields, OBS, PATIENT};
use proptest::prelude::*;
use treesync_codec::{EntityFields, FieldValue, Node};
use treesync_protocol::{ChangeItem, ChangeRecord, ItemState, RecordState};
use uuid::Uuid;

/// Strategy for random v4-shaped uuids.
pub fn uuid_strategy() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(|bits| uuid::Builder::from_random_bytes(bits.to_le_bytes()).into_uuid())
}

/// Strategy for dotted entity type names.
pub fn type_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{2,8}\\.[A-Z][a-zA-Z]{1,10}").expect("Invalid regex")
}

/// Strategy for any record state.
pub fn record_state_strategy() -> impl Strategy<Value = RecordState> {
    prop::sample::select(RecordState::all().to_vec())
}

/// Strategy for patient fields with a random name.
pub fn patient_fields_strategy() -> impl Strategy<Value = EntityFields> {
    prop::string::string_regex("[A-Z][a-z]{1,12}")
        .expect("Invalid regex")
        .prop_map(|name| patient_fields(&name))
}

/// Strategy for patient fields with an optional family name and death flag.
pub fn rich_patient_fields_strategy() -> impl Strategy<Value = EntityFields> {
    (
        patient_fields_strategy(),
        prop::option::of("[A-Z][a-z]{1,12}"),
        any::<bool>(),
    )
        .prop_map(|(mut fields, family, dead)| {
            if let Some(family) = family {
                fields.insert("family_name".into(), FieldValue::Text(family));
            }
            fields.insert("dead".into(), FieldValue::Boolean(dead));
            fields
        })
}

/// Strategy for a record of one to four items with opaque payloads.
pub fn change_record_strategy() -> impl Strategy<Value = ChangeRecord> {
    prop::collection::vec(
        (
            prop::sample::select(vec![PATIENT, OBS, "audit.Log"]),
            uuid_strategy(),
            any::<bool>(),
        ),
        1..5,
    )
    .prop_map(|items| {
        let items = items
            .into_iter()
            .map(|(ty, key, deleted)| {
                if deleted {
                    ChangeItem::deleted(ty, key)
                } else {
                    ChangeItem::new(ty, key, ItemState::Updated, Node::Null)
                }
            })
            .collect();
        ChangeRecord::new("generator", "1.0", items).expect("items are never empty")
    })
}
