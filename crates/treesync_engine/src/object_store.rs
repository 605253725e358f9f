//! The domain object store the engine replicates into.

use crate::error::SyncError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use treesync_codec::{CodecError, EntityFields, PayloadCodec};
use treesync_protocol::{ChangeItem, FailureKind, ItemState};
use uuid::Uuid;

/// Why a mutation could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// A referenced entity does not exist.
    #[error("referenced entity not found: {0}")]
    ReferentNotFound(String),

    /// The store refused the new state of the entity.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The payload type is not known here.
    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),

    /// The store itself failed.
    #[error("store failure: {0}")]
    Store(String),
}

impl ApplyError {
    /// Classification carried on the import record.
    pub fn kind(&self) -> FailureKind {
        match self {
            ApplyError::ReferentNotFound(_) => FailureKind::ReferentNotFound,
            ApplyError::ValidationFailed(_) => FailureKind::Validation,
            ApplyError::UnsupportedPayload(_) => FailureKind::UnsupportedPayload,
            ApplyError::Store(_) => FailureKind::Store,
        }
    }
}

impl From<CodecError> for ApplyError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ReferentNotFound { .. } => ApplyError::ReferentNotFound(err.to_string()),
            CodecError::UnsupportedPayloadType { .. } => {
                ApplyError::UnsupportedPayload(err.to_string())
            }
            other => ApplyError::ValidationFailed(other.to_string()),
        }
    }
}

impl From<ApplyError> for SyncError {
    fn from(err: ApplyError) -> Self {
        SyncError::Apply {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Storage for domain entities.
pub trait ObjectStore: Send + Sync {
    /// Applies one change item.
    fn apply_mutation(&self, item: &ChangeItem) -> Result<(), ApplyError>;

    /// Applies the items of one record, in the given order.
    ///
    /// Implementations that can should make this all-or-nothing.
    fn apply_record(&self, items: &[&ChangeItem]) -> Result<(), ApplyError> {
        for item in items {
            self.apply_mutation(item)?;
        }
        Ok(())
    }

    /// True if the entity exists.
    fn exists(&self, entity_type: &str, id: &Uuid) -> bool;
}

type Validator = Box<dyn Fn(&EntityFields) -> Result<(), String> + Send + Sync>;
type Entities = HashMap<(String, Uuid), EntityFields>;

/// Pending writes of one record; `None` marks a delete.
type Staged = HashMap<(String, Uuid), Option<EntityFields>>;

/// An in-memory object store that decodes payloads with a [`PayloadCodec`].
pub struct MemoryObjectStore {
    codec: PayloadCodec,
    entities: RwLock<Entities>,
    validators: HashMap<String, Validator>,
    applied: AtomicU64,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    pub fn new(codec: PayloadCodec) -> Self {
        Self {
            codec,
            entities: RwLock::new(HashMap::new()),
            validators: HashMap::new(),
            applied: AtomicU64::new(0),
        }
    }

    /// Adds a check run on every create or update of `entity_type`.
    pub fn with_validator<F>(mut self, entity_type: impl Into<String>, check: F) -> Self
    where
        F: Fn(&EntityFields) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.insert(entity_type.into(), Box::new(check));
        self
    }

    /// The codec used to decode payloads.
    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// Fields of an entity.
    pub fn get(&self, entity_type: &str, id: &Uuid) -> Option<EntityFields> {
        self.entities
            .read()
            .get(&(entity_type.to_string(), *id))
            .cloned()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutations applied since creation.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    fn apply_to(
        &self,
        base: &Entities,
        staged: &mut Staged,
        item: &ChangeItem,
    ) -> Result<(), ApplyError> {
        let key = (item.contained_type.clone(), item.key);
        if item.state == ItemState::Deleted {
            staged.insert(key, None);
            return Ok(());
        }

        let fields = {
            let view: &Staged = staged;
            let resolver = |t: &str, id: &Uuid| {
                let key = (t.to_string(), *id);
                match view.get(&key) {
                    Some(entry) => entry.is_some(),
                    None => base.contains_key(&key),
                }
            };
            self.codec
                .decode_payload(&item.contained_type, &item.payload, &resolver)?
        };
        if let Some(check) = self.validators.get(&item.contained_type) {
            check(&fields).map_err(ApplyError::ValidationFailed)?;
        }
        staged.insert(key, Some(fields));
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn apply_mutation(&self, item: &ChangeItem) -> Result<(), ApplyError> {
        self.apply_record(&[item])
    }

    fn apply_record(&self, items: &[&ChangeItem]) -> Result<(), ApplyError> {
        let mut entities = self.entities.write();
        let mut staged = Staged::new();
        for item in items {
            self.apply_to(&entities, &mut staged, item)?;
        }
        for (key, entry) in staged {
            match entry {
                Some(fields) => entities.insert(key, fields),
                None => entities.remove(&key),
            };
        }
        self.applied.fetch_add(items.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn exists(&self, entity_type: &str, id: &Uuid) -> bool {
        self.entities
            .read()
            .contains_key(&(entity_type.to_string(), *id))
    }
}
