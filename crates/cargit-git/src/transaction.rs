//! Compare-and-swap ref updates
//!
//! Every operation snapshots the ref inside the caller's write transaction,
//! checks the expected value against that snapshot and only then writes.
//! The backing store has a single writer, so the check and the write cannot
//! interleave with another update.

use lmdb_asset_store::{AssetRecord, RoTxn, RwTxn};
use tracing::{debug, warn};

use crate::object::{ObjectId, PersonIdent};
use crate::odb::ObjectStore;
use crate::refdb::{
    decode_ref, peel_object, RefStore, ATTR_REF_LOG_MESSAGE, ATTR_REF_UPDATED_BY, MAX_SYMREF_DEPTH,
};
use crate::refs::{validate_ref_name, Ref};
use crate::{Error, Result};

/// Outcome of a single ref operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdateResult {
    /// The ref now holds the requested object id.
    Accepted,
    /// A symbolic ref was created.
    New,
    /// An existing ref was overwritten or deleted without a value check.
    Forced,
    /// The ref was moved to its new name.
    Renamed,
    /// The expected old value did not match, or the name conflicts with another ref.
    Rejected,
    /// The ref to delete or rename does not exist.
    MissingRef,
}

impl RefUpdateResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RefUpdateResult::Accepted
                | RefUpdateResult::New
                | RefUpdateResult::Forced
                | RefUpdateResult::Renamed
        )
    }
}

/// Snapshot of a ref taken before writing.
struct Lock {
    /// Non-symbolic ref the update lands on.
    leaf: String,
    record: Option<AssetRecord>,
    old: ObjectId,
}

pub struct RefTransaction<'r> {
    refs: RefStore<'r>,
    objects: ObjectStore<'r>,
    identity: Option<PersonIdent>,
    message: Option<String>,
}

impl<'r> RefTransaction<'r> {
    pub fn new(refs: RefStore<'r>, objects: ObjectStore<'r>) -> Self {
        Self {
            refs,
            objects,
            identity: None,
            message: None,
        }
    }

    /// Identity recorded on every ref this transaction writes.
    pub fn with_identity(mut self, identity: PersonIdent) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Point `name` at `new_id` if it currently holds `expected_old`.
    ///
    /// `ObjectId::ZERO` as `expected_old` means the ref must not exist; as
    /// `new_id` it requests deletion. A symbolic `name` updates the ref it
    /// points to.
    pub fn update(
        &self,
        txn: &mut RwTxn,
        name: &str,
        new_id: ObjectId,
        expected_old: ObjectId,
    ) -> Result<RefUpdateResult> {
        if new_id.is_zero() {
            return self.delete_expecting(txn, name, Some(expected_old));
        }

        let lock = self.lock(txn, name)?;
        if lock.old != expected_old {
            warn!(
                "rejecting update of {}: expected {}, found {}",
                lock.leaf, expected_old, lock.old
            );
            return Ok(RefUpdateResult::Rejected);
        }
        if lock.record.is_none() && self.refs.is_name_conflicting(txn, &lock.leaf)? {
            warn!("rejecting creation of {}: name conflicts with an existing ref", lock.leaf);
            return Ok(RefUpdateResult::Rejected);
        }

        let value = peel_object(txn, &self.objects, new_id)?;
        let mut record = match lock.record {
            Some(record) => record,
            None => self.refs.create(&lock.leaf)?,
        };
        self.stamp(&mut record);
        self.refs.write(txn, &mut record, &value)?;
        debug!("{}: {} -> {}", lock.leaf, lock.old, new_id);
        Ok(RefUpdateResult::Accepted)
    }

    /// Make `name` a symbolic ref to `target`, whatever it held before.
    pub fn link(&self, txn: &mut RwTxn, name: &str, target: &str) -> Result<RefUpdateResult> {
        validate_ref_name(name)?;
        validate_ref_name(target)?;

        let existing = self.refs.find_record(txn, name)?;
        let result = if existing.is_some() {
            RefUpdateResult::Forced
        } else if self.refs.is_name_conflicting(txn, name)? {
            return Ok(RefUpdateResult::Rejected);
        } else {
            RefUpdateResult::New
        };

        let mut record = match existing {
            Some(record) => record,
            None => self.refs.create(name)?,
        };
        self.stamp(&mut record);
        self.refs.write(txn, &mut record, &Ref::symbolic(target))?;
        debug!("{} -> {} ({:?})", name, target, result);
        Ok(result)
    }

    /// Remove `name`. Symbolic refs are removed themselves, not their target.
    pub fn delete(&self, txn: &mut RwTxn, name: &str) -> Result<RefUpdateResult> {
        self.delete_expecting(txn, name, None)
    }

    /// Remove `name` if it currently resolves to `expected_old`.
    pub fn delete_expecting(
        &self,
        txn: &mut RwTxn,
        name: &str,
        expected_old: Option<ObjectId>,
    ) -> Result<RefUpdateResult> {
        if self.refs.find_record(txn, name)?.is_none() {
            return Ok(RefUpdateResult::MissingRef);
        }
        if let Some(expected) = expected_old {
            let current = self
                .refs
                .get_resolved(txn, name)?
                .map(|resolved| resolved.object_id())
                .unwrap_or(ObjectId::ZERO);
            if current != expected {
                warn!(
                    "rejecting delete of {}: expected {}, found {}",
                    name, expected, current
                );
                return Ok(RefUpdateResult::Rejected);
            }
        }
        self.refs.delete(txn, name)?;
        debug!("deleted {}", name);
        Ok(RefUpdateResult::Forced)
    }

    /// Create `to` with the value of `from`, then delete `from`.
    ///
    /// The two writes are independent: if the delete fails after the create
    /// succeeded, both refs exist.
    pub fn rename(&self, txn: &mut RwTxn, from: &str, to: &str) -> Result<RefUpdateResult> {
        let Some(source) = self.refs.find_by_name(txn, from)? else {
            return Ok(RefUpdateResult::MissingRef);
        };
        let Some(id) = source.object_id() else {
            return Err(Error::Unsupported(format!("cannot rename symbolic ref {}", from)));
        };

        let created = self.update(txn, to, id, ObjectId::ZERO)?;
        if created != RefUpdateResult::Accepted {
            return Ok(created);
        }
        match self.delete(txn, from)? {
            RefUpdateResult::Forced => Ok(RefUpdateResult::Renamed),
            other => Ok(other),
        }
    }

    fn lock(&self, txn: &RoTxn, name: &str) -> Result<Lock> {
        validate_ref_name(name)?;
        let mut leaf = name.to_string();
        for _ in 0..=MAX_SYMREF_DEPTH {
            let Some(record) = self.refs.find_record(txn, &leaf)? else {
                return Ok(Lock {
                    leaf,
                    record: None,
                    old: ObjectId::ZERO,
                });
            };
            match decode_ref(&record)? {
                Ref::Symbolic(target) => {
                    validate_ref_name(&target)?;
                    leaf = target;
                }
                value => {
                    return Ok(Lock {
                        leaf,
                        old: value.object_id().unwrap_or(ObjectId::ZERO),
                        record: Some(record),
                    })
                }
            }
        }
        Err(Error::Corrupt(format!(
            "symbolic ref {} nested deeper than {}",
            name, MAX_SYMREF_DEPTH
        )))
    }

    fn stamp(&self, record: &mut AssetRecord) {
        match &self.identity {
            Some(identity) => record.set_attribute(ATTR_REF_UPDATED_BY, identity.to_string()),
            None => {
                record.remove_attribute(ATTR_REF_UPDATED_BY);
            }
        }
        match &self.message {
            Some(message) => record.set_attribute(ATTR_REF_LOG_MESSAGE, message.clone()),
            None => {
                record.remove_attribute(ATTR_REF_LOG_MESSAGE);
            }
        }
    }
}
