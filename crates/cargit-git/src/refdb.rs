//! Ref database on top of the asset store
//!
//! Each ref is one asset of kind `ref` named by the full ref name. The value is
//! kept entirely in attributes; refs have no blob.

use lmdb_asset_store::{AssetRecord, LmdbAssetStore, RoTxn, RwTxn};

use crate::object::{parse_tag, ObjectId, ObjectType};
use crate::odb::ObjectStore;
use crate::refs::{validate_ref_name, NamedRef, Ref, ResolvedRef};
use crate::{Error, Result};

pub const REF_KIND: &str = "ref";
pub const ATTR_REF_TYPE: &str = "git-ref-type";
pub const ATTR_REF_TARGET: &str = "git-ref-target";
pub const ATTR_REF_PEELED: &str = "git-ref-peeled-object-id";
pub const ATTR_REF_UPDATED_BY: &str = "git-ref-updated-by";
pub const ATTR_REF_LOG_MESSAGE: &str = "git-ref-log-message";

const TYPE_UNPEELED: &str = "object-id-unpeeled";
const TYPE_PEELED_TAG: &str = "object-id-peeled-tag";
const TYPE_PEELED_NONTAG: &str = "object-id-peeled-nontag";
const TYPE_SYMBOLIC: &str = "symbolic";

/// Prefixes tried, in order, when looking up an abbreviated ref name.
pub const SEARCH_PATH: &[&str] = &["", "refs/", "refs/tags/", "refs/heads/", "refs/remotes/"];

/// Longest chain of symbolic refs followed before giving up (git's SYMREF_MAXDEPTH).
pub const MAX_SYMREF_DEPTH: usize = 5;

fn encode_ref(record: &mut AssetRecord, value: &Ref) {
    record.remove_attribute(ATTR_REF_PEELED);
    let (kind, target) = match value {
        Ref::Unpeeled(id) => (TYPE_UNPEELED, id.to_hex()),
        Ref::PeeledNonTag(id) => (TYPE_PEELED_NONTAG, id.to_hex()),
        Ref::PeeledTag { id, peeled } => {
            record.set_attribute(ATTR_REF_PEELED, peeled.to_hex());
            (TYPE_PEELED_TAG, id.to_hex())
        }
        Ref::Symbolic(target) => (TYPE_SYMBOLIC, target.clone()),
    };
    record.set_attribute(ATTR_REF_TYPE, kind);
    record.set_attribute(ATTR_REF_TARGET, target);
}

pub(crate) fn decode_ref(record: &AssetRecord) -> Result<Ref> {
    let corrupt = || Error::Corrupt(format!("ref {} has a malformed value", record.name));
    let target = record.attribute(ATTR_REF_TARGET).ok_or_else(corrupt)?;
    let object_id = || ObjectId::from_hex(target).ok_or_else(corrupt);

    match record.attribute(ATTR_REF_TYPE) {
        Some(TYPE_UNPEELED) => Ok(Ref::Unpeeled(object_id()?)),
        Some(TYPE_PEELED_NONTAG) => Ok(Ref::PeeledNonTag(object_id()?)),
        Some(TYPE_PEELED_TAG) => {
            let peeled = record
                .attribute(ATTR_REF_PEELED)
                .and_then(ObjectId::from_hex)
                .ok_or_else(corrupt)?;
            Ok(Ref::PeeledTag {
                id: object_id()?,
                peeled,
            })
        }
        Some(TYPE_SYMBOLIC) => Ok(Ref::Symbolic(target.to_string())),
        _ => Err(corrupt()),
    }
}

/// Classify `id` as a peeled value, following annotated tags to their target.
pub fn peel_object(txn: &RoTxn, objects: &ObjectStore, id: ObjectId) -> Result<Ref> {
    let obj_type = objects
        .object_type(txn, &id)?
        .ok_or_else(|| Error::MissingObject(id.to_hex()))?;
    if obj_type != ObjectType::Tag {
        return Ok(Ref::PeeledNonTag(id));
    }

    let mut target = id;
    loop {
        let tag = objects.read_object(txn, &target, Some(ObjectType::Tag))?;
        let info = parse_tag(&tag.content)?;
        target = info.object;
        if info.object_type != ObjectType::Tag {
            return Ok(Ref::PeeledTag { id, peeled: target });
        }
    }
}

/// Named references scoped to one repository container.
#[derive(Clone, Copy)]
pub struct RefStore<'r> {
    store: &'r LmdbAssetStore,
    container: &'r str,
}

impl<'r> RefStore<'r> {
    pub fn new(store: &'r LmdbAssetStore, container: &'r str) -> Self {
        Self { store, container }
    }

    /// Fresh, unsaved record for a new ref.
    pub fn create(&self, name: &str) -> Result<AssetRecord> {
        validate_ref_name(name)?;
        Ok(AssetRecord::new(self.container, REF_KIND, name))
    }

    pub fn find_by_name(&self, txn: &RoTxn, name: &str) -> Result<Option<Ref>> {
        self.find_record(txn, name)?
            .map(|record| decode_ref(&record))
            .transpose()
    }

    /// Look up a possibly abbreviated name such as `master` or `v1.0`.
    ///
    /// The first hit along [`SEARCH_PATH`] wins, so a tag shadows a branch
    /// of the same name.
    pub fn find_ref(&self, txn: &RoTxn, name: &str) -> Result<Option<NamedRef>> {
        for prefix in SEARCH_PATH {
            let full = format!("{}{}", prefix, name);
            if let Some(reference) = self.find_by_name(txn, &full)? {
                return Ok(Some(NamedRef::new(full, reference)));
            }
        }
        Ok(None)
    }

    /// Refs whose name starts with `prefix`, in name order.
    pub fn find_by_prefix(&self, txn: &RoTxn, prefix: &str) -> Result<Vec<NamedRef>> {
        self.store
            .browse_assets(txn, self.container, REF_KIND, prefix, None)?
            .iter()
            .map(|record| -> Result<NamedRef> {
                Ok(NamedRef::new(record.name.clone(), decode_ref(record)?))
            })
            .collect()
    }

    /// Follow symbolic refs to a non-symbolic value. `None` if any link is missing.
    pub fn get_resolved(&self, txn: &RoTxn, name: &str) -> Result<Option<ResolvedRef>> {
        let mut current = name.to_string();
        for _ in 0..=MAX_SYMREF_DEPTH {
            match self.find_by_name(txn, &current)? {
                None => return Ok(None),
                Some(Ref::Symbolic(target)) => current = target,
                Some(target) => {
                    return Ok(Some(ResolvedRef {
                        name: name.to_string(),
                        leaf: current,
                        target,
                    }))
                }
            }
        }
        Err(Error::Corrupt(format!(
            "symbolic ref {} nested deeper than {}",
            name, MAX_SYMREF_DEPTH
        )))
    }

    /// True if an existing ref is a path ancestor of `name`, or lives beneath it.
    pub fn is_name_conflicting(&self, txn: &RoTxn, name: &str) -> Result<bool> {
        for (pos, _) in name.match_indices('/') {
            if self.find_record(txn, &name[..pos])?.is_some() {
                return Ok(true);
            }
        }
        let nested = format!("{}/", name);
        Ok(!self
            .store
            .browse_assets(txn, self.container, REF_KIND, &nested, Some(1))?
            .is_empty())
    }

    /// Peel an unpeeled value; other values are returned as they are.
    pub fn peel(&self, txn: &RoTxn, objects: &ObjectStore, value: &Ref) -> Result<Ref> {
        match value {
            Ref::Unpeeled(id) => peel_object(txn, objects, *id),
            other => Ok(other.clone()),
        }
    }

    pub(crate) fn find_record(&self, txn: &RoTxn, name: &str) -> Result<Option<AssetRecord>> {
        Ok(self.store.find_asset(txn, self.container, REF_KIND, name)?)
    }

    /// Store `value` in `record`, creating or replacing it.
    pub(crate) fn write(&self, txn: &mut RwTxn, record: &mut AssetRecord, value: &Ref) -> Result<()> {
        encode_ref(record, value);
        self.store.save_asset(txn, record)?;
        Ok(())
    }

    pub(crate) fn delete(&self, txn: &mut RwTxn, name: &str) -> Result<bool> {
        Ok(self.store.delete_asset(txn, self.container, REF_KIND, name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::{HEAD, MASTER};
    use tempfile::TempDir;

    const CONTAINER: &str = "git:test";

    fn open_store() -> (TempDir, LmdbAssetStore) {
        let temp = TempDir::new().unwrap();
        let store = LmdbAssetStore::with_map_size(temp.path().join("db"), 64 * 1024 * 1024).unwrap();
        (temp, store)
    }

    fn put(store: &LmdbAssetStore, name: &str, value: Ref) -> Result<()> {
        let refs = RefStore::new(store, CONTAINER);
        store.write_with(|txn| {
            let mut record = refs.create(name)?;
            refs.write(txn, &mut record, &value)
        })
    }

    #[test]
    fn test_value_encoding() -> Result<()> {
        let (_temp, store) = open_store();
        let id = ObjectId::hash_object(ObjectType::Commit, b"c");
        let peeled = ObjectId::hash_object(ObjectType::Commit, b"p");
        let values = [
            ("refs/heads/a", Ref::Unpeeled(id)),
            ("refs/heads/b", Ref::PeeledNonTag(id)),
            ("refs/tags/c", Ref::PeeledTag { id, peeled }),
            (HEAD, Ref::symbolic(MASTER)),
        ];
        for (name, value) in &values {
            put(&store, name, value.clone())?;
        }

        let refs = RefStore::new(&store, CONTAINER);
        let rtxn = store.read_txn()?;
        for (name, value) in &values {
            assert_eq!(refs.find_by_name(&rtxn, name)?.as_ref(), Some(value));
        }
        assert!(refs.find_by_name(&rtxn, "refs/heads/none")?.is_none());

        let heads: Vec<_> = refs
            .find_by_prefix(&rtxn, "refs/heads/")?
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(heads, vec!["refs/heads/a", "refs/heads/b"]);
        Ok(())
    }

    #[test]
    fn test_get_resolved_follows_symbolic_chain() -> Result<()> {
        let (_temp, store) = open_store();
        let id = ObjectId::hash_object(ObjectType::Commit, b"c");
        put(&store, MASTER, Ref::PeeledNonTag(id))?;
        put(&store, HEAD, Ref::symbolic(MASTER))?;
        put(&store, "refs/remotes/origin/HEAD", Ref::symbolic(HEAD))?;

        let refs = RefStore::new(&store, CONTAINER);
        let rtxn = store.read_txn()?;
        let resolved = refs.get_resolved(&rtxn, "refs/remotes/origin/HEAD")?.unwrap();
        assert_eq!(resolved.leaf, MASTER);
        assert_eq!(resolved.object_id(), id);
        assert!(resolved.is_symbolic());
        Ok(())
    }

    #[test]
    fn test_get_resolved_missing_link() -> Result<()> {
        let (_temp, store) = open_store();
        put(&store, HEAD, Ref::symbolic(MASTER))?;

        let refs = RefStore::new(&store, CONTAINER);
        let rtxn = store.read_txn()?;
        assert!(refs.get_resolved(&rtxn, HEAD)?.is_none());
        Ok(())
    }

    #[test]
    fn test_symbolic_cycle_is_corrupt() -> Result<()> {
        let (_temp, store) = open_store();
        put(&store, "refs/heads/a", Ref::symbolic("refs/heads/b"))?;
        put(&store, "refs/heads/b", Ref::symbolic("refs/heads/a"))?;

        let refs = RefStore::new(&store, CONTAINER);
        let rtxn = store.read_txn()?;
        assert!(matches!(
            refs.get_resolved(&rtxn, "refs/heads/a"),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_name_conflicts() -> Result<()> {
        let (_temp, store) = open_store();
        let id = ObjectId::hash_object(ObjectType::Commit, b"c");
        put(&store, "refs/heads/a/b", Ref::PeeledNonTag(id))?;
        put(&store, "refs/heads/x", Ref::PeeledNonTag(id))?;

        let refs = RefStore::new(&store, CONTAINER);
        let rtxn = store.read_txn()?;
        assert!(refs.is_name_conflicting(&rtxn, "refs/heads/a")?);
        assert!(refs.is_name_conflicting(&rtxn, "refs/heads/x/y")?);
        assert!(!refs.is_name_conflicting(&rtxn, "refs/heads/ab")?);
        assert!(!refs.is_name_conflicting(&rtxn, "refs/heads/a/c")?);
        Ok(())
    }

    #[test]
    fn test_create_validates_name() {
        let (_temp, store) = open_store();
        let refs = RefStore::new(&store, CONTAINER);
        assert!(matches!(refs.create("refs/heads/bad name"), Err(Error::InvalidRefName(_))));
    }

    #[test]
    fn test_find_ref_search_path() -> Result<()> {
        let (_temp, store) = open_store();
        let branch = ObjectId::hash_object(ObjectType::Commit, b"branch");
        let tag = ObjectId::hash_object(ObjectType::Commit, b"tag");
        let remote = ObjectId::hash_object(ObjectType::Commit, b"remote");
        put(&store, MASTER, Ref::PeeledNonTag(branch))?;
        put(&store, "refs/heads/v1", Ref::PeeledNonTag(branch))?;
        put(&store, "refs/tags/v1", Ref::PeeledNonTag(tag))?;
        put(&store, "refs/remotes/origin/main", Ref::PeeledNonTag(remote))?;
        put(&store, HEAD, Ref::symbolic(MASTER))?;

        let refs = RefStore::new(&store, CONTAINER);
        let rtxn = store.read_txn()?;
        let found = refs.find_ref(&rtxn, "master")?.unwrap();
        assert_eq!(found.name, MASTER);
        assert_eq!(found.reference, Ref::PeeledNonTag(branch));

        assert_eq!(refs.find_ref(&rtxn, "v1")?.unwrap().name, "refs/tags/v1");
        assert_eq!(refs.find_ref(&rtxn, "heads/v1")?.unwrap().name, "refs/heads/v1");
        assert_eq!(refs.find_ref(&rtxn, "origin/main")?.unwrap().name, "refs/remotes/origin/main");
        assert_eq!(refs.find_ref(&rtxn, HEAD)?.unwrap().reference, Ref::symbolic(MASTER));
        assert!(refs.find_ref(&rtxn, "missing")?.is_none());
        Ok(())
    }
}
