//! Repositories stored as asset containers
//!
//! A repository is a container in the `git` group. Its objects, refs and
//! stored git config are assets inside that container.

use lmdb_asset_store::{AssetRecord, LmdbAssetStore, RoTxn, RwTxn, Sha1Digest};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ingest::PackIngester;
use crate::object::{
    format_commit, parse_commit, parse_tree, serialize_tree, ObjectId, ObjectType, PersonIdent, TreeEntry,
    MODE_FILE, MODE_TREE,
};
use crate::odb::{ObjectStore, DEFAULT_BIG_FILE_THRESHOLD};
use crate::refdb::RefStore;
use crate::refs::{HEAD, MASTER};
use crate::transaction::{RefTransaction, RefUpdateResult};
use crate::{Error, Result};

pub const REPOSITORY_GROUP: &str = "git";
pub const CONFIG_KIND: &str = "config";
const CONFIG_NAME: &str = "config";
const DEFAULT_CONFIG: &str = "[core]\n\trepositoryformatversion = 0\n\tbare = true\n";

/// Factory for repository handles over one asset store.
#[derive(Clone)]
pub struct Repositories {
    store: Arc<LmdbAssetStore>,
    big_file_threshold: u64,
}

impl Repositories {
    pub fn new(store: Arc<LmdbAssetStore>) -> Self {
        Self {
            store,
            big_file_threshold: DEFAULT_BIG_FILE_THRESHOLD,
        }
    }

    pub fn with_big_file_threshold(mut self, threshold: u64) -> Self {
        self.big_file_threshold = threshold;
        self
    }

    pub fn store(&self) -> &Arc<LmdbAssetStore> {
        &self.store
    }

    /// Create a new repository with HEAD pointing at refs/heads/master.
    pub fn create_repository(&self, txn: &mut RwTxn, name: &str) -> Result<RepositoryHandle> {
        validate_repository_name(name)?;
        if self.get_repository(txn, name)?.is_some() {
            return Err(Error::Rejected(format!("repository {} already exists", name)));
        }
        let container = self.store.create_container(txn, REPOSITORY_GROUP, name)?;
        let handle = self.handle(name, container.id());

        handle.ref_transaction().link(txn, HEAD, MASTER)?;
        if handle.find_config(txn)?.is_none() {
            handle.write_config(txn, DEFAULT_CONFIG)?;
        }
        info!("created repository {}", name);
        Ok(handle)
    }

    pub fn get_repository(&self, txn: &RoTxn, name: &str) -> Result<Option<RepositoryHandle>> {
        Ok(self
            .store
            .find_container(txn, REPOSITORY_GROUP, name)?
            .map(|container| self.handle(name, container.id())))
    }

    /// Return the named repository, creating it first if needed.
    pub fn ensure_repository(&self, name: &str) -> Result<RepositoryHandle> {
        self.store.write_with(|txn| match self.get_repository(txn, name)? {
            Some(handle) => Ok(handle),
            None => self.create_repository(txn, name),
        })
    }

    fn handle(&self, name: &str, container: String) -> RepositoryHandle {
        RepositoryHandle {
            name: name.to_string(),
            container,
            store: Arc::clone(&self.store),
            big_file_threshold: self.big_file_threshold,
        }
    }
}

fn validate_repository_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidPath(format!("invalid repository name {:?}", name)))
    }
}

/// One repository: an object store and a ref store sharing a container.
#[derive(Clone)]
pub struct RepositoryHandle {
    name: String,
    container: String,
    store: Arc<LmdbAssetStore>,
    big_file_threshold: u64,
}

impl RepositoryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &LmdbAssetStore {
        &self.store
    }

    pub fn objects(&self) -> ObjectStore<'_> {
        ObjectStore::new(&self.store, &self.container, self.big_file_threshold)
    }

    pub fn refs(&self) -> RefStore<'_> {
        RefStore::new(&self.store, &self.container)
    }

    pub fn ref_transaction(&self) -> RefTransaction<'_> {
        RefTransaction::new(self.refs(), self.objects())
    }

    pub fn pack_ingester(&self) -> PackIngester<'_> {
        PackIngester::new(self.objects())
    }

    /// Stored git config text; empty if none was ever written.
    pub fn read_config(&self, txn: &RoTxn) -> Result<String> {
        let Some(record) = self.find_config(txn)? else {
            return Ok(String::new());
        };
        let Some(blob) = &record.blob else {
            return Ok(String::new());
        };
        let mut text = String::new();
        self.store
            .open_blob(txn, blob)?
            .ok_or_else(|| Error::MissingObject(format!("config blob of {}", self.name)))?
            .read_to_string(&mut text)?;
        Ok(text)
    }

    pub fn write_config(&self, txn: &mut RwTxn, text: &str) -> Result<()> {
        let mut record = match self.find_config(txn)? {
            Some(record) => record,
            None => AssetRecord::new(&self.container, CONFIG_KIND, CONFIG_NAME),
        };
        if let Some(old) = record.blob.take() {
            self.store.delete_blob(txn, &old)?;
        }
        let blob = self
            .store
            .create_blob(txn, text.as_bytes(), vec![Box::new(Sha1Digest::new())])?;
        record.attach_blob(&blob);
        self.store.save_asset(txn, &record)?;
        Ok(())
    }

    fn find_config(&self, txn: &RoTxn) -> Result<Option<AssetRecord>> {
        Ok(self
            .store
            .find_asset(txn, &self.container, CONFIG_KIND, CONFIG_NAME)?)
    }

    /// Commit `bytes` at `path` on `branch`, keeping the rest of the tree.
    ///
    /// Returns the new commit, or `None` when the tree would not change.
    pub fn replace_file(
        &self,
        txn: &mut RwTxn,
        branch: &str,
        path: &str,
        bytes: &[u8],
        author: &PersonIdent,
        message: &str,
    ) -> Result<Option<ObjectId>> {
        let components = split_path(path)?;
        let objects = self.objects();

        let resolved = self.refs().get_resolved(txn, branch)?;
        let expected_old = resolved
            .as_ref()
            .map(|r| r.object_id())
            .unwrap_or(ObjectId::ZERO);
        let tip = resolved.map(|r| r.target.peeled_id().unwrap_or_else(|| r.object_id()));
        let parent_tree = match tip {
            Some(commit) => {
                let commit = objects.read_object(txn, &commit, Some(ObjectType::Commit))?;
                Some(parse_commit(&commit.content)?.tree)
            }
            None => None,
        };

        let blob = objects.insert_bytes(txn, ObjectType::Blob, bytes)?;
        let tree = self.write_tree_with(txn, parent_tree, &components, blob)?;
        if Some(tree) == parent_tree {
            debug!("{} on {} unchanged, no commit", path, branch);
            return Ok(None);
        }

        let parents: Vec<ObjectId> = tip.into_iter().collect();
        let content = format_commit(tree, &parents, author, message);
        let commit = objects.insert_bytes(txn, ObjectType::Commit, &content)?;

        let log_message = if parents.is_empty() {
            format!("commit (initial): {}", message)
        } else {
            format!("commit: {}", message)
        };
        let result = self
            .ref_transaction()
            .with_identity(author.clone())
            .with_message(log_message)
            .update(txn, branch, commit, expected_old)?;
        if result != RefUpdateResult::Accepted {
            return Err(Error::Rejected(format!("update of {} was {:?}", branch, result)));
        }
        info!("committed {} to {} in {} as {}", path, branch, self.name, commit);
        Ok(Some(commit))
    }

    /// Copy `tree` with the file at `components` set to `blob`, writing every
    /// changed subtree.
    fn write_tree_with(
        &self,
        txn: &mut RwTxn,
        tree: Option<ObjectId>,
        components: &[&str],
        blob: ObjectId,
    ) -> Result<ObjectId> {
        let objects = self.objects();
        let mut entries = match tree {
            Some(id) => parse_tree(&objects.read_object(txn, &id, Some(ObjectType::Tree))?.content)?,
            None => Vec::new(),
        };
        let (name, rest) = components
            .split_first()
            .ok_or_else(|| Error::InvalidPath("empty path".into()))?;
        let existing = entries.iter().position(|entry| entry.name == *name);

        let entry = if rest.is_empty() {
            let mode = existing
                .map(|i| &entries[i])
                .filter(|entry| !entry.is_tree() && !entry.is_submodule())
                .map(|entry| entry.mode)
                .unwrap_or(MODE_FILE);
            TreeEntry::new(mode, *name, blob)
        } else {
            let subtree = existing
                .map(|i| &entries[i])
                .filter(|entry| entry.is_tree())
                .map(|entry| entry.oid);
            TreeEntry::new(MODE_TREE, *name, self.write_tree_with(txn, subtree, rest, blob)?)
        };

        match existing {
            Some(i) => entries[i] = entry,
            None => entries.push(entry),
        }
        objects.insert_bytes(txn, ObjectType::Tree, &serialize_tree(&entries))
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let components: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    for component in &components {
        if component.is_empty() || *component == "." || *component == ".." || component.contains('\0') {
            return Err(Error::InvalidPath(path.to_string()));
        }
    }
    Ok(components)
}
