//! Registry index maintenance
//!
//! The cargo registry index is an ordinary git repository. Crate metadata
//! and `config.json` are committed into it with
//! [`RepositoryHandle::replace_file`], one file per commit.

use anyhow::{Context, Result};
use cargit_git::refs::MASTER;
use cargit_git::{ObjectId, PersonIdent, Repositories, RepositoryHandle};
use serde::Serialize;
use tracing::info;

/// Path of a crate's metadata file inside the index.
///
/// `a` → `1/a`, `ab` → `2/ab`, `abc` → `3/a/abc`, `abcde` → `ab/cd/abcde`.
/// Names are lowercased. Returns `None` for an empty name.
pub fn index_entry_path(name: &str) -> Option<String> {
    let name = name.to_lowercase();
    let chars: Vec<char> = name.chars().collect();
    let path = match chars.len() {
        0 => return None,
        1 => format!("1/{}", name),
        2 => format!("2/{}", name),
        3 => format!("3/{}/{}", chars[0], name),
        _ => {
            let first: String = chars[..2].iter().collect();
            let second: String = chars[2..4].iter().collect();
            format!("{}/{}/{}", first, second, name)
        }
    };
    Some(path)
}

#[derive(Serialize)]
struct IndexConfig<'a> {
    dl: String,
    api: &'a str,
    #[serde(rename = "allowed-registries")]
    allowed_registries: &'a [String],
}

/// The registry's index repository.
#[derive(Clone)]
pub struct RegistryIndex {
    repositories: Repositories,
    repository: String,
    identity: PersonIdent,
}

impl RegistryIndex {
    pub fn new(repositories: Repositories, repository: impl Into<String>, identity: PersonIdent) -> Self {
        Self {
            repositories,
            repository: repository.into(),
            identity,
        }
    }

    /// Ensure the index repository exists. Called once before serving.
    pub fn initialize(&self) -> Result<RepositoryHandle> {
        let handle = self
            .repositories
            .ensure_repository(&self.repository)
            .with_context(|| format!("Failed to create index repository {}", self.repository))?;
        info!("registry index ready in repository {}", self.repository);
        Ok(handle)
    }

    /// Point the index at `url`. Returns the new commit, if anything changed.
    pub fn write_config_json(&self, url: &str, allowed_registries: &[String]) -> Result<Option<ObjectId>> {
        let url = url.trim_end_matches('/');
        let config = IndexConfig {
            dl: format!("{}/api/v1/crates", url),
            api: url,
            allowed_registries,
        };
        let bytes = serde_json::to_vec(&config)?;
        self.commit_file("config.json", &bytes, &format!("Update registry URL to {}", url))
    }

    /// Replace the metadata file of `crate_name` with `bytes`.
    pub fn write_index_entry(&self, crate_name: &str, bytes: &[u8]) -> Result<Option<ObjectId>> {
        let path = index_entry_path(crate_name).context("Crate name is empty")?;
        self.commit_file(&path, bytes, &format!("Update crate {}", crate_name))
    }

    fn commit_file(&self, path: &str, bytes: &[u8], message: &str) -> Result<Option<ObjectId>> {
        let handle = self.initialize()?;
        let commit = self
            .repositories
            .store()
            .write_with(|txn| handle.replace_file(txn, MASTER, path, bytes, &self.identity, message))
            .with_context(|| format!("Failed to commit {} to the index", path))?;
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cargit_git::object::{parse_commit, parse_tree};
    use cargit_git::ObjectType;
    use lmdb_asset_store::LmdbAssetStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_index_entry_path() {
        assert_eq!(index_entry_path("a").as_deref(), Some("1/a"));
        assert_eq!(index_entry_path("ab").as_deref(), Some("2/ab"));
        assert_eq!(index_entry_path("abc").as_deref(), Some("3/a/abc"));
        assert_eq!(index_entry_path("abcde").as_deref(), Some("ab/cd/abcde"));
        assert_eq!(index_entry_path("Serde").as_deref(), Some("se/rd/serde"));
        assert_eq!(index_entry_path(""), None);
    }

    fn open_index() -> (TempDir, RegistryIndex) {
        let temp = TempDir::new().unwrap();
        let store = LmdbAssetStore::with_map_size(temp.path().join("db"), 64 * 1024 * 1024).unwrap();
        let repositories = Repositories::new(Arc::new(store));
        let identity = PersonIdent::new("Cargit System", "cargit@localhost");
        (temp, RegistryIndex::new(repositories, "index", identity))
    }

    #[test]
    fn test_write_config_json() -> Result<()> {
        let (_temp, index) = open_index();
        let allowed = vec!["https://github.com/rust-lang/crates.io-index".to_string()];
        let commit = index
            .write_config_json("https://crates.example.com/", &allowed)?
            .expect("first write commits");

        // Same URL again changes nothing.
        assert_eq!(index.write_config_json("https://crates.example.com", &allowed)?, None);

        let handle = index.initialize()?;
        let txn = index.repositories.store().read_txn()?;
        let objects = handle.objects();
        let object = objects.read_object(&txn, &commit, Some(ObjectType::Commit))?;
        let message = String::from_utf8_lossy(&object.content).to_string();
        assert!(message.contains("Update registry URL to https://crates.example.com"));
        assert!(message.contains("author Cargit System <cargit@localhost>"));

        let tree = objects.read_object(&txn, &parse_commit(&object.content)?.tree, Some(ObjectType::Tree))?;
        let entry = parse_tree(&tree.content)?
            .into_iter()
            .find(|entry| entry.name == "config.json")
            .expect("config.json in tree");
        let blob = objects.read_object(&txn, &entry.oid, Some(ObjectType::Blob))?;
        let json: serde_json::Value = serde_json::from_slice(&blob.content)?;
        assert_eq!(json["dl"], "https://crates.example.com/api/v1/crates");
        assert_eq!(json["api"], "https://crates.example.com");
        assert_eq!(json["allowed-registries"][0], "https://github.com/rust-lang/crates.io-index");
        Ok(())
    }

    #[test]
    fn test_write_index_entry() -> Result<()> {
        let (_temp, index) = open_index();
        let first = index.write_index_entry("serde", b"{\"name\":\"serde\",\"vers\":\"1.0.0\"}\n")?;
        let second = index.write_index_entry("syn", b"{\"name\":\"syn\",\"vers\":\"2.0.0\"}\n")?;
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(index.write_index_entry("", b"{}").is_err());

        let handle = index.initialize()?;
        let txn = index.repositories.store().read_txn()?;
        let tip = handle.refs().get_resolved(&txn, MASTER)?.expect("master exists");
        assert_eq!(Some(tip.object_id()), second);
        Ok(())
    }
}
