//! LMDB-backed asset storage.
//!
//! An asset is a named record inside a container, identified by its kind and
//! name. Each asset carries a string attribute map and at most one attached
//! blob. Every operation takes its transaction explicitly; [`LmdbAssetStore::read_with`]
//! and [`LmdbAssetStore::write_with`] open a call-scoped one for callers that
//! do not already hold a transaction.

mod blob;

pub use blob::{AssetBlob, BlobReader, BlobRef, Sha1Digest, StreamDigest, BLOB_CHUNK_SIZE};
pub use heed::{RoTxn, RwTxn};

use heed::types::{Bytes, Str};
use heed::{Database, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Blob not found: {0}")]
    BlobMissing(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub type Attributes = BTreeMap<String, String>;

/// A named group of assets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub group: String,
    pub name: String,
}

impl Container {
    pub fn id(&self) -> String {
        container_id(&self.group, &self.name)
    }
}

fn container_id(group: &str, name: &str) -> String {
    format!("{}:{}", group, name)
}

/// A stored asset record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AssetRecord {
    pub container: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl AssetRecord {
    pub fn new(container: &str, kind: &str, name: &str) -> Self {
        Self {
            container: container.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: Attributes::new(),
            blob: None,
            size: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        self.attributes.remove(key)
    }

    pub fn attach_blob(&mut self, blob: &AssetBlob) {
        self.blob = Some(blob.blob_ref.clone());
        self.size = Some(blob.size);
    }
}

/// Storage statistics.
#[derive(Debug, Clone, Default)]
pub struct AssetStoreStats {
    pub containers: usize,
    pub assets: usize,
    pub blobs: usize,
    pub blob_bytes: u64,
}

pub struct LmdbAssetStore {
    env: heed::Env,
    /// container id → serialized [`Container`]
    containers: Database<Str, Bytes>,
    /// container \0 kind \0 name → serialized [`AssetRecord`]
    assets: Database<Bytes, Bytes>,
    /// blob ref ++ chunk index (u32 BE) → chunk bytes
    blobs: Database<Bytes, Bytes>,
    /// blob ref → total size (u64 BE)
    blob_sizes: Database<Bytes, Bytes>,
}

impl LmdbAssetStore {
    /// Open or create an asset store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_map_size(path, 10 * 1024 * 1024 * 1024) // 10GB default
    }

    /// Open or create with custom map size.
    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let containers = env.create_database(&mut wtxn, Some("containers"))?;
        let assets = env.create_database(&mut wtxn, Some("assets"))?;
        let blobs = env.create_database(&mut wtxn, Some("blobs"))?;
        let blob_sizes = env.create_database(&mut wtxn, Some("blob_sizes"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            containers,
            assets,
            blobs,
            blob_sizes,
        })
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Run `f` inside a call-scoped read transaction.
    pub fn read_with<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&RoTxn) -> std::result::Result<T, E>,
    {
        let rtxn = self.read_txn()?;
        f(&rtxn)
    }

    /// Run `f` inside a write transaction, committing on `Ok` and aborting on `Err`.
    pub fn write_with<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut RwTxn) -> std::result::Result<T, E>,
    {
        let mut wtxn = self.write_txn()?;
        match f(&mut wtxn) {
            Ok(value) => {
                wtxn.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(e) => {
                wtxn.abort();
                Err(e)
            }
        }
    }

    /// Create a container, returning the existing one if already present.
    pub fn create_container(&self, txn: &mut RwTxn, group: &str, name: &str) -> Result<Container> {
        if let Some(existing) = self.find_container(txn, group, name)? {
            return Ok(existing);
        }
        let container = Container {
            group: group.to_string(),
            name: name.to_string(),
        };
        let id = container.id();
        self.containers
            .put(txn, &id, &serde_json::to_vec(&container)?)?;
        debug!("created container {}", id);
        Ok(container)
    }

    pub fn find_container(&self, txn: &RoTxn, group: &str, name: &str) -> Result<Option<Container>> {
        match self.containers.get(txn, &container_id(group, name))? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace an asset record.
    pub fn save_asset(&self, txn: &mut RwTxn, record: &AssetRecord) -> Result<()> {
        let key = asset_key(&record.container, &record.kind, &record.name)?;
        self.assets.put(txn, &key, &serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Exact lookup by kind and name.
    pub fn find_asset(
        &self,
        txn: &RoTxn,
        container: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<AssetRecord>> {
        let key = asset_key(container, kind, name)?;
        match self.assets.get(txn, &key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    /// Assets of `kind` whose name starts with `name_prefix`, in name order.
    pub fn browse_assets(
        &self,
        txn: &RoTxn,
        container: &str,
        kind: &str,
        name_prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AssetRecord>> {
        let prefix = asset_key(container, kind, name_prefix)?;
        let limit = limit.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        for item in self.assets.prefix_iter(txn, &prefix)? {
            if records.len() >= limit {
                break;
            }
            let (_, raw) = item?;
            records.push(serde_json::from_slice(raw)?);
        }
        Ok(records)
    }

    /// Assets of `kind` whose attribute `key` equals `value`.
    pub fn find_assets_by_attribute(
        &self,
        txn: &RoTxn,
        container: &str,
        kind: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<AssetRecord>> {
        Ok(self
            .browse_assets(txn, container, kind, "", None)?
            .into_iter()
            .filter(|record| record.attribute(key) == Some(value))
            .collect())
    }

    pub fn count_assets(&self, txn: &RoTxn, container: &str, kind: &str) -> Result<usize> {
        let prefix = asset_key(container, kind, "")?;
        let mut count = 0;
        for item in self.assets.prefix_iter(txn, &prefix)? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Delete an asset and its blob. Returns false if it did not exist.
    pub fn delete_asset(&self, txn: &mut RwTxn, container: &str, kind: &str, name: &str) -> Result<bool> {
        let Some(record) = self.find_asset(txn, container, kind, name)? else {
            return Ok(false);
        };
        if let Some(blob_ref) = &record.blob {
            self.delete_blob(txn, blob_ref)?;
        }
        let key = asset_key(container, kind, name)?;
        Ok(self.assets.delete(txn, &key)?)
    }

    /// Get storage statistics.
    pub fn stats(&self) -> Result<AssetStoreStats> {
        let rtxn = self.read_txn()?;
        let mut stats = AssetStoreStats {
            containers: self.containers.len(&rtxn)? as usize,
            assets: self.assets.len(&rtxn)? as usize,
            blobs: self.blob_sizes.len(&rtxn)? as usize,
            blob_bytes: 0,
        };
        for item in self.blob_sizes.iter(&rtxn)? {
            let (_, raw) = item?;
            if let Ok(raw) = <[u8; 8]>::try_from(raw) {
                stats.blob_bytes += u64::from_be_bytes(raw);
            }
        }
        Ok(stats)
    }
}

fn asset_key(container: &str, kind: &str, name: &str) -> Result<Vec<u8>> {
    for part in [container, kind, name] {
        if part.contains('\0') {
            return Err(StoreError::InvalidKey(part.escape_default().to_string()));
        }
    }
    let mut key = Vec::with_capacity(container.len() + kind.len() + name.len() + 2);
    key.extend_from_slice(container.as_bytes());
    key.push(0);
    key.extend_from_slice(kind.as_bytes());
    key.push(0);
    key.extend_from_slice(name.as_bytes());
    Ok(key)
}
