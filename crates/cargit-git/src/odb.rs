//! Object database on top of the asset store
//!
//! Each object is one asset of kind `object`, named by its hex id, with the
//! raw content (no header, not deflated) stored as the asset blob.

use lmdb_asset_store::{AssetRecord, BlobRef, LmdbAssetStore, RoTxn, RwTxn, StreamDigest};
use std::io::Read;
use tracing::debug;

use crate::object::{GitObject, ObjectId, ObjectIdHasher, ObjectType};
use crate::{Error, Result};

pub const OBJECT_KIND: &str = "object";
pub const ATTR_OBJECT_TYPE: &str = "git-object-type";

/// Objects at or above this size are streamed instead of buffered.
pub const DEFAULT_BIG_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Upper bound on abbreviated-id matches.
pub const MAX_ABBREVIATED_RESULTS: usize = 256;

const OBJECT_ID_DIGEST: &str = "git-object-id";

/// Computes the git object id while a blob is being written.
struct ObjectIdDigest(ObjectIdHasher);

impl StreamDigest for ObjectIdDigest {
    fn name(&self) -> &'static str {
        OBJECT_ID_DIGEST
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finish().as_bytes().to_vec()
    }
}

/// An opened object. Small objects are already in memory; large ones are
/// read from their blob when streamed.
#[derive(Debug, Clone)]
pub enum ObjectLoader {
    Small {
        obj_type: ObjectType,
        data: Vec<u8>,
    },
    Large {
        id: ObjectId,
        obj_type: ObjectType,
        size: u64,
        blob: BlobRef,
    },
}

impl ObjectLoader {
    pub fn obj_type(&self) -> ObjectType {
        match self {
            ObjectLoader::Small { obj_type, .. } | ObjectLoader::Large { obj_type, .. } => *obj_type,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ObjectLoader::Small { data, .. } => data.len() as u64,
            ObjectLoader::Large { size, .. } => *size,
        }
    }

    pub fn is_large(&self) -> bool {
        matches!(self, ObjectLoader::Large { .. })
    }

    /// In-memory content, `None` for large objects.
    pub fn cached_bytes(&self) -> Option<&[u8]> {
        match self {
            ObjectLoader::Small { data, .. } => Some(data),
            ObjectLoader::Large { .. } => None,
        }
    }
}

/// Content-addressed object storage scoped to one repository container.
#[derive(Clone, Copy)]
pub struct ObjectStore<'r> {
    store: &'r LmdbAssetStore,
    container: &'r str,
    big_file_threshold: u64,
}

impl<'r> ObjectStore<'r> {
    pub fn new(store: &'r LmdbAssetStore, container: &'r str, big_file_threshold: u64) -> Self {
        Self {
            store,
            container,
            big_file_threshold,
        }
    }

    pub fn big_file_threshold(&self) -> u64 {
        self.big_file_threshold
    }

    /// Stream `content` into storage and return its object id.
    ///
    /// If an object with the same id already exists the new blob is dropped.
    pub fn insert<R: Read>(
        &self,
        txn: &mut RwTxn,
        obj_type: ObjectType,
        size: u64,
        content: R,
    ) -> Result<ObjectId> {
        let digest = ObjectIdDigest(ObjectIdHasher::new(obj_type, size));
        let blob = self.store.create_blob(txn, content, vec![Box::new(digest)])?;

        if blob.size != size {
            self.store.delete_blob(txn, &blob.blob_ref)?;
            return Err(Error::Corrupt(format!(
                "{} declared {} bytes but {} were read",
                obj_type, size, blob.size
            )));
        }

        let id = blob
            .digest(OBJECT_ID_DIGEST)
            .and_then(ObjectId::from_bytes)
            .ok_or_else(|| Error::Corrupt("object id digest missing".into()))?;

        if self.find_record(txn, &id)?.is_some() {
            debug!("{} {} already stored", obj_type, id);
            self.store.delete_blob(txn, &blob.blob_ref)?;
            return Ok(id);
        }

        let mut record = AssetRecord::new(self.container, OBJECT_KIND, &id.to_hex());
        record.set_attribute(ATTR_OBJECT_TYPE, obj_type.as_str());
        record.attach_blob(&blob);
        self.store.save_asset(txn, &record)?;
        debug!("stored {} {} ({} bytes)", obj_type, id, size);
        Ok(id)
    }

    pub fn insert_bytes(&self, txn: &mut RwTxn, obj_type: ObjectType, data: &[u8]) -> Result<ObjectId> {
        self.insert(txn, obj_type, data.len() as u64, data)
    }

    /// Whether the object exists. A mismatching `type_hint` is an error.
    pub fn has(&self, txn: &RoTxn, id: &ObjectId, type_hint: Option<ObjectType>) -> Result<bool> {
        let Some(record) = self.find_record(txn, id)? else {
            return Ok(false);
        };
        if let Some(expected) = type_hint {
            check_type(id, record_type(&record)?, expected)?;
        }
        Ok(true)
    }

    /// Stored type of an object, `None` if absent.
    pub fn object_type(&self, txn: &RoTxn, id: &ObjectId) -> Result<Option<ObjectType>> {
        match self.find_record(txn, id)? {
            Some(record) => Ok(Some(record_type(&record)?)),
            None => Ok(None),
        }
    }

    pub fn open(&self, txn: &RoTxn, id: &ObjectId, type_hint: Option<ObjectType>) -> Result<ObjectLoader> {
        let record = self
            .find_record(txn, id)?
            .ok_or_else(|| Error::MissingObject(id.to_hex()))?;
        let obj_type = record_type(&record)?;
        if let Some(expected) = type_hint {
            check_type(id, obj_type, expected)?;
        }

        let blob = record
            .blob
            .ok_or_else(|| Error::MissingObject(id.to_hex()))?;
        let size = match record.size {
            Some(size) => size,
            None => self
                .store
                .blob_size(txn, &blob)?
                .ok_or_else(|| Error::MissingObject(id.to_hex()))?,
        };

        if size >= self.big_file_threshold {
            return Ok(ObjectLoader::Large {
                id: *id,
                obj_type,
                size,
                blob,
            });
        }

        let mut reader = self
            .store
            .open_blob(txn, &blob)?
            .ok_or_else(|| Error::MissingObject(id.to_hex()))?;
        let mut data = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut data)?;
        Ok(ObjectLoader::Small { obj_type, data })
    }

    /// Content stream for an opened object.
    pub fn stream<'t, 'e>(
        &self,
        txn: &'t RoTxn<'e>,
        loader: &'t ObjectLoader,
    ) -> Result<Box<dyn Read + 't>> {
        match loader {
            ObjectLoader::Small { data, .. } => Ok(Box::new(data.as_slice())),
            ObjectLoader::Large { id, blob, .. } => {
                let reader = self
                    .store
                    .open_blob(txn, blob)?
                    .ok_or_else(|| Error::MissingObject(id.to_hex()))?;
                Ok(Box::new(reader))
            }
        }
    }

    /// Fully materialize an object regardless of size.
    pub fn read_object(&self, txn: &RoTxn, id: &ObjectId, type_hint: Option<ObjectType>) -> Result<GitObject> {
        match self.open(txn, id, type_hint)? {
            ObjectLoader::Small { obj_type, data } => Ok(GitObject::new(obj_type, data)),
            loader => {
                let mut content = Vec::with_capacity(loader.size() as usize);
                self.stream(txn, &loader)?.read_to_end(&mut content)?;
                Ok(GitObject::new(loader.obj_type(), content))
            }
        }
    }

    /// Ids starting with the hex `prefix`, at most [`MAX_ABBREVIATED_RESULTS`].
    pub fn resolve_abbreviated(&self, txn: &RoTxn, prefix: &str) -> Result<Vec<ObjectId>> {
        let prefix = prefix.to_ascii_lowercase();
        if prefix.len() > 40 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .browse_assets(txn, self.container, OBJECT_KIND, &prefix, Some(MAX_ABBREVIATED_RESULTS))?
            .iter()
            .filter_map(|record| ObjectId::from_hex(&record.name))
            .collect())
    }

    pub fn count(&self, txn: &RoTxn) -> Result<usize> {
        Ok(self.store.count_assets(txn, self.container, OBJECT_KIND)?)
    }

    fn find_record(&self, txn: &RoTxn, id: &ObjectId) -> Result<Option<AssetRecord>> {
        Ok(self
            .store
            .find_asset(txn, self.container, OBJECT_KIND, &id.to_hex())?)
    }
}

fn record_type(record: &AssetRecord) -> Result<ObjectType> {
    let raw = record.attribute(ATTR_OBJECT_TYPE).unwrap_or_default();
    ObjectType::from_str(raw)
        .ok_or_else(|| Error::Corrupt(format!("object {} has type {:?}", record.name, raw)))
}

fn check_type(id: &ObjectId, actual: ObjectType, expected: ObjectType) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::IncorrectType {
            id: id.to_hex(),
            expected: expected.as_str(),
            actual: actual.as_str(),
        })
    }
}
