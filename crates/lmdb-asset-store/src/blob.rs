//! Chunked blob storage with digests computed while streaming.

use crate::{LmdbAssetStore, Result, StoreError};
use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};

/// Blobs are split into records of this many bytes.
pub const BLOB_CHUNK_SIZE: usize = 64 * 1024;

/// Opaque handle to a stored blob.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    fn generate() -> Self {
        BlobRef(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn chunk_key(&self, index: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.0.len() + 4);
        key.extend_from_slice(self.0.as_bytes());
        key.extend_from_slice(&index.to_be_bytes());
        key
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A digest computed over a blob as it is written.
pub trait StreamDigest: Send {
    /// Key under which the finished digest is reported.
    fn name(&self) -> &'static str;
    fn update(&mut self, data: &[u8]);
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// Plain SHA-1 over the blob bytes.
#[derive(Default)]
pub struct Sha1Digest(Sha1);

impl Sha1Digest {
    pub const NAME: &'static str = "sha1";

    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDigest for Sha1Digest {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

/// Result of writing a blob.
#[derive(Debug, Clone)]
pub struct AssetBlob {
    pub blob_ref: BlobRef,
    pub size: u64,
    pub digests: BTreeMap<&'static str, Vec<u8>>,
}

impl AssetBlob {
    pub fn digest(&self, name: &str) -> Option<&[u8]> {
        self.digests.get(name).map(|d| d.as_slice())
    }
}

impl LmdbAssetStore {
    /// Stream `reader` into a new blob, feeding every chunk to `digests`.
    ///
    /// The blob is visible only inside `txn` until it commits. A blob that is
    /// never attached to an asset should be removed with [`delete_blob`].
    ///
    /// [`delete_blob`]: LmdbAssetStore::delete_blob
    pub fn create_blob<R: Read>(
        &self,
        txn: &mut RwTxn,
        mut reader: R,
        mut digests: Vec<Box<dyn StreamDigest>>,
    ) -> Result<AssetBlob> {
        let blob_ref = BlobRef::generate();
        let mut buf = vec![0u8; BLOB_CHUNK_SIZE];
        let mut size = 0u64;
        let mut index = 0u32;

        loop {
            let n = fill_buffer(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            for digest in digests.iter_mut() {
                digest.update(chunk);
            }
            self.blobs.put(txn, &blob_ref.chunk_key(index), chunk)?;
            size += n as u64;
            index += 1;
            if n < buf.len() {
                break;
            }
        }

        self.blob_sizes
            .put(txn, blob_ref.as_str().as_bytes(), &size.to_be_bytes())?;

        let digests = digests
            .into_iter()
            .map(|d| (d.name(), d.finish()))
            .collect();

        Ok(AssetBlob {
            blob_ref,
            size,
            digests,
        })
    }

    /// Size of a stored blob, or `None` if it does not exist.
    pub fn blob_size(&self, txn: &RoTxn, blob_ref: &BlobRef) -> Result<Option<u64>> {
        let Some(raw) = self.blob_sizes.get(txn, blob_ref.as_str().as_bytes())? else {
            return Ok(None);
        };
        let raw: [u8; 8] = raw
            .try_into()
            .map_err(|_| StoreError::InvalidKey(format!("bad size record for blob {}", blob_ref)))?;
        Ok(Some(u64::from_be_bytes(raw)))
    }

    /// Open a blob for chunked reading within `txn`.
    pub fn open_blob<'t, 'e>(
        &self,
        txn: &'t RoTxn<'e>,
        blob_ref: &BlobRef,
    ) -> Result<Option<BlobReader<'t, 'e>>> {
        let Some(size) = self.blob_size(txn, blob_ref)? else {
            return Ok(None);
        };
        Ok(Some(BlobReader {
            txn,
            blobs: self.blobs,
            blob_ref: blob_ref.clone(),
            next_chunk: 0,
            chunk: &[],
            remaining: size,
            size,
        }))
    }

    /// Remove a blob and all of its chunks. Returns false if it was absent.
    pub fn delete_blob(&self, txn: &mut RwTxn, blob_ref: &BlobRef) -> Result<bool> {
        let Some(size) = self.blob_size(txn, blob_ref)? else {
            return Ok(false);
        };
        let chunks = size.div_ceil(BLOB_CHUNK_SIZE as u64) as u32;
        for index in 0..chunks {
            self.blobs.delete(txn, &blob_ref.chunk_key(index))?;
        }
        self.blob_sizes.delete(txn, blob_ref.as_str().as_bytes())?;
        Ok(true)
    }
}

/// Sequential reader over the chunks of one blob.
pub struct BlobReader<'t, 'e> {
    txn: &'t RoTxn<'e>,
    blobs: Database<Bytes, Bytes>,
    blob_ref: BlobRef,
    next_chunk: u32,
    chunk: &'t [u8],
    remaining: u64,
    size: u64,
}

impl BlobReader<'_, '_> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for BlobReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.chunk.is_empty() {
            if self.remaining == 0 {
                return Ok(0);
            }
            let key = self.blob_ref.chunk_key(self.next_chunk);
            let chunk = self
                .blobs
                .get(self.txn, &key)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("blob {} truncated at chunk {}", self.blob_ref, self.next_chunk),
                    )
                })?;
            self.chunk = chunk;
            self.next_chunk += 1;
        }

        let n = buf.len().min(self.chunk.len());
        buf[..n].copy_from_slice(&self.chunk[..n]);
        self.chunk = &self.chunk[n..];
        self.remaining = self.remaining.saturating_sub(n as u64);
        Ok(n)
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill_buffer<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
