//! Git packfile format and generation
//!
//! Packfiles are git's binary format for transferring objects.
//! Format: PACK header, N objects, SHA-1 checksum

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lmdb_asset_store::RoTxn;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use tracing::debug;

use crate::object::{parse_commit, parse_tag, parse_tree, ObjectId, ObjectType};
use crate::odb::ObjectStore;
use crate::{Error, Result};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_HEADER_LEN: usize = 12;
pub const PACK_TRAILER_LEN: usize = 20;

/// Pack object type encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
    OfsDelta = 6,
    RefDelta = 7,
}

impl PackObjectType {
    pub fn from_object_type(t: ObjectType) -> Self {
        match t {
            ObjectType::Commit => PackObjectType::Commit,
            ObjectType::Tree => PackObjectType::Tree,
            ObjectType::Blob => PackObjectType::Blob,
            ObjectType::Tag => PackObjectType::Tag,
        }
    }

    /// Object type for whole entries, `None` for deltas.
    pub fn object_type(self) -> Option<ObjectType> {
        match self {
            PackObjectType::Commit => Some(ObjectType::Commit),
            PackObjectType::Tree => Some(ObjectType::Tree),
            PackObjectType::Blob => Some(ObjectType::Blob),
            PackObjectType::Tag => Some(ObjectType::Tag),
            PackObjectType::OfsDelta | PackObjectType::RefDelta => None,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PackObjectType::Commit),
            2 => Some(PackObjectType::Tree),
            3 => Some(PackObjectType::Blob),
            4 => Some(PackObjectType::Tag),
            6 => Some(PackObjectType::OfsDelta),
            7 => Some(PackObjectType::RefDelta),
            _ => None,
        }
    }
}

/// The type+size prefix of every pack entry.
///
/// First byte: continuation bit, 3-bit type, low 4 bits of size. Following
/// bytes: continuation bit and 7 more size bits each, least significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObjectHeader {
    pub pack_type: PackObjectType,
    /// Inflated size of the entry body.
    pub size: u64,
    /// Bytes taken by the header itself.
    pub header_len: usize,
}

impl PackedObjectHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let truncated = || Error::Corrupt("truncated object header".into());
        let first = *data.first().ok_or_else(truncated)?;
        let type_bits = (first >> 4) & 0x07;
        let pack_type = PackObjectType::from_u8(type_bits)
            .ok_or_else(|| Error::Corrupt(format!("invalid pack object type: {}", type_bits)))?;

        let mut size = (first & 0x0f) as u64;
        let mut shift = 4;
        let mut pos = 1;
        let mut byte = first;
        while byte & 0x80 != 0 {
            byte = *data.get(pos).ok_or_else(truncated)?;
            pos += 1;
            if shift > 57 {
                return Err(Error::Corrupt("object size overflows".into()));
            }
            size |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
        }

        Ok(Self {
            pack_type,
            size,
            header_len: pos,
        })
    }

    pub fn encode(pack_type: PackObjectType, size: u64, out: &mut Vec<u8>) {
        let mut c = ((pack_type as u8) << 4) | ((size & 0x0f) as u8);
        let mut remaining = size >> 4;
        if remaining > 0 {
            c |= 0x80;
        }
        out.push(c);

        while remaining > 0 {
            let mut byte = (remaining & 0x7f) as u8;
            remaining >>= 7;
            if remaining > 0 {
                byte |= 0x80;
            }
            out.push(byte);
        }
    }
}

/// Decode the negative base offset of an ofs-delta entry.
///
/// Returns the distance back to the base and the number of bytes read.
pub fn read_ofs_offset(data: &[u8]) -> Result<(u64, usize)> {
    let truncated = || Error::Corrupt("truncated ofs-delta offset".into());
    let mut byte = *data.first().ok_or_else(truncated)?;
    let mut pos = 1;
    let mut offset = (byte & 0x7f) as u64;
    while byte & 0x80 != 0 {
        byte = *data.get(pos).ok_or_else(truncated)?;
        pos += 1;
        if offset > (u64::MAX >> 8) {
            return Err(Error::Corrupt("ofs-delta offset overflows".into()));
        }
        offset = ((offset + 1) << 7) | (byte & 0x7f) as u64;
    }
    Ok((offset, pos))
}

/// Parse the 12-byte pack header, returning the object count.
pub fn parse_pack_header(data: &[u8]) -> Result<u32> {
    if data.len() < PACK_HEADER_LEN {
        return Err(Error::Corrupt("pack header truncated".into()));
    }
    if &data[0..4] != PACK_SIGNATURE {
        return Err(Error::Corrupt("invalid packfile magic".into()));
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != 2 && version != 3 {
        return Err(Error::Corrupt(format!("unsupported pack version: {}", version)));
    }
    Ok(u32::from_be_bytes([data[8], data[9], data[10], data[11]]))
}

/// Passes bytes through while hashing them for the pack trailer.
struct HashingWriter<W> {
    inner: W,
    digest: Sha1,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams undeltified pack entries and the trailing checksum into `W`.
///
/// Nothing is buffered beyond what the zlib encoder holds, so packs of any
/// size can be written straight into a response body.
pub struct PackWriter<W: Write> {
    out: HashingWriter<W>,
    remaining: u32,
}

impl<W: Write> PackWriter<W> {
    pub fn new(out: W, object_count: u32) -> Result<Self> {
        let mut out = HashingWriter {
            inner: out,
            digest: Sha1::new(),
        };
        out.write_all(PACK_SIGNATURE)?;
        out.write_all(&2u32.to_be_bytes())?;
        out.write_all(&object_count.to_be_bytes())?;
        Ok(Self {
            out,
            remaining: object_count,
        })
    }

    /// Append one entry, deflating `content` as it is read.
    pub fn write_entry<R: Read>(&mut self, obj_type: ObjectType, size: u64, mut content: R) -> Result<()> {
        if self.remaining == 0 {
            return Err(Error::Corrupt("more entries than the pack header declares".into()));
        }
        let mut header = Vec::with_capacity(10);
        PackedObjectHeader::encode(PackObjectType::from_object_type(obj_type), size, &mut header);
        self.out.write_all(&header)?;

        let mut encoder = ZlibEncoder::new(&mut self.out, Compression::default());
        let copied = io::copy(&mut content, &mut encoder)?;
        encoder.finish()?;
        if copied != size {
            return Err(Error::Corrupt(format!(
                "{} declared {} bytes but {} were read",
                obj_type, size, copied
            )));
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Write the checksum and hand back the output.
    pub fn finish(self) -> Result<W> {
        if self.remaining != 0 {
            return Err(Error::Corrupt(format!("{} declared entries never written", self.remaining)));
        }
        let HashingWriter { mut inner, digest } = self.out;
        inner.write_all(&digest.finalize())?;
        Ok(inner)
    }
}

/// Stream a packfile containing the given objects into `out`.
pub fn write_packfile<W: Write>(txn: &RoTxn, objects: &ObjectStore, ids: &[ObjectId], out: W) -> Result<W> {
    let mut writer = PackWriter::new(out, ids.len() as u32)?;
    for id in ids {
        let loader = objects.open(txn, id, None)?;
        let stream = objects.stream(txn, &loader)?;
        writer.write_entry(loader.obj_type(), loader.size(), stream)?;
    }
    writer.finish()
}

/// Generate a packfile containing the given objects
pub fn generate_packfile(txn: &RoTxn, objects: &ObjectStore, ids: &[ObjectId]) -> Result<Vec<u8>> {
    write_packfile(txn, objects, ids, Vec::new())
}

/// Selects the objects reachable from the wanted tips but not from the
/// client's common commits, and packs them.
pub struct PackBuilder<'a> {
    objects: ObjectStore<'a>,
    want: Vec<ObjectId>,
    have: Vec<ObjectId>,
}

impl<'a> PackBuilder<'a> {
    pub fn new(objects: ObjectStore<'a>) -> Self {
        Self {
            objects,
            want: Vec::new(),
            have: Vec::new(),
        }
    }

    pub fn want(&mut self, oid: ObjectId) {
        self.want.push(oid);
    }

    pub fn have(&mut self, oid: ObjectId) {
        self.have.push(oid);
    }

    /// Stream the pack for the collected objects into `out`.
    pub fn write_to<W: Write>(&self, txn: &RoTxn, ids: &[ObjectId], out: W) -> Result<W> {
        debug!("packing {} objects for {} wants", ids.len(), self.want.len());
        write_packfile(txn, &self.objects, ids, out)
    }

    /// Walk the object graph from the wants, stopping at the haves.
    pub fn collect(&self, txn: &RoTxn) -> Result<Vec<ObjectId>> {
        let mut excluded: HashSet<ObjectId> = HashSet::new();
        for have in &self.have {
            excluded.insert(*have);
            if self.objects.object_type(txn, have)? == Some(ObjectType::Commit) {
                let commit = self.objects.read_object(txn, have, Some(ObjectType::Commit))?;
                self.exclude_tree(txn, parse_commit(&commit.content)?.tree, &mut excluded)?;
            }
        }

        let mut needed = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<ObjectId> = self.want.iter().rev().copied().collect();

        while let Some(oid) = stack.pop() {
            if excluded.contains(&oid) || !seen.insert(oid) {
                continue;
            }
            let obj_type = self
                .objects
                .object_type(txn, &oid)?
                .ok_or_else(|| Error::MissingObject(oid.to_hex()))?;
            needed.push(oid);

            match obj_type {
                ObjectType::Commit => {
                    let commit = self.objects.read_object(txn, &oid, Some(obj_type))?;
                    let info = parse_commit(&commit.content)?;
                    stack.extend(info.parents.iter().rev());
                    stack.push(info.tree);
                }
                ObjectType::Tree => {
                    let tree = self.objects.read_object(txn, &oid, Some(obj_type))?;
                    let entries = parse_tree(&tree.content)?;
                    stack.extend(
                        entries
                            .iter()
                            .rev()
                            .filter(|entry| !entry.is_submodule())
                            .map(|entry| entry.oid),
                    );
                }
                ObjectType::Tag => {
                    let tag = self.objects.read_object(txn, &oid, Some(obj_type))?;
                    stack.push(parse_tag(&tag.content)?.object);
                }
                ObjectType::Blob => {}
            }
        }

        Ok(needed)
    }

    /// Mark a tree and everything below it as already present on the client.
    fn exclude_tree(&self, txn: &RoTxn, root: ObjectId, excluded: &mut HashSet<ObjectId>) -> Result<()> {
        let mut stack = vec![root];
        while let Some(tree_id) = stack.pop() {
            if !excluded.insert(tree_id) {
                continue;
            }
            if self.objects.object_type(txn, &tree_id)? != Some(ObjectType::Tree) {
                continue;
            }
            let tree = self.objects.read_object(txn, &tree_id, Some(ObjectType::Tree))?;
            for entry in parse_tree(&tree.content)? {
                if entry.is_submodule() {
                    continue;
                }
                if entry.is_tree() {
                    stack.push(entry.oid);
                } else {
                    excluded.insert(entry.oid);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{format_commit, serialize_tree, PersonIdent, TreeEntry, MODE_FILE, MODE_TREE};
    use crate::odb::DEFAULT_BIG_FILE_THRESHOLD;
    use lmdb_asset_store::LmdbAssetStore;

    #[test]
    fn test_header_encoding() {
        for size in [0u64, 15, 16, 1000, 1 << 20, u32::MAX as u64 + 7] {
            let mut out = Vec::new();
            PackedObjectHeader::encode(PackObjectType::Blob, size, &mut out);
            let header = PackedObjectHeader::parse(&out).unwrap();
            assert_eq!(header.pack_type, PackObjectType::Blob);
            assert_eq!(header.size, size);
            assert_eq!(header.header_len, out.len());
        }
    }

    #[test]
    fn test_header_rejects_bad_type() {
        assert!(matches!(PackedObjectHeader::parse(&[0x50]), Err(Error::Corrupt(_))));
        assert!(matches!(PackedObjectHeader::parse(&[0x90]), Err(Error::Corrupt(_))));
        assert!(matches!(PackedObjectHeader::parse(&[]), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_ofs_offset() {
        assert_eq!(read_ofs_offset(&[0x05]).unwrap(), (5, 1));
        // Two-byte form adds the implicit 1 << 7 bias.
        assert_eq!(read_ofs_offset(&[0x80, 0x00]).unwrap(), (128, 2));
        assert_eq!(read_ofs_offset(&[0x81, 0x05]).unwrap(), (((1 + 1) << 7) | 5, 2));
        assert!(read_ofs_offset(&[0x81]).is_err());
    }

    #[test]
    fn test_pack_header() {
        let mut writer = PackWriter::new(Vec::new(), 3).unwrap();
        for content in [&b"a"[..], b"b", b"c"] {
            writer.write_entry(ObjectType::Blob, 1, content).unwrap();
        }
        let pack = writer.finish().unwrap();
        assert_eq!(parse_pack_header(&pack).unwrap(), 3);
        assert_eq!(&pack[pack.len() - PACK_TRAILER_LEN..], Sha1::digest(&pack[..pack.len() - PACK_TRAILER_LEN]).as_slice());

        let mut bad = pack.clone();
        bad[7] = 9;
        assert!(matches!(parse_pack_header(&bad), Err(Error::Corrupt(_))));
        assert!(matches!(parse_pack_header(b"PACK"), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_writer_enforces_declared_count() {
        let writer = PackWriter::new(Vec::new(), 1).unwrap();
        assert!(matches!(writer.finish(), Err(Error::Corrupt(_))));

        let mut writer = PackWriter::new(Vec::new(), 0).unwrap();
        let outcome = writer.write_entry(ObjectType::Blob, 1, &b"x"[..]);
        assert!(matches!(outcome, Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_writer_streams_into_any_output() {
        let mut out = Vec::new();
        let mut writer = PackWriter::new(&mut out, 1).unwrap();
        writer.write_entry(ObjectType::Blob, 5, &b"hello"[..]).unwrap();
        writer.finish().unwrap();

        let mut buffered = PackWriter::new(Vec::new(), 1).unwrap();
        buffered.write_entry(ObjectType::Blob, 5, &b"hello"[..]).unwrap();
        assert_eq!(out, buffered.finish().unwrap());
    }

    fn commit_tree(odb: &ObjectStore, txn: &mut lmdb_asset_store::RwTxn, readme: &[u8], parent: Option<ObjectId>) -> ObjectId {
        let lib = odb.insert_bytes(txn, ObjectType::Blob, b"pub fn unchanged() {}\n").unwrap();
        let src = serialize_tree(&[TreeEntry::new(MODE_FILE, "lib.rs", lib)]);
        let src = odb.insert_bytes(txn, ObjectType::Tree, &src).unwrap();
        let readme = odb.insert_bytes(txn, ObjectType::Blob, readme).unwrap();
        let root = serialize_tree(&[
            TreeEntry::new(MODE_FILE, "README", readme),
            TreeEntry::new(MODE_TREE, "src", src),
        ]);
        let root = odb.insert_bytes(txn, ObjectType::Tree, &root).unwrap();
        let parents: Vec<ObjectId> = parent.into_iter().collect();
        let author = PersonIdent::new("Test", "test@example.com");
        let commit = format_commit(root, &parents, &author, "update");
        odb.insert_bytes(txn, ObjectType::Commit, &commit).unwrap()
    }

    #[test]
    fn test_incremental_pack_skips_unchanged_subtrees() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = LmdbAssetStore::with_map_size(temp.path().join("db"), 64 * 1024 * 1024).unwrap();
        let odb = ObjectStore::new(&store, "git:test", DEFAULT_BIG_FILE_THRESHOLD);
        let (first, second) = store
            .write_with(|txn| {
                let first = commit_tree(&odb, txn, b"one\n", None);
                let second = commit_tree(&odb, txn, b"two\n", Some(first));
                Ok::<_, Error>((first, second))
            })
            .unwrap();

        let txn = store.read_txn().unwrap();
        let mut builder = PackBuilder::new(odb);
        builder.want(second);
        assert_eq!(builder.collect(&txn).unwrap().len(), 8);

        builder.have(first);
        let ids = builder.collect(&txn).unwrap();
        // New commit, new root tree and the changed README only.
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], second);
        let readme = ObjectId::hash_object(ObjectType::Blob, b"two\n");
        assert!(ids.contains(&readme));
        let lib = ObjectId::hash_object(ObjectType::Blob, b"pub fn unchanged() {}\n");
        assert!(!ids.contains(&lib));
    }
}
