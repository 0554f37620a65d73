//! Pack ingestion
//!
//! Turns a received pack into discrete objects in the object store. The pack
//! is read as a stream: whole entries are inflated straight into the store
//! and deltas whose base is already available are resolved immediately. The
//! rest are revisited from their recorded offsets once the whole pack has
//! been read and its checksum verified, which is why the source must also be
//! seekable (pushes are spooled to a temporary file first).
//!
//! Objects are inserted before the checksum is known, so callers must run
//! [`PackIngester::ingest`] inside a write transaction and abort it on error.

use flate2::bufread::ZlibDecoder;
use flate2::Crc;
use lmdb_asset_store::{RoTxn, RwTxn, StoreError};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use tracing::debug;

use crate::delta::apply_delta;
use crate::object::{ObjectId, ObjectType};
use crate::odb::ObjectStore;
use crate::pack::{
    parse_pack_header, read_ofs_offset, PackObjectType, PackedObjectHeader, PACK_HEADER_LEN,
    PACK_TRAILER_LEN,
};
use crate::{Error, Result};

/// What an ingestion stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub objects: usize,
    pub deltas: usize,
    pub ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, Copy)]
enum EntryKind {
    Whole(ObjectType),
    OfsDelta { base_offset: u64 },
    RefDelta { base: ObjectId },
}

#[derive(Debug)]
struct PackEntry {
    offset: u64,
    end: u64,
    crc: u32,
    kind: EntryKind,
    resolved: Option<(ObjectType, ObjectId)>,
}

/// An entry header, read up to where its compressed body starts.
struct EntryHeader {
    kind: EntryKind,
    size: u64,
}

/// Buffered view of the pack that hashes and counts every byte consumed.
///
/// The zlib decoder only consumes what belongs to its stream, so after an
/// entry is inflated `pos` is exactly the offset of the next one.
struct PackStream<R> {
    inner: R,
    pos: u64,
    digest: Sha1,
    crc: Crc,
}

impl<R: BufRead> PackStream<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            pos: 0,
            digest: Sha1::new(),
            crc: Crc::new(),
        }
    }
}

impl<R: BufRead> Read for PackStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            let available = self.fill_buf()?;
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for PackStream<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        // Already buffered, so this cannot block or fail.
        if let Ok(buffered) = self.inner.fill_buf() {
            let used = &buffered[..amt.min(buffered.len())];
            self.digest.update(used);
            self.crc.update(used);
        }
        self.inner.consume(amt);
        self.pos += amt as u64;
    }
}

pub struct PackIngester<'r> {
    objects: ObjectStore<'r>,
}

impl<'r> PackIngester<'r> {
    pub fn new(objects: ObjectStore<'r>) -> Self {
        Self { objects }
    }

    /// Ingest the pack starting at the current position of `pack`.
    pub fn ingest<R: BufRead + Seek>(&self, txn: &mut RwTxn, mut pack: R) -> Result<PackSummary> {
        let start = pack.stream_position()?;
        let mut stream = PackStream::new(&mut pack);

        let mut header = [0u8; PACK_HEADER_LEN];
        stream.read_exact(&mut header).map_err(truncated)?;
        let count = parse_pack_header(&header)? as usize;

        let mut entries: Vec<PackEntry> = Vec::with_capacity(count.min(4096));
        let mut by_offset: HashMap<u64, usize> = HashMap::new();

        for _ in 0..count {
            let offset = stream.pos;
            stream.crc.reset();
            let header = read_entry_header(&mut stream, offset)?;
            let resolved = match header.kind {
                EntryKind::Whole(obj_type) => {
                    let id = self.insert_whole(txn, &mut stream, header.size, obj_type)?;
                    Some((obj_type, id))
                }
                kind => {
                    let delta = inflate(&mut stream, header.size)?;
                    self.resolve_delta(txn, &entries, &by_offset, kind, &delta)?
                }
            };

            by_offset.insert(offset, entries.len());
            entries.push(PackEntry {
                offset,
                end: stream.pos,
                crc: stream.crc.sum(),
                kind: header.kind,
                resolved,
            });
        }

        let PackStream { digest, pos, .. } = stream;
        let mut trailer = Vec::with_capacity(PACK_TRAILER_LEN);
        (&mut pack)
            .take(PACK_TRAILER_LEN as u64 + 1)
            .read_to_end(&mut trailer)?;
        if trailer.len() < PACK_TRAILER_LEN {
            return Err(Error::Corrupt("pack truncated".into()));
        }
        if trailer.len() > PACK_TRAILER_LEN {
            return Err(Error::Corrupt("unexpected bytes after last entry".into()));
        }
        if digest.finalize().as_slice() != trailer.as_slice() {
            return Err(Error::Corrupt("pack checksum mismatch".into()));
        }

        // Deltas whose base appeared later in the pack, or was itself a delta.
        loop {
            let mut progressed = false;
            for index in 0..entries.len() {
                if entries[index].resolved.is_some() {
                    continue;
                }
                let delta = reread_delta(&mut pack, start, &entries[index])?;
                let kind = entries[index].kind;
                if let Some(resolved) = self.resolve_delta(txn, &entries, &by_offset, kind, &delta)? {
                    entries[index].resolved = Some(resolved);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let unresolved = entries.iter().filter(|e| e.resolved.is_none()).count();
        if unresolved > 0 {
            return Err(Error::Corrupt(format!("{} deltas have no base", unresolved)));
        }

        let summary = PackSummary {
            objects: entries.len(),
            deltas: entries
                .iter()
                .filter(|e| !matches!(e.kind, EntryKind::Whole(_)))
                .count(),
            ids: entries
                .iter()
                .filter_map(|e| e.resolved.map(|(_, id)| id))
                .collect(),
        };
        debug!(
            "ingested {} objects ({} deltas) from {} byte pack",
            summary.objects,
            summary.deltas,
            pos + PACK_TRAILER_LEN as u64
        );
        Ok(summary)
    }

    /// Stream a whole entry straight into the object store.
    fn insert_whole<R: BufRead>(
        &self,
        txn: &mut RwTxn,
        input: &mut R,
        size: u64,
        obj_type: ObjectType,
    ) -> Result<ObjectId> {
        let mut decoder = ZlibDecoder::new(input);
        self.objects
            .insert(txn, obj_type, size, &mut decoder)
            .map_err(|e| match e {
                Error::Store(StoreError::Io(io)) => Error::Corrupt(format!("inflate failed: {}", io)),
                other => other,
            })
    }

    /// Apply `delta` to its base if the base is available, and store the result.
    fn resolve_delta(
        &self,
        txn: &mut RwTxn,
        entries: &[PackEntry],
        by_offset: &HashMap<u64, usize>,
        kind: EntryKind,
        delta: &[u8],
    ) -> Result<Option<(ObjectType, ObjectId)>> {
        let Some((obj_type, base)) = self.load_base(txn, entries, by_offset, kind)? else {
            return Ok(None);
        };
        let content = apply_delta(&base, delta)?;
        let id = self.objects.insert_bytes(txn, obj_type, &content)?;
        Ok(Some((obj_type, id)))
    }

    fn load_base(
        &self,
        txn: &RoTxn,
        entries: &[PackEntry],
        by_offset: &HashMap<u64, usize>,
        kind: EntryKind,
    ) -> Result<Option<(ObjectType, Vec<u8>)>> {
        let base_id = match kind {
            EntryKind::Whole(_) => return Ok(None),
            EntryKind::OfsDelta { base_offset } => {
                let index = by_offset.get(&base_offset).ok_or_else(|| {
                    Error::Corrupt(format!("ofs-delta base at {} is not an entry", base_offset))
                })?;
                match entries[*index].resolved {
                    Some((_, id)) => id,
                    None => return Ok(None),
                }
            }
            EntryKind::RefDelta { base } => base,
        };
        if !self.objects.has(txn, &base_id, None)? {
            return Ok(None);
        }
        let base = self.objects.read_object(txn, &base_id, None)?;
        Ok(Some((base.obj_type, base.content)))
    }
}

fn truncated(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::Corrupt("pack truncated".into()),
        _ => Error::Io(err),
    }
}

/// Read a little-endian base-128 varint's raw bytes (at most 10).
fn read_varint_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(4);
    loop {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte).map_err(truncated)?;
        bytes.push(byte[0]);
        if byte[0] & 0x80 == 0 || bytes.len() == 10 {
            return Ok(bytes);
        }
    }
}

/// Read the entry header at `offset`, leaving `input` at the compressed body.
fn read_entry_header<R: Read>(input: &mut R, offset: u64) -> Result<EntryHeader> {
    let header = PackedObjectHeader::parse(&read_varint_bytes(input)?)?;

    let kind = match header.pack_type {
        PackObjectType::OfsDelta => {
            let (distance, _) = read_ofs_offset(&read_varint_bytes(input)?)?;
            let base_offset = Some(distance)
                .filter(|&d| d > 0)
                .and_then(|d| offset.checked_sub(d))
                .ok_or_else(|| Error::Corrupt(format!("bad ofs-delta base at {}", offset)))?;
            EntryKind::OfsDelta { base_offset }
        }
        PackObjectType::RefDelta => {
            let mut raw = [0u8; 20];
            input.read_exact(&mut raw).map_err(truncated)?;
            let base = ObjectId::from_bytes(&raw)
                .ok_or_else(|| Error::Corrupt("truncated ref-delta base".into()))?;
            EntryKind::RefDelta { base }
        }
        other => match other.object_type() {
            Some(obj_type) => EntryKind::Whole(obj_type),
            None => return Err(Error::Corrupt(format!("unexpected entry type {:?}", other))),
        },
    };

    Ok(EntryHeader {
        kind,
        size: header.size,
    })
}

/// Re-read a delta entry from its offset after checking its CRC.
fn reread_delta<R: Read + Seek>(pack: &mut R, start: u64, entry: &PackEntry) -> Result<Vec<u8>> {
    let len = usize::try_from(entry.end - entry.offset)
        .map_err(|_| Error::Corrupt(format!("entry at {} is too large", entry.offset)))?;
    let mut raw = vec![0u8; len];
    pack.seek(SeekFrom::Start(start + entry.offset))?;
    pack.read_exact(&mut raw).map_err(truncated)?;
    if crc32(&raw) != entry.crc {
        return Err(Error::Corrupt(format!("CRC mismatch for entry at {}", entry.offset)));
    }

    let mut body = raw.as_slice();
    let header = read_entry_header(&mut body, entry.offset)?;
    let delta = inflate(&mut body, header.size)?;
    if !body.is_empty() {
        return Err(Error::Corrupt(format!("entry at {} changed length", entry.offset)));
    }
    Ok(delta)
}

/// Inflate one zlib stream, consuming exactly its compressed bytes.
fn inflate<R: BufRead>(input: &mut R, expected: u64) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(input);
    let mut data = Vec::with_capacity(expected.min(1 << 24) as usize);
    // One extra byte is enough to notice an entry that inflates too far.
    (&mut decoder)
        .take(expected + 1)
        .read_to_end(&mut data)
        .map_err(|e| Error::Corrupt(format!("inflate failed: {}", e)))?;
    if data.len() as u64 != expected {
        return Err(Error::Corrupt(format!(
            "entry inflated to {} bytes, header says {}",
            data.len(),
            expected
        )));
    }
    Ok(data)
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}
