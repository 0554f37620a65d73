//! Git object types and serialization
//!
//! Git has four object types: blob, tree, commit, and tag.
//! Each is content-addressed by SHA-1 hash of: "{type} {size}\0{content}"

use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// The four git object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
            ObjectType::Tag => "tag",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(ObjectType::Blob),
            "tree" => Some(ObjectType::Tree),
            "commit" => Some(ObjectType::Commit),
            "tag" => Some(ObjectType::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A 20-byte SHA-1 object ID
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(ObjectId(arr))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 {
            return None;
        }
        let bytes = hex::decode(hex).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Compute the object ID of `content` stored as `obj_type`.
    pub fn hash_object(obj_type: ObjectType, content: &[u8]) -> Self {
        let mut hasher = ObjectIdHasher::new(obj_type, content.len() as u64);
        hasher.update(content);
        hasher.finish()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Streaming object ID computation, primed with the "{type} {size}\0" header.
#[derive(Clone)]
pub struct ObjectIdHasher(Sha1);

impl ObjectIdHasher {
    pub fn new(obj_type: ObjectType, size: u64) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", obj_type.as_str(), size).as_bytes());
        Self(hasher)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> ObjectId {
        let mut id = [0u8; 20];
        id.copy_from_slice(&self.0.finalize());
        ObjectId(id)
    }
}

/// A git object with type and content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    pub obj_type: ObjectType,
    pub content: Vec<u8>,
}

impl GitObject {
    pub fn new(obj_type: ObjectType, content: Vec<u8>) -> Self {
        Self { obj_type, content }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(self.obj_type, &self.content)
    }
}

pub const MODE_TREE: u32 = 0o40000;
pub const MODE_FILE: u32 = 0o100644;

/// Tree entry (mode, name, object id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub oid: ObjectId,
}

impl TreeEntry {
    pub fn new(mode: u32, name: impl Into<String>, oid: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            oid,
        }
    }

    /// Mode as the octal string used in tree content
    pub fn mode_str(&self) -> String {
        format!("{:o}", self.mode)
    }

    pub fn is_tree(&self) -> bool {
        self.mode & 0o170000 == MODE_TREE
    }

    pub fn is_submodule(&self) -> bool {
        self.mode & 0o170000 == 0o160000
    }

    /// Git orders tree entries as if subtree names carried a trailing '/'.
    pub fn tree_order(&self, other: &TreeEntry) -> Ordering {
        let a = self.name.bytes().chain(self.is_tree().then_some(b'/'));
        let b = other.name.bytes().chain(other.is_tree().then_some(b'/'));
        a.cmp(b)
    }
}

/// Parse tree content into entries
pub fn parse_tree(content: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < content.len() {
        let space_pos = content[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::Corrupt("tree: missing space".into()))?;
        let mode_str = std::str::from_utf8(&content[pos..pos + space_pos])
            .map_err(|_| Error::Corrupt("tree: invalid mode".into()))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| Error::Corrupt("tree: invalid mode octal".into()))?;
        pos += space_pos + 1;

        let null_pos = content[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Corrupt("tree: missing null".into()))?;
        let name = std::str::from_utf8(&content[pos..pos + null_pos])
            .map_err(|_| Error::Corrupt("tree: invalid name".into()))?
            .to_string();
        pos += null_pos + 1;

        if pos + 20 > content.len() {
            return Err(Error::Corrupt("tree: truncated sha".into()));
        }
        let oid = ObjectId::from_bytes(&content[pos..pos + 20])
            .ok_or_else(|| Error::Corrupt("tree: invalid sha".into()))?;
        pos += 20;

        entries.push(TreeEntry { mode, name, oid });
    }

    Ok(entries)
}

/// Serialize tree entries to content, in git's canonical order
pub fn serialize_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.tree_order(b));

    let mut content = Vec::new();
    for entry in sorted {
        content.extend_from_slice(entry.mode_str().as_bytes());
        content.push(b' ');
        content.extend_from_slice(entry.name.as_bytes());
        content.push(0);
        content.extend_from_slice(entry.oid.as_bytes());
    }
    content
}

/// Header lines of a commit or tag, up to the first blank line.
fn headers(content: &[u8]) -> impl Iterator<Item = (&str, &str)> {
    content
        .split(|&b| b == b'\n')
        .take_while(|line| !line.is_empty())
        .filter_map(|line| std::str::from_utf8(line).ok())
        .filter_map(|line| line.split_once(' '))
}

/// The parts of a commit needed for graph walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
}

pub fn parse_commit(content: &[u8]) -> Result<CommitInfo> {
    let mut tree = None;
    let mut parents = Vec::new();
    for (key, value) in headers(content) {
        match key {
            "tree" => tree = ObjectId::from_hex(value.trim()),
            "parent" => parents.push(
                ObjectId::from_hex(value.trim())
                    .ok_or_else(|| Error::Corrupt(format!("commit: bad parent {}", value)))?,
            ),
            _ => {}
        }
    }
    let tree = tree.ok_or_else(|| Error::Corrupt("commit: missing tree".into()))?;
    Ok(CommitInfo { tree, parents })
}

/// The target of an annotated tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub object: ObjectId,
    pub object_type: ObjectType,
}

pub fn parse_tag(content: &[u8]) -> Result<TagInfo> {
    let mut object = None;
    let mut object_type = None;
    for (key, value) in headers(content) {
        match key {
            "object" => object = ObjectId::from_hex(value.trim()),
            "type" => object_type = ObjectType::from_str(value.trim()),
            _ => {}
        }
    }
    match (object, object_type) {
        (Some(object), Some(object_type)) => Ok(TagInfo { object, object_type }),
        _ => Err(Error::Corrupt("tag: missing object or type".into())),
    }
}

/// Author/committer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonIdent {
    pub name: String,
    pub email: String,
}

impl PersonIdent {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Identity line for commit headers, stamped with the current time in UTC.
    pub fn signature_now(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{} <{}> {} +0000", self.name, self.email, secs)
    }
}

impl fmt::Display for PersonIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Build commit content.
pub fn format_commit(
    tree: ObjectId,
    parents: &[ObjectId],
    author: &PersonIdent,
    message: &str,
) -> Vec<u8> {
    let signature = author.signature_now();
    let mut content = format!("tree {}\n", tree);
    for parent in parents {
        content.push_str(&format!("parent {}\n", parent));
    }
    content.push_str(&format!("author {}\ncommitter {}\n\n{}", signature, signature, message));
    if !message.ends_with('\n') {
        content.push('\n');
    }
    content.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex() {
        let hex = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        let oid = ObjectId::from_hex(hex).unwrap();
        assert_eq!(oid.to_hex(), hex);
        assert!(ObjectId::from_hex("da39").is_none());
        assert!(ObjectId::ZERO.is_zero());
    }

    #[test]
    fn test_blob_hash() {
        let empty_blob_hash = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";
        let oid = ObjectId::hash_object(ObjectType::Blob, &[]);
        assert_eq!(oid.to_hex(), empty_blob_hash);
    }

    #[test]
    fn test_hello_world_blob() {
        let content = b"hello world\n";
        let expected = "3b18e512dba79e4c8300dd08aeb37f8e728b8dad";
        let oid = ObjectId::hash_object(ObjectType::Blob, content);
        assert_eq!(oid.to_hex(), expected);
    }

    #[test]
    fn test_empty_tree_hash() {
        let oid = ObjectId::hash_object(ObjectType::Tree, &serialize_tree(&[]));
        assert_eq!(oid.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_hash_covers_every_type() {
        let content = b"payload";
        for obj_type in [ObjectType::Blob, ObjectType::Tree, ObjectType::Commit, ObjectType::Tag] {
            let mut sha = Sha1::new();
            sha.update(format!("{} {}\0", obj_type, content.len()).as_bytes());
            sha.update(content);
            let expected = ObjectId::from_bytes(&sha.finalize()).unwrap();
            assert_eq!(ObjectId::hash_object(obj_type, content), expected);
        }
    }

    #[test]
    fn test_streaming_hasher_matches_one_shot() {
        let mut hasher = ObjectIdHasher::new(ObjectType::Blob, 12);
        hasher.update(b"hello ");
        hasher.update(b"world\n");
        assert_eq!(hasher.finish(), ObjectId::hash_object(ObjectType::Blob, b"hello world\n"));
    }

    #[test]
    fn test_tree_order_treats_dirs_as_slash_suffixed() {
        let oid = ObjectId::hash_object(ObjectType::Blob, b"x");
        // "foo.txt" < "foo/" because '.' (0x2e) < '/' (0x2f), but "foo" blob < "foo.txt".
        let entries = vec![
            TreeEntry::new(MODE_TREE, "foo", oid),
            TreeEntry::new(MODE_FILE, "foo.txt", oid),
            TreeEntry::new(MODE_FILE, "bar", oid),
        ];
        let parsed = parse_tree(&serialize_tree(&entries)).unwrap();
        let names: Vec<_> = parsed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "foo.txt", "foo"]);
        assert!(parsed[2].is_tree());
    }

    #[test]
    fn test_parse_commit_and_tag() {
        let tree = ObjectId::hash_object(ObjectType::Tree, b"");
        let parent = ObjectId::hash_object(ObjectType::Commit, b"parent");
        let author = PersonIdent::new("Test", "test@example.com");
        let commit = format_commit(tree, &[parent], &author, "message");
        let info = parse_commit(&commit).unwrap();
        assert_eq!(info.tree, tree);
        assert_eq!(info.parents, vec![parent]);

        let commit_id = ObjectId::hash_object(ObjectType::Commit, &commit);
        let tag = format!(
            "object {}\ntype commit\ntag v1.0\ntagger Test <test@example.com> 0 +0000\n\nrelease\n",
            commit_id
        );
        let info = parse_tag(tag.as_bytes()).unwrap();
        assert_eq!(info.object, commit_id);
        assert_eq!(info.object_type, ObjectType::Commit);

        assert!(parse_commit(b"author nobody\n\nno tree\n").is_err());
    }
}
