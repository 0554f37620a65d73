//! Git references (branches, tags, HEAD)
//!
//! Refs are named pointers to objects or to other refs. They live in the refs namespace:
//! - refs/heads/* - branches
//! - refs/tags/* - tags
//! - HEAD - usually symbolic

use crate::object::ObjectId;
use crate::Error;
use crate::Result;

/// Stored value of a ref
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// Points at an object whose type has not been inspected.
    Unpeeled(ObjectId),
    /// Points at an annotated tag; `peeled` is the first non-tag object behind it.
    PeeledTag { id: ObjectId, peeled: ObjectId },
    /// Points at an object known not to be a tag.
    PeeledNonTag(ObjectId),
    /// Points at another ref by name (e.g., HEAD -> refs/heads/master)
    Symbolic(String),
}

impl Ref {
    pub fn symbolic(target: impl Into<String>) -> Self {
        Ref::Symbolic(target.into())
    }

    /// Object the ref points at directly, `None` for symbolic refs.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Ref::Unpeeled(id) | Ref::PeeledNonTag(id) | Ref::PeeledTag { id, .. } => Some(*id),
            Ref::Symbolic(_) => None,
        }
    }

    /// Object behind an annotated tag, if this ref is a peeled tag.
    pub fn peeled_id(&self) -> Option<ObjectId> {
        match self {
            Ref::PeeledTag { peeled, .. } => Some(*peeled),
            _ => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Ref::Symbolic(_))
    }
}

/// Reference with its full name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub name: String,
    pub reference: Ref,
}

impl NamedRef {
    pub fn new(name: impl Into<String>, reference: Ref) -> Self {
        Self {
            name: name.into(),
            reference,
        }
    }
}

/// A ref after following symbolic links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    /// Name that was asked for.
    pub name: String,
    /// Name of the non-symbolic ref at the end of the chain.
    pub leaf: String,
    /// Value of the leaf; never `Ref::Symbolic`.
    pub target: Ref,
}

impl ResolvedRef {
    pub fn object_id(&self) -> ObjectId {
        // Leaf values are never symbolic.
        self.target.object_id().unwrap_or(ObjectId::ZERO)
    }

    pub fn is_symbolic(&self) -> bool {
        self.name != self.leaf
    }
}

/// Validate a ref name according to git rules
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRefName("empty ref name".into()));
    }

    // Must not start with / or end with /
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRefName("cannot start or end with /".into()));
    }

    // No double slashes
    if name.contains("//") {
        return Err(Error::InvalidRefName("cannot contain //".into()));
    }

    // No .. (path traversal)
    if name.contains("..") {
        return Err(Error::InvalidRefName("cannot contain ..".into()));
    }

    for c in name.chars() {
        if c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(Error::InvalidRefName(format!("invalid character: {:?}", c)));
        }
    }

    // No component may start with '.' or end with .lock
    for component in name.split('/') {
        if component.starts_with('.') {
            return Err(Error::InvalidRefName("component cannot start with .".into()));
        }
        if component.ends_with(".lock") {
            return Err(Error::InvalidRefName("component cannot end with .lock".into()));
        }
    }

    if name.contains("@{") {
        return Err(Error::InvalidRefName("cannot contain @{".into()));
    }

    if name == "@" {
        return Err(Error::InvalidRefName("cannot be @".into()));
    }

    if name.ends_with('.') {
        return Err(Error::InvalidRefName("cannot end with .".into()));
    }

    Ok(())
}

pub const HEAD: &str = "HEAD";
pub const MASTER: &str = "refs/heads/master";
