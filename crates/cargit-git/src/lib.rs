//! Git object and ref storage on a transactional asset store
//!
//! Serves read/write git repositories over the smart HTTP protocol. Objects,
//! refs and config live as assets in an [`lmdb_asset_store::LmdbAssetStore`]
//! container per repository; nothing touches a filesystem repository.
//!
//! Every operation takes the store transaction explicitly: `&RoTxn` for
//! reads, `&mut RwTxn` for writes.

pub mod error;
pub mod object;
pub mod refs;
pub mod odb;
pub mod refdb;
pub mod transaction;
pub mod delta;
pub mod pack;
pub mod ingest;
pub mod protocol;
pub mod repository;
pub mod http;

pub use error::{Error, Result};
pub use http::{GitProtocolServer, GitResponse, Service};
pub use ingest::{PackIngester, PackSummary};
pub use object::{ObjectId, ObjectType, PersonIdent};
pub use odb::{ObjectLoader, ObjectStore};
pub use refdb::RefStore;
pub use refs::{NamedRef, Ref, ResolvedRef};
pub use repository::{Repositories, RepositoryHandle};
pub use transaction::{RefTransaction, RefUpdateResult};
