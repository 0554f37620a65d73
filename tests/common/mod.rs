//! Shared server setup for the HTTP-level tests.
#![allow(dead_code)]

use cargit::CargitServer;
use cargit_git::refs::MASTER;
use cargit_git::{GitProtocolServer, ObjectId, PersonIdent, Repositories};
use lmdb_asset_store::LmdbAssetStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub struct TestServer {
    pub addr: SocketAddr,
    pub repositories: Repositories,
    _dir: TempDir,
}

impl TestServer {
    pub fn url(&self, repo: &str) -> String {
        format!("http://{}/git/{}", self.addr, repo)
    }

    pub fn create_repo(&self, name: &str) {
        self.repositories
            .store()
            .write_with(|txn| self.repositories.create_repository(txn, name).map(|_| ()))
            .unwrap();
    }

    /// Commit `bytes` at `path` on master, creating the repository if needed.
    pub fn commit_file(&self, repo: &str, path: &str, bytes: &[u8], message: &str) -> ObjectId {
        let handle = self.repositories.ensure_repository(repo).unwrap();
        let author = PersonIdent::new("Test", "test@test.com");
        self.repositories
            .store()
            .write_with(|txn| handle.replace_file(txn, MASTER, path, bytes, &author, message))
            .unwrap()
            .expect("file changed")
    }

    /// Current target of `name` in `repo`.
    pub fn ref_target(&self, repo: &str, name: &str) -> Option<ObjectId> {
        let txn = self.repositories.store().read_txn().unwrap();
        let handle = self.repositories.get_repository(&txn, repo).unwrap()?;
        let resolved = handle.refs().get_resolved(&txn, name).unwrap()?;
        Some(resolved.object_id())
    }
}

pub async fn start_server(auth: Option<(&str, &str)>) -> TestServer {
    let dir = TempDir::new().unwrap();
    let store = LmdbAssetStore::with_map_size(dir.path().join("db"), 256 * 1024 * 1024).unwrap();
    let repositories = Repositories::new(Arc::new(store));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = CargitServer::new(GitProtocolServer::new(repositories.clone()), addr.to_string());
    if let Some((username, password)) = auth {
        server = server.with_auth(username.to_string(), password.to_string());
    }

    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        addr,
        repositories,
        _dir: dir,
    }
}
