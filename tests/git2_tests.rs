//! Integration tests using the git2 library
//!
//! These tests use libgit2 bindings for programmatic git operations.

mod common;

use cargit_git::refs::MASTER;
use common::start_server;
use git2::{Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository};
use std::time::Duration;
use tempfile::tempdir;

/// Run a blocking git2 operation with timeout
async fn with_timeout<T, F>(timeout_secs: u64, f: F) -> Result<T, &'static str>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(Duration::from_secs(timeout_secs), handle).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err("task panicked"),
        Err(_) => Err("timeout"),
    }
}

fn callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|_url, _username, _allowed| Cred::userpass_plaintext("alice", "secret"));
    callbacks
}

fn list_remote(url: String) -> Vec<(String, String)> {
    let mut remote = git2::Remote::create_detached(url).unwrap();
    let connection = remote.connect_auth(git2::Direction::Fetch, None, None).unwrap();
    connection
        .list()
        .unwrap()
        .iter()
        .map(|r| (r.name().to_string(), r.oid().to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_git2_ls_remote() {
    let server = start_server(None).await;
    let commit = server.commit_file("test", "README.md", b"hello\n", "Test commit");
    let url = server.url("test");

    let refs = with_timeout(15, move || list_remote(url)).await.expect("ls-remote timed out");

    let commit_hex = commit.to_hex();
    assert!(refs.iter().any(|(name, oid)| name == "HEAD" && *oid == commit_hex));
    assert!(refs.iter().any(|(name, oid)| name == MASTER && *oid == commit_hex));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_git2_clone_empty_repo() {
    let server = start_server(None).await;
    server.create_repo("test");
    let url = server.url("test");

    let clone_dir = tempdir().unwrap();
    let clone_path = clone_dir.path().join("cloned");

    let result = with_timeout(15, move || Repository::clone(&url, clone_path))
        .await
        .expect("clone timed out");

    // libgit2 versions differ on empty clones; it must not hang
    eprintln!("clone empty repo result: {:?}", result.as_ref().err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_git2_push_and_clone() {
    let server = start_server(Some(("alice", "secret"))).await;
    server.create_repo("test");
    let url = server.url("test");

    let local_dir = tempdir().unwrap();
    let local_path = local_dir.path().to_path_buf();
    let push_url = url.clone();

    let pushed = with_timeout(30, move || {
        let repo = Repository::init(&local_path).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();

        std::fs::write(local_path.join("README.md"), "# Hello from git2!\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let commit = repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[]).unwrap();

        let mut remote = repo.remote("origin", &push_url).unwrap();
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks());
        remote.push(&["HEAD:refs/heads/master"], Some(&mut push_opts)).unwrap();
        commit.to_string()
    })
    .await
    .expect("push timed out");

    assert_eq!(server.ref_target("test", MASTER).map(|id| id.to_hex()), Some(pushed));

    let clone_dir = tempdir().unwrap();
    let clone_path = clone_dir.path().join("cloned");
    let readme = clone_path.join("README.md");

    with_timeout(30, move || {
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks());
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        builder.clone(&url, &clone_path).unwrap();
    })
    .await
    .expect("clone timed out");

    let content = std::fs::read_to_string(readme).unwrap();
    assert!(content.contains("Hello from git2!"), "content should match");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_git2_fetch_branches() {
    let server = start_server(None).await;
    let master = server.commit_file("test", "a.txt", b"a\n", "Main commit");
    let url = server.url("test");

    // Second branch pointing at a separate history
    let handle = server.repositories.ensure_repository("test").unwrap();
    let author = cargit_git::PersonIdent::new("Test", "test@test.com");
    let feature = server
        .repositories
        .store()
        .write_with(|txn| handle.replace_file(txn, "refs/heads/feature", "b.txt", b"b\n", &author, "Feature commit"))
        .unwrap()
        .unwrap();

    let refs = with_timeout(15, move || list_remote(url)).await.expect("fetch timed out");

    let oid_of = |name: &str| refs.iter().find(|(n, _)| n == name).map(|(_, oid)| oid.clone());
    assert_eq!(oid_of(MASTER), Some(master.to_hex()));
    assert_eq!(oid_of("refs/heads/feature"), Some(feature.to_hex()));
    assert_ne!(master, feature, "branches should have different commits");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_git2_push_update_ref() {
    let server = start_server(Some(("alice", "secret"))).await;
    server.commit_file("test", "README.md", b"initial\n", "Initial");
    let url = server.url("test");

    let local_dir = tempdir().unwrap();
    let local_path = local_dir.path().join("repo");
    let clone_url = url.clone();

    let new_commit_oid = with_timeout(30, move || {
        let repo = Repository::clone(&clone_url, &local_path).unwrap();

        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        std::fs::write(local_path.join("new_file.txt"), "new content\n").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("new_file.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

        let parent = repo.find_commit(repo.head().unwrap().target().unwrap()).unwrap();
        let new_commit_oid = repo.commit(Some("HEAD"), &sig, &sig, "Second commit", &tree, &[&parent]).unwrap();

        let mut remote = repo.find_remote("origin").unwrap();
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks());
        remote.push(&["HEAD:refs/heads/master"], Some(&mut push_opts)).unwrap();

        new_commit_oid.to_string()
    })
    .await
    .expect("push update timed out");

    let server_oid = with_timeout(15, move || list_remote(url))
        .await
        .expect("verify timed out")
        .into_iter()
        .find(|(name, _)| name == MASTER)
        .map(|(_, oid)| oid);

    assert_eq!(server_oid, Some(new_commit_oid), "server ref should be updated to new commit");
}
