//! Smart HTTP behavior over a real socket, driven with reqwest.

mod common;

use base64::Engine;
use cargit_git::pack::parse_pack_header;
use cargit_git::protocol::{sideband, PktLine, PktLineReader, PktLineWriter};
use common::start_server;
use reqwest::StatusCode;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_info_refs_advertisement() {
    let server = start_server(None).await;
    let commit = server.commit_file("index", "config.json", b"{}\n", "Initial");

    let response = reqwest::get(format!("{}/info/refs?service=git-upload-pack", server.url("index")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-git-upload-pack-advertisement"
    );
    assert_eq!(response.headers()["cache-control"], "no-cache, max-age=0, must-revalidate");

    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains(&format!("{} HEAD\0", commit)));
    assert!(text.contains("symref=HEAD:refs/heads/master"));
    assert!(text.contains(&format!("{} refs/heads/master\n", commit)));
    assert!(text.ends_with("0000"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repo_suffix_is_optional() {
    let server = start_server(None).await;
    server.create_repo("crates");

    let response = reqwest::get(format!(
        "http://{}/git/crates.git/info/refs?service=git-upload-pack",
        server.addr
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("capabilities^{}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejections() {
    let server = start_server(None).await;
    server.create_repo("index");
    let client = reqwest::Client::new();

    // Dumb protocol
    let response = client
        .get(format!("{}/info/refs", server.url("index")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["pragma"], "no-cache");

    // Unknown service
    let response = client
        .get(format!("{}/info/refs?service=git-archive", server.url("index")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Unknown repository
    let response = client
        .get(format!("{}/info/refs?service=git-upload-pack", server.url("missing")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Wrong method
    let response = client
        .get(format!("{}/git-upload-pack", server.url("index")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()["allow"], "POST");

    // Wrong content type
    let response = client
        .post(format!("{}/git-upload-pack", server.url("index")))
        .header("content-type", "text/plain")
        .body("0000")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_pack_unknown_want() {
    let server = start_server(None).await;
    server.commit_file("index", "a.txt", b"a\n", "Initial");

    let want = "0032want 1111111111111111111111111111111111111111\n00000009done\n";
    let response = reqwest::Client::new()
        .post(format!("{}/git-upload-pack", server.url("index")))
        .header("content-type", "application/x-git-upload-pack-request")
        .body(want)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();
    assert!(String::from_utf8_lossy(&body)
        .contains("ERR upload-pack: not our ref 1111111111111111111111111111111111111111"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_pack_requires_auth() {
    let server = start_server(Some(("alice", "secret"))).await;
    server.create_repo("index");
    let client = reqwest::Client::new();

    // Fetch side stays open
    let response = client
        .get(format!("{}/info/refs?service=git-upload-pack", server.url("index")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .get(format!("{}/info/refs?service=git-receive-pack", server.url("index")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "Basic realm=\"cargit\"");
    assert!(response.bytes().await.unwrap().is_empty());

    let response = client
        .post(format!("{}/git-receive-pack", server.url("index")))
        .header("content-type", "application/x-git-receive-pack-request")
        .body("0000")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.bytes().await.unwrap().is_empty());

    let credentials = base64::engine::general_purpose::STANDARD.encode("alice:secret");
    let response = client
        .get(format!("{}/info/refs?service=git-receive-pack", server.url("index")))
        .header("authorization", format!("Basic {}", credentials))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-git-receive-pack-advertisement"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_pack_streams_side_band() {
    let server = start_server(None).await;
    // Incompressible, so the pack spans many side-band packets.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let content: Vec<u8> = (0..3 * 1024 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    let commit = server.commit_file("index", "big.bin", &content, "Big file");

    let mut request = PktLineWriter::new();
    request.write_str(&format!("want {} side-band-64k no-progress", commit));
    request.flush();
    request.write_str("done");
    let response = reqwest::Client::new()
        .post(format!("{}/git-upload-pack", server.url("index")))
        .header("content-type", "application/x-git-upload-pack-request")
        .body(request.into_bytes())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/x-git-upload-pack-result");
    assert!(response.headers().get("content-length").is_none());

    let body = response.bytes().await.unwrap();
    let mut reader = PktLineReader::new(&body);
    assert_eq!(reader.read_text().unwrap(), Some("NAK"));
    let mut pack = Vec::new();
    let mut packets = 0;
    while let Some(PktLine::Data(data)) = reader.read().unwrap() {
        assert_eq!(data[0], sideband::DATA);
        pack.extend_from_slice(&data[1..]);
        packets += 1;
    }
    assert!(packets > 40);
    assert!(pack.len() > content.len());
    assert_eq!(parse_pack_header(&pack).unwrap(), 3);
}
