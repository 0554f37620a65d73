//! Git smart HTTP protocol routes
//!
//! Routes:
//!   - /git/:repo/info/refs?service=git-upload-pack|git-receive-pack
//!   - /git/:repo/git-upload-pack
//!   - /git/:repo/git-receive-pack
//!
//! Every method reaches the handlers so the engine can answer wrong methods
//! with its own 400 + Allow response. Engine calls run on the blocking pool
//! because LMDB transactions are bound to their thread.
//!
//! Fetch packs flow from the blocking pool to the response body through a
//! bounded channel. Push bodies are spooled to a temporary file first.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use cargit_git::http::NO_CACHE_HEADERS;
use cargit_git::{Error, GitResponse};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::io::{self, Seek, Write};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::auth::{AppState, Principal};

/// Pack chunks in flight between the blocking writer and the response body.
const STREAM_QUEUE: usize = 16;

/// Size of the writes handed to the response body when side-band is off.
const STREAM_CHUNK: usize = 64 * 1024;

/// Accepts both `name` and `name.git`.
fn repo_name(raw: &str) -> String {
    raw.strip_suffix(".git").unwrap_or(raw).to_string()
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// /git/:repo/info/refs
pub async fn info_refs(
    State(state): State<AppState>,
    method: Method,
    Path(repo): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let git = state.git.clone();
    let service = query.get("service").cloned();
    run_blocking(move || git.info_refs(method.as_str(), &repo_name(&repo), service.as_deref())).await
}

/// Hands pack bytes from the blocking pool to the async response body.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// /git/:repo/git-upload-pack (fetch)
///
/// The response head goes out as soon as negotiation is done; the pack
/// follows as it is generated.
pub async fn upload_pack(
    State(state): State<AppState>,
    method: Method,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let git = state.git.clone();
    let repo = repo_name(&repo);
    let content_type = content_type(&headers);
    let (head_tx, head_rx) = oneshot::channel::<GitResponse>();
    let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_QUEUE);

    let task = tokio::task::spawn_blocking(move || {
        git.upload_pack_streaming(method.as_str(), &repo, content_type.as_deref(), &body, move |head| {
            head_tx
                .send(head)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))?;
            Ok(io::BufWriter::with_capacity(STREAM_CHUNK, ChannelWriter { tx: chunk_tx }))
        })
    });

    let Ok(mut head) = head_rx.await else {
        // Failed before a response existed, so the error can still pick the status.
        return match task.await {
            Ok(Err(e)) => error_response(&e),
            Ok(Ok(())) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Err(e) => {
                error!("git handler task failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
    };

    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("upload-pack stream ended early: {}", e),
            Err(e) => error!("git handler task failed: {}", e),
        }
    });

    let prefix = Bytes::from(std::mem::take(&mut head.body));
    let chunks = stream::unfold(chunk_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let body = stream::once(async move { Ok::<_, io::Error>(prefix) }).chain(chunks);
    build_response(head, Body::from_stream(body))
}

/// Copy a request body into an anonymous temporary file, rewound to the start.
async fn spool_body(body: Body) -> Result<std::fs::File, Response> {
    let spool = tempfile::tempfile().map_err(|e| {
        error!("failed to create push spool: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;
    let mut file = tokio::fs::File::from_std(spool);
    let mut chunks = body.into_data_stream();
    let mut size = 0u64;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| {
            warn!("push body aborted after {} bytes: {}", size, e);
            error_response(&Error::Protocol("request body aborted".into()))
        })?;
        size += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(|e| error_response(&Error::Io(e)))?;
    }
    file.flush().await.map_err(|e| error_response(&Error::Io(e)))?;

    let mut spool = file.into_std().await;
    spool.rewind().map_err(|e| error_response(&Error::Io(e)))?;
    debug!("spooled {} byte push", size);
    Ok(spool)
}

/// /git/:repo/git-receive-pack (push)
pub async fn receive_pack(
    State(state): State<AppState>,
    method: Method,
    Path(repo): Path<String>,
    principal: Option<Extension<Principal>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let spool = match spool_body(body).await {
        Ok(spool) => spool,
        Err(response) => return response,
    };
    let git = state.git.clone();
    let content_type = content_type(&headers);
    let identity = principal.map(|Extension(principal)| principal.ident());
    run_blocking(move || {
        git.receive_pack(
            method.as_str(),
            &repo_name(&repo),
            content_type.as_deref(),
            spool,
            identity,
        )
    })
    .await
}

async fn run_blocking<F>(f: F) -> Response
where
    F: FnOnce() -> cargit_git::Result<GitResponse> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(response)) => into_response(response),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("git handler task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn into_response(mut response: GitResponse) -> Response {
    let body = Body::from(std::mem::take(&mut response.body));
    build_response(response, body)
}

/// Status and headers from `head`, with `body` as the payload.
fn build_response(head: GitResponse, body: Body) -> Response {
    let mut builder = Response::builder()
        .status(head.status)
        .header(header::CONTENT_TYPE, head.content_type);
    for (name, value) in NO_CACHE_HEADERS {
        builder = builder.header(*name, *value);
    }
    for (name, value) in head.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// HTTP status for an engine error.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unsupported(_) => StatusCode::FORBIDDEN,
        Error::Protocol(_) | Error::InvalidRefName(_) | Error::InvalidPath(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &Error) -> Response {
    let status = status_for(e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("git request failed: {}", e);
    }
    into_response(GitResponse::text(status.as_u16(), &e.to_string()))
}
