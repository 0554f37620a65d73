//! Git smart HTTP protocol handlers
//!
//! Implements:
//! - GET  /info/refs?service=git-upload-pack
//! - GET  /info/refs?service=git-receive-pack
//! - POST /git-upload-pack
//! - POST /git-receive-pack
//!
//! The handlers are framework-neutral: they take the request method, query
//! and body as plain values and return a [`GitResponse`] for the embedding
//! HTTP server to send. Method, service and content-type checks happen
//! before any repository is opened.
//!
//! Packs are never held in memory whole. [`GitProtocolServer::upload_pack_streaming`]
//! writes the pack into a sink supplied by the caller once the response head
//! is known, and [`GitProtocolServer::receive_pack`] reads the push from any
//! seekable source, typically a spooled temporary file.

use lmdb_asset_store::{RoTxn, RwTxn, StoreError};
use std::io::{self, BufRead, BufReader, Read, Seek, Write};
use tracing::{debug, info, warn};

use crate::object::{ObjectId, PersonIdent};
use crate::pack::PackBuilder;
use crate::protocol::*;
use crate::refs::{Ref, HEAD};
use crate::repository::{Repositories, RepositoryHandle};
use crate::transaction::RefUpdateResult;
use crate::{Error, Result};

/// Service types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    /// Service names are matched case-insensitively.
    pub fn from_str(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("git-upload-pack") {
            Some(Service::UploadPack)
        } else if s.eq_ignore_ascii_case("git-receive-pack") {
            Some(Service::ReceivePack)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn request_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-request",
            Service::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    pub fn result_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Service::UploadPack => UPLOAD_PACK_CAPABILITIES,
            Service::ReceivePack => RECEIVE_PACK_CAPABILITIES,
        }
    }
}

const GET_METHODS: &[&str] = &["GET", "HEAD"];
const POST_METHODS: &[&str] = &["POST"];

/// Headers attached to every response.
pub const NO_CACHE_HEADERS: &[(&str, &str)] = &[
    ("Expires", "Fri, 01 Jan 1980 00:00:00 GMT"),
    ("Pragma", "no-cache"),
    ("Cache-Control", "no-cache, max-age=0, must-revalidate"),
];

/// A response ready to be written by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitResponse {
    pub status: u16,
    pub content_type: &'static str,
    /// Extra headers besides [`NO_CACHE_HEADERS`] and the content type.
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl GitResponse {
    pub fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            headers: Vec::new(),
            body,
        }
    }

    pub fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            headers: Vec::new(),
            body: message.as_bytes().to_vec(),
        }
    }

    fn bad_method(allowed: &[&str]) -> Self {
        let mut response = Self::text(400, "bad request");
        response.headers.push(("Allow", allowed.join(", ")));
        response
    }
}

/// Smart HTTP front-end over a set of repositories.
#[derive(Clone)]
pub struct GitProtocolServer {
    repositories: Repositories,
}

impl GitProtocolServer {
    pub fn new(repositories: Repositories) -> Self {
        Self { repositories }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    /// GET /info/refs?service=git-upload-pack or git-receive-pack
    pub fn info_refs(&self, method: &str, repo: &str, service: Option<&str>) -> Result<GitResponse> {
        if !GET_METHODS.contains(&method) {
            return Ok(GitResponse::bad_method(GET_METHODS));
        }
        let Some(requested) = service else {
            return Ok(GitResponse::text(403, "git over dump-http is not supported"));
        };
        let Some(service) = Service::from_str(requested) else {
            return Ok(GitResponse::text(403, "unknown service"));
        };

        let store = self.repositories.store();
        let txn = store.read_txn()?;
        let handle = self.open(&txn, repo)?;
        let body = advertise_refs(&txn, &handle, service)?;
        Ok(GitResponse::ok(service.content_type(), body))
    }

    /// POST /git-upload-pack (client wants to fetch), buffered.
    pub fn upload_pack(
        &self,
        method: &str,
        repo: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<GitResponse> {
        let mut head = None;
        let mut pack = Vec::new();
        let head_slot = &mut head;
        let sink = &mut pack;
        self.upload_pack_streaming(method, repo, content_type, body, move |response| {
            *head_slot = Some(response);
            Ok(sink)
        })?;
        let mut response = head.ok_or_else(|| Error::Protocol("upload-pack sent no response".into()))?;
        response.body.extend_from_slice(&pack);
        Ok(response)
    }

    /// POST /git-upload-pack (client wants to fetch)
    ///
    /// Negotiation and object selection finish before `respond` is called
    /// with the response head. The pack is then streamed into the returned
    /// writer, so errors after that point can only truncate the body (or,
    /// with side-band, be reported on the error channel).
    pub fn upload_pack_streaming<W, F>(
        &self,
        method: &str,
        repo: &str,
        content_type: Option<&str>,
        body: &[u8],
        respond: F,
    ) -> Result<()>
    where
        W: Write,
        F: FnOnce(GitResponse) -> io::Result<W>,
    {
        let service = Service::UploadPack;
        if let Some(rejection) = check_post(service, method, content_type) {
            respond(rejection)?;
            return Ok(());
        }

        let store = self.repositories.store();
        let txn = store.read_txn()?;
        let handle = self.open(&txn, repo)?;
        let request = UploadRequest::parse(body)?;
        upload(&txn, &handle, &request, respond)
    }

    /// POST /git-receive-pack (client pushes)
    ///
    /// `body` is the whole request: commands followed by the pack. It is
    /// read once front to back, then delta entries are revisited by offset.
    /// `principal` becomes the identity recorded on every updated ref.
    pub fn receive_pack<R: Read + Seek>(
        &self,
        method: &str,
        repo: &str,
        content_type: Option<&str>,
        body: R,
        principal: Option<PersonIdent>,
    ) -> Result<GitResponse> {
        let service = Service::ReceivePack;
        if let Some(rejection) = check_post(service, method, content_type) {
            return Ok(rejection);
        }

        let store = self.repositories.store();
        let handle = {
            let txn = store.read_txn()?;
            self.open(&txn, repo)?
        };
        let mut body = BufReader::new(body);
        let request = ReceiveRequest::parse(&mut body)?;
        let report = receive(&handle, &request, &mut body, principal)?;
        Ok(GitResponse::ok(service.result_content_type(), report))
    }

    fn open(&self, txn: &RoTxn, repo: &str) -> Result<RepositoryHandle> {
        self.repositories
            .get_repository(txn, repo)?
            .ok_or_else(|| Error::NotFound(format!("repository {}", repo)))
    }
}

fn check_post(service: Service, method: &str, content_type: Option<&str>) -> Option<GitResponse> {
    if !POST_METHODS.contains(&method) {
        debug!("wrong {} method: {}", service.as_str(), method);
        return Some(GitResponse::bad_method(POST_METHODS));
    }
    if content_type != Some(service.request_content_type()) {
        debug!("wrong {} content type: {:?}", service.as_str(), content_type);
        return Some(GitResponse::text(400, "bad request"));
    }
    None
}

/// Service announcement followed by the ref advertisement.
fn advertise_refs(txn: &RoTxn, repo: &RepositoryHandle, service: Service) -> Result<Vec<u8>> {
    let mut writer = PktLineWriter::new();
    writer.write_str(&format!("# service={}", service.as_str()));
    writer.flush();

    let refs = repo.refs();
    let objects = repo.objects();
    let head = refs.get_resolved(txn, HEAD)?;

    let mut caps: Vec<String> = service.capabilities().iter().map(|c| c.to_string()).collect();
    if let (Service::UploadPack, Some(head)) = (service, &head) {
        if head.is_symbolic() {
            caps.push(format!("symref={}:{}", HEAD, head.leaf));
        }
    }
    caps.push(agent());
    let caps = caps.join(" ");

    let mut lines: Vec<(ObjectId, String)> = Vec::new();
    if let Some(head) = &head {
        lines.push((head.object_id(), HEAD.to_string()));
    }
    for named in refs.find_by_prefix(txn, "refs/")? {
        let value = match named.reference {
            Ref::Symbolic(_) => match refs.get_resolved(txn, &named.name)? {
                Some(resolved) => resolved.target,
                None => continue,
            },
            value => value,
        };
        let Some(id) = value.object_id() else {
            continue;
        };
        lines.push((id, named.name.clone()));
        if service == Service::UploadPack {
            if let Some(peeled) = refs.peel(txn, &objects, &value)?.peeled_id() {
                lines.push((peeled, format!("{}^{{}}", named.name)));
            }
        }
    }

    if lines.is_empty() {
        writer.write_str(&format!("{} capabilities^{{}}\0{}", ObjectId::ZERO, caps));
    }
    for (i, (id, name)) in lines.iter().enumerate() {
        if i == 0 {
            writer.write_str(&format!("{} {}\0{}", id, name, caps));
        } else {
            writer.write_str(&format!("{} {}", id, name));
        }
    }
    writer.flush();
    Ok(writer.into_bytes())
}

/// Parsed want/have negotiation from an upload-pack request.
#[derive(Debug, Default)]
struct UploadRequest {
    wants: Vec<ObjectId>,
    haves: Vec<ObjectId>,
    capabilities: Vec<String>,
    done: bool,
}

impl UploadRequest {
    fn parse(body: &[u8]) -> Result<Self> {
        let mut request = UploadRequest::default();
        let mut reader = PktLineReader::new(body);

        while let Some(pkt) = reader.read()? {
            let PktLine::Data(data) = pkt else {
                continue;
            };
            let line = std::str::from_utf8(data)
                .map_err(|_| Error::Protocol("invalid utf8".into()))?
                .trim_end_matches('\n');

            if let Some(rest) = line.strip_prefix("want ") {
                let (hex, caps) = rest.split_once(' ').unwrap_or((rest, ""));
                request.wants.push(parse_id(hex)?);
                if request.capabilities.is_empty() {
                    request.capabilities = parse_capabilities(caps);
                }
            } else if let Some(hex) = line.strip_prefix("have ") {
                request.haves.push(parse_id(hex.trim())?);
            } else if line == "done" {
                request.done = true;
            } else if line.starts_with("deepen") || line.starts_with("shallow ") {
                return Err(Error::Unsupported("shallow clone".into()));
            } else {
                return Err(Error::Protocol(format!("unexpected upload-pack line: {}", line)));
            }
        }
        Ok(request)
    }

    fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

fn parse_id(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).ok_or_else(|| Error::Protocol(format!("invalid object id: {}", hex)))
}

fn upload<W, F>(txn: &RoTxn, repo: &RepositoryHandle, request: &UploadRequest, respond: F) -> Result<()>
where
    W: Write,
    F: FnOnce(GitResponse) -> io::Result<W>,
{
    let content_type = Service::UploadPack.result_content_type();
    let mut writer = PktLineWriter::new();
    if request.wants.is_empty() {
        respond(GitResponse::ok(content_type, writer.into_bytes()))?;
        return Ok(());
    }

    let objects = repo.objects();
    for want in &request.wants {
        if !objects.has(txn, want, None)? {
            warn!("upload-pack for {} wants unknown object {}", repo.name(), want);
            writer.write_str(&format!("ERR upload-pack: not our ref {}", want));
            respond(GitResponse::ok(content_type, writer.into_bytes()))?;
            return Ok(());
        }
    }

    let mut common = Vec::new();
    for have in &request.haves {
        if objects.has(txn, have, None)? {
            common.push(*have);
        }
    }

    // Without multi_ack git expects one ACK, for the first common commit.
    match common.first() {
        Some(first) => writer.write_str(&format!("ACK {}", first)),
        None => writer.write_str("NAK"),
    }
    if !request.done {
        respond(GitResponse::ok(content_type, writer.into_bytes()))?;
        return Ok(());
    }

    let mut builder = PackBuilder::new(objects);
    for want in &request.wants {
        builder.want(*want);
    }
    for have in &common {
        builder.have(*have);
    }
    let ids = builder.collect(txn)?;
    debug!(
        "upload-pack for {}: {} wants, {} common, {} objects",
        repo.name(),
        request.wants.len(),
        common.len(),
        ids.len()
    );

    let out = respond(GitResponse::ok(content_type, writer.into_bytes()))?;
    let chunk_size = if request.has_capability("side-band-64k") {
        SIDEBAND_64K_CHUNK
    } else if request.has_capability("side-band") {
        SIDEBAND_CHUNK
    } else {
        let mut out = builder.write_to(txn, &ids, out)?;
        out.flush()?;
        return Ok(());
    };

    let mut band = SidebandWriter::new(out, chunk_size);
    let written = builder.write_to(txn, &ids, &mut band).map(|_| ());
    match written {
        Ok(()) => {
            band.finish()?;
            Ok(())
        }
        Err(err) => {
            warn!("upload-pack for {} failed mid-pack: {}", repo.name(), err);
            band.abort(&format!("upload-pack: {}", err))?;
            Err(err)
        }
    }
}

/// A ref update command
#[derive(Debug)]
struct RefCommand {
    old_id: ObjectId,
    new_id: ObjectId,
    name: String,
}

#[derive(Debug)]
struct ReceiveRequest {
    commands: Vec<RefCommand>,
    capabilities: Vec<String>,
}

impl ReceiveRequest {
    /// Read the command list, leaving `body` at the start of the pack.
    fn parse<R: Read>(body: R) -> Result<Self> {
        let mut reader = PktLineStream::new(body);
        let mut commands = Vec::new();
        let mut capabilities = Vec::new();

        while let Some(line) = reader.read_text()? {
            let (command, caps) = line.split_once('\0').unwrap_or((line.as_str(), ""));
            if commands.is_empty() {
                capabilities = parse_capabilities(caps);
            }
            let mut parts = command.splitn(3, ' ');
            let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(Error::Protocol(format!("malformed command: {}", command)));
            };
            commands.push(RefCommand {
                old_id: parse_id(old)?,
                new_id: parse_id(new)?,
                name: name.to_string(),
            });
        }

        Ok(Self {
            commands,
            capabilities,
        })
    }

    fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

/// Ingest the pack and apply every command in one write transaction.
fn receive<R: BufRead + Seek>(
    repo: &RepositoryHandle,
    request: &ReceiveRequest,
    pack: &mut R,
    principal: Option<PersonIdent>,
) -> Result<Vec<u8>> {
    if request.commands.is_empty() {
        return Ok(Vec::new());
    }

    // Pure deletes carry no pack.
    let has_pack = !pack.fill_buf()?.is_empty();

    let store = repo.store();
    let mut txn = store.write_txn()?;

    let unpacked = if has_pack {
        repo.pack_ingester()
            .ingest(&mut txn, pack)
            .map(|summary| info!("received {} objects into {}", summary.objects, repo.name()))
    } else {
        Ok(())
    };

    let statuses = match unpacked {
        Ok(()) => {
            let statuses = apply_commands(&mut txn, repo, &request.commands, principal)?;
            txn.commit().map_err(StoreError::from)?;
            Ok(statuses)
        }
        Err(err @ (Error::Corrupt(_) | Error::MissingObject(_) | Error::IncorrectType { .. })) => {
            warn!("rejecting pack pushed to {}: {}", repo.name(), err);
            txn.abort();
            Err(err)
        }
        Err(err) => return Err(err),
    };

    if !request.has_capability("report-status") {
        return Ok(Vec::new());
    }

    let mut report = PktLineWriter::new();
    match &statuses {
        Ok(statuses) => {
            report.write_str("unpack ok");
            for (command, failure) in request.commands.iter().zip(statuses) {
                match failure {
                    None => report.write_str(&format!("ok {}", command.name)),
                    Some(reason) => report.write_str(&format!("ng {} {}", command.name, reason)),
                }
            }
        }
        Err(err) => {
            report.write_str(&format!("unpack {}", err));
            for command in &request.commands {
                report.write_str(&format!("ng {} unpacker error", command.name));
            }
        }
    }
    report.flush();

    if request.has_capability("side-band-64k") {
        let mut response = PktLineWriter::new();
        response.write_sideband(sideband::DATA, report.as_bytes(), SIDEBAND_64K_CHUNK);
        response.flush();
        Ok(response.into_bytes())
    } else {
        Ok(report.into_bytes())
    }
}

/// Apply each command, returning `None` for success or the failure reason.
fn apply_commands(
    txn: &mut RwTxn,
    repo: &RepositoryHandle,
    commands: &[RefCommand],
    principal: Option<PersonIdent>,
) -> Result<Vec<Option<String>>> {
    let mut transaction = repo.ref_transaction().with_message("push");
    if let Some(identity) = principal {
        transaction = transaction.with_identity(identity);
    }

    let mut statuses = Vec::with_capacity(commands.len());
    for command in commands {
        let outcome = transaction.update(txn, &command.name, command.new_id, command.old_id);
        let failure = match outcome {
            Ok(result) if result.is_success() => None,
            Ok(RefUpdateResult::MissingRef) => Some("no such ref".to_string()),
            Ok(_) => Some("failed to lock".to_string()),
            Err(Error::InvalidRefName(_)) => Some("funny refname".to_string()),
            Err(Error::MissingObject(_)) => Some("missing necessary objects".to_string()),
            Err(err) => return Err(err),
        };
        if let Some(reason) = &failure {
            warn!("push to {} {}: {}", repo.name(), command.name, reason);
        } else {
            debug!("push to {} {}: {} -> {}", repo.name(), command.name, command.old_id, command.new_id);
        }
        statuses.push(failure);
    }
    Ok(statuses)
}
