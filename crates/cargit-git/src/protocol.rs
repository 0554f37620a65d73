//! pkt-line framing
//!
//! Git uses "pkt-line" framing: 4 hex digits length prefix followed by data.
//! Special values: "0000" (flush), "0001" (delimiter), "0002" (response-end)

use std::io::{self, Read, Write};

use crate::{Error, Result};

/// Flush packet (marks end of message)
pub const FLUSH_PKT: &[u8] = b"0000";

/// Maximum pkt-line size including the 4-byte length prefix
pub const MAX_PKT_LINE: usize = 65520;

/// Largest side-band payload that fits in one pkt-line with side-band-64k
pub const SIDEBAND_64K_CHUNK: usize = MAX_PKT_LINE - 5;

/// Largest side-band payload with the original 1000-byte side-band
pub const SIDEBAND_CHUNK: usize = 1000 - 5;

/// Write a pkt-line
pub fn pkt_line(data: &[u8]) -> Vec<u8> {
    let len = data.len() + 4; // Include the 4-byte length prefix
    let mut pkt = format!("{:04x}", len).into_bytes();
    pkt.extend_from_slice(data);
    pkt
}

/// Write a pkt-line with newline suffix
pub fn pkt_line_with_newline(data: &str) -> Vec<u8> {
    let line = format!("{}\n", data);
    pkt_line(line.as_bytes())
}

/// Parse pkt-lines from a buffer
pub struct PktLineReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PktLineReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read the next pkt-line
    pub fn read(&mut self) -> Result<Option<PktLine<'a>>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if self.pos + 4 > self.data.len() {
            return Err(Error::Protocol("pkt-line length truncated".into()));
        }

        let len = decode_length(&self.data[self.pos..self.pos + 4])?;
        if let Some(pkt) = special_packet(len) {
            self.pos += 4;
            return Ok(Some(pkt));
        }

        if self.pos + len > self.data.len() {
            return Err(Error::Protocol("pkt-line truncated".into()));
        }

        let payload = &self.data[self.pos + 4..self.pos + len];
        self.pos += len;

        Ok(Some(PktLine::Data(payload)))
    }

    /// Read the next data line as text with the trailing newline removed.
    ///
    /// Returns `None` at a flush or at end of input.
    pub fn read_text(&mut self) -> Result<Option<&'a str>> {
        loop {
            match self.read()? {
                None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => return Ok(None),
                Some(PktLine::Delimiter) => continue,
                Some(PktLine::Data(data)) => {
                    let line = std::str::from_utf8(data)
                        .map_err(|_| Error::Protocol("pkt-line is not utf-8".into()))?;
                    return Ok(Some(line.strip_suffix('\n').unwrap_or(line)));
                }
            }
        }
    }

    /// Remaining bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Decode the 4 hex digit length prefix. Values below 4 are special packets.
fn decode_length(prefix: &[u8]) -> Result<usize> {
    let len_hex =
        std::str::from_utf8(prefix).map_err(|_| Error::Protocol("invalid pkt-line length".into()))?;
    let len = usize::from_str_radix(len_hex, 16)
        .map_err(|_| Error::Protocol("invalid pkt-line length".into()))?;
    if len == 3 {
        return Err(Error::Protocol("pkt-line length too small".into()));
    }
    if len > MAX_PKT_LINE {
        return Err(Error::Protocol("pkt-line too large".into()));
    }
    Ok(len)
}

fn special_packet(len: usize) -> Option<PktLine<'static>> {
    match len {
        0 => Some(PktLine::Flush),
        1 => Some(PktLine::Delimiter),
        2 => Some(PktLine::ResponseEnd),
        _ => None,
    }
}

/// Reads pkt-lines one at a time from a stream, leaving whatever follows
/// the last line read untouched.
pub struct PktLineStream<R> {
    inner: R,
}

impl<R: Read> PktLineStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Same contract as [`PktLineReader::read_text`].
    pub fn read_text(&mut self) -> Result<Option<String>> {
        loop {
            let mut prefix = [0u8; 4];
            let mut filled = 0;
            while filled < prefix.len() {
                let n = self.inner.read(&mut prefix[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            match filled {
                0 => return Ok(None),
                4 => {}
                _ => return Err(Error::Protocol("pkt-line length truncated".into())),
            }

            let len = decode_length(&prefix)?;
            match special_packet(len) {
                Some(PktLine::Delimiter) => continue,
                Some(_) => return Ok(None),
                None => {}
            }
            let mut data = vec![0u8; len - 4];
            self.inner.read_exact(&mut data).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::Protocol("pkt-line truncated".into()),
                _ => Error::Io(e),
            })?;
            let mut line =
                String::from_utf8(data).map_err(|_| Error::Protocol("pkt-line is not utf-8".into()))?;
            if line.ends_with('\n') {
                line.pop();
            }
            return Ok(Some(line));
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// A pkt-line entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine<'a> {
    Flush,
    Delimiter,
    ResponseEnd,
    Data(&'a [u8]),
}

/// Build pkt-line responses
pub struct PktLineWriter {
    buffer: Vec<u8>,
}

impl PktLineWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(&pkt_line(data));
    }

    pub fn write_str(&mut self, s: &str) {
        self.buffer.extend_from_slice(&pkt_line_with_newline(s));
    }

    pub fn flush(&mut self) {
        self.buffer.extend_from_slice(FLUSH_PKT);
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write `data` on a side-band channel, split into pkt-line sized chunks.
    pub fn write_sideband(&mut self, channel: u8, data: &[u8], chunk_size: usize) {
        for chunk in data.chunks(chunk_size) {
            self.buffer.extend_from_slice(&sideband_pkt(channel, chunk));
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for PktLineWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse capability string from a request line
pub fn parse_capabilities(caps_str: &str) -> Vec<String> {
    caps_str
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Server capabilities for upload-pack
pub const UPLOAD_PACK_CAPABILITIES: &[&str] = &["side-band", "side-band-64k", "no-progress"];

/// Server capabilities for receive-pack
pub const RECEIVE_PACK_CAPABILITIES: &[&str] =
    &["report-status", "delete-refs", "side-band-64k", "ofs-delta"];

/// Agent string advertised alongside the capabilities
pub fn agent() -> String {
    format!("agent=cargit/{}", env!("CARGO_PKG_VERSION"))
}

/// Side-band channel IDs
pub mod sideband {
    pub const DATA: u8 = 1;
    pub const ERROR: u8 = 3;
}

/// Write data to a side-band channel
pub fn sideband_pkt(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![channel];
    payload.extend_from_slice(data);
    pkt_line(&payload)
}

/// Frames everything written to it as side-band data packets.
///
/// Output is cut into `chunk_size` payloads, so each packet is written to
/// the inner writer in one piece.
pub struct SidebandWriter<W: Write> {
    inner: W,
    chunk_size: usize,
    pending: Vec<u8>,
}

impl<W: Write> SidebandWriter<W> {
    pub fn new(inner: W, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
        }
    }

    fn emit_pending(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.inner.write_all(&sideband_pkt(sideband::DATA, &self.pending))?;
            self.pending.clear();
        }
        Ok(())
    }

    /// Send the remaining data and the closing flush packet.
    pub fn finish(mut self) -> io::Result<W> {
        self.emit_pending()?;
        self.inner.write_all(FLUSH_PKT)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    /// Report a fatal error to the client on the error channel.
    pub fn abort(mut self, message: &str) -> io::Result<W> {
        self.pending.clear();
        self.inner.write_all(&sideband_pkt(sideband::ERROR, message.as_bytes()))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SidebandWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.pending.len();
        let n = buf.len().min(room);
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() == self.chunk_size {
            self.emit_pending()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_pending()?;
        self.inner.flush()
    }
}
