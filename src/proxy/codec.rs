use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::util::timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// Header names that must not be forwarded between hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name_string = name.into();
        let lower_name = name_string.to_ascii_lowercase();
        Self {
            name: name_string,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Vec<HeaderLine>,
    pub head_bytes: usize,
}

impl RequestHead {
    /// First value of the named header, if present.
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn content_length(&self) -> Result<Option<usize>> {
        let mut length = None;
        for header in &self.headers {
            if header.lower_name() != "content-length" {
                continue;
            }
            if length.is_some() {
                bail!("multiple Content-Length headers are not supported");
            }
            let parsed: usize = header
                .value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{}'", header.value))?;
            length = Some(parsed);
        }
        Ok(length)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.iter().any(|header| {
            header.lower_name() == "transfer-encoding"
                && header.value.to_ascii_lowercase().contains("chunked")
        })
    }

    pub fn wants_connection_close(&self) -> bool {
        let mut close = matches!(self.version, Version::HTTP_10);
        for header in &self.headers {
            if header.lower_name() != "connection" {
                continue;
            }
            for token in header.value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    close = false;
                }
            }
        }
        close
    }
}

/// Read one request head from the client. `Ok(None)` means the connection
/// closed cleanly between requests.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut request_line = String::new();
    let request_line_bytes = read_line_with_timeout(
        reader,
        &mut request_line,
        timeout,
        peer,
        max_header_bytes,
    )
    .await?;
    if request_line_bytes == 0 {
        return Ok(None);
    }

    let trimmed = request_line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("empty request line from {peer}");
    }
    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => bail!("invalid HTTP version '{other}'"),
        None => bail!("malformed request line: missing version"),
    };
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let mut headers = Vec::new();
    let mut head_bytes = request_line_bytes;
    let mut header_line = String::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(head_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request headers from {peer} exceed configured limit"))?;
        header_line.clear();
        let read =
            read_line_with_timeout(reader, &mut header_line, timeout, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed mid-headers from {peer}");
        }
        head_bytes += read;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from {peer}"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        headers.push(HeaderLine::new(name, value));
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        head_bytes,
    }))
}

pub async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(
            timeout_dur,
            reader.fill_buf(),
            format!("reading line from {peer}"),
        )
        .await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

/// Read exactly `length` body bytes into memory.
pub async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: usize,
    timeout: Duration,
    context: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        let read = timeout_with_context(timeout, reader.read(&mut body[filled..]), context).await?;
        if read == 0 {
            bail!("unexpected EOF while {context}");
        }
        filled += read;
    }
    Ok(body)
}

/// Decode a chunked body into memory, consuming the trailer section.
pub async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        let size_bytes =
            read_line_with_timeout(reader, &mut line, timeout, peer, MAX_CHUNK_LINE_LENGTH).await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed);
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailer section runs to the first blank line.
            loop {
                let trailer_bytes =
                    read_line_with_timeout(reader, &mut line, timeout, peer, MAX_CHUNK_LINE_LENGTH)
                        .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        if body.len() + chunk_size > max_len {
            bail!("chunked body from {peer} exceeds configured limit of {max_len} bytes");
        }

        let start = body.len();
        body.resize(start + chunk_size, 0);
        timeout_with_context(
            timeout,
            reader.read_exact(&mut body[start..]),
            format!("reading chunk data from {peer}"),
        )
        .await?;

        let mut crlf = [0u8; 2];
        timeout_with_context(
            timeout,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {peer}"),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {peer}");
        }
    }

    Ok(body)
}

/// Read until the peer closes the connection.
pub async fn read_body_to_close<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = timeout_with_context(
            timeout,
            reader.read(&mut buffer),
            format!("reading response body from {peer}"),
        )
        .await?;
        if read == 0 {
            break;
        }
        if body.len() + read > max_len {
            bail!("response body from {peer} exceeds configured limit of {max_len} bytes");
        }
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body)
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status_line: String,
    pub status: StatusCode,
    pub headers: Vec<HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    let mut head_bytes = bytes;
    let trimmed = status_line.trim_end_matches(['\r', '\n']).to_string();
    let (version, status) = parse_status_line(&trimmed)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut content_length_seen = false;
    let mut chunked = false;
    let mut connection_close = matches!(version, Version::HTTP_10);

    let mut header_line = String::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(head_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
        let read =
            read_line_with_timeout(reader, &mut header_line, timeout, peer, remaining).await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        head_bytes += read;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length_seen {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
            content_length_seen = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    connection_close = false;
                }
            }
        }
        headers.push(HeaderLine::new(name, value));
    }

    if chunked && content_length_seen {
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        status_line: trimmed,
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.split_whitespace();
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => bail!("invalid upstream HTTP version '{other}'"),
        None => bail!("upstream status line missing HTTP version"),
    };
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;
    Ok((version, status))
}

/// Rewrite a client request for the upstream: origin-form target, the
/// upstream's own Host, end-to-end headers only, and a fresh framing for the
/// buffered body.
pub fn build_upstream_request(
    head: &RequestHead,
    target: &str,
    authority: &str,
    body_len: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512);
    buffer.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, target).as_bytes());
    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(authority.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for header in &head.headers {
        let lower = header.lower_name();
        if lower == "host" || lower == "content-length" || lower == "expect" {
            continue;
        }
        if HOP_BY_HOP.contains(&lower) {
            continue;
        }
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if body_len > 0 || allows_request_body(&head.method) {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(body_len.to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

fn allows_request_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Re-encode a buffered upstream response for the client, replacing the
/// original framing with the buffered body's length.
pub fn encode_response_head(head: &ResponseHead, body_len: usize, close: bool) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(head.status_line.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for header in &head.headers {
        let lower = header.lower_name();
        if lower == "content-length" || HOP_BY_HOP.contains(&lower) {
            continue;
        }
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    finish_head(&mut buffer, body_len, close);
    buffer
}

/// Head for a response replayed from the store; only status, content type,
/// and length survive recording.
pub fn encode_replay_head(
    status: StatusCode,
    content_type: &str,
    body_len: usize,
    close: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(128);
    let reason = status.canonical_reason().unwrap_or("Unknown");
    buffer.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());
    buffer.extend_from_slice(b"Content-Type: ");
    buffer.extend_from_slice(content_type.as_bytes());
    buffer.extend_from_slice(b"\r\n");
    finish_head(&mut buffer, body_len, close);
    buffer
}

fn finish_head(buffer: &mut Vec<u8>, body_len: usize, close: bool) {
    buffer.extend_from_slice(b"Content-Length: ");
    buffer.extend_from_slice(body_len.to_string().as_bytes());
    buffer.extend_from_slice(b"\r\n");
    if close {
        buffer.extend_from_slice(b"Connection: close\r\n");
    } else {
        buffer.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
}
