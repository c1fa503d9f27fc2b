//! Minimal HTTP/1.1 codec.
//!
//! The proxy forwards raw bytes; this codec only parses what framing
//! decisions need (request/status line, headers) and writes heads back out
//! verbatim, including the original reason phrase. Header order is
//! preserved.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use warden_shared::{WardenError, WardenResult};

/// Hard cap on a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        for (k, v) in self.entries.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Token test for list-valued headers, e.g. `Connection: keep-alive, close`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    /// Verbatim, so the client sees the upstream's exact phrasing.
    pub reason: String,
    pub headers: Headers,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    /// Body runs until the peer closes.
    UntilClose,
}

pub fn request_framing(head: &RequestHead) -> WardenResult<BodyFraming> {
    if head.headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match head.headers.get("Content-Length") {
        Some(v) => {
            let n = v
                .trim()
                .parse()
                .map_err(|_| WardenError::Proxy(format!("bad Content-Length {:?}", v)))?;
            Ok(BodyFraming::ContentLength(n))
        }
        None => Ok(BodyFraming::None),
    }
}

pub fn response_framing(request_method: &str, head: &ResponseHead) -> WardenResult<BodyFraming> {
    if request_method.eq_ignore_ascii_case("HEAD") {
        return Ok(BodyFraming::None);
    }
    if head.status / 100 == 1 || head.status == 204 || head.status == 304 {
        return Ok(BodyFraming::None);
    }
    if head.headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match head.headers.get("Content-Length") {
        Some(v) => {
            let n = v
                .trim()
                .parse()
                .map_err(|_| WardenError::Proxy(format!("bad Content-Length {:?}", v)))?;
            Ok(BodyFraming::ContentLength(n))
        }
        None => Ok(BodyFraming::UntilClose),
    }
}

// ============================================================================
// Reading
// ============================================================================

async fn read_head_lines<R>(reader: &mut R) -> WardenResult<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let mut raw = Vec::new();
        let n = reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| WardenError::Proxy(format!("read head: {}", e)))?;
        if n == 0 {
            if lines.is_empty() && total == 0 {
                // clean EOF between messages
                return Ok(None);
            }
            return Err(WardenError::Proxy("unexpected EOF in head".into()));
        }
        total += n;
        if total > MAX_HEAD_SIZE {
            return Err(WardenError::Proxy("head too large".into()));
        }

        let line = String::from_utf8(raw)
            .map_err(|_| WardenError::Proxy("head is not valid UTF-8".into()))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if lines.is_empty() {
                // tolerate stray CRLF before the start line
                continue;
            }
            return Ok(Some(lines));
        }
        lines.push(line.to_string());
    }
}

fn parse_headers(lines: &[String]) -> WardenResult<Headers> {
    let mut headers = Headers::default();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WardenError::Proxy(format!("bad header line {:?}", line)))?;
        headers
            .entries
            .push((name.to_string(), value.trim_start().to_string()));
    }
    Ok(headers)
}

/// Read a request head; `None` on clean EOF (client finished keep-alive).
pub async fn read_request_head<R>(reader: &mut R) -> WardenResult<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = read_head_lines(reader).await? else {
        return Ok(None);
    };
    let mut parts = lines[0].split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => {
            return Err(WardenError::Proxy(format!(
                "bad request line {:?}",
                lines[0]
            )))
        }
    };
    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: parse_headers(&lines[1..])?,
    }))
}

pub async fn read_response_head<R>(reader: &mut R) -> WardenResult<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let lines = read_head_lines(reader)
        .await?
        .ok_or_else(|| WardenError::Proxy("EOF before response".into()))?;
    let mut parts = lines[0].splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| WardenError::Proxy("empty status line".into()))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WardenError::Proxy(format!("bad status line {:?}", lines[0])))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers: parse_headers(&lines[1..])?,
    })
}

// ============================================================================
// Writing
// ============================================================================

pub async fn write_request_head<W>(writer: &mut W, head: &RequestHead) -> WardenResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{} {} {}\r\n", head.method, head.target, head.version);
    for (name, value) in head.headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer
        .write_all(out.as_bytes())
        .await
        .map_err(|e| WardenError::Proxy(format!("write request: {}", e)))
}

/// Status line is written by hand to preserve the original reason phrase.
pub async fn write_response_head<W>(writer: &mut W, head: &ResponseHead) -> WardenResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = if head.reason.is_empty() {
        format!("{} {}\r\n", head.version, head.status)
    } else {
        format!("{} {} {}\r\n", head.version, head.status, head.reason)
    };
    for (name, value) in head.headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer
        .write_all(out.as_bytes())
        .await
        .map_err(|e| WardenError::Proxy(format!("write response: {}", e)))
}

// ============================================================================
// Body copies
// ============================================================================

pub async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, n: u64) -> WardenResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut taken = reader.take(n);
    let copied = tokio::io::copy(&mut taken, writer)
        .await
        .map_err(|e| WardenError::Proxy(format!("copy body: {}", e)))?;
    if copied != n {
        return Err(WardenError::Proxy(format!(
            "short body: {} of {} bytes",
            copied, n
        )));
    }
    Ok(())
}

async fn read_chunk_size<R>(reader: &mut R) -> WardenResult<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut size_line = String::new();
    reader
        .read_line(&mut size_line)
        .await
        .map_err(|e| WardenError::Proxy(format!("read chunk size: {}", e)))?;
    let size_str = size_line.trim_end_matches(['\r', '\n']);
    // chunk extensions after ';' are dropped
    let size_str = size_str.split(';').next().unwrap_or("");
    u64::from_str_radix(size_str.trim(), 16)
        .map_err(|_| WardenError::Proxy(format!("bad chunk size {:?}", size_str)))
}

/// The zero chunk must be followed by a bare CRLF; anything else is a
/// trailer, which we do not support.
async fn read_chunked_terminator<R>(reader: &mut R) -> WardenResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut terminator = String::new();
    reader
        .read_line(&mut terminator)
        .await
        .map_err(|e| WardenError::Proxy(format!("read chunk terminator: {}", e)))?;
    if !terminator.trim_end_matches(['\r', '\n']).is_empty() {
        return Err(WardenError::Proxy("trailers are not supported".into()));
    }
    Ok(())
}

async fn read_chunk_crlf<R>(reader: &mut R) -> WardenResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(|e| WardenError::Proxy(format!("read chunk crlf: {}", e)))?;
    if &crlf != b"\r\n" {
        return Err(WardenError::Proxy("malformed chunk terminator".into()));
    }
    Ok(())
}

/// Copy a chunked body, re-emitting well-formed chunk framing. Consumes the
/// final CRLF from the source.
pub async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> WardenResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            read_chunked_terminator(reader).await?;
            writer
                .write_all(b"0\r\n\r\n")
                .await
                .map_err(|e| WardenError::Proxy(format!("write final chunk: {}", e)))?;
            return Ok(());
        }

        writer
            .write_all(format!("{:x}\r\n", size).as_bytes())
            .await
            .map_err(|e| WardenError::Proxy(format!("write chunk size: {}", e)))?;
        copy_exact(reader, writer, size).await?;
        read_chunk_crlf(reader).await?;
        writer
            .write_all(b"\r\n")
            .await
            .map_err(|e| WardenError::Proxy(format!("write chunk crlf: {}", e)))?;
    }
}

/// Read an exact-length body into memory, refusing anything over `max`.
pub async fn read_body_exact<R>(reader: &mut R, n: u64, max: u64) -> WardenResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if n > max {
        return Err(WardenError::Proxy(format!(
            "request body of {} bytes exceeds the {} byte filter cap",
            n, max
        )));
    }
    let mut body = vec![0u8; n as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| WardenError::Proxy(format!("read body: {}", e)))?;
    Ok(body)
}

/// Read a whole chunked body into memory, de-chunked and bounded by `max`.
/// Consumes the final CRLF from the source.
pub async fn read_chunked_to_end<R>(reader: &mut R, max: u64) -> WardenResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            read_chunked_terminator(reader).await?;
            return Ok(body);
        }
        if body.len() as u64 + size > max {
            return Err(WardenError::Proxy(format!(
                "chunked request body exceeds the {} byte filter cap",
                max
            )));
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| WardenError::Proxy(format!("read chunk: {}", e)))?;
        read_chunk_crlf(reader).await?;
    }
}
