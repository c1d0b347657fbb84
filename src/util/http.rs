/*!
Minimal HTTP/1.1 plumbing for the front-end: tolerant request parsing and
response/SSE helpers over any `Read`/`Write` stream.

Parsing accepts both CRLFCRLF and LFLF header termination, caps headers at
64 KiB and bodies at 1 MiB, and reads the remainder of the body from the
stream when Content-Length says so.
*/
use std::collections::HashMap;
use std::io::{self, Read, Write};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

const HDR_CAP: usize = 64 * 1024;
const BODY_CAP: usize = 1024 * 1024;

/// Parsed request: uppercased method, path as sent, decoded query pairs,
/// lowercased header keys.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    buf.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// Parse a single request from a reader. Best-effort body read based on
/// Content-Length; oversized headers or bodies yield InvalidData.
pub fn read_http_request<R: Read>(reader: &mut R) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let mut split = None;

    while split.is_none() && buf.len() < HDR_CAP {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        split = find_header_end(&buf);
    }
    let (hend, body_start) = match split {
        Some(pair) => pair,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete or oversized request header",
            ))
        }
    };

    let header_str = String::from_utf8_lossy(&buf[..hend]).to_string();
    let mut lines = header_str.lines();
    let request_line = lines.next().unwrap_or_default().trim().to_string();
    let (method, path, query) = parse_request_line(&request_line);

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let mut body = buf[body_start..].to_vec();
    let content_len: usize = headers
        .get("content-length")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    if content_len > BODY_CAP {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "body too large"));
    }
    while body.len() < content_len {
        let want = (content_len - body.len()).min(8 * 1024);
        let mut rem = vec![0u8; want];
        let got = reader.read(&mut rem)?;
        if got == 0 {
            break;
        }
        body.extend_from_slice(&rem[..got]);
    }
    if content_len > 0 && body.len() > content_len {
        body.truncate(content_len);
    }

    Ok(HttpRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn parse_request_line(line: &str) -> (String, String, Vec<(String, String)>) {
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_ascii_uppercase();
    let target = parts.next().unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target).to_string();
    let mut query = Vec::new();
    if let Some(idx) = target.find('?') {
        query = parse_form_urlencoded(&target[idx + 1..]);
    }
    (method, path, query)
}

/// application/x-www-form-urlencoded pairs with %XX and '+' decoding;
/// invalid escape sequences are preserved literally.
pub fn parse_form_urlencoded(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for pair in s.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut it = pair.splitn(2, '=');
        let k = it.next().unwrap_or_default();
        let v = it.next().unwrap_or_default();
        out.push((url_decode(k), url_decode(v)));
    }
    out
}

pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let v1 = (bytes[i + 1] as char).to_digit(16);
                let v2 = (bytes[i + 2] as char).to_digit(16);
                if let (Some(a), Some(b)) = (v1, v2) {
                    out.push(((a << 4) + b) as u8 as char);
                    i += 3;
                } else {
                    out.push('%');
                    i += 1;
                }
            }
            c => {
                out.push(c as char);
                i += 1;
            }
        }
    }
    out
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "OK",
    }
}

pub fn respond_json<W: Write>(w: &mut W, code: u16, body: &serde_json::Value) {
    let text = body.to_string();
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        status_text(code),
        text.len()
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(text.as_bytes());
    let _ = w.flush();
}

pub fn respond_error<W: Write>(w: &mut W, err: &crate::errors::ApiError) {
    respond_json(
        w,
        err.http_status(),
        &serde_json::json!({ "error": err.kind(), "message": err.message() }),
    );
}

pub fn respond_bytes<W: Write>(w: &mut W, code: u16, content_type: &str, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        status_text(code),
        content_type,
        body.len()
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(body);
    let _ = w.flush();
}

/// Write SSE response headers. Frames follow via `sse_frame`.
pub fn sse_prelude<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
    )?;
    w.flush()
}

/// One SSE frame. Returns the write error so callers can detect disconnects.
pub fn sse_frame<W: Write>(w: &mut W, event: &str, data: &str) -> io::Result<()> {
    write!(w, "event: {}\ndata: {}\n\n", event, data)?;
    w.flush()
}

/// Binary chunk frame: base-64 payload under the `chunk` event name.
pub fn sse_chunk<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    sse_frame(w, "chunk", &B64.encode(bytes))
}
