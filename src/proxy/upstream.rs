//! Request forwarding
//!
//! This module connects the HTTP gate to its backends: it serializes the
//! client's request for the selected backend, reads the backend's response
//! off a pooled connection, and maps per-request failures to best-effort
//! error responses.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::proxy::backend::{Backend, BackendPool};

const BUFFER_SIZE: usize = 8192;
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Forwards requests to the backend pool.
pub struct ProxyHandler {
    pool: BackendPool,
}

impl ProxyHandler {
    pub fn new(pool: BackendPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    /// Forwards one request to the next backend in round-robin order.
    ///
    /// A proxy failure (unreachable backend, dial timeout, malformed
    /// response) is returned to the client as a 502/504; it never
    /// propagates out of this call, so the gate and sibling requests
    /// are unaffected.
    pub async fn forward_request(&self, request: &Request) -> Response {
        let backend = self.pool.select();

        tracing::debug!(
            backend = backend.display_name(),
            method = request.method.as_str(),
            path = %request.path,
            "Forwarding request"
        );

        match self.proxy_to_backend(backend, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    backend = backend.display_name(),
                    error = %e,
                    method = request.method.as_str(),
                    path = %request.path,
                    "Proxy request failed"
                );
                error_response(&e)
            }
        }
    }

    async fn proxy_to_backend(&self, backend: &Backend, request: &Request) -> Result<Response> {
        let mut stream = backend.transport.checkout().await?;

        let request_bytes = build_http_request(request, backend);
        stream
            .write_all(&request_bytes)
            .await
            .context("failed to write request to backend")?;
        stream.flush().await?;

        let head_only = request.method == Method::HEAD;
        let (response, reusable) = read_http_response(&mut stream, head_only).await?;

        if reusable {
            backend.transport.checkin(stream).await;
        }

        Ok(response)
    }
}

/// Serializes a client request for a backend.
///
/// Standard reverse-proxy rewrite: Host points at the backend, hop-by-hop
/// headers are stripped, and everything else (method, path, headers, body)
/// passes through unchanged. No Connection header is added, so the backend
/// connection stays persistent per HTTP/1.1 defaults.
pub fn build_http_request(request: &Request, backend: &Backend) -> Vec<u8> {
    let mut buffer = Vec::new();

    let path = if request.path.is_empty() {
        "/"
    } else {
        &request.path
    };

    buffer.extend_from_slice(
        format!("{} {} {}\r\n", request.method.as_str(), path, request.version).as_bytes(),
    );

    let mut headers = request.headers.clone();
    headers.insert("Host".to_string(), backend.addr.clone());

    // Hop-by-hop headers are not forwarded
    headers.remove("Connection");
    headers.remove("Keep-Alive");
    headers.remove("Proxy-Connection");
    headers.remove("Transfer-Encoding");
    headers.remove("Upgrade");

    if !request.body.is_empty() {
        headers.insert("Content-Length".to_string(), request.body.len().to_string());
    }

    for (key, value) in &headers {
        buffer.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
    }

    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    buffer
}

/// Reads one response from a backend connection.
///
/// Returns the response plus whether the connection is reusable: the body
/// was framed (Content-Length, chunked, or no body at all) and the backend
/// did not ask to close.
async fn read_http_response(
    stream: &mut TcpStream,
    head_only: bool,
) -> Result<(Response, bool)> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        if let Some(headers_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let header_bytes = buffer.split_to(headers_end + 4);
            let (status, mut headers) = parse_response_head(&header_bytes)?;

            let connection_close = headers
                .get("Connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);

            let code = status.as_u16();
            let bodiless = head_only || code == 204 || code == 304 || (100..200).contains(&code);

            let chunked = headers
                .get("Transfer-Encoding")
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);

            let (body, framed) = if bodiless {
                (Vec::new(), true)
            } else if chunked {
                (read_chunked_body(stream, &mut buffer).await?, true)
            } else if let Some(cl) = headers.get("Content-Length") {
                let content_length: usize = cl
                    .trim()
                    .parse()
                    .context("invalid Content-Length in backend response")?;
                (read_sized_body(stream, &mut buffer, content_length).await?, true)
            } else {
                // Close-delimited body: valid HTTP, but ends the connection
                (read_to_eof(stream, &mut buffer).await?, false)
            };

            // The gate manages framing and connection lifetime on the
            // client side itself; a decoded chunked body is re-framed with
            // Content-Length by the response builder.
            headers.remove("Connection");
            headers.remove("Keep-Alive");
            headers.remove("Transfer-Encoding");

            let response = ResponseBuilder::new(status)
                .headers(headers)
                .body(body)
                .build();

            let reusable = framed && !connection_close;
            return Ok((response, reusable));
        }

        if buffer.len() > MAX_HEADER_BYTES {
            anyhow::bail!("backend response headers too large");
        }

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            anyhow::bail!("connection closed before complete response head");
        }
    }
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, HashMap<String, String>)> {
    let head_str =
        std::str::from_utf8(head).context("invalid UTF-8 in backend response head")?;

    let mut lines = head_str.lines();

    // Status line: "HTTP/1.1 200 OK"
    let status_line = lines.next().context("empty backend response")?;
    let mut parts = status_line.splitn(3, ' ');
    parts.next().context("missing HTTP version in status line")?;
    let code: u16 = parts
        .next()
        .context("missing status code in status line")?
        .parse()
        .context("invalid status code in backend response")?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    Ok((StatusCode(code), headers))
}

async fn read_sized_body(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    content_length: usize,
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(content_length.min(BUFFER_SIZE * 8));

    let take = buffer.len().min(content_length);
    body.extend_from_slice(&buffer[..take]);
    buffer.advance(take);

    while body.len() < content_length {
        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            anyhow::bail!("connection closed before complete response body");
        }
        let take = buffer.len().min(content_length - body.len());
        body.extend_from_slice(&buffer[..take]);
        buffer.advance(take);
    }

    Ok(body)
}

async fn read_to_eof(stream: &mut TcpStream, buffer: &mut BytesMut) -> Result<Vec<u8>> {
    let mut body = buffer.split().to_vec();

    loop {
        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buffer[..]);
        buffer.clear();
    }

    Ok(body)
}

async fn read_chunked_body(stream: &mut TcpStream, buffer: &mut BytesMut) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let size_line = read_line(stream, buffer).await?;
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .with_context(|| format!("invalid chunk size {size_field:?}"))?;

        if size == 0 {
            // Trailer section runs until an empty line
            loop {
                let trailer = read_line(stream, buffer).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        // Chunk data plus its trailing CRLF
        while buffer.len() < size + 2 {
            let n = stream.read_buf(buffer).await?;
            if n == 0 {
                anyhow::bail!("connection closed mid-chunk");
            }
        }
        body.extend_from_slice(&buffer[..size]);
        buffer.advance(size + 2);
    }
}

async fn read_line(stream: &mut TcpStream, buffer: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line = buffer.split_to(pos + 2);
            return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
        }

        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            anyhow::bail!("connection closed before end of line");
        }
    }
}

/// Maps a proxy failure to the response the client sees.
fn error_response(error: &anyhow::Error) -> Response {
    let error_str = error.to_string();

    let (status, body) = if error_str.contains("timed out") {
        (
            StatusCode::GATEWAY_TIMEOUT,
            b"504 Gateway Timeout\r\n\r\nThe backend server did not respond in time.".to_vec(),
        )
    } else {
        (
            StatusCode::BAD_GATEWAY,
            b"502 Bad Gateway\r\n\r\nFailed to reach the backend server.".to_vec(),
        )
    };

    ResponseBuilder::new(status)
        .header("Content-Type", "text/plain")
        .body(body)
        .build()
}
