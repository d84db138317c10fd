use std::collections::HashMap;

/// An HTTP status code.
///
/// A transparent wrapper around the numeric code so that whatever a backend
/// answers is relayed to the client verbatim, including codes the gateway
/// has no name for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Standard reason phrase for well-known codes, empty otherwise.
    pub fn reason_phrase(self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }
}

/// A complete HTTP response ready to be sent to a client.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Builder for constructing HTTP responses in a fluent style.
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Adds or replaces a single header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replaces the full header map, e.g. with headers read from a backend.
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the final Response.
    ///
    /// Adds a Content-Length header from the body size unless one is
    /// already present, so every response written to a client is framed.
    pub fn build(mut self) -> Response {
        self.headers
            .entry("Content-Length".to_string())
            .or_insert_with(|| self.body.len().to_string());

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// A plain 400 response for requests the gate could not parse.
    pub fn bad_request() -> Self {
        ResponseBuilder::new(StatusCode::BAD_REQUEST)
            .header("Content-Type", "text/plain")
            .body(b"400 Bad Request".to_vec())
            .build()
    }
}
