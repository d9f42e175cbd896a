//! HTTP request parser.
//!
//! A [`Request`] is fed bytes as they're read from the connection using
//! [`Request::received`], which returns the number of bytes it consumed. Once
//! [`Request::is_completed`] returns `true` the request (including the body)
//! is ready to be handled, or [`Request::error`] holds the reason it can't be
//! handled.

use std::collections::BTreeMap;
use std::mem;

use httparse::EMPTY_HEADER;
use percent_encoding::percent_decode_str;

use crate::buffer::{Buffer, OverflowableBuffer};
use crate::{Config, RequestError, Version};

/// Maximum number of headers parsed from a single request.
pub const MAX_HEADERS: usize = 100;

/// Maximum size of a chunk-size or trailer line in a chunked request body.
const MAX_CONTROL_LINE: usize = 4096;

/// HTTP request, both while it's being received and once it's complete.
#[derive(Debug)]
pub struct Request {
    /// Limits, copied from [`Config`].
    max_header: u64,
    max_body: u64,
    inbuf_overflow: u64,

    /// Bytes of the request head received so far.
    header_plus: Vec<u8>,
    body_bytes_received: u64,
    body: Option<BodyReceiver>,

    completed: bool,
    empty: bool,
    error: Option<RequestError>,
    expect_continue: bool,
    headers_finished: bool,
    connection_close: bool,
    chunked: bool,
    content_length: u64,

    version: Version,
    command: String,
    path: String,
    query: String,
    url_scheme: String,
    /// Header names are upper case with `-` replaced by `_`, e.g.
    /// `CONTENT_TYPE`.
    headers: BTreeMap<String, String>,
}

impl Request {
    /// Create a new request, ready to receive bytes.
    pub fn new(config: &Config) -> Request {
        Request {
            max_header: config.max_request_header_size,
            max_body: config.max_request_body_size,
            inbuf_overflow: config.inbuf_overflow,
            header_plus: Vec::new(),
            body_bytes_received: 0,
            body: None,
            completed: false,
            empty: false,
            error: None,
            expect_continue: false,
            headers_finished: false,
            connection_close: false,
            chunked: false,
            content_length: 0,
            version: Version::Http10,
            command: String::new(),
            path: String::new(),
            query: String::new(),
            url_scheme: config.url_scheme.clone(),
            headers: BTreeMap::new(),
        }
    }

    /// Create a completed request that only carries `error`.
    ///
    /// The `version` and `Connection` header of the original request are
    /// copied so the error response follows the same connection handling.
    pub(crate) fn with_error(
        config: &Config,
        error: RequestError,
        version: Version,
        connection: Option<String>,
    ) -> Request {
        let mut request = Request::new(config);
        request.error = Some(error);
        request.version = version;
        request.command = "GET".to_owned();
        request.path = "/".to_owned();
        if let Some(connection) = connection {
            let _ = request.headers.insert("CONNECTION".to_owned(), connection);
        }
        request.headers_finished = true;
        request.completed = true;
        request
    }

    /// Receive `data`, returns the number of bytes consumed.
    ///
    /// Once the request is completed no more bytes are consumed, the remaining
    /// bytes belong to the next (pipelined) request.
    pub fn received(&mut self, data: &[u8]) -> usize {
        if self.completed {
            return 0;
        }

        let body = match self.body.as_mut() {
            Some(body) => body,
            None => return self.received_header(data),
        };

        let consumed = body.received(data);
        let error = body.take_error();
        let done = body.is_completed();
        let body_len = body.len();
        self.body_bytes_received += consumed as u64;

        if self.body_bytes_received >= self.max_body {
            // Only possible for chunked bodies, `Content-Length` is checked
            // once the header is parsed.
            self.error = Some(RequestError::RequestEntityTooLarge(format!(
                "exceeds max_body of {}",
                self.max_body
            )));
            self.completed = true;
        } else if let Some(error) = error {
            self.error = Some(error);
            self.completed = true;
        } else if done {
            self.completed = true;
            if self.chunked {
                // The body is no longer chunked for the application, but has a
                // known length.
                let _ = self
                    .headers
                    .insert("CONTENT_LENGTH".to_owned(), body_len.to_string());
            }
        }
        consumed
    }

    fn received_header(&mut self, data: &[u8]) -> usize {
        let old_len = self.header_plus.len();
        self.header_plus.extend_from_slice(data);
        let search_start = old_len.saturating_sub(3);
        let end = find_double_newline(&self.header_plus[search_start..]).map(|i| i + search_start);

        let (consumed, header_size) = match end {
            Some(end) => (end - old_len, end),
            None => (data.len(), self.header_plus.len()),
        };

        if header_size as u64 >= self.max_header {
            self.command = "GET".to_owned();
            self.path = "/".to_owned();
            self.error = Some(RequestError::RequestHeaderFieldsTooLarge(format!(
                "exceeds max_header of {}",
                self.max_header
            )));
            self.header_plus = Vec::new();
            self.completed = true;
            return consumed;
        }

        let end = match end {
            Some(end) => end,
            // Header not complete yet.
            None => return consumed,
        };

        let mut header_plus = mem::take(&mut self.header_plus);
        header_plus.truncate(end);
        // Leading blank lines are allowed, e.g. an extra CRLF send by a client
        // after a previous (pipelined) request, RFC 7230 section 3.5.
        let start = header_plus
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(header_plus.len());
        if start == header_plus.len() {
            self.empty = true;
            self.completed = true;
        } else if let Err(error) = self.parse_header(&header_plus[start..]) {
            self.error = Some(error);
            self.completed = true;
        } else {
            if self.body.is_none() {
                // No `Content-Length` and no chunked body.
                self.completed = true;
            }
            if self.content_length > 0 && self.content_length >= self.max_body {
                self.error = Some(RequestError::RequestEntityTooLarge(format!(
                    "exceeds max_body of {}",
                    self.max_body
                )));
                self.completed = true;
            }
        }
        self.headers_finished = true;
        consumed
    }

    /// Parse the request head, `head` includes the final CRLFCRLF.
    fn parse_header(&mut self, head: &[u8]) -> Result<(), RequestError> {
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(RequestError::BadRequest("incomplete request".to_owned()))
            }
            Err(err) => return Err(RequestError::BadRequest(err.to_string())),
        }

        // A complete parse sets the method, path and version.
        self.command = req.method.unwrap_or_default().to_ascii_uppercase();
        self.version = Version::from_minor(req.version.unwrap_or_default());
        let (scheme, path, query) = split_uri(req.path.unwrap_or_default())?;
        if let Some(scheme) = scheme {
            self.url_scheme = scheme;
        }
        self.path = path;
        self.query = query;

        for header in req.headers.iter() {
            let name = header.name.trim().to_ascii_uppercase();
            if name.contains('_') {
                // Would be indistinguishable from the `-` variant, which
                // allows a client to spoof headers set by a proxy.
                continue;
            }
            let name = name.replace('-', "_");
            let value = latin1(header.value);
            let value = value.trim();
            match self.headers.get_mut(&name) {
                Some(existing) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => {
                    let _ = self.headers.insert(name, value.to_owned());
                }
            }
        }

        let connection = self
            .headers
            .get("CONNECTION")
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or_default();
        match self.version {
            Version::Http10 => {
                if connection != "keep-alive" {
                    self.connection_close = true;
                }
            }
            Version::Http11 => {
                if let Some(te) = self.headers.remove("TRANSFER_ENCODING") {
                    let encodings: Vec<String> = te
                        .split(',')
                        .map(|e| e.trim().to_ascii_lowercase())
                        .filter(|e| !e.is_empty())
                        .collect();
                    // Of the transfer codings in RFC 7230 section 4 only
                    // chunked is supported.
                    if let Some(encoding) = encodings.iter().find(|e| *e != "chunked") {
                        return Err(RequestError::NotImplemented(format!(
                            "transfer-encoding {encoding} not supported"
                        )));
                    }
                    if !encodings.is_empty() {
                        if self.headers.contains_key("CONTENT_LENGTH") {
                            return Err(RequestError::BadRequest(
                                "Content-Length and Transfer-Encoding both present".to_owned(),
                            ));
                        }
                        self.chunked = true;
                        let buf = OverflowableBuffer::new(self.inbuf_overflow);
                        self.body = Some(BodyReceiver::Chunked(ChunkedReceiver::new(buf)));
                    }
                }

                let expect = self.headers.get("EXPECT").map(|e| e.to_ascii_lowercase());
                self.expect_continue = expect.as_deref() == Some("100-continue");
                if connection == "close" {
                    self.connection_close = true;
                }
            }
        }

        if !self.chunked {
            let content_length = match self.headers.get("CONTENT_LENGTH") {
                Some(value) => parse_content_length(value).ok_or_else(|| {
                    RequestError::BadRequest("Content-Length is invalid".to_owned())
                })?,
                None => 0,
            };
            self.content_length = content_length;
            if content_length > 0 {
                let buf = OverflowableBuffer::new(self.inbuf_overflow);
                self.body = Some(BodyReceiver::Fixed {
                    remain: content_length,
                    buf,
                });
            }
        }
        Ok(())
    }

    /// Returns `true` if the request, including the body, is completely
    /// received (or an error occurred).
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Returns `true` if the request consisted of only blank lines.
    pub const fn is_empty(&self) -> bool {
        self.empty
    }

    /// Returns the error that occurred while receiving the request, if any.
    pub const fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    /// Returns `true` if the client expects a `100 Continue` response before
    /// sending the body.
    pub const fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    /// Mark the `100 Continue` response as send.
    pub(crate) fn continue_sent(&mut self) {
        self.expect_continue = false;
    }

    /// Returns `true` if the request head is completely received.
    pub const fn headers_finished(&self) -> bool {
        self.headers_finished
    }

    /// Returns `true` if the connection must be closed after responding to
    /// this request.
    pub const fn connection_close(&self) -> bool {
        self.connection_close
    }

    /// Returns `true` if the request body was chunked encoded.
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Returns the value of the `Content-Length` header, or 0.
    pub const fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Returns the HTTP version of the request.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the request method, in upper case.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the percent-decoded path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query, without the `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Returns the URL scheme, from the request URI or the configured
    /// default.
    pub fn url_scheme(&self) -> &str {
        &self.url_scheme
    }

    /// Returns all request headers.
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Returns the value of header `name`, e.g. `CONTENT_TYPE`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Take the request body, leaves an empty body in its place.
    pub(crate) fn take_body(&mut self) -> Option<OverflowableBuffer> {
        match self.body.take()? {
            BodyReceiver::Fixed { buf, .. } => Some(buf),
            BodyReceiver::Chunked(chunked) => Some(chunked.buf),
        }
    }

    /// Release the resources held by the request, i.e. the body buffer.
    pub fn close(&mut self) {
        if let Some(mut body) = self.take_body() {
            // Closing in-memory or temporary file buffers doesn't fail in a way
            // the caller can act upon.
            let _ = body.close();
        }
    }

    /// Read the complete body, only used in tests.
    #[cfg(test)]
    pub(crate) fn body_bytes(&mut self) -> Vec<u8> {
        use std::io::Read;
        let mut bytes = Vec::new();
        if let Some(mut body) = self.take_body() {
            let _ = body.read_to_end(&mut bytes).unwrap();
        }
        bytes
    }
}

#[derive(Debug)]
enum BodyReceiver {
    /// Body with a `Content-Length`.
    Fixed { remain: u64, buf: OverflowableBuffer },
    Chunked(ChunkedReceiver),
}

impl BodyReceiver {
    fn received(&mut self, data: &[u8]) -> usize {
        match self {
            BodyReceiver::Fixed { remain, buf } => {
                let n = (*remain).min(data.len() as u64) as usize;
                if buf.append(&data[..n]).is_err() {
                    // Treated as if the rest of the body is lost, the request
                    // can't be handled anyway.
                    *remain = 0;
                    return n;
                }
                *remain -= n as u64;
                n
            }
            BodyReceiver::Chunked(chunked) => chunked.received(data),
        }
    }

    fn take_error(&mut self) -> Option<RequestError> {
        match self {
            BodyReceiver::Fixed { .. } => None,
            BodyReceiver::Chunked(chunked) => chunked.error.take(),
        }
    }

    fn is_completed(&self) -> bool {
        match self {
            BodyReceiver::Fixed { remain, .. } => *remain == 0,
            BodyReceiver::Chunked(chunked) => chunked.completed,
        }
    }

    fn len(&self) -> u64 {
        match self {
            BodyReceiver::Fixed { buf, .. } => buf.len(),
            BodyReceiver::Chunked(chunked) => chunked.buf.len(),
        }
    }
}

/// Receiver for a chunked encoded body, RFC 7230 section 4.1.
#[derive(Debug)]
struct ChunkedReceiver {
    state: ChunkState,
    /// Partial chunk-size, chunk end or trailer line.
    control: Vec<u8>,
    buf: OverflowableBuffer,
    completed: bool,
    error: Option<RequestError>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChunkState {
    /// Reading the chunk-size line.
    Size,
    /// Reading the chunk data, bytes left in the chunk.
    Data(u64),
    /// Reading the CRLF after the chunk data.
    DataEnd,
    /// Reading the trailer, after the last chunk.
    Trailer,
}

impl ChunkedReceiver {
    const fn new(buf: OverflowableBuffer) -> ChunkedReceiver {
        ChunkedReceiver {
            state: ChunkState::Size,
            control: Vec::new(),
            buf,
            completed: false,
            error: None,
        }
    }

    fn received(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < data.len() && !self.completed && self.error.is_none() {
            let data = &data[consumed..];
            consumed += match self.state {
                ChunkState::Size | ChunkState::Trailer => self.control_line(data),
                ChunkState::Data(remain) => {
                    let n = remain.min(data.len() as u64) as usize;
                    if let Err(err) = self.buf.append(&data[..n]) {
                        self.error = Some(RequestError::InternalServerError(format!(
                            "failed to buffer request body: {err}"
                        )));
                    }
                    let remain = remain - n as u64;
                    self.state = if remain == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remain)
                    };
                    n
                }
                ChunkState::DataEnd => {
                    let n = (2 - self.control.len()).min(data.len());
                    self.control.extend_from_slice(&data[..n]);
                    if self.control.len() == 2 {
                        if self.control != b"\r\n" {
                            self.error = Some(RequestError::BadRequest(
                                "chunk not properly terminated".to_owned(),
                            ));
                        }
                        self.control.clear();
                        self.state = ChunkState::Size;
                    }
                    n
                }
            };
        }
        consumed
    }

    /// Read (part of) a chunk-size or trailer line.
    fn control_line(&mut self, data: &[u8]) -> usize {
        let (n, complete) = match data.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (data.len(), false),
        };
        self.control.extend_from_slice(&data[..n]);
        if self.control.len() > MAX_CONTROL_LINE {
            self.error = Some(RequestError::BadRequest(
                "chunk control line too long".to_owned(),
            ));
            return n;
        }
        if !complete {
            return n;
        }

        let line = mem::take(&mut self.control);
        match self.state {
            ChunkState::Size => match httparse::parse_chunk_size(&line) {
                Ok(httparse::Status::Complete((_, 0))) => self.state = ChunkState::Trailer,
                Ok(httparse::Status::Complete((_, size))) => self.state = ChunkState::Data(size),
                Ok(httparse::Status::Partial) | Err(_) => {
                    self.error = Some(RequestError::BadRequest("invalid chunk size".to_owned()));
                }
            },
            ChunkState::Trailer => {
                // Trailer fields are ignored, an empty line ends the body.
                if line.iter().all(u8::is_ascii_whitespace) {
                    self.completed = true;
                }
            }
            ChunkState::Data(..) | ChunkState::DataEnd => unreachable!(),
        }
        n
    }
}

/// Returns the index *after* the first CRLFCRLF in `buf`, if any.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a `Content-Length` value, only plain digits are allowed.
fn parse_content_length(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Split a request target into (scheme, percent-decoded path, query).
///
/// Both the origin-form (`/path?query`) and the absolute-form
/// (`http://host/path?query`) are supported. Any fragment is dropped.
fn split_uri(uri: &str) -> Result<(Option<String>, String, String), RequestError> {
    let (scheme, rest) = if uri.starts_with('/') || uri == "*" {
        (None, uri)
    } else if let Some(idx) = uri.find("://") {
        let scheme = &uri[..idx];
        if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(RequestError::BadRequest(format!("invalid URI: {uri}")));
        }
        let after = &uri[idx + 3..];
        // Skip the authority, the `Host` header is used instead.
        let path_start = after.find(|c| matches!(c, '/' | '?' | '#')).unwrap_or(after.len());
        (Some(scheme.to_ascii_lowercase()), &after[path_start..])
    } else {
        return Err(RequestError::BadRequest(format!("invalid URI: {uri}")));
    };

    let rest = match rest.find('#') {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    let (path, query) = match rest.find('?') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };
    let path = if path.is_empty() { "/" } else { path };
    let path = latin1(&percent_decode_str(path).collect::<Vec<u8>>());
    Ok((scheme, path, query.to_owned()))
}

/// Map bytes to a string as ISO-8859-1, which maps every byte to a `char`.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| char::from(*b)).collect()
}
