//! Module with [`Task`], responding to a single request.
//!
//! A task is created by the [`Channel`] for each completely received request.
//! There are two kinds of tasks, see [`TaskKind`]: one calling the
//! [`Application`] and one rendering the error that occurred while receiving
//! the request.
//!
//! [`Application`]: crate::Application

use std::mem;
use std::time::SystemTime;

use log::{debug, warn};

use crate::app::{Body, BodyIter, Environ, StartResponse};
use crate::buffer::FileWrapper;
use crate::channel::{Channel, Payload};
use crate::header::{self, cmp_lower_case, contains_crlf, HeaderList};
use crate::{parser, AppError, Error, RequestError, Version};

/// The kind of [`Task`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Call the application.
    Normal,
    /// Render the error of the request, the application is not called.
    Error,
}

/// Task responding to a single request.
///
/// Lifecycle: the response is started by [`Task::start_response`] (directly,
/// or by the application using [`StartResponse`]), then the body is written
/// using [`Task::write`] and finally [`Task::finish`] completes the response.
/// [`Task::service`] runs the entire lifecycle.
///
/// The response header is written along with the first write, see
/// [`Task::build_response_header`].
#[derive(Debug)]
pub struct Task<'c> {
    channel: &'c Channel,
    request: parser::Request,
    kind: TaskKind,
    status: String,
    /// Headers in the order the application set them.
    response_headers: HeaderList,
    version: Version,
    close_on_finish: bool,
    /// Value of the `Content-Length` header, or determined from the body.
    content_length: Option<u64>,
    content_bytes_written: u64,
    chunked_response: bool,
    wrote_header: bool,
    /// Set once the response is started, required before writing.
    complete: bool,
    finished: bool,
    start_time: SystemTime,
    logged_length_mismatch: bool,
    logged_write_no_body: bool,
}

impl<'c> Task<'c> {
    /// Create a task responding to `request` on `channel`.
    ///
    /// If the request has an error, see [`parser::Request::error`], the task
    /// will be an [`TaskKind::Error`] task.
    pub fn new(channel: &'c Channel, request: parser::Request) -> Task<'c> {
        let kind = if request.error().is_some() {
            TaskKind::Error
        } else {
            TaskKind::Normal
        };
        let version = request.version();
        Task {
            channel,
            request,
            kind,
            status: "200 OK".to_owned(),
            response_headers: Vec::new(),
            version,
            close_on_finish: false,
            content_length: None,
            content_bytes_written: 0,
            chunked_response: false,
            wrote_header: false,
            complete: false,
            finished: false,
            start_time: SystemTime::now(),
            logged_length_mismatch: false,
            logged_write_no_body: false,
        }
    }

    /// Returns the kind of task.
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns the request the task is responding to.
    pub const fn request(&self) -> &parser::Request {
        &self.request
    }

    /// Returns the response status.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Returns the response headers.
    ///
    /// After the response header is build this includes the headers added by
    /// the server, e.g. `Date`.
    pub fn response_headers(&self) -> &[(String, String)] {
        &self.response_headers
    }

    /// Returns the HTTP version of the response.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns `true` if the connection will be closed after the response.
    pub const fn close_on_finish(&self) -> bool {
        self.close_on_finish
    }

    /// Close the connection after the response.
    pub fn set_close_on_finish(&mut self) {
        self.close_on_finish = true;
    }

    /// Returns the length of the response body, if known.
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Returns the number of body bytes written so far.
    pub const fn content_bytes_written(&self) -> u64 {
        self.content_bytes_written
    }

    /// Returns `true` if the response body uses chunked encoding.
    pub const fn chunked_response(&self) -> bool {
        self.chunked_response
    }

    /// Returns `true` if the response header was written.
    pub const fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    /// Returns `true` if the response was started.
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Run the task: start, execute and finish it.
    ///
    /// I/O errors close the connection after the response, they're only
    /// returned if socket errors are logged (see
    /// [`Config::log_socket_errors`]).
    ///
    /// [`Config::log_socket_errors`]: crate::Config::log_socket_errors
    pub fn service(&mut self) -> Result<(), Error> {
        self.start();
        match self.execute().and_then(|()| self.finish()) {
            Ok(()) => Ok(()),
            Err(Error::Io(err)) => {
                self.close_on_finish = true;
                if self.channel.context().config.log_socket_errors {
                    Err(Error::Io(err))
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Mark the start of the task, the start time is used in the `Date`
    /// header.
    pub fn start(&mut self) {
        self.start_time = SystemTime::now();
    }

    /// Execute the task, i.e. call the application or write the error
    /// response.
    pub fn execute(&mut self) -> Result<(), Error> {
        match self.kind {
            TaskKind::Normal => self.execute_app(),
            TaskKind::Error => self.execute_error(),
        }
    }

    fn execute_app(&mut self) -> Result<(), Error> {
        let channel = self.channel;
        let context = channel.context();
        let environ = Environ::new(
            &mut self.request,
            channel.addr(),
            &context.server_name,
            context.effective_port,
            &context.config,
        )?;

        let body = context
            .application
            .call(environ, &mut StartResponse::new(self))
            .map_err(application_error)?;
        match body {
            Body::File(file) => self.write_file(file),
            Body::Chunks(mut body) => {
                let result = self.write_body(&mut *body);
                body.close();
                result
            }
        }
    }

    /// Write a body consisting of a file.
    ///
    /// If possible the file is given to the channel to send as a whole,
    /// otherwise it's read in blocks.
    fn write_file(&mut self, mut file: FileWrapper) -> Result<(), Error> {
        let size = match file.prepare(self.content_length) {
            Ok(size) if size != 0 => size,
            Ok(_) => {
                let result = self.write_body(&mut file);
                file.close();
                return result;
            }
            Err(err) => {
                debug!(error:% = err; "can't determine size of file body, reading blocks");
                let result = self.write_body(&mut file);
                file.close();
                return result;
            }
        };

        if self.content_length != Some(size) {
            if self.content_length.is_some() {
                // The application set the wrong length, use the real size.
                self.remove_content_length_header();
            }
            self.content_length = Some(size);
        }
        self.write(b"")?;
        if self.sends_body() {
            let _ = self.channel.write_soon(Payload::File(file))?;
        } else {
            file.close();
        }
        Ok(())
    }

    /// Write all chunks of `body`.
    fn write_body(&mut self, body: &mut dyn BodyIter) -> Result<(), Error> {
        let mut first_chunk = true;
        while let Some(chunk) = body.next_chunk() {
            let chunk = chunk.map_err(application_error)?;
            if first_chunk {
                first_chunk = false;
                // A single non-empty chunk is the entire body, so we can set
                // a `Content-Length` header. The application may only start
                // the response when producing the first chunk.
                if self.content_length.is_none()
                    && body.chunk_count() == Some(1)
                    && !chunk.is_empty()
                {
                    self.content_length = Some(chunk.len() as u64);
                }
            }
            // The header is only written once the first non-empty chunk is
            // produced.
            if !chunk.is_empty() {
                self.write(&chunk)?;
            }
        }

        if let Some(content_length) = self.content_length {
            if self.content_bytes_written != content_length && self.request.command() != "HEAD" {
                if !self.logged_length_mismatch {
                    warn!(
                        content_length = content_length,
                        written = self.content_bytes_written;
                        "application returned a different number of bytes than specified by Content-Length header"
                    );
                    self.logged_length_mismatch = true;
                }
                self.close_on_finish = true;
            }
        }
        Ok(())
    }

    fn execute_error(&mut self) -> Result<(), Error> {
        let error = self.request.error().cloned().unwrap_or_else(|| {
            RequestError::InternalServerError("unknown request error".to_owned())
        });
        let body = error.response_body(&self.channel.context().config.ident);
        self.status = error.status();
        self.content_length = Some(body.len() as u64);
        self.response_headers.push((
            "Content-Length".to_owned(),
            itoa::Buffer::new().format(body.len()).to_owned(),
        ));
        self.response_headers
            .push(("Content-Type".to_owned(), "text/plain".to_owned()));
        match self.version {
            Version::Http11 => {
                // Keep-alive is the default, only need to repeat the client.
                if self.client_connection() == "close" {
                    self.response_headers
                        .push(("Connection".to_owned(), "close".to_owned()));
                }
            }
            Version::Http10 => {
                self.response_headers
                    .push(("Connection".to_owned(), "close".to_owned()));
            }
        }
        // The request was malformed, we can't trust what comes after it.
        self.close_on_finish = true;
        self.complete = true;
        self.write(body.as_bytes())
    }

    /// Start the response with `status` and `headers`.
    ///
    /// If `error` is provided the response may be started again, replacing
    /// the previous status and headers. However if the header was already
    /// written this returns [`Error::AlreadySent`].
    pub fn start_response(
        &mut self,
        status: String,
        headers: HeaderList,
        error: Option<AppError>,
    ) -> Result<(), Error> {
        match error {
            Some(err) if self.wrote_header => return Err(Error::AlreadySent(err)),
            Some(_) => {
                self.response_headers.clear();
                self.content_length = None;
            }
            None if self.complete => return Err(Error::StartedTwice),
            None => {}
        }
        self.complete = true;

        if status.is_empty() || contains_crlf(&status) {
            return Err(Error::InvalidStatus(status));
        }
        self.status = status;

        for (name, value) in &headers {
            if contains_crlf(name) {
                return Err(Error::InvalidHeaderName(name.clone()));
            } else if contains_crlf(value) {
                return Err(Error::InvalidHeaderValue(name.clone()));
            } else if cmp_lower_case("content-length", name) {
                let length = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidContentLength(value.clone()))?;
                self.content_length = Some(length);
            } else if header::is_hop_by_hop(name) {
                return Err(Error::HopByHopHeader(name.clone()));
            }
        }
        self.response_headers.extend(headers);
        Ok(())
    }

    /// Returns `true` if the status allows a body, i.e. not 1xx, 204 or 304.
    fn status_allows_body(&self) -> bool {
        let code = self.status.get(..3).unwrap_or("");
        !(code.starts_with('1') || code == "204" || code == "304")
    }

    /// Returns `true` if the body is send to the client.
    fn sends_body(&self) -> bool {
        self.status_allows_body() && self.request.command() != "HEAD"
    }

    /// Returns the `Connection` header of the request, in lower case.
    fn client_connection(&self) -> String {
        self.request
            .header("CONNECTION")
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }

    /// Build the response header.
    ///
    /// Determines the framing of the body:
    ///  * with a known length: `Content-Length` is set,
    ///  * HTTP/1.1 without a length: the body is chunked and the connection
    ///    closed after the response,
    ///  * HTTP/1.0 without a length: the connection is closed after the body.
    ///
    /// HTTP/1.0 keep-alive is only honoured if the length is known.
    ///
    /// A `Date` and `Server` header are added if the application didn't set
    /// them. If the application did set a `Server` header a `Via` header is
    /// added instead. Headers are sorted by name, keeping the order of
    /// headers with the same name.
    pub fn build_response_header(&mut self) -> Vec<u8> {
        let connection = self.client_connection();
        let allows_body = self.status_allows_body();
        let mut content_length_header = false;
        let mut date_header = false;
        let mut server_header = false;
        let mut connection_header = false;

        let mut headers = Vec::with_capacity(self.response_headers.len() + 4);
        for (name, value) in mem::take(&mut self.response_headers) {
            if cmp_lower_case("content-length", &name) {
                if !allows_body {
                    continue;
                }
                content_length_header = true;
            } else if cmp_lower_case("date", &name) {
                date_header = true;
            } else if cmp_lower_case("server", &name) {
                server_header = true;
            } else if cmp_lower_case("connection", &name) {
                connection_header = true;
            }
            headers.push((name, value));
        }

        if !content_length_header && allows_body {
            if let Some(content_length) = self.content_length {
                let value = itoa::Buffer::new().format(content_length).to_owned();
                headers.push(("Content-Length".to_owned(), value));
                content_length_header = true;
            }
        }

        let mut close = false;
        match self.version {
            Version::Http10 => {
                if connection == "keep-alive"
                    && content_length_header
                    && !connection_header
                    && !self.close_on_finish
                {
                    headers.push(("Connection".to_owned(), "Keep-Alive".to_owned()));
                } else {
                    close = true;
                }
            }
            Version::Http11 => {
                if connection == "close" {
                    close = true;
                }
                if !content_length_header {
                    // RFC 7230 section 3.3: no body for 1xx, 204 and 304.
                    if self.sends_body() {
                        headers.push(("Transfer-Encoding".to_owned(), "chunked".to_owned()));
                        self.chunked_response = true;
                    }
                    close = true;
                }
                // Keep-alive is the default in HTTP/1.1, no header needed.
            }
        }
        if close {
            if !connection_header {
                headers.push(("Connection".to_owned(), "close".to_owned()));
            }
            self.close_on_finish = true;
        }

        let ident = &self.channel.context().config.ident;
        if server_header {
            headers.push(("Via".to_owned(), ident.clone()));
        } else {
            headers.push(("Server".to_owned(), ident.clone()));
        }
        if !date_header {
            headers.push(("Date".to_owned(), httpdate::fmt_http_date(self.start_time)));
        }

        // Stable sort, so headers with the same name keep their order.
        headers.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut header = Vec::with_capacity(256);
        header.extend_from_slice(self.version.as_str().as_bytes());
        header.push(b' ');
        header.extend_from_slice(self.status.as_bytes());
        header.extend_from_slice(b"\r\n");
        for (name, value) in &headers {
            header.extend_from_slice(name.as_bytes());
            header.extend_from_slice(b": ");
            header.extend_from_slice(value.as_bytes());
            header.extend_from_slice(b"\r\n");
        }
        header.extend_from_slice(b"\r\n");
        self.response_headers = headers;
        header
    }

    /// Write `data` as part of the response body.
    ///
    /// Writes the response header first if it wasn't written yet. Returns
    /// [`Error::NotStarted`] if the response wasn't started.
    ///
    /// Writing more bytes than specified by the `Content-Length` header doesn't
    /// truncate the body, but closes the connection after the response.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.complete {
            return Err(Error::NotStarted);
        }

        if !self.wrote_header {
            let header = self.build_response_header();
            let _ = self.channel.write_soon(Payload::Bytes(&header))?;
            self.wrote_header = true;
        }

        if data.is_empty() {
            return Ok(());
        }

        if !self.sends_body() {
            // Pretend we've written the bytes, but no body is allowed (or
            // wanted in case of a HEAD request).
            self.content_bytes_written += data.len() as u64;
            if !self.logged_write_no_body && self.request.command() != "HEAD" {
                debug!(status = self.status.as_str();
                    "application-written content was ignored due to HTTP response that may not contain a body"
                );
                self.logged_write_no_body = true;
            }
            return Ok(());
        }

        if self.chunked_response {
            let mut chunk = Vec::with_capacity(data.len() + 20);
            chunk.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
            chunk.extend_from_slice(data);
            chunk.extend_from_slice(b"\r\n");
            let _ = self.channel.write_soon(Payload::Bytes(&chunk))?;
        } else {
            if let Some(content_length) = self.content_length {
                let total = self.content_bytes_written + data.len() as u64;
                if total > content_length {
                    if !self.logged_length_mismatch {
                        warn!(
                            content_length = content_length,
                            written = total;
                            "application-written content exceeded the number of bytes specified by Content-Length header"
                        );
                        self.logged_length_mismatch = true;
                    }
                    // We can't truncate a body we already partially send, the
                    // client can't determine the end of it either.
                    self.close_on_finish = true;
                }
            }
            let _ = self.channel.write_soon(Payload::Bytes(data))?;
        }
        self.content_bytes_written += data.len() as u64;
        Ok(())
    }

    /// Finish the response.
    ///
    /// Writes the response header if it wasn't written yet and the last chunk
    /// if the body is chunked. Calling this more than once does nothing.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        if !self.wrote_header {
            self.write(b"")?;
        }
        if self.chunked_response {
            let _ = self.channel.write_soon(Payload::Bytes(b"0\r\n\r\n"))?;
        }
        self.finished = true;
        Ok(())
    }

    /// Remove all `Content-Length` headers set by the application.
    pub fn remove_content_length_header(&mut self) {
        self.response_headers
            .retain(|(name, _)| !cmp_lower_case("content-length", name));
    }
}

impl<'c> Drop for Task<'c> {
    fn drop(&mut self) {
        // Releases the request body, also if the task panicked.
        self.request.close();
    }
}

/// Convert an error returned by the application, keeping our own errors
/// (e.g. returned by [`StartResponse::start`]) as is.
fn application_error(err: AppError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => Error::Application(err),
    }
}
