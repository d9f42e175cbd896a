//! Module with the interface between the server and the application.
//!
//! An [`Application`] is called with the [`Environ`] of a request and a
//! [`StartResponse`] to start the response. It returns the response [`Body`].

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::{fmt, mem};

use log::error;

use crate::buffer::{Buffer, FileWrapper, OverflowableBuffer};
use crate::header::HeaderList;
use crate::task::Task;
use crate::{parser, AppError, Config, Error};

/// Application handling requests.
///
/// It's implemented for all functions with the correct signature.
///
/// # Examples
///
/// ```
/// use hearth::{AppError, Body, Environ, StartResponse};
///
/// fn hello(environ: Environ, start_response: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
///     let body = format!("Hello {}", environ.get("PATH_INFO").unwrap_or("world"));
///     start_response.start("200 OK", vec![
///         ("Content-Type".to_owned(), "text/plain".to_owned()),
///     ])?;
///     Ok(Body::from(body.into_bytes()))
/// }
/// # fn assert_app<A: hearth::Application>(_: A) {}
/// # assert_app(hello);
/// ```
pub trait Application: Send + Sync + 'static {
    /// Handle a request.
    ///
    /// The application must call [`StartResponse::start`] before it returns,
    /// or before the first chunk of the body is produced.
    fn call(
        &self,
        environ: Environ,
        start_response: &mut StartResponse<'_, '_>,
    ) -> Result<Body, AppError>;
}

impl<F> Application for F
where
    F: Fn(Environ, &mut StartResponse<'_, '_>) -> Result<Body, AppError> + Send + Sync + 'static,
{
    fn call(
        &self,
        environ: Environ,
        start_response: &mut StartResponse<'_, '_>,
    ) -> Result<Body, AppError> {
        (self)(environ, start_response)
    }
}

/// Environment of a request.
///
/// Contains the CGI variables, e.g. `REQUEST_METHOD` or `PATH_INFO`, all
/// request headers as `HTTP_*` variables and the request body as
/// [`Environ::input`].
pub struct Environ {
    vars: BTreeMap<String, String>,
    url_scheme: String,
    input: Input,
}

impl Environ {
    /// Version of the interface, `(1, 0)`.
    pub const VERSION: (u8, u8) = (1, 0);

    /// Create the environment for `request`, received from `peer`.
    ///
    /// Takes the body from `request`.
    pub(crate) fn new(
        request: &mut parser::Request,
        peer: SocketAddr,
        server_name: &str,
        server_port: u16,
        config: &Config,
    ) -> Result<Environ, Error> {
        let mut headers = request.headers().clone();
        let mut url_scheme = request.url_scheme().to_owned();
        if let Some(proto) = headers.get("X_FORWARDED_PROTO") {
            if config.is_trusted_proxy(peer.ip()) {
                let proto = proto.to_ascii_lowercase();
                if proto != "http" && proto != "https" {
                    return Err(Error::InvalidForwardedProto(proto));
                }
                url_scheme = proto;
                let _ = headers.remove("X_FORWARDED_PROTO");
            }
        }

        let url_prefix = &config.url_prefix;
        let mut path = request.path().to_owned();
        if path.starts_with('/') {
            path = format!("/{}", path.trim_start_matches('/'));
        }
        if !url_prefix.is_empty() {
            if path == *url_prefix {
                path = String::new();
            } else if path.starts_with(url_prefix.as_str())
                && path.as_bytes().get(url_prefix.len()) == Some(&b'/')
            {
                path = path[url_prefix.len()..].to_owned();
            }
        }

        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            let _ = vars.insert(key.to_owned(), value);
        };
        set("REQUEST_METHOD", request.command().to_owned());
        set("SERVER_PORT", server_port.to_string());
        set("SERVER_NAME", server_name.to_owned());
        set("SERVER_SOFTWARE", config.ident.clone());
        set("SERVER_PROTOCOL", request.version().as_str().to_owned());
        set("SCRIPT_NAME", url_prefix.clone());
        set("PATH_INFO", path);
        set("QUERY_STRING", request.query().to_owned());
        set("REMOTE_ADDR", peer.ip().to_string());
        // No reverse DNS lookup is done, the address is allowed here.
        set("REMOTE_HOST", peer.ip().to_string());
        set("REMOTE_PORT", peer.port().to_string());

        for (name, value) in headers {
            let key = match name.as_str() {
                "CONTENT_TYPE" | "CONTENT_LENGTH" => name,
                _ => format!("HTTP_{name}"),
            };
            if !vars.contains_key(&key) {
                let _ = vars.insert(key, value);
            }
        }

        Ok(Environ {
            vars,
            url_scheme,
            input: Input {
                body: request.take_body(),
            },
        })
    }

    /// Returns the value of the environment variable `key`, e.g.
    /// `REQUEST_METHOD` or `HTTP_HOST`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Returns all environment variables.
    pub const fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Set the environment variable `key` to `value`.
    ///
    /// Useful for middleware.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let _ = self.vars.insert(key.into(), value.into());
    }

    /// Returns the URL scheme, `http` or `https`.
    pub fn url_scheme(&self) -> &str {
        &self.url_scheme
    }

    /// Returns [`Environ::VERSION`].
    pub const fn version(&self) -> (u8, u8) {
        Environ::VERSION
    }

    /// Always `true`, the application is called from multiple threads.
    pub const fn multithread(&self) -> bool {
        true
    }

    /// Always `false`.
    pub const fn multiprocess(&self) -> bool {
        false
    }

    /// Always `false`.
    pub const fn run_once(&self) -> bool {
        false
    }

    /// Always `true`, [`Environ::input`] returns end of file after the body
    /// is read.
    pub const fn input_terminated(&self) -> bool {
        true
    }

    /// Returns the request body.
    pub fn input(&mut self) -> &mut Input {
        &mut self.input
    }

    /// Take the request body, leaving an empty body behind.
    pub fn take_input(&mut self) -> Input {
        mem::replace(&mut self.input, Input { body: None })
    }

    /// Returns a writer for error output, each line written is logged.
    pub fn errors(&self) -> Errors {
        Errors { line: Vec::new() }
    }

    /// Wrap a file to be returned as response body, see [`FileWrapper`].
    pub fn file_wrapper<F>(&self, file: F, block_size: Option<usize>) -> FileWrapper
    where
        F: Read + io::Seek + Send + 'static,
    {
        match block_size {
            Some(block_size) => FileWrapper::with_block_size(file, block_size),
            None => FileWrapper::new(file),
        }
    }
}

impl fmt::Debug for Environ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ")
            .field("vars", &self.vars)
            .field("url_scheme", &self.url_scheme)
            .finish()
    }
}

/// Request body, see [`Environ::input`].
#[derive(Debug)]
pub struct Input {
    body: Option<OverflowableBuffer>,
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.body.as_mut() {
            Some(body) => body.read(buf),
            None => Ok(0),
        }
    }
}

/// Error output of the application, see [`Environ::errors`].
///
/// Every line is logged as error using the `hearth::app` target.
#[derive(Debug)]
pub struct Errors {
    /// Incomplete line.
    line: Vec<u8>,
}

impl Errors {
    fn log_line(&mut self, end: usize) {
        let line = String::from_utf8_lossy(&self.line[..end]);
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        error!(target: "hearth::app", "{line}");
        let _ = self.line.drain(..end);
    }
}

impl Write for Errors {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(i) = self.line.iter().position(|b| *b == b'\n') {
            self.log_line(i + 1);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.log_line(self.line.len());
        }
        Ok(())
    }
}

impl Drop for Errors {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Response body returned by an [`Application`].
pub enum Body {
    /// Body produced in chunks.
    Chunks(Box<dyn BodyIter>),
    /// Body read from a file.
    File(FileWrapper),
}

impl Body {
    /// Empty body.
    pub fn empty() -> Body {
        Body::from(Vec::<Vec<u8>>::new())
    }

    /// Body produced by `iter`, which doesn't know the number of chunks
    /// upfront.
    pub fn stream<I>(iter: I) -> Body
    where
        I: Iterator<Item = Result<Vec<u8>, AppError>> + Send + 'static,
    {
        Body::Chunks(Box::new(Stream(iter)))
    }

    /// Body produced by a custom [`BodyIter`].
    pub fn iter<B: BodyIter + 'static>(body: B) -> Body {
        Body::Chunks(Box::new(body))
    }
}

impl From<Vec<Vec<u8>>> for Body {
    fn from(chunks: Vec<Vec<u8>>) -> Body {
        let count = chunks.len();
        Body::Chunks(Box::new(Chunks {
            chunks: chunks.into(),
            count,
        }))
    }
}

impl From<Vec<u8>> for Body {
    fn from(chunk: Vec<u8>) -> Body {
        Body::from(vec![chunk])
    }
}

impl From<&'static str> for Body {
    fn from(chunk: &'static str) -> Body {
        Body::from(chunk.as_bytes().to_vec())
    }
}

impl From<FileWrapper> for Body {
    fn from(file: FileWrapper) -> Body {
        Body::File(file)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Chunks(iter) => f
                .debug_struct("Body::Chunks")
                .field("chunk_count", &iter.chunk_count())
                .finish(),
            Body::File(file) => f.debug_tuple("Body::File").field(file).finish(),
        }
    }
}

/// Iterator over the chunks of a response [`Body`].
pub trait BodyIter: Send {
    /// Returns the next chunk, or `None` at the end of the body.
    fn next_chunk(&mut self) -> Option<Result<Vec<u8>, AppError>>;

    /// Returns the total number of chunks, if known.
    ///
    /// If the body consists of a single chunk and the application didn't set
    /// a `Content-Length` header, the length of the chunk is used.
    fn chunk_count(&self) -> Option<usize> {
        None
    }

    /// Release any resources held by the body.
    ///
    /// Always called once the body is no longer used, even if not all chunks
    /// were consumed (e.g. due to an error).
    fn close(&mut self) {}
}

/// Body with a known number of chunks.
struct Chunks {
    chunks: VecDeque<Vec<u8>>,
    count: usize,
}

impl BodyIter for Chunks {
    fn next_chunk(&mut self) -> Option<Result<Vec<u8>, AppError>> {
        self.chunks.pop_front().map(Ok)
    }

    fn chunk_count(&self) -> Option<usize> {
        Some(self.count)
    }
}

/// Body with an unknown number of chunks.
struct Stream<I>(I);

impl<I> BodyIter for Stream<I>
where
    I: Iterator<Item = Result<Vec<u8>, AppError>> + Send,
{
    fn next_chunk(&mut self) -> Option<Result<Vec<u8>, AppError>> {
        self.0.next()
    }
}

impl BodyIter for FileWrapper {
    fn next_chunk(&mut self) -> Option<Result<Vec<u8>, AppError>> {
        self.next_block().map_err(Into::into).transpose()
    }

    fn close(&mut self) {
        if let Err(err) = Buffer::close(self) {
            error!(error:% = err; "failed to close file body");
        }
    }
}

/// Start the response to a request.
///
/// Passed to [`Application::call`].
pub struct StartResponse<'t, 'c> {
    task: &'t mut Task<'c>,
}

impl<'t, 'c> StartResponse<'t, 'c> {
    pub(crate) fn new(task: &'t mut Task<'c>) -> StartResponse<'t, 'c> {
        StartResponse { task }
    }

    /// Start the response with `status`, e.g. `200 OK`, and `headers`.
    ///
    /// Header names and values may not contain a carriage return or line
    /// feed and the application may not set a hop-by-hop header, such as
    /// `Connection`, these are determined by the server.
    ///
    /// Returns an error if called a second time, use
    /// [`StartResponse::start_after_error`] to replace the response after an
    /// error.
    pub fn start<S>(&mut self, status: S, headers: HeaderList) -> Result<(), Error>
    where
        S: Into<String>,
    {
        self.task.start_response(status.into(), headers, None)
    }

    /// Replace the started response with an error response.
    ///
    /// If the response header was already send to the client the response
    /// can't be replaced and [`Error::AlreadySent`] is returned, containing
    /// `error`. Otherwise the previously set headers are discarded.
    pub fn start_after_error<S>(
        &mut self,
        status: S,
        headers: HeaderList,
        error: AppError,
    ) -> Result<(), Error>
    where
        S: Into<String>,
    {
        self.task.start_response(status.into(), headers, Some(error))
    }

    /// Write `data` as part of the response body immediately.
    ///
    /// Prefer returning the body from the application.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.task.write(data)
    }
}

impl<'t, 'c> fmt::Debug for StartResponse<'t, 'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartResponse").finish()
    }
}
