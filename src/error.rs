//! Module containing the error types.

use std::any::Any;
use std::{fmt, io};

/// Error returned by an [`Application`].
///
/// [`Application`]: crate::Application
pub type AppError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error parsing, or otherwise failing to handle, an HTTP request.
///
/// These errors are rendered as a response by the error task, see
/// [`RequestError::response_body`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// The request is malformed.
    BadRequest(String),
    /// The request's header is larger than the configured maximum.
    RequestHeaderFieldsTooLarge(String),
    /// The request's body is larger than the configured maximum.
    RequestEntityTooLarge(String),
    /// Something unexpected happened while handling the request.
    InternalServerError(String),
    /// The request uses a feature we don't support, e.g. a transfer coding.
    NotImplemented(String),
}

impl RequestError {
    /// Returns the status code for the response.
    pub const fn status_code(&self) -> u16 {
        use RequestError::*;
        match self {
            BadRequest(..) => 400,
            RequestHeaderFieldsTooLarge(..) => 431,
            RequestEntityTooLarge(..) => 413,
            InternalServerError(..) => 500,
            NotImplemented(..) => 501,
        }
    }

    /// Returns the reason phrase for the response.
    pub const fn reason(&self) -> &'static str {
        use RequestError::*;
        match self {
            BadRequest(..) => "Bad Request",
            RequestHeaderFieldsTooLarge(..) => "Request Header Fields Too Large",
            RequestEntityTooLarge(..) => "Request Entity Too Large",
            InternalServerError(..) => "Internal Server Error",
            NotImplemented(..) => "Not Implemented",
        }
    }

    /// Returns the details about the error.
    pub fn detail(&self) -> &str {
        use RequestError::*;
        match self {
            BadRequest(detail)
            | RequestHeaderFieldsTooLarge(detail)
            | RequestEntityTooLarge(detail)
            | InternalServerError(detail)
            | NotImplemented(detail) => detail,
        }
    }

    /// Returns the status line, e.g. `400 Bad Request`.
    pub fn status(&self) -> String {
        format!("{} {}", self.status_code(), self.reason())
    }

    /// Returns the plain text body of the response.
    pub fn response_body(&self, ident: &str) -> String {
        format!(
            "{}\r\n\r\n{}\r\n\r\n(generated by {})",
            self.reason(),
            self.detail(),
            ident
        )
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason(), self.detail())
    }
}

impl std::error::Error for RequestError {}

/// Error returned while executing a task, i.e. responding to a request.
///
/// Most errors are mistakes made by the [`Application`], e.g. calling
/// [`StartResponse::start`] twice or providing a header with a line feed in
/// it. All of them are fatal for the current request.
///
/// [`Application`]: crate::Application
/// [`StartResponse::start`]: crate::StartResponse::start
#[derive(Debug)]
pub enum Error {
    /// Response body was written before the response was started.
    NotStarted,
    /// The response was started a second time without providing an error.
    StartedTwice,
    /// Invalid status, e.g. empty or containing a line feed.
    InvalidStatus(String),
    /// Header name contains a carriage return or line feed.
    InvalidHeaderName(String),
    /// Header value contains a carriage return or line feed.
    InvalidHeaderValue(String),
    /// Application set a hop-by-hop header, e.g. `Connection`.
    HopByHopHeader(String),
    /// Invalid `Content-Length` header value.
    InvalidContentLength(String),
    /// The response was restarted after an error, but the header was already
    /// written to the connection. The error can no longer be turned into a
    /// response.
    AlreadySent(AppError),
    /// The application returned an error.
    Application(AppError),
    /// The forwarded protocol set by a trusted proxy is not `http` or `https`.
    InvalidForwardedProto(String),
    /// The client disconnected.
    ClientDisconnected,
    /// I/O error, e.g. from reading the request body.
    Io(io::Error),
}

impl Error {
    /// Create an error from a panic caught while executing a task.
    pub(crate) fn panic(panic: Box<dyn Any + Send + 'static>) -> Error {
        Error::Application(Box::new(PanicError(convert_panic(panic))))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            NotStarted => f.write_str("response was not started before body was written"),
            StartedTwice => f.write_str("response was started a second time without an error"),
            InvalidStatus(status) => write!(f, "invalid status: {status:?}"),
            InvalidHeaderName(name) => {
                write!(f, "carriage return/line feed in header name: {name:?}")
            }
            InvalidHeaderValue(name) => {
                write!(f, "carriage return/line feed in value of header {name:?}")
            }
            HopByHopHeader(name) => write!(
                f,
                "{name} is a hop-by-hop header; it can't be used by an application"
            ),
            InvalidContentLength(value) => write!(f, "invalid Content-Length: {value:?}"),
            AlreadySent(err) => write!(f, "error after response header was sent: {err}"),
            Application(err) => write!(f, "application error: {err}"),
            InvalidForwardedProto(value) => write!(f, "invalid X-Forwarded-Proto: {value:?}"),
            ClientDisconnected => f.write_str("client disconnected"),
            Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::AlreadySent(err) | Error::Application(err) => Some(&**err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Panic message turned into an error.
#[derive(Debug)]
struct PanicError(String);

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.0)
    }
}

impl std::error::Error for PanicError {}

/// Maps a boxed panic messages to a `String`.
pub(crate) fn convert_panic(panic: Box<dyn Any + Send + 'static>) -> String {
    match panic.downcast::<&'static str>() {
        Ok(s) => (*s).to_owned(),
        Err(panic) => match panic.downcast::<String>() {
            Ok(s) => *s,
            Err(..) => "<unknown>".to_owned(),
        },
    }
}
