//! Hearth is a threaded HTTP/1 server for gateway applications.
//!
//! ## About
//!
//! Hearth runs an [`Application`] for every HTTP request it receives. The
//! application is called with the [`Environ`]ment of the request, CGI style
//! variables such as `REQUEST_METHOD` and `PATH_INFO`, and returns the
//! response [`Body`].
//!
//! ```
//! use hearth::{AppError, Body, Environ, StartResponse};
//!
//! fn app(environ: Environ, start_response: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
//!     let path = environ.get("PATH_INFO").unwrap_or("/").to_owned();
//!     start_response.start("200 OK", vec![
//!         ("Content-Type".to_owned(), "text/plain".to_owned()),
//!     ])?;
//!     Ok(Body::from(format!("Hello from {path}").into_bytes()))
//! }
//! # fn assert_app<A: hearth::Application>(_: A) {}
//! # assert_app(app);
//! ```
//!
//! ## Design
//!
//! The [`Server`] uses a single reactor thread that accepts connections and
//! does all reading from and writing to the connections. Each connection is
//! represented by a [`Channel`], which parses the requests (see
//! [`parser::Request`]). Completed requests are serviced on a pool of worker
//! threads, the [`ThreadedTaskDispatcher`], using a [`Task`]. The task calls
//! the application and writes the response to the channel's output buffers,
//! which the reactor flushes to the connection.
//!
//! Because the application runs on the worker threads a slow application
//! doesn't stop the server from accepting connections or sending responses
//! to other connections.
//!
//! ## Response framing
//!
//! The body of a response is framed by:
//!  * the `Content-Length` header if the length is known, set by the
//!    application or determined from a body consisting of a single chunk or
//!    a file,
//!  * for HTTP/1.1 without a known length, chunked encoding after which the
//!    connection is closed,
//!  * for HTTP/1.0 without a known length, closing the connection.
//!
//! ## Logging
//!
//! Hearth uses the [`log`] crate, it's up to the user to install a logger. The
//! queue depth of the dispatcher is logged using the `hearth::queue` target,
//! output written to [`Environ::errors`] using the `hearth::app` target.

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences
)]

mod app;
pub mod buffer;
mod channel;
mod config;
mod dispatcher;
mod error;
pub mod header;
pub mod parser;
mod server;
mod task;
mod version;

#[doc(no_inline)]
pub use app::{Application, Body, BodyIter, Environ, Errors, Input, StartResponse};
#[doc(no_inline)]
pub use buffer::{Buffer, FileWrapper, OverflowableBuffer};
#[doc(no_inline)]
pub use channel::{Channel, Payload, ServerContext, Socket};
#[doc(no_inline)]
pub use config::Config;
#[doc(no_inline)]
pub use dispatcher::{Dispatch, Job, ThreadedTaskDispatcher};
#[doc(no_inline)]
pub use error::{AppError, Error, RequestError};
#[doc(no_inline)]
pub use header::HeaderList;
#[doc(no_inline)]
pub use server::{Server, ServerHandle};
#[doc(no_inline)]
pub use task::{Task, TaskKind};
#[doc(no_inline)]
pub use version::{UnknownVersion, Version};
